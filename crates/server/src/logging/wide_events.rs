//! WideEvent - one structured span per authority operation.
//!
//! Each operation creates a `WideEvent`, records attributes as they become known and
//! emits a single event at the end, so one log line carries the whole story of a call:
//!
//! ```rust,ignore
//! let evt = WideEvent::new("confirm_otp");
//! evt.token(&token_id);
//! evt.status(VerificationStatus::Confirmed);
//! evt.outcome("confirmed");
//! evt.info("otp confirmed");
//! ```
//!
//! `tracing` silently drops values recorded on fields the span did not declare, so the
//! attribute set is fixed here. Add a field to the `span!` call before recording it.

use std::fmt::Display;
use tracing::{Level, Span, field};

use crate::session::{TokenId, VerificationStatus};

#[derive(Clone)]
pub struct WideEvent {
    span: Span,
}

impl WideEvent {
    pub fn new(operation: &'static str) -> Self {
        let span = tracing::span!(
            Level::INFO,
            "verification",
            operation = operation,
            token_id = field::Empty,
            status = field::Empty,
            outcome = field::Empty,
            phone = field::Empty,
            attempts = field::Empty,
            error = field::Empty,
        );
        WideEvent { span }
    }

    pub fn token(&self, token_id: &TokenId) {
        self.add("token_id", token_id);
    }

    pub fn status(&self, status: VerificationStatus) {
        self.add("status", status);
    }

    pub fn outcome(&self, outcome: &str) {
        self.add("outcome", outcome);
    }

    /// Callers pass an already masked phone.
    pub fn phone(&self, masked: &str) {
        self.add("phone", masked);
    }

    pub fn attempts(&self, attempts: u32) {
        self.span.record("attempts", attempts);
    }

    pub fn error<E: Display>(&self, error: &E) {
        self.add("error", error);
    }

    fn add<V: Display>(&self, key: &'static str, value: V) {
        self.span.record(key, field::display(value));
    }

    fn emit(&self, message: &str, level: Level) {
        self.span.in_scope(|| match level {
            Level::ERROR => tracing::event!(Level::ERROR, message = %message),
            Level::WARN => tracing::event!(Level::WARN, message = %message),
            Level::INFO => tracing::event!(Level::INFO, message = %message),
            Level::DEBUG => tracing::event!(Level::DEBUG, message = %message),
            Level::TRACE => tracing::event!(Level::TRACE, message = %message),
        });
    }

    pub fn info(&self, message: &str) {
        self.emit(message, Level::INFO)
    }
    pub fn warn(&self, message: &str) {
        self.emit(message, Level::WARN)
    }
    pub fn error_event(&self, message: &str) {
        self.emit(message, Level::ERROR)
    }
}
