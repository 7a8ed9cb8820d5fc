//! Display countdown for an issued code. Expiry itself is decided by the authority.

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant, interval_at};

/// Render seconds as `m:ss`.
pub fn format_remaining(seconds: u64) -> String {
    format!("{}:{:02}", seconds / 60, seconds % 60)
}

/// Ticks once per second from the issued TTL down to zero.
/// Dropping it stops the ticking task.
#[derive(Debug)]
pub struct OtpCountdown {
    remaining: watch::Receiver<u64>,
    task: JoinHandle<()>,
}

impl OtpCountdown {
    pub fn start(seconds: u64) -> Self {
        let (tx, rx) = watch::channel(seconds);
        let task = tokio::spawn(async move {
            let tick = Duration::from_secs(1);
            let mut ticker = interval_at(Instant::now() + tick, tick);
            let mut left = seconds;
            while left > 0 {
                ticker.tick().await;
                left -= 1;
                if tx.send(left).is_err() {
                    break;
                }
            }
        });
        Self {
            remaining: rx,
            task,
        }
    }

    pub fn remaining(&self) -> u64 {
        *self.remaining.borrow()
    }

    pub fn display(&self) -> String {
        format_remaining(self.remaining())
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.remaining.clone()
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for OtpCountdown {
    fn drop(&mut self) {
        self.task.abort();
    }
}
