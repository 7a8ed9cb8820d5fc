//! Access to the token authority, in-process or over HTTP.

use crate::authority::TokenAuthority;
use crate::error::ClientError;
use crate::protocol::{
    ConfirmRequest, ErrorBody, InitRequest, InitResponse, OtpIssued, OtpRequest, StatusView,
};
use crate::session::{Claims, TokenId};
use crate::store::Repository;
use reqwest::StatusCode;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// What the provider flow and the callback resolver need from the authority.
pub trait AuthorityApi: Send + Sync {
    fn init(
        &self,
        request: InitRequest,
    ) -> impl Future<Output = Result<TokenId, ClientError>> + Send;

    fn request_otp(
        &self,
        request: OtpRequest,
    ) -> impl Future<Output = Result<OtpIssued, ClientError>> + Send;

    fn confirm_otp(
        &self,
        request: ConfirmRequest,
    ) -> impl Future<Output = Result<(), ClientError>> + Send;

    fn status(
        &self,
        token_id: &TokenId,
    ) -> impl Future<Output = Result<StatusView, ClientError>> + Send;
}

impl<T: AuthorityApi> AuthorityApi for Arc<T> {
    fn init(
        &self,
        request: InitRequest,
    ) -> impl Future<Output = Result<TokenId, ClientError>> + Send {
        (**self).init(request)
    }

    fn request_otp(
        &self,
        request: OtpRequest,
    ) -> impl Future<Output = Result<OtpIssued, ClientError>> + Send {
        (**self).request_otp(request)
    }

    fn confirm_otp(
        &self,
        request: ConfirmRequest,
    ) -> impl Future<Output = Result<(), ClientError>> + Send {
        (**self).confirm_otp(request)
    }

    fn status(
        &self,
        token_id: &TokenId,
    ) -> impl Future<Output = Result<StatusView, ClientError>> + Send {
        (**self).status(token_id)
    }
}

impl<R: Repository> AuthorityApi for TokenAuthority<R> {
    async fn init(&self, request: InitRequest) -> Result<TokenId, ClientError> {
        let claims = Claims::parse(
            &request.name,
            &request.phone_number,
            request.carrier.as_deref(),
            request.auth_request_id.as_deref(),
        )?;
        Ok(TokenAuthority::init(self, claims, request.return_url.as_deref()).await?)
    }

    async fn request_otp(&self, request: OtpRequest) -> Result<OtpIssued, ClientError> {
        let issued = TokenAuthority::request_otp(
            self,
            &request.token_id,
            &request.name,
            &request.phone_number,
        )
        .await?;
        Ok(issued)
    }

    async fn confirm_otp(&self, request: ConfirmRequest) -> Result<(), ClientError> {
        Ok(TokenAuthority::confirm_otp(self, &request.token_id, &request.otp).await?)
    }

    async fn status(&self, token_id: &TokenId) -> Result<StatusView, ClientError> {
        Ok(TokenAuthority::status(self, token_id).await?)
    }
}

/// Remote authority reached through its JSON API under `/api/v1/auth`.
#[derive(Debug, Clone)]
pub struct HttpAuthorityClient {
    http: reqwest::Client,
    base: Url,
}

impl HttpAuthorityClient {
    pub fn new(base: Url) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .connect_timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self::with_client(http, base))
    }

    pub fn with_client(http: reqwest::Client, mut base: Url) -> Self {
        // Url::join drops the last segment unless the base ends with a slash.
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Self { http, base }
    }

    fn endpoint(&self, path: &str) -> Result<Url, ClientError> {
        self.base
            .join(path)
            .map_err(|e| ClientError::Transport(format!("bad endpoint {path}: {e}")))
    }

    /// Map a non-2xx response onto the business error it carries.
    async fn rejection(response: reqwest::Response) -> ClientError {
        let status = response.status();
        let bytes = match response.bytes().await {
            Ok(b) => b,
            Err(e) => return e.into(),
        };
        match serde_json::from_slice::<ErrorBody>(&bytes) {
            Ok(body) => match body.into_error() {
                Some(e) => ClientError::Rejected(e),
                None if status.is_server_error() => {
                    ClientError::Transport(format!("authority answered {status}"))
                }
                None => ClientError::MalformedUpstreamResponse(format!(
                    "unknown error code with status {status}"
                )),
            },
            Err(_) if status.is_server_error() => {
                ClientError::Transport(format!("authority answered {status}"))
            }
            Err(e) => ClientError::MalformedUpstreamResponse(format!("{status}: {e}")),
        }
    }
}

impl AuthorityApi for HttpAuthorityClient {
    #[tracing::instrument(skip_all)]
    async fn init(&self, request: InitRequest) -> Result<TokenId, ClientError> {
        let response = self
            .http
            .post(self.endpoint("init")?)
            .json(&request)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Self::rejection(response).await);
        }
        let body: InitResponse = response.json().await?;
        Ok(body.token_id)
    }

    #[tracing::instrument(skip_all, fields(token_id = %request.token_id))]
    async fn request_otp(&self, request: OtpRequest) -> Result<OtpIssued, ClientError> {
        let response = self
            .http
            .post(self.endpoint("request-otp")?)
            .json(&request)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Self::rejection(response).await);
        }
        Ok(response.json().await?)
    }

    #[tracing::instrument(skip_all, fields(token_id = %request.token_id))]
    async fn confirm_otp(&self, request: ConfirmRequest) -> Result<(), ClientError> {
        let response = self
            .http
            .patch(self.endpoint("confirm")?)
            .json(&request)
            .send()
            .await?;
        match response.status() {
            StatusCode::NO_CONTENT | StatusCode::OK => Ok(()),
            _ => Err(Self::rejection(response).await),
        }
    }

    #[tracing::instrument(skip(self))]
    async fn status(&self, token_id: &TokenId) -> Result<StatusView, ClientError> {
        let mut url = self.endpoint("status/")?;
        url.path_segments_mut()
            .map_err(|_| ClientError::Transport("authority base cannot carry a path".into()))?
            .pop_if_empty()
            .push(token_id.as_str());
        let response = self.http.get(url).send().await?;
        if !response.status().is_success() {
            return Err(Self::rejection(response).await);
        }
        Ok(response.json().await?)
    }
}
