use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderValue, InvalidHeaderValue, AUTHORIZATION};
use reqwest::{Client, Method, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::retry::{retry_async, RetryPolicy};
use crate::session::{Credential, SessionError, SessionManager, TokenExchange};
use crate::stream::proto::Category;

const ERROR_BODY_SNIPPET_LEN: usize = 220;
pub const API_BASE_URL: &str = "https://api.fishfish.gg/v1";
pub const TOKEN_EXCHANGE_PATH: &str = "/users/@me/tokens";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ApiDefaults;

impl ApiDefaults {
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
    pub const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(15);
}

#[derive(Clone, Debug)]
pub struct ApiClientOptions {
    pub connect_timeout: Duration,
    pub attempt_timeout: Duration,
    /// Applied to GET requests only.
    pub retry_policy: RetryPolicy,
}

impl Default for ApiClientOptions {
    fn default() -> Self {
        Self {
            connect_timeout: ApiDefaults::CONNECT_TIMEOUT,
            attempt_timeout: ApiDefaults::ATTEMPT_TIMEOUT,
            retry_policy: RetryPolicy::idempotent_read(),
        }
    }
}

/// HTTP transport for the reputation API.
#[derive(Clone, Debug)]
pub struct ApiClient {
    http: Client,
    base_url: String,
    attempt_timeout: Duration,
    retry_policy: RetryPolicy,
}

impl ApiClient {
    pub fn new() -> Result<Self, ApiError> {
        Self::with_options(ApiClientOptions::default())
    }

    pub fn with_options(options: ApiClientOptions) -> Result<Self, ApiError> {
        let http = Client::builder()
            .no_proxy()
            .connect_timeout(options.connect_timeout)
            .build()
            .map_err(ApiError::Transport)?;

        Ok(Self {
            http,
            base_url: API_BASE_URL.to_string(),
            attempt_timeout: options.attempt_timeout,
            retry_policy: options.retry_policy,
        })
    }

    /// Points the client at another deployment, eg a staging API.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        self.base_url = base_url.trim_end().trim_end_matches('/').to_string();
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Exchanges the refresh secret for a session credential.
    ///
    /// Single attempt; renewal retry policy belongs to the caller.
    pub async fn exchange_token(
        &self,
        refresh_secret: &SecretString,
    ) -> Result<Credential, ApiError> {
        #[derive(Deserialize)]
        struct TokenResponse {
            token: String,
            expires: u64,
        }

        let authorization = HeaderValue::from_str(refresh_secret.expose_secret())?;
        let response = self
            .http
            .post(self.endpoint(TOKEN_EXCHANGE_PATH))
            .timeout(self.attempt_timeout)
            .header(AUTHORIZATION, authorization)
            .send()
            .await
            .map_err(ApiError::Transport)?;
        let status = response.status();
        let body = response.text().await.map_err(ApiError::Transport)?;
        check_status(status, &body)?;

        let parsed: TokenResponse = serde_json::from_str(&body)
            .map_err(|err| ApiError::Parse(format!("token exchange response: {err}")))?;
        Ok(Credential::from_epoch_seconds(
            SecretString::new(parsed.token),
            parsed.expires,
        ))
    }

    /// Sends one request and maps the status to an [`ApiError`].
    ///
    /// GET requests are retried according to the configured policy. An empty
    /// response body is returned as `Value::Null`.
    pub async fn send(
        &self,
        method: Method,
        path: &str,
        credential: Option<&Credential>,
        body: Option<&Value>,
    ) -> Result<Value, ApiError> {
        let endpoint = self.endpoint(path);
        let authorization = credential
            .map(|credential| HeaderValue::from_str(credential.token().expose_secret()))
            .transpose()?;
        let policy = if method == Method::GET {
            self.retry_policy.clone()
        } else {
            RetryPolicy::none()
        };

        retry_async(
            &policy,
            |attempt| {
                let method = method.clone();
                let endpoint = endpoint.clone();
                let authorization = authorization.clone();
                async move {
                    debug!(event = "api_request", method = %method, endpoint = %endpoint, attempt);
                    self.send_attempt(method, &endpoint, authorization, body)
                        .await
                }
            },
            ApiError::is_retryable,
        )
        .await
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send_attempt(
        &self,
        method: Method,
        endpoint: &str,
        authorization: Option<HeaderValue>,
        body: Option<&Value>,
    ) -> Result<Value, ApiError> {
        let mut builder = self
            .http
            .request(method, endpoint)
            .timeout(self.attempt_timeout);
        if let Some(authorization) = authorization {
            builder = builder.header(AUTHORIZATION, authorization);
        }
        if let Some(body) = body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(ApiError::Transport)?;
        let status = response.status();
        let text = response.text().await.map_err(ApiError::Transport)?;
        check_status(status, &text)?;

        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(|err| ApiError::Parse(err.to_string()))
    }
}

#[async_trait]
impl TokenExchange for ApiClient {
    async fn exchange(&self, refresh_secret: &SecretString) -> Result<Credential, ApiError> {
        self.exchange_token(refresh_secret).await
    }
}

/// REST front that attaches a valid session credential when one is
/// configured.
///
/// Without a refresh secret the client is anonymous; routes that require
/// authentication fail with [`ApiError::AuthenticatedRoute`] before any
/// network call.
#[derive(Clone, Debug)]
pub struct FishClient {
    api: ApiClient,
    session: Option<Arc<SessionManager>>,
}

impl FishClient {
    pub fn anonymous(api: ApiClient) -> Self {
        Self { api, session: None }
    }

    pub fn with_refresh_secret(api: ApiClient, refresh_secret: SecretString) -> Self {
        let session = SessionManager::new(Arc::new(api.clone()), refresh_secret);
        Self {
            api,
            session: Some(Arc::new(session)),
        }
    }

    pub fn with_session(api: ApiClient, session: Arc<SessionManager>) -> Self {
        Self {
            api,
            session: Some(session),
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.session.is_some()
    }

    pub fn session(&self) -> Option<&Arc<SessionManager>> {
        self.session.as_ref()
    }

    pub fn api(&self) -> &ApiClient {
        &self.api
    }

    /// Sends a request and decodes the JSON response into `T`.
    ///
    /// A 401 answered to a cached credential invalidates it so the next call
    /// renews.
    pub async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        requires_auth: bool,
    ) -> Result<T, ApiError> {
        if requires_auth && self.session.is_none() {
            return Err(ApiError::AuthenticatedRoute);
        }

        let credential = match self.session.as_ref() {
            Some(session) => Some(session.ensure_valid().await?),
            None => None,
        };

        let result = self
            .api
            .send(method, path, credential.as_ref(), body)
            .await;
        if let (Err(ApiError::Unauthorized), Some(session)) = (&result, self.session.as_ref()) {
            session.invalidate();
        }

        serde_json::from_value(result?).map_err(|err| ApiError::Parse(err.to_string()))
    }

    /// Builds a collection listing path such as `/domains?category=phishing&full=true`.
    pub fn collection_path(collection: &str, category: Option<Category>, full: bool) -> String {
        match category {
            Some(category) => format!("/{collection}?category={category}&full={full}"),
            None => format!("/{collection}?full={full}"),
        }
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Transport(reqwest::Error),

    #[error("request lacks valid authentication")]
    Unauthorized,

    #[error("not permitted to perform this action")]
    Forbidden,

    #[error("object does not exist")]
    ObjectNotFound,

    #[error("server error {status}: {body}")]
    ServerError { status: StatusCode, body: String },

    #[error("http status {status}: {body}")]
    HttpStatus { status: StatusCode, body: String },

    #[error("failed to parse response: {0}")]
    Parse(String),

    #[error("route requires an authenticated client")]
    AuthenticatedRoute,

    #[error("invalid authorization header: {0}")]
    InvalidHeader(#[from] InvalidHeaderValue),

    #[error(transparent)]
    Session(#[from] SessionError),
}

impl ApiError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(err) => err.is_timeout() || err.is_connect(),
            Self::ServerError { .. } => true,
            Self::HttpStatus { status, .. } => *status == StatusCode::TOO_MANY_REQUESTS,
            _ => false,
        }
    }
}

fn check_status(status: StatusCode, body: &str) -> Result<(), ApiError> {
    if status.is_success() {
        return Ok(());
    }

    Err(match status {
        StatusCode::UNAUTHORIZED => ApiError::Unauthorized,
        StatusCode::FORBIDDEN => ApiError::Forbidden,
        StatusCode::NOT_FOUND => ApiError::ObjectNotFound,
        status if status.is_server_error() => ApiError::ServerError {
            status,
            body: summarize_error_body(body),
        },
        status => ApiError::HttpStatus {
            status,
            body: summarize_error_body(body),
        },
    })
}

fn summarize_error_body(body: &str) -> String {
    #[derive(Debug, Deserialize)]
    struct ErrorBody {
        #[serde(default)]
        error: Option<String>,
        #[serde(default)]
        message: Option<String>,
    }

    if let Ok(parsed) = serde_json::from_str::<ErrorBody>(body) {
        if let Some(message) = parsed.error.or(parsed.message) {
            return message;
        }
    }

    body.chars().take(ERROR_BODY_SNIPPET_LEN).collect()
}
