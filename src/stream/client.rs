//! Realtime stream connection.
//!
//! [`StreamClient::start`] renews the session credential, opens the websocket
//! and hands every frame to the [`EventDispatcher`] without waiting for its
//! handlers. There is no reconnect: when the connection closes or fails the
//! handle resolves and any retry policy belongs to the caller.

use std::future::Future;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{InvalidHeaderValue, AUTHORIZATION};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, info, warn};

use crate::api::ApiClient;
use crate::session::{SessionError, SessionManager};
use crate::stream::dispatcher::{DispatchError, EventDispatcher, HandlerError};
use crate::stream::proto::{EventEnvelope, EventType, StreamEvent};

/// Production websocket endpoint for the stream service.
pub const STREAM_ENDPOINT: &str = "wss://api.fishfish.gg/v1/stream/";

/// Lifecycle of one stream connection.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StreamState {
    Idle,
    Connecting,
    Streaming,
    Closed,
    Failed,
}

/// Entry point for realtime event streams.
#[derive(Clone, Debug)]
pub struct StreamClient {
    session: Arc<SessionManager>,
    dispatcher: EventDispatcher,
    endpoint_override: Option<String>,
}

impl StreamClient {
    pub fn new(session: Arc<SessionManager>) -> Self {
        Self {
            session,
            dispatcher: EventDispatcher::new(),
            endpoint_override: None,
        }
    }

    /// Builds a client that renews credentials through the production API.
    pub fn from_refresh_secret(refresh_secret: SecretString) -> Result<Self, crate::api::ApiError> {
        let api = ApiClient::new()?;
        Ok(Self::new(Arc::new(SessionManager::new(
            Arc::new(api),
            refresh_secret,
        ))))
    }

    /// Replaces the dispatcher, eg one built with custom options.
    pub fn with_dispatcher(mut self, dispatcher: EventDispatcher) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    /// Sets an explicit stream endpoint override.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        let endpoint = endpoint.into();
        self.endpoint_override = Some(endpoint.trim_end().to_string());
        self
    }

    pub fn dispatcher(&self) -> &EventDispatcher {
        &self.dispatcher
    }

    pub fn session(&self) -> &Arc<SessionManager> {
        &self.session
    }

    /// Registers an async handler for one event type.
    pub fn register_listener<F, Fut>(&self, event_type: EventType, handler: F)
    where
        F: Fn(StreamEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.dispatcher.register_listener(event_type, handler);
    }

    /// Registers the handler for decode and handler failures.
    pub fn register_error_handler<F, Fut>(&self, handler: F)
    where
        F: Fn(DispatchError) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.dispatcher.register_error_handler(handler);
    }

    /// Spawns a worker that owns one websocket connection.
    ///
    /// Each call opens an independent connection. Dropping the returned
    /// handle stops the stream.
    pub fn start(&self) -> StreamHandle {
        let (state_tx, state_rx) = watch::channel(StreamState::Idle);
        let (stop_tx, stop_rx) = oneshot::channel();

        let endpoint = self.endpoint().to_string();
        let session = Arc::clone(&self.session);
        let dispatcher = self.dispatcher.clone();

        let task = tokio::spawn(async move {
            let result = run_stream(&endpoint, &session, &dispatcher, &state_tx, stop_rx).await;
            match &result {
                Ok(()) => {
                    info!(event = "stream_closed", endpoint = %endpoint);
                    state_tx.send_replace(StreamState::Closed);
                }
                Err(err) => {
                    warn!(event = "stream_failed", endpoint = %endpoint, error = %err);
                    state_tx.send_replace(StreamState::Failed);
                }
            }
            result
        });

        StreamHandle {
            task,
            state: state_rx,
            stop: Some(stop_tx),
        }
    }

    fn endpoint(&self) -> &str {
        self.endpoint_override.as_deref().unwrap_or(STREAM_ENDPOINT)
    }
}

/// Handle to a running stream.
#[derive(Debug)]
pub struct StreamHandle {
    task: JoinHandle<Result<(), StreamClientError>>,
    state: watch::Receiver<StreamState>,
    stop: Option<oneshot::Sender<()>>,
}

impl StreamHandle {
    pub fn state(&self) -> StreamState {
        *self.state.borrow()
    }

    /// Receiver that observes every state transition.
    pub fn state_updates(&self) -> watch::Receiver<StreamState> {
        self.state.clone()
    }

    /// Cancels the in-flight read and closes the connection.
    ///
    /// Dispatch batches already submitted keep running to completion.
    pub fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }

    /// Waits for the stream to end. `Ok` means the connection was closed by
    /// the remote end or by [`StreamHandle::stop`].
    pub async fn join(mut self) -> Result<(), StreamClientError> {
        let _keep_running = self.stop.take();
        match (&mut self.task).await {
            Ok(result) => result,
            Err(err) => Err(StreamClientError::Protocol(format!(
                "stream worker stopped unexpectedly: {err}"
            ))),
        }
    }
}

/// Errors that end a stream connection.
#[derive(Debug, Error)]
pub enum StreamClientError {
    /// Credential renewal failed before connecting.
    #[error("session renewal failed: {0}")]
    Session(#[from] SessionError),

    /// Websocket transport error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] WsError),

    /// A frame was not valid JSON.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Session token could not be converted to a valid HTTP header value.
    #[error("invalid authorization header: {0}")]
    InvalidTokenHeader(#[from] InvalidHeaderValue),

    /// The handshake was rejected for the session token.
    #[error("stream rejected the session credential")]
    Unauthorized,

    /// The handshake was rejected for lack of permission.
    #[error("stream access forbidden")]
    Forbidden,

    /// The handshake failed on the server side.
    #[error("stream handshake failed with server status {0}")]
    ServerError(u16),

    /// Stream protocol contract error.
    #[error("protocol error: {0}")]
    Protocol(String),
}

async fn run_stream(
    endpoint: &str,
    session: &SessionManager,
    dispatcher: &EventDispatcher,
    state: &watch::Sender<StreamState>,
    mut stop: oneshot::Receiver<()>,
) -> Result<(), StreamClientError> {
    state.send_replace(StreamState::Connecting);

    let connecting = async {
        let credential = session.ensure_valid().await?;
        connect(endpoint, credential.token()).await
    };
    let mut socket = tokio::select! {
        connected = connecting => connected?,
        _ = &mut stop => return Ok(()),
    };

    state.send_replace(StreamState::Streaming);
    debug!(event = "stream_connected", endpoint);

    loop {
        tokio::select! {
            _ = &mut stop => {
                let _ = socket.close(None).await;
                return Ok(());
            }
            maybe_inbound = socket.next() => {
                match maybe_inbound {
                    Some(Ok(Message::Text(text))) => {
                        submit_frame(dispatcher, parse_frame(text.as_str().as_bytes())?)
                    }
                    Some(Ok(Message::Binary(bytes))) => {
                        submit_frame(dispatcher, parse_frame(&bytes)?)
                    }
                    Some(Ok(Message::Ping(payload))) => socket.send(Message::Pong(payload)).await?,
                    Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => {}
                    Some(Ok(Message::Close(_))) | None => return Ok(()),
                    Some(Err(err)) => return Err(StreamClientError::WebSocket(err)),
                }
            }
        }
    }
}

async fn connect(
    endpoint: &str,
    token: &SecretString,
) -> Result<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    StreamClientError,
> {
    let mut request = endpoint.into_client_request()?;
    let authorization = token.expose_secret().parse()?;
    request.headers_mut().insert(AUTHORIZATION, authorization);

    let (socket, _) = connect_async(request).await.map_err(handshake_error)?;
    Ok(socket)
}

fn handshake_error(error: WsError) -> StreamClientError {
    if let WsError::Http(response) = &error {
        if let Some(rejected) = rejected_handshake(response.status()) {
            return rejected;
        }
    }
    StreamClientError::WebSocket(error)
}

fn rejected_handshake(status: StatusCode) -> Option<StreamClientError> {
    match status {
        StatusCode::UNAUTHORIZED => Some(StreamClientError::Unauthorized),
        StatusCode::FORBIDDEN => Some(StreamClientError::Forbidden),
        status if status.is_server_error() => Some(StreamClientError::ServerError(status.as_u16())),
        _ => None,
    }
}

fn parse_frame(bytes: &[u8]) -> Result<Value, StreamClientError> {
    serde_json::from_slice(bytes).map_err(StreamClientError::Json)
}

fn submit_frame(dispatcher: &EventDispatcher, frame: Value) {
    match EventEnvelope::from_value(frame) {
        Ok(envelope) => {
            // Detached: the read loop never waits on handlers.
            drop(dispatcher.dispatch(envelope));
        }
        Err(err) => dispatcher.report(DispatchError::Decode(err)),
    }
}
