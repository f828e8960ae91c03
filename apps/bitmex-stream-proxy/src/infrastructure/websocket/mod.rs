//! Downstream WebSocket Endpoint
//!
//! Serves `GET /realtime` and adapts each upgraded socket to the
//! [`StreamProxy`] contract: one writer task draining the client's bounded
//! frame queue, and a reader loop forwarding requests.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Router,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
    routing::get,
};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::application::services::StreamProxy;
use crate::infrastructure::bitmex::encode_downstream;
use crate::infrastructure::broadcast::ChannelSink;

/// Path of the downstream WebSocket endpoint.
pub const REALTIME_PATH: &str = "/realtime";

// =============================================================================
// Server
// =============================================================================

#[derive(Clone)]
struct EndpointState {
    proxy: Arc<StreamProxy>,
    client_buffer: usize,
    cancel: CancellationToken,
}

/// Downstream WebSocket server.
pub struct WebSocketServer {
    port: u16,
    proxy: Arc<StreamProxy>,
    client_buffer: usize,
    cancel: CancellationToken,
}

impl WebSocketServer {
    /// Create a new server.
    ///
    /// `client_buffer` bounds each client's outbound frame queue.
    #[must_use]
    pub const fn new(
        port: u16,
        proxy: Arc<StreamProxy>,
        client_buffer: usize,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            port,
            proxy,
            client_buffer,
            cancel,
        }
    }

    /// Run the server until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `ServerError` if binding fails or the HTTP server stops
    /// with an error.
    pub async fn run(self) -> Result<(), ServerError> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::BindFailed(self.port, e.to_string()))?;

        tracing::info!(port = self.port, path = REALTIME_PATH, "WebSocket server listening");
        serve(listener, self.proxy, self.client_buffer, self.cancel).await?;
        tracing::info!("WebSocket server stopped");
        Ok(())
    }
}

/// Serve the endpoint on an already bound listener.
///
/// # Errors
///
/// Returns `ServerError::ServerFailed` if the HTTP server stops with an error.
pub async fn serve(
    listener: TcpListener,
    proxy: Arc<StreamProxy>,
    client_buffer: usize,
    cancel: CancellationToken,
) -> Result<(), ServerError> {
    let app = router(proxy, client_buffer, cancel.clone());
    axum::serve(listener, app)
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
        .map_err(|e| ServerError::ServerFailed(e.to_string()))
}

/// Routes for the downstream endpoint.
pub fn router(proxy: Arc<StreamProxy>, client_buffer: usize, cancel: CancellationToken) -> Router {
    Router::new()
        .route(REALTIME_PATH, get(realtime_handler))
        .with_state(EndpointState {
            proxy,
            client_buffer: client_buffer.max(1),
            cancel,
        })
}

// =============================================================================
// Connection Handling
// =============================================================================

async fn realtime_handler(
    ws: WebSocketUpgrade,
    State(state): State<EndpointState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: EndpointState) {
    let (mut sender, mut receiver) = socket.split();

    let (sink, rx) = ChannelSink::channel(state.client_buffer);
    let handle = state.proxy.on_downstream_connected(Arc::new(sink));

    // Ends when the relay drops the client's sink or the socket stops accepting writes.
    let writer = tokio::spawn(async move {
        let mut frames = ReceiverStream::new(rx)
            .map(|frame| Ok::<_, axum::Error>(Message::Text(encode_downstream(&frame).into())));
        if let Err(e) = sender.send_all(&mut frames).await {
            tracing::debug!(client = handle, error = %e, "Downstream write failed");
        }
        let _ = sender.close().await;
    });

    loop {
        tokio::select! {
            () = state.cancel.cancelled() => break,
            msg = receiver.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    state.proxy.on_downstream_message(handle, text.as_str().as_bytes()).await;
                }
                Some(Ok(Message::Binary(data))) => {
                    state.proxy.on_downstream_message(handle, &data).await;
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    tracing::debug!(client = handle, error = %e, "Downstream read failed");
                    break;
                }
            }
        }
    }

    state.proxy.on_downstream_closed(handle).await;
    writer.abort();
}

// =============================================================================
// Errors
// =============================================================================

/// Downstream server errors.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Failed to bind to port.
    #[error("failed to bind to port {0}: {1}")]
    BindFailed(u16, String),

    /// Server error.
    #[error("server error: {0}")]
    ServerFailed(String),
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    use super::*;
    use crate::application::ports::MockControlPort;
    use crate::domain::subscription::SessionRegistry;
    use crate::infrastructure::broadcast::FanoutRelay;

    fn proxy() -> Arc<StreamProxy> {
        let relay = Arc::new(FanoutRelay::new(Arc::new(SessionRegistry::new())));
        Arc::new(StreamProxy::new(relay, Arc::new(MockControlPort::new())))
    }

    #[tokio::test]
    async fn plain_get_is_not_upgraded() {
        let app = router(proxy(), 16, CancellationToken::new());
        let response = app
            .oneshot(Request::builder().uri(REALTIME_PATH).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert!(response.status().is_client_error());
    }

    #[tokio::test]
    async fn unknown_path_is_not_found() {
        let app = router(proxy(), 16, CancellationToken::new());
        let response = app
            .oneshot(Request::builder().uri("/ws").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn server_error_display() {
        let err = ServerError::BindFailed(8080, "address in use".to_string());
        assert_eq!(err.to_string(), "failed to bind to port 8080: address in use");
    }
}
