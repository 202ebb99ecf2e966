//! WebSocket front door for the hub.
//!
//! ```text
//! TCP accept ──► upgrade request ──► Authenticator ──✗──► 401
//!                                         │ UserId
//!                                         ▼
//!                              serve_connection (pumps)
//!                                  │            ▲
//!                           Router ▼            │ outbound queue
//!                                 Hub ──────────┘
//! ```
//!
//! Authentication itself happens upstream; the server only maps the
//! upgrade request to a user identity.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use uuid::Uuid;

use crate::connection::{serve_connection, ConnectionConfig, SessionEnd, UserId};
use crate::hub::Hub;
use crate::router::Router;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Per-session transport settings
    pub connection: ConnectionConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            connection: ConnectionConfig::default(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WebSocket handshake failed: {0}")]
    Handshake(#[from] tungstenite::Error),
}

/// Maps an upgrade request to the user it belongs to.
pub trait Authenticator: Send + Sync {
    /// `None` rejects the upgrade with 401.
    fn authenticate(&self, request: &Request) -> Option<UserId>;
}

/// Trusts a user id header set by an upstream auth proxy.
#[derive(Debug, Clone)]
pub struct TrustedHeaderAuthenticator {
    header: String,
}

impl TrustedHeaderAuthenticator {
    pub const DEFAULT_HEADER: &'static str = "X-User-Id";

    pub fn new(header: impl Into<String>) -> Self {
        Self {
            header: header.into(),
        }
    }
}

impl Default for TrustedHeaderAuthenticator {
    fn default() -> Self {
        Self::new(Self::DEFAULT_HEADER)
    }
}

impl Authenticator for TrustedHeaderAuthenticator {
    fn authenticate(&self, request: &Request) -> Option<UserId> {
        let value = request.headers().get(self.header.as_str())?.to_str().ok()?;
        Uuid::parse_str(value.trim()).ok()
    }
}

/// Accepts WebSocket sessions and binds them to the hub.
pub struct HubServer {
    config: ServerConfig,
    hub: Hub,
    authenticator: Arc<dyn Authenticator>,
    router: Arc<Router>,
}

impl HubServer {
    pub fn new(
        config: ServerConfig,
        hub: Hub,
        authenticator: Arc<dyn Authenticator>,
        router: Arc<Router>,
    ) -> Self {
        Self {
            config,
            hub,
            authenticator,
            router,
        }
    }

    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    /// Bind `bind_addr` and serve forever.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: self.config.bind_addr.clone(),
                source,
            })?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        log::info!("Hub server listening on {}", listener.local_addr()?);

        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    log::warn!("Accept failed: {e}");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            };
            log::debug!("New TCP connection from {addr}");

            let hub = self.hub.clone();
            let authenticator = self.authenticator.clone();
            let router = self.router.clone();
            let config = self.config.connection.clone();

            tokio::spawn(async move {
                match Self::handle_connection(stream, addr, hub, authenticator, router, config).await {
                    Ok(end) => log::debug!("Connection from {addr} closed: {end:?}"),
                    Err(e) => log::warn!("Connection from {addr} failed: {e}"),
                }
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        hub: Hub,
        authenticator: Arc<dyn Authenticator>,
        router: Arc<Router>,
        config: ConnectionConfig,
    ) -> Result<SessionEnd, ServerError> {
        let mut user_id = None;
        let callback = |request: &Request, response: Response| {
            match authenticator.authenticate(request) {
                Some(id) => {
                    user_id = Some(id);
                    Ok(response)
                }
                None => Err(unauthorized()),
            }
        };

        let ws_config = WebSocketConfig::default().max_message_size(Some(config.max_message_size));
        let ws = tokio_tungstenite::accept_hdr_async_with_config(stream, callback, Some(ws_config)).await?;
        let Some(user_id) = user_id else {
            return Ok(SessionEnd::Closed);
        };

        log::info!("WebSocket connection established from {addr} for user {user_id}");
        Ok(serve_connection(ws, user_id, hub, router, config).await)
    }
}

fn unauthorized() -> ErrorResponse {
    let mut response = ErrorResponse::new(Some("Unauthorized".to_string()));
    *response.status_mut() = StatusCode::UNAUTHORIZED;
    response
}
