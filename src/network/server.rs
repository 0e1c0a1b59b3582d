//! WebSocket Game Server
//!
//! Accepts TCP connections, upgrades them to WebSocket, admits the user named
//! in the `username` query parameter and hands the connection to the
//! [`SessionCoordinator`].

use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tracing::{debug, error, info, instrument, warn};

use crate::game::directory::{DirectoryError, UserDirectory};
use crate::network::channel::split_websocket;
use crate::network::coordinator::{CoordinatorConfig, SessionCoordinator};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Create directory entries for unknown usernames.
    pub auto_register: bool,
    /// Session coordination settings.
    pub coordinator: CoordinatorConfig,
    /// Server version string.
    pub version: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            max_connections: 1000,
            auto_register: true,
            coordinator: CoordinatorConfig::default(),
            version: crate::VERSION.to_string(),
        }
    }
}

impl ServerConfig {
    /// Defaults overridden by `PORT`, `CHESS_MAX_CONNECTIONS`,
    /// `CHESS_AUTO_REGISTER`, `CHESS_INVITATION_TIMEOUT_SECS` and
    /// `CHESS_CLOCK_SECONDS`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`ServerConfig::from_env`] with a custom variable source.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(port) = parse_var::<u16, _>(&lookup, "PORT") {
            config.bind_addr.set_port(port);
        }
        if let Some(max) = parse_var(&lookup, "CHESS_MAX_CONNECTIONS") {
            config.max_connections = max;
        }
        if let Some(auto) = parse_var(&lookup, "CHESS_AUTO_REGISTER") {
            config.auto_register = auto;
        }
        if let Some(secs) = parse_var(&lookup, "CHESS_INVITATION_TIMEOUT_SECS") {
            config.coordinator.invitation_timeout = std::time::Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var(&lookup, "CHESS_CLOCK_SECONDS") {
            config.coordinator.seconds_per_side = secs;
        }

        config
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Option<T>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("Ignoring invalid {}={:?}", key, raw);
            None
        }
    }
}

/// Game server errors.
#[derive(Debug, thiserror::Error)]
pub enum GameServerError {
    /// Failed to bind to address.
    #[error("Failed to bind: {0}")]
    BindFailed(#[from] std::io::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Connection limit reached.
    #[error("Connection limit reached")]
    ConnectionLimitReached,

    /// Upgrade request carried no username.
    #[error("Missing username")]
    MissingUsername,

    /// Username not in the directory and auto-registration is off.
    #[error("Unknown user {0}")]
    UnknownUser(String),

    /// Directory failure.
    #[error("Directory error: {0}")]
    Directory(#[from] DirectoryError),
}

/// The game server.
pub struct GameServer {
    /// Server configuration.
    config: ServerConfig,
    /// Session coordinator.
    coordinator: SessionCoordinator,
    /// Shutdown signal.
    shutdown_tx: broadcast::Sender<()>,
}

impl GameServer {
    /// Create a new game server.
    pub fn new(config: ServerConfig, directory: Arc<dyn UserDirectory>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let coordinator = SessionCoordinator::new(directory, config.coordinator.clone());

        Self {
            config,
            coordinator,
            shutdown_tx,
        }
    }

    /// The coordinator behind this server.
    pub fn coordinator(&self) -> &SessionCoordinator {
        &self.coordinator
    }

    /// Bind and run until shutdown.
    pub async fn run(&self) -> Result<(), GameServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Run the accept loop on an already bound listener.
    #[instrument(skip(self, listener))]
    pub async fn serve(&self, listener: TcpListener) -> Result<(), GameServerError> {
        info!(
            "Chess rooms server {} listening on {}",
            self.config.version,
            listener.local_addr()?
        );

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let count = self.coordinator.registry().len().await;
                            if count >= self.config.max_connections {
                                warn!("{}, rejecting {}", GameServerError::ConnectionLimitReached, addr);
                                continue;
                            }

                            debug!("New connection from {}", addr);
                            self.handle_connection(stream, addr);
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        Ok(())
    }

    /// Handle a new WebSocket connection.
    fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let coordinator = self.coordinator.clone();
        let auto_register = self.config.auto_register;
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut username = None;
            let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
                username = username_from_query(request.uri().query());
                Ok(response)
            };

            let ws_stream = match accept_hdr_async(stream, callback).await {
                Ok(ws) => ws,
                Err(e) => {
                    error!("WebSocket handshake failed for {}: {}", addr, e);
                    return;
                }
            };

            let username = match username {
                Some(username) => username,
                None => {
                    warn!("{}: {}", addr, GameServerError::MissingUsername);
                    return;
                }
            };

            if let Err(e) = admit(coordinator.directory().as_ref(), &username, auto_register).await {
                warn!("Refusing {} from {}: {}", username, addr, e);
                return;
            }

            let (sink, source) = split_websocket(ws_stream);
            let conn = coordinator.connect(&username, Box::new(sink)).await;

            tokio::select! {
                _ = coordinator.serve_connection(conn.clone(), source) => {}
                _ = shutdown_rx.recv() => {
                    conn.close().await;
                }
            }

            debug!("Client {} ({}) cleaned up", username, addr);
        });
    }

    /// Shutdown the server.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Get number of connected users.
    pub async fn connection_count(&self) -> usize {
        self.coordinator.registry().len().await
    }

    /// Get number of sessions, including finished ones awaiting cleanup.
    pub async fn session_count(&self) -> usize {
        self.coordinator.sessions().len().await
    }

    /// Get number of pending invitations.
    pub async fn invitation_count(&self) -> usize {
        self.coordinator.pending().len().await
    }
}

/// Make sure `username` has a directory entry.
async fn admit(
    directory: &dyn UserDirectory,
    username: &str,
    auto_register: bool,
) -> Result<(), GameServerError> {
    if directory.get_user(username).await.is_some() {
        return Ok(());
    }
    if !auto_register {
        return Err(GameServerError::UnknownUser(username.to_string()));
    }
    directory.create_user(username).await?;
    info!("Registered new user {}", username);
    Ok(())
}

fn username_from_query(query: Option<&str>) -> Option<String> {
    query?
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == "username")
        .map(|(_, value)| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
