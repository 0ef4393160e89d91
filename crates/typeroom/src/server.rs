//! `TyperoomServer` builder and accept loop.
//!
//! This is the entry point for running a Typeroom server. It ties
//! together all the layers: transport → stream → presence → game.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use typeroom_game::{GameConfig, GameManager, Repository};
use typeroom_presence::{PresenceConfig, PresenceStore};
use typeroom_protocol::JsonCodec;
use typeroom_stream::{StreamConfig, StreamStore, StreamTransport};
use typeroom_transport::{Transport, WebSocketConnection, WebSocketTransport};

use crate::handler::handle_connection;
use crate::{Authenticator, ConnectionConfig, RoomRegistry, RoomService, ServerConfig, TyperoomError};

/// Shared server state passed to each connection handler task.
pub(crate) struct ServerState<S, R, A> {
    pub(crate) config: ConnectionConfig,
    pub(crate) codec: JsonCodec,
    pub(crate) auth: A,
    pub(crate) stream: StreamTransport<S>,
    pub(crate) presence: Arc<PresenceStore>,
    pub(crate) games: GameManager<S, R>,
    pub(crate) rooms: RoomService<S, R>,
    pub(crate) registry: RoomRegistry<WebSocketConnection>,
}

/// Builder for configuring and starting a Typeroom server.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
///
/// use typeroom::prelude::*;
///
/// # async fn run() -> Result<(), TyperoomError> {
/// let server = TyperoomServerBuilder::new()
///     .bind("0.0.0.0:8080")
///     .build(
///         MemoryStreamStore::new(),
///         Arc::new(MemoryRepository::new()),
///         StaticAuthenticator::new(),
///     )
///     .await?;
/// server.run().await
/// # }
/// ```
pub struct TyperoomServerBuilder {
    config: ServerConfig,
}

impl TyperoomServerBuilder {
    /// Creates a new builder with default settings.
    pub fn new() -> Self {
        Self {
            config: ServerConfig::default(),
        }
    }

    /// Replaces the whole configuration, e.g. with
    /// [`ServerConfig::from_env`].
    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the address to bind the server to.
    pub fn bind(mut self, addr: &str) -> Self {
        self.config.bind_addr = addr.to_string();
        self
    }

    pub fn connection_config(mut self, config: ConnectionConfig) -> Self {
        self.config.connection = config;
        self
    }

    pub fn game_config(mut self, config: GameConfig) -> Self {
        self.config.game = config;
        self
    }

    pub fn presence_config(mut self, config: PresenceConfig) -> Self {
        self.config.presence = config;
        self
    }

    pub fn stream_config(mut self, config: StreamConfig) -> Self {
        self.config.stream = config;
        self
    }

    /// Binds the listener and wires the layers together over the given
    /// stream backend, repository and authenticator.
    pub async fn build<S, R, A>(
        self,
        store: S,
        repo: Arc<R>,
        auth: A,
    ) -> Result<TyperoomServer<S, R, A>, TyperoomError>
    where
        S: StreamStore,
        R: Repository,
        A: Authenticator,
    {
        let ServerConfig {
            bind_addr,
            connection,
            game,
            presence,
            stream,
        } = self.config;

        let transport = WebSocketTransport::bind(&bind_addr)
            .await?
            .with_queue_capacity(connection.queue_capacity)
            .with_handshake_timeout(connection.handshake_timeout);

        let stream = StreamTransport::new(store, stream);
        let presence = Arc::new(PresenceStore::new(presence));
        let games = GameManager::new(game, stream.clone(), Arc::clone(&presence), Arc::clone(&repo));
        let rooms = RoomService::new(stream.clone(), Arc::clone(&presence), games.clone(), repo);

        let state = Arc::new(ServerState {
            config: connection,
            codec: JsonCodec,
            auth,
            stream,
            presence,
            games,
            rooms,
            registry: RoomRegistry::new(),
        });

        Ok(TyperoomServer {
            transport,
            state,
            shutdown: CancellationToken::new(),
        })
    }
}

impl Default for TyperoomServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A Typeroom server, bound and ready to accept connections.
///
/// Call [`run()`](Self::run) to start accepting. The game manager and
/// room service are shared with the connection handlers, so handles
/// taken before `run` drive the same rooms.
pub struct TyperoomServer<S, R, A> {
    transport: WebSocketTransport,
    state: Arc<ServerState<S, R, A>>,
    shutdown: CancellationToken,
}

impl<S, R, A> TyperoomServer<S, R, A>
where
    S: StreamStore,
    R: Repository,
    A: Authenticator,
{
    /// Returns the local address the server is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, TyperoomError> {
        Ok(self.transport.local_addr()?)
    }

    pub fn games(&self) -> &GameManager<S, R> {
        &self.state.games
    }

    pub fn rooms(&self) -> &RoomService<S, R> {
        &self.state.rooms
    }

    pub fn presence(&self) -> &Arc<PresenceStore> {
        &self.state.presence
    }

    /// A token that stops [`run()`](Self::run) when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Runs the accept loop until the shutdown token is cancelled.
    ///
    /// Each accepted connection gets its own handler task. A failed
    /// accept is logged and the loop carries on. On shutdown every
    /// stream subscription is cancelled, which ends the handlers.
    pub async fn run(mut self) -> Result<(), TyperoomError> {
        tracing::info!(addr = ?self.transport.local_addr().ok(), "typeroom server running");

        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = self.transport.accept() => accepted,
            };
            match accepted {
                Ok(conn) => {
                    let state = Arc::clone(&self.state);
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(conn, state).await {
                            tracing::debug!(error = %e, "connection ended with error");
                        }
                    });
                }
                Err(e) => {
                    tracing::error!(error = %e, "accept failed");
                }
            }
        }

        tracing::info!("typeroom server shutting down");
        self.state.stream.shutdown();
        self.transport.shutdown().await?;
        Ok(())
    }
}
