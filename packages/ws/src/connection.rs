//! Per-connection loop.
//!
//! A connection moves through [`ConnectionState`]s: the handshake decides whether
//! it is accepted, `on_connect` decides whether it becomes active, and the read
//! loop runs until the transport fails, a close frame arrives, the idle timeout
//! elapses or the client asks to disconnect.

use std::{sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, EnumString};
use switchboard_logging::debug_or_trace;
use tokio_util::task::TaskTracker;

use crate::{
    client::Client,
    frame::{Frame, FrameKind, FrameReader, FrameWriter, TransportError},
    handler::ClientHandler,
    middleware::{HandshakeRequest, ResolvedMiddlewares},
    registry::Registry,
};

/// How inbound frames of one connection are dispatched.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, AsRefStr, EnumString, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DispatchMode {
    /// Every frame is dispatched on its own task. Handlers may complete out of
    /// order.
    #[default]
    Concurrent,
    /// Frames are dispatched one after the other, in arrival order.
    Sequential,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionOptions {
    pub dispatch: DispatchMode,
    /// Closes connections that send nothing for this long. Disabled when `None`.
    pub idle_timeout: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr)]
pub enum ConnectionState {
    Upgrading,
    HandshakePending,
    Active,
    Closing,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr)]
pub enum CloseReason {
    /// The peer sent a close frame or the transport reported a clean close.
    RemoteClosed,
    ReadError,
    IdleTimeout,
    /// A handler called [`Client::disconnect`].
    Requested,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionOutcome {
    HandshakeRejected,
    ConnectFailed,
    Closed(CloseReason),
}

/// Serves connections for one route.
#[derive(Debug, Clone)]
pub struct ConnectionHandler {
    path: String,
    handler: Arc<ClientHandler>,
    middlewares: Arc<ResolvedMiddlewares>,
    registry: Arc<Registry>,
    options: ConnectionOptions,
}

impl ConnectionHandler {
    #[must_use]
    pub fn new(
        path: impl Into<String>,
        handler: ClientHandler,
        middlewares: ResolvedMiddlewares,
        registry: Arc<Registry>,
        options: ConnectionOptions,
    ) -> Self {
        Self {
            path: path.into(),
            handler: Arc::new(handler),
            middlewares: Arc::new(middlewares),
            registry,
            options,
        }
    }

    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    #[must_use]
    pub const fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    fn transition(client: &Client, state: &mut ConnectionState, next: ConnectionState) {
        log::trace!(
            "connection: client_id={} {} -> {}",
            client.id(),
            state.as_ref(),
            next.as_ref()
        );
        *state = next;
    }

    /// Runs one upgraded connection to completion.
    #[allow(clippy::future_not_send)]
    pub async fn serve<R: FrameReader>(
        &self,
        request: &HandshakeRequest,
        mut reader: R,
        writer: impl FrameWriter + 'static,
    ) -> ConnectionOutcome {
        let client = Arc::new(Client::new(
            &self.path,
            Box::new(writer),
            self.middlewares.send().to_vec(),
        ));
        let mut state = ConnectionState::Upgrading;

        log::debug!("connection: client_id={} path={}", client.id(), self.path);

        Self::transition(&client, &mut state, ConnectionState::HandshakePending);

        if !self.middlewares.handshake(request, &client) {
            log::debug!("connection: handshake rejected client_id={}", client.id());
            Self::close_transport(&client).await;
            Self::transition(&client, &mut state, ConnectionState::Closed);
            return ConnectionOutcome::HandshakeRejected;
        }

        Self::transition(&client, &mut state, ConnectionState::Active);

        if let Err(e) = self.handler.connect(&client).await {
            log::error!(
                "on_connect failed client_id={} route={}: {e:?}",
                client.id(),
                self.path
            );
            self.registry.leave_all_rooms(&client);
            Self::close_transport(&client).await;
            Self::transition(&client, &mut state, ConnectionState::Closed);
            return ConnectionOutcome::ConnectFailed;
        }

        self.registry.add(client.clone());

        let dispatches = TaskTracker::new();
        let reason = self.read_loop(&client, &mut reader, &dispatches).await;

        log::debug!(
            "connection: closing client_id={} reason={}",
            client.id(),
            reason.as_ref()
        );

        Self::transition(&client, &mut state, ConnectionState::Closing);
        self.teardown(&client, &dispatches).await;
        Self::transition(&client, &mut state, ConnectionState::Closed);

        ConnectionOutcome::Closed(reason)
    }

    async fn read<R: FrameReader>(
        reader: &mut R,
        idle_timeout: Option<Duration>,
    ) -> Option<Result<Frame, TransportError>> {
        match idle_timeout {
            Some(timeout) => tokio::time::timeout(timeout, reader.read_frame()).await.ok(),
            None => Some(reader.read_frame().await),
        }
    }

    #[allow(clippy::future_not_send)]
    async fn read_loop<R: FrameReader>(
        &self,
        client: &Arc<Client>,
        reader: &mut R,
        dispatches: &TaskTracker,
    ) -> CloseReason {
        loop {
            let result = tokio::select! {
                () = client.disconnect_requested() => return CloseReason::Requested,
                result = Self::read(reader, self.options.idle_timeout) => result,
            };

            let frame = match result {
                None => {
                    log::debug!("connection: idle timeout client_id={}", client.id());
                    return CloseReason::IdleTimeout;
                }
                Some(Err(TransportError::Closed)) => return CloseReason::RemoteClosed,
                Some(Err(e)) => {
                    log::warn!("connection: read failed client_id={}: {e:?}", client.id());
                    return CloseReason::ReadError;
                }
                Some(Ok(frame)) => frame,
            };

            debug_or_trace!(
                (
                    "frame: client_id={} kind={} bytes={}",
                    client.id(),
                    frame.kind,
                    frame.payload.len()
                ),
                (
                    "frame: client_id={} kind={} payload={:?}",
                    client.id(),
                    frame.kind,
                    String::from_utf8_lossy(&frame.payload)
                )
            );

            if frame.kind == FrameKind::Close {
                self.dispatch(client, frame).await;
                return CloseReason::RemoteClosed;
            }

            match self.options.dispatch {
                DispatchMode::Concurrent => {
                    let this = self.clone();
                    let client = client.clone();
                    dispatches.spawn(async move { this.dispatch(&client, frame).await });
                }
                DispatchMode::Sequential => self.dispatch(client, frame).await,
            }
        }
    }

    async fn dispatch(&self, client: &Arc<Client>, mut frame: Frame) {
        if frame.is_data() {
            frame.payload = self
                .middlewares
                .apply_receive(client, frame.payload.to_vec())
                .into();
        }

        if let Err(e) = self.handler.dispatch(client, frame).await {
            log::error!(
                "Handler failed client_id={} route={}: {e:?}",
                client.id(),
                self.path
            );
        }
    }

    async fn close_transport(client: &Client) {
        if let Err(e) = client.close().await {
            log::warn!("connection: close failed client_id={}: {e:?}", client.id());
        }
    }

    /// In-flight dispatches finish before the client leaves the registry and
    /// its rooms, so a late `join_room` cannot outlive the connection.
    async fn teardown(&self, client: &Arc<Client>, dispatches: &TaskTracker) {
        Self::close_transport(client).await;

        dispatches.close();
        if !dispatches.is_empty() {
            log::debug!(
                "connection: waiting for {} dispatch(es) client_id={}",
                dispatches.len(),
                client.id()
            );
        }
        dispatches.wait().await;

        if let Err(e) = self.handler.disconnect(client).await {
            log::error!(
                "on_disconnect failed client_id={} route={}: {e:?}",
                client.id(),
                self.path
            );
        }

        self.registry.remove(client.id());
        self.registry.leave_all_rooms(client);
    }
}
