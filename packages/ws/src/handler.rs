//! Per-route handler pipeline.
//!
//! A [`ClientHandler`] holds the lifecycle callbacks of a route and the handlers
//! for raw messages and events. Raw handlers are keyed by the exact frame payload,
//! event handlers by event identifier, and both fall back to [`WILDCARD`].

use std::{collections::BTreeMap, future::Future, sync::Arc};

use bytes::Bytes;
use futures::{FutureExt as _, future::BoxFuture};
use switchboard_ws_models::Event;
use thiserror::Error;

use crate::{
    client::{Client, SendError},
    frame::{Frame, FrameKind},
};

/// Key that matches anything without a dedicated handler.
pub const WILDCARD: &str = "*";

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error(transparent)]
    Send(#[from] SendError),
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

pub type LifecycleCallback =
    Arc<dyn Fn(Arc<Client>) -> BoxFuture<'static, Result<(), HandlerError>> + Send + Sync>;

pub type MessageCallback =
    Arc<dyn Fn(Arc<Client>, Bytes) -> BoxFuture<'static, Result<(), HandlerError>> + Send + Sync>;

pub type EventCallback =
    Arc<dyn Fn(Arc<Client>, Event) -> BoxFuture<'static, Result<(), HandlerError>> + Send + Sync>;

#[derive(Default, Clone)]
pub struct ClientHandler {
    on_connect: Option<LifecycleCallback>,
    on_disconnect: Option<LifecycleCallback>,
    on: BTreeMap<Bytes, MessageCallback>,
    on_event: BTreeMap<String, EventCallback>,
}

impl std::fmt::Debug for ClientHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientHandler")
            .field("on_connect", &self.on_connect.is_some())
            .field("on_disconnect", &self.on_disconnect.is_some())
            .field("on", &self.on.keys().collect::<Vec<_>>())
            .field("on_event", &self.on_event.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ClientHandler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Called once the handshake accepted the connection. An error rejects the
    /// connection.
    #[must_use]
    pub fn on_connect<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Arc<Client>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.on_connect = Some(Arc::new(move |client: Arc<Client>| f(client).boxed()));
        self
    }

    /// Called at most once, when the connection closes.
    #[must_use]
    pub fn on_disconnect<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Arc<Client>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.on_disconnect = Some(Arc::new(move |client: Arc<Client>| f(client).boxed()));
        self
    }

    /// Handles raw frames whose payload is exactly `key`.
    #[must_use]
    pub fn on<F, Fut>(mut self, key: impl Into<Bytes>, f: F) -> Self
    where
        F: Fn(Arc<Client>, Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.on.insert(
            key.into(),
            Arc::new(move |client: Arc<Client>, data: Bytes| f(client, data).boxed()),
        );
        self
    }

    /// Handles events named `identifier`.
    #[must_use]
    pub fn on_event<F, Fut>(mut self, identifier: impl Into<String>, f: F) -> Self
    where
        F: Fn(Arc<Client>, Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.on_event.insert(
            identifier.into(),
            Arc::new(move |client: Arc<Client>, event: Event| f(client, event).boxed()),
        );
        self
    }

    /// # Errors
    ///
    /// * If the `on_connect` callback fails
    pub async fn connect(&self, client: &Arc<Client>) -> Result<(), HandlerError> {
        match &self.on_connect {
            Some(callback) => callback(client.clone()).await,
            None => Ok(()),
        }
    }

    /// Runs the `on_disconnect` callback unless it already ran for `client`.
    ///
    /// # Errors
    ///
    /// * If the `on_disconnect` callback fails
    pub async fn disconnect(&self, client: &Arc<Client>) -> Result<(), HandlerError> {
        if !client.mark_disconnected() {
            log::trace!("disconnect: already handled client_id={}", client.id());
            return Ok(());
        }

        match &self.on_disconnect {
            Some(callback) => callback(client.clone()).await,
            None => Ok(()),
        }
    }

    /// Dispatches one inbound frame.
    ///
    /// # Errors
    ///
    /// * If the matched callback fails
    /// * If a pong reply could not be written
    pub async fn dispatch(&self, client: &Arc<Client>, frame: Frame) -> Result<(), HandlerError> {
        match frame.kind {
            FrameKind::Close => self.disconnect(client).await,
            FrameKind::Text | FrameKind::Binary => self.dispatch_data(client, frame.payload).await,
            FrameKind::Ping => {
                client.write_frame(Frame::pong(frame.payload)).await?;
                Ok(())
            }
            FrameKind::Pong => Ok(()),
        }
    }

    async fn dispatch_data(&self, client: &Arc<Client>, payload: Bytes) -> Result<(), HandlerError> {
        if let Some(event) = Event::classify(&payload) {
            let callback = self
                .on_event
                .get(&event.identifier)
                .or_else(|| self.on_event.get(WILDCARD));

            let Some(callback) = callback else {
                log::trace!(
                    "dispatch: no event handler client_id={} event={}",
                    client.id(),
                    event.identifier
                );
                return Ok(());
            };

            return callback(client.clone(), event).await;
        }

        let callback = self
            .on
            .get(&payload)
            .or_else(|| self.on.get(WILDCARD.as_bytes()));

        let Some(callback) = callback else {
            log::trace!("dispatch: no message handler client_id={}", client.id());
            return Ok(());
        };

        callback(client.clone(), payload).await
    }
}
