use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{
        PoisonError, RwLock,
        atomic::{AtomicBool, Ordering},
    },
};

use serde::Serialize;
use switchboard_ws_models::{Event, MetadataValue};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use crate::{
    frame::{Frame, FrameWriter, TransportError},
    middleware::SendMiddleware,
    registry::RoomId,
};

pub type ClientId = String;

#[derive(Debug, Error)]
pub enum SendError {
    #[error("Client not found: {0}")]
    ClientNotFound(ClientId),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

/// One live connection.
///
/// Owned by the [`Registry`](crate::registry::Registry) once connected. Rooms only
/// hold weak references.
pub struct Client {
    id: ClientId,
    route: String,
    writer: Mutex<Box<dyn FrameWriter>>,
    send_middlewares: Vec<SendMiddleware>,
    metadata: RwLock<BTreeMap<String, MetadataValue>>,
    rooms: RwLock<BTreeSet<RoomId>>,
    token: CancellationToken,
    disconnected: AtomicBool,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.id)
            .field("route", &self.route)
            .field("send_middlewares", &self.send_middlewares.len())
            .field("metadata", &self.metadata)
            .field("rooms", &self.rooms)
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Creates a client with a random id.
    #[must_use]
    pub fn new(
        route: impl Into<String>,
        writer: Box<dyn FrameWriter>,
        send_middlewares: Vec<SendMiddleware>,
    ) -> Self {
        Self::with_id(
            uuid::Uuid::new_v4().to_string(),
            route,
            writer,
            send_middlewares,
        )
    }

    #[must_use]
    pub fn with_id(
        id: impl Into<ClientId>,
        route: impl Into<String>,
        writer: Box<dyn FrameWriter>,
        send_middlewares: Vec<SendMiddleware>,
    ) -> Self {
        Self {
            id: id.into(),
            route: route.into(),
            writer: Mutex::new(writer),
            send_middlewares,
            metadata: RwLock::new(BTreeMap::new()),
            rooms: RwLock::new(BTreeSet::new()),
            token: CancellationToken::new(),
            disconnected: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Route path this client connected through.
    #[must_use]
    pub fn route(&self) -> &str {
        &self.route
    }

    pub fn set_metadata(&self, key: impl Into<String>, value: impl Into<MetadataValue>) {
        self.metadata
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.into(), value.into());
    }

    /// Returns `None` if `key` was never set. A stored `null` is returned as
    /// `Some(Value::Null)`.
    #[must_use]
    pub fn get_metadata(&self, key: &str) -> Option<MetadataValue> {
        self.metadata
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    pub fn remove_metadata(&self, key: &str) -> Option<MetadataValue> {
        self.metadata
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
    }

    #[must_use]
    pub fn metadata_matches(&self, key: &str, value: &MetadataValue) -> bool {
        self.metadata
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .is_some_and(|x| x == value)
    }

    /// Rooms this client is a member of.
    ///
    /// [`Registry::client_rooms`](crate::registry::Registry::client_rooms) gives a
    /// view consistent with the room table.
    #[must_use]
    pub fn rooms(&self) -> BTreeSet<RoomId> {
        self.rooms
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    #[must_use]
    pub fn in_room(&self, room_id: &str) -> bool {
        self.rooms
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(room_id)
    }

    pub(crate) fn add_room(&self, room_id: &str) {
        self.rooms
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(room_id.to_string());
    }

    pub(crate) fn remove_room(&self, room_id: &str) {
        self.rooms
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(room_id);
    }

    pub(crate) fn clear_rooms(&self) {
        self.rooms
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Sends `data` to this client.
    ///
    /// The payload goes through every send middleware bound to the client's
    /// route, in registration order. A failing middleware is logged and skipped;
    /// the remaining middlewares and the write still happen. Valid UTF-8 is sent
    /// as a text frame, anything else as a binary frame.
    ///
    /// # Errors
    ///
    /// * If the frame could not be written to the transport
    pub async fn write(&self, data: impl Into<Vec<u8>>) -> Result<(), SendError> {
        let mut data = data.into();

        for middleware in &self.send_middlewares {
            if let Err(e) = middleware(self, &mut data) {
                log::error!(
                    "Send middleware failed client_id={} route={}: {e:?}",
                    self.id,
                    self.route
                );
            }
        }

        let frame = if std::str::from_utf8(&data).is_ok() {
            Frame::text(data)
        } else {
            Frame::binary(data)
        };

        self.write_frame(frame).await
    }

    /// # Errors
    ///
    /// * If the event fails to encode
    /// * If the frame could not be written to the transport
    pub async fn write_event(&self, event: &Event) -> Result<(), SendError> {
        self.write(event.to_bytes()?).await
    }

    /// Serializes `value` to JSON and sends it like [`Self::write`].
    ///
    /// # Errors
    ///
    /// * If `value` fails to serialize
    /// * If the frame could not be written to the transport
    pub async fn write_json<T: Serialize + ?Sized + Sync>(&self, value: &T) -> Result<(), SendError> {
        self.write(serde_json::to_vec(value)?).await
    }

    /// Writes a frame as is, bypassing send middlewares.
    pub(crate) async fn write_frame(&self, frame: Frame) -> Result<(), SendError> {
        self.writer.lock().await.write_frame(frame).await?;
        Ok(())
    }

    /// Closes the underlying transport.
    ///
    /// # Errors
    ///
    /// * If the close handshake could not be sent
    pub async fn close(&self) -> Result<(), SendError> {
        self.writer.lock().await.close().await?;
        Ok(())
    }

    /// Asks the connection loop to stop reading and tear this client down.
    pub fn disconnect(&self) {
        log::debug!("disconnect requested client_id={}", self.id);
        self.token.cancel();
    }

    #[must_use]
    pub fn is_disconnect_requested(&self) -> bool {
        self.token.is_cancelled()
    }

    pub(crate) fn disconnect_requested(&self) -> WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }

    /// Returns `true` the first time it is called.
    pub(crate) fn mark_disconnected(&self) -> bool {
        !self.disconnected.swap(true, Ordering::SeqCst)
    }
}
