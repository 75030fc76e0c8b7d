//! Client registry and room manager.
//!
//! Locks are always taken in the order registry, room, client, and every guard is
//! scoped to the statement or block that needs it. Broadcasts collect their
//! recipients under the lock and write after it has been released.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{Arc, PoisonError, RwLock, Weak},
};

use futures::future::join_all;
use switchboard_ws_models::{Event, MetadataValue};

use crate::client::{Client, ClientId, SendError};

pub type RoomId = String;

/// A named broadcast group. Members are weak references; the registry owns the
/// clients.
#[derive(Debug)]
pub struct Room {
    id: RoomId,
    members: RwLock<BTreeMap<ClientId, Weak<Client>>>,
}

impl Room {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            members: RwLock::new(BTreeMap::new()),
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn member_ids(&self) -> Vec<ClientId> {
        self.members
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    /// Live members. Members that were dropped without leaving are skipped.
    #[must_use]
    pub fn members(&self) -> Vec<Arc<Client>> {
        self.members
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter_map(Weak::upgrade)
            .collect()
    }

    #[must_use]
    pub fn contains(&self, client_id: &str) -> bool {
        self.members
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(client_id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.members
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn insert(&self, client: &Arc<Client>) {
        self.members
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(client.id().to_string(), Arc::downgrade(client));
    }

    /// Returns whether the room is now empty.
    fn remove(&self, client_id: &str) -> bool {
        let mut members = self
            .members
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        members.remove(client_id);
        members.is_empty()
    }
}

#[derive(Debug, Default)]
struct Inner {
    clients: BTreeMap<ClientId, Arc<Client>>,
    rooms: BTreeMap<RoomId, Arc<Room>>,
}

/// Directory of live clients and rooms.
#[derive(Debug, Default)]
pub struct Registry {
    inner: RwLock<Inner>,
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add(&self, client: Arc<Client>) {
        log::debug!("add: client_id={}", client.id());
        self.write()
            .clients
            .insert(client.id().to_string(), client);
    }

    pub fn remove(&self, client_id: &str) -> Option<Arc<Client>> {
        log::debug!("remove: client_id={client_id}");
        self.write().clients.remove(client_id)
    }

    #[must_use]
    pub fn get(&self, client_id: &str) -> Option<Arc<Client>> {
        self.read().clients.get(client_id).cloned()
    }

    /// Snapshot of every connected client.
    #[must_use]
    pub fn all(&self) -> Vec<Arc<Client>> {
        self.read().clients.values().cloned().collect()
    }

    #[must_use]
    pub fn client_count(&self) -> usize {
        self.read().clients.len()
    }

    #[must_use]
    pub fn room_count(&self) -> usize {
        self.read().rooms.len()
    }

    /// Linear scan for clients whose metadata `key` equals `value`.
    #[must_use]
    pub fn find_by_metadata(&self, key: &str, value: &MetadataValue) -> Vec<Arc<Client>> {
        self.read()
            .clients
            .values()
            .filter(|x| x.metadata_matches(key, value))
            .cloned()
            .collect()
    }

    /// Adds `client` to `room_id`, creating the room if needed.
    pub fn join_room(&self, client: &Arc<Client>, room_id: &str) {
        log::debug!("join_room: client_id={} room_id={room_id}", client.id());

        let mut inner = self.write();
        let room = inner
            .rooms
            .entry(room_id.to_string())
            .or_insert_with(|| Arc::new(Room::new(room_id)));

        room.insert(client);
        client.add_room(room_id);
    }

    /// Removes `client` from `room_id`, deleting the room once it is empty.
    ///
    /// Returns `false` if the room does not exist.
    pub fn leave_room(&self, client: &Client, room_id: &str) -> bool {
        log::debug!("leave_room: client_id={} room_id={room_id}", client.id());

        let mut inner = self.write();
        let Some(room) = inner.rooms.get(room_id) else {
            client.remove_room(room_id);
            return false;
        };

        if room.remove(client.id()) {
            log::debug!("leave_room: removing empty room_id={room_id}");
            inner.rooms.remove(room_id);
        }
        client.remove_room(room_id);

        true
    }

    /// Removes `client` from every room it is a member of.
    pub fn leave_all_rooms(&self, client: &Client) {
        log::debug!("leave_all_rooms: client_id={}", client.id());

        let mut inner = self.write();
        let mut emptied = vec![];

        for room in inner.rooms.values() {
            if room.contains(client.id()) && room.remove(client.id()) {
                emptied.push(room.id().to_string());
            }
        }

        for room_id in emptied {
            log::debug!("leave_all_rooms: removing empty room_id={room_id}");
            inner.rooms.remove(&room_id);
        }
        client.clear_rooms();
    }

    #[must_use]
    pub fn room(&self, room_id: &str) -> Option<Arc<Room>> {
        self.read().rooms.get(room_id).cloned()
    }

    /// Returns `None` if the room does not exist.
    #[must_use]
    pub fn room_members(&self, room_id: &str) -> Option<Vec<Arc<Client>>> {
        self.room(room_id).map(|room| room.members())
    }

    #[must_use]
    pub fn rooms(&self) -> Vec<RoomId> {
        self.read().rooms.keys().cloned().collect()
    }

    #[must_use]
    pub fn connected_client_ids(&self) -> Vec<ClientId> {
        self.read().clients.keys().cloned().collect()
    }

    #[must_use]
    pub fn connected_client_ids_by_metadata(
        &self,
        key: &str,
        value: &MetadataValue,
    ) -> Vec<ClientId> {
        self.find_by_metadata(key, value)
            .iter()
            .map(|x| x.id().to_string())
            .collect()
    }

    /// Returns `None` if the room does not exist.
    #[must_use]
    pub fn connected_client_ids_by_room(&self, room_id: &str) -> Option<Vec<ClientId>> {
        self.room(room_id).map(|room| room.member_ids())
    }

    /// Rooms of a connected client, read under the registry lock so it agrees with
    /// the room table. Returns `None` if the client is not connected.
    #[must_use]
    pub fn client_rooms(&self, client_id: &str) -> Option<BTreeSet<RoomId>> {
        self.read().clients.get(client_id).map(|x| x.rooms())
    }

    async fn deliver(targets: Vec<Arc<Client>>, data: &[u8]) {
        log::trace!("deliver: recipients={} bytes={}", targets.len(), data.len());

        let results = join_all(targets.iter().map(|x| x.write(data.to_vec()))).await;

        for (client, result) in targets.iter().zip(results) {
            if let Err(e) = result {
                log::error!("Failed to deliver to client_id={}: {e:?}", client.id());
            }
        }
    }

    async fn deliver_event(targets: Vec<Arc<Client>>, event: &Event) {
        match event.to_bytes() {
            Ok(data) => Self::deliver(targets, &data).await,
            Err(e) => log::error!("Failed to encode event={}: {e:?}", event.identifier),
        }
    }

    pub async fn send_to_room(&self, room_id: &str, data: &[u8]) {
        let Some(targets) = self.room_members(room_id) else {
            log::debug!("send_to_room: no room_id={room_id}");
            return;
        };
        Self::deliver(targets, data).await;
    }

    pub async fn send_event_to_room(&self, room_id: &str, event: &Event) {
        let Some(targets) = self.room_members(room_id) else {
            log::debug!("send_event_to_room: no room_id={room_id}");
            return;
        };
        Self::deliver_event(targets, event).await;
    }

    pub async fn send_to_all(&self, data: &[u8]) {
        Self::deliver(self.all(), data).await;
    }

    pub async fn send_event_to_all(&self, event: &Event) {
        Self::deliver_event(self.all(), event).await;
    }

    fn all_except(&self, client_id: &str) -> Vec<Arc<Client>> {
        self.read()
            .clients
            .values()
            .filter(|x| x.id() != client_id)
            .cloned()
            .collect()
    }

    pub async fn send_to_all_except(&self, client_id: &str, data: &[u8]) {
        Self::deliver(self.all_except(client_id), data).await;
    }

    pub async fn send_event_to_all_except(&self, client_id: &str, event: &Event) {
        Self::deliver_event(self.all_except(client_id), event).await;
    }

    pub async fn send_to_all_by_metadata(&self, key: &str, value: &MetadataValue, data: &[u8]) {
        Self::deliver(self.find_by_metadata(key, value), data).await;
    }

    pub async fn send_event_to_all_by_metadata(
        &self,
        key: &str,
        value: &MetadataValue,
        event: &Event,
    ) {
        Self::deliver_event(self.find_by_metadata(key, value), event).await;
    }

    /// # Errors
    ///
    /// * If no client with `client_id` is connected
    /// * If the write to the client fails
    pub async fn send_to_client(&self, client_id: &str, data: &[u8]) -> Result<(), SendError> {
        let client = self
            .get(client_id)
            .ok_or_else(|| SendError::ClientNotFound(client_id.to_string()))?;

        client.write(data.to_vec()).await
    }

    /// # Errors
    ///
    /// * If no client with `client_id` is connected
    /// * If the event fails to encode
    /// * If the write to the client fails
    pub async fn send_event_to_client(&self, client_id: &str, event: &Event) -> Result<(), SendError> {
        let client = self
            .get(client_id)
            .ok_or_else(|| SendError::ClientNotFound(client_id.to_string()))?;

        client.write_event(event).await
    }
}
