//! Broadcast API for application code.
//!
//! With a [`FanOut`] configured every call goes through the backbone, otherwise
//! it goes straight to the local [`Registry`].

use std::sync::Arc;

use switchboard_ws_models::{Event, MetadataValue};
use thiserror::Error;

use crate::{
    client::SendError,
    fanout::{FanOut, FanOutError},
    registry::Registry,
};

#[derive(Debug, Error)]
pub enum BroadcastError {
    #[error(transparent)]
    Send(#[from] SendError),
    #[error(transparent)]
    FanOut(#[from] FanOutError),
}

#[derive(Debug, Clone)]
pub struct Broadcaster {
    registry: Arc<Registry>,
    fan_out: Option<Arc<FanOut>>,
}

impl Broadcaster {
    #[must_use]
    pub const fn local(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            fan_out: None,
        }
    }

    #[must_use]
    pub fn clustered(fan_out: Arc<FanOut>) -> Self {
        Self {
            registry: fan_out.registry().clone(),
            fan_out: Some(fan_out),
        }
    }

    #[must_use]
    pub const fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    #[must_use]
    pub const fn is_clustered(&self) -> bool {
        self.fan_out.is_some()
    }

    /// # Errors
    ///
    /// * If the backbone publish fails
    pub async fn send_to_room(&self, room_id: &str, data: &[u8]) -> Result<(), BroadcastError> {
        match &self.fan_out {
            Some(fan_out) => fan_out.send_to_room(room_id, data).await?,
            None => self.registry.send_to_room(room_id, data).await,
        }
        Ok(())
    }

    /// # Errors
    ///
    /// * If the backbone publish fails
    pub async fn send_event_to_room(&self, room_id: &str, event: &Event) -> Result<(), BroadcastError> {
        match &self.fan_out {
            Some(fan_out) => fan_out.send_event_to_room(room_id, event).await?,
            None => self.registry.send_event_to_room(room_id, event).await,
        }
        Ok(())
    }

    /// # Errors
    ///
    /// * If the backbone publish fails
    pub async fn send_to_all(&self, data: &[u8]) -> Result<(), BroadcastError> {
        match &self.fan_out {
            Some(fan_out) => fan_out.send_to_all(data).await?,
            None => self.registry.send_to_all(data).await,
        }
        Ok(())
    }

    /// # Errors
    ///
    /// * If the backbone publish fails
    pub async fn send_event_to_all(&self, event: &Event) -> Result<(), BroadcastError> {
        match &self.fan_out {
            Some(fan_out) => fan_out.send_event_to_all(event).await?,
            None => self.registry.send_event_to_all(event).await,
        }
        Ok(())
    }

    /// # Errors
    ///
    /// * If the backbone publish fails
    pub async fn send_to_all_except(&self, client_id: &str, data: &[u8]) -> Result<(), BroadcastError> {
        match &self.fan_out {
            Some(fan_out) => fan_out.send_to_all_except(client_id, data).await?,
            None => self.registry.send_to_all_except(client_id, data).await,
        }
        Ok(())
    }

    /// # Errors
    ///
    /// * If the backbone publish fails
    pub async fn send_event_to_all_except(
        &self,
        client_id: &str,
        event: &Event,
    ) -> Result<(), BroadcastError> {
        match &self.fan_out {
            Some(fan_out) => fan_out.send_event_to_all_except(client_id, event).await?,
            None => self.registry.send_event_to_all_except(client_id, event).await,
        }
        Ok(())
    }

    /// # Errors
    ///
    /// * If the backbone publish fails
    pub async fn send_to_all_by_metadata(
        &self,
        key: &str,
        value: &MetadataValue,
        data: &[u8],
    ) -> Result<(), BroadcastError> {
        match &self.fan_out {
            Some(fan_out) => fan_out.send_to_all_by_metadata(key, value, data).await?,
            None => self.registry.send_to_all_by_metadata(key, value, data).await,
        }
        Ok(())
    }

    /// # Errors
    ///
    /// * If the backbone publish fails
    pub async fn send_event_to_all_by_metadata(
        &self,
        key: &str,
        value: &MetadataValue,
        event: &Event,
    ) -> Result<(), BroadcastError> {
        match &self.fan_out {
            Some(fan_out) => {
                fan_out
                    .send_event_to_all_by_metadata(key, value, event)
                    .await?;
            }
            None => {
                self.registry
                    .send_event_to_all_by_metadata(key, value, event)
                    .await;
            }
        }
        Ok(())
    }

    /// # Errors
    ///
    /// * If the client is not connected to this process (local mode only)
    /// * If the write fails (local mode only)
    /// * If the backbone publish fails
    pub async fn send_to_client(&self, client_id: &str, data: &[u8]) -> Result<(), BroadcastError> {
        match &self.fan_out {
            Some(fan_out) => fan_out.send_to_client(client_id, data).await?,
            None => self.registry.send_to_client(client_id, data).await?,
        }
        Ok(())
    }

    /// # Errors
    ///
    /// * If the client is not connected to this process (local mode only)
    /// * If the write fails (local mode only)
    /// * If the backbone publish fails
    pub async fn send_event_to_client(&self, client_id: &str, event: &Event) -> Result<(), BroadcastError> {
        match &self.fan_out {
            Some(fan_out) => fan_out.send_event_to_client(client_id, event).await?,
            None => self.registry.send_event_to_client(client_id, event).await?,
        }
        Ok(())
    }

    /// Publishes a line to every process's log. Logs locally when not clustered.
    ///
    /// # Errors
    ///
    /// * If the backbone publish fails
    pub async fn publish_log(&self, line: &str) -> Result<(), BroadcastError> {
        match &self.fan_out {
            Some(fan_out) => fan_out.publish_log(line).await?,
            None => log::info!("{line}"),
        }
        Ok(())
    }
}
