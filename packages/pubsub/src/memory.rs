//! In-process backbone.
//!
//! Cloning a [`MemoryPubSub`] yields a handle onto the same bus, so two fan-out
//! layers built from clones behave like two processes sharing one Redis.

use std::{
    collections::BTreeSet,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use tokio::sync::broadcast::{self, error::RecvError};

use crate::{PubSub, PubSubError, PubSubMessage, Subscription};

const BUS_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub struct MemoryPubSub {
    bus: broadcast::Sender<PubSubMessage>,
    published: Arc<AtomicUsize>,
}

impl Default for MemoryPubSub {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryPubSub {
    #[must_use]
    pub fn new() -> Self {
        let (bus, _) = broadcast::channel(BUS_CAPACITY);

        Self {
            bus,
            published: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of messages published on this bus by any handle.
    #[must_use]
    pub fn published_count(&self) -> usize {
        self.published.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PubSub for MemoryPubSub {
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), PubSubError> {
        self.published.fetch_add(1, Ordering::SeqCst);
        log::trace!("publish: channel={channel} payload={payload}");

        // no subscribers is not an error, same as a Redis PUBLISH reaching 0 clients
        let _ = self.bus.send(PubSubMessage {
            channel: channel.to_string(),
            payload: payload.to_string(),
        });

        Ok(())
    }

    async fn subscribe(&self, channels: &[String]) -> Result<Subscription, PubSubError> {
        let receiver = self.bus.subscribe();
        let channels = channels.iter().cloned().collect::<BTreeSet<_>>();

        log::debug!("subscribe: channels={channels:?}");

        let stream = futures::stream::unfold(
            (receiver, channels),
            |(mut receiver, channels)| async move {
                loop {
                    match receiver.recv().await {
                        Ok(message) => {
                            if channels.contains(&message.channel) {
                                return Some((message, (receiver, channels)));
                            }
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            log::warn!("subscription lagged, skipped {skipped} messages");
                        }
                        Err(RecvError::Closed) => return None,
                    }
                }
            },
        );

        Ok(Box::pin(stream))
    }
}
