//! Cluster-wide broadcasts.
//!
//! Every broadcast is published on a backbone channel and re-delivered to local
//! clients by the subscription loop of each process, the publishing process
//! included.

use std::sync::Arc;

use futures::StreamExt as _;
use strum::IntoEnumIterator as _;
use switchboard_pubsub::{PubSub, PubSubError, PubSubMessage};
use switchboard_ws_models::{Channel, DistributedPayload, Event, MetadataValue};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::registry::Registry;

#[derive(Debug, Error)]
pub enum FanOutError {
    #[error(transparent)]
    PubSub(#[from] PubSubError),
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
    #[error("Unknown channel: {0}")]
    UnknownChannel(String),
    #[error("Backbone subscription ended")]
    SubscriptionEnded,
    #[error("Missing '{field}' for channel {channel}")]
    MissingField {
        channel: Channel,
        field: &'static str,
    },
}

#[derive(Debug)]
pub struct FanOut {
    pubsub: Arc<dyn PubSub>,
    registry: Arc<Registry>,
    token: CancellationToken,
}

impl FanOut {
    /// Subscribes to every backbone channel and spawns the subscription loop,
    /// which runs until `token` is cancelled. If the backbone ends the
    /// subscription first, `token` is cancelled and the handle resolves to
    /// [`FanOutError::SubscriptionEnded`].
    ///
    /// # Errors
    ///
    /// * If the subscription cannot be established
    pub async fn start(
        pubsub: Arc<dyn PubSub>,
        registry: Arc<Registry>,
        token: CancellationToken,
    ) -> Result<(Arc<Self>, JoinHandle<Result<(), FanOutError>>), FanOutError> {
        let channels = Channel::iter().map(|x| x.to_string()).collect::<Vec<_>>();
        let mut subscription = pubsub.subscribe(&channels).await?;

        log::debug!("start: subscribed to {} channels", channels.len());

        let fan_out = Arc::new(Self {
            pubsub,
            registry,
            token: token.clone(),
        });

        let handle = {
            let registry = fan_out.registry.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        () = token.cancelled() => {
                            log::debug!("subscription loop cancelled");
                            return Ok(());
                        }
                        message = subscription.next() => {
                            let Some(message) = message else {
                                log::error!("Backbone subscription ended, shutting down");
                                token.cancel();
                                return Err(FanOutError::SubscriptionEnded);
                            };
                            let registry = registry.clone();
                            tokio::spawn(async move {
                                if let Err(e) = handle_message(&registry, &message).await {
                                    log::error!(
                                        "Dropping backbone message on channel={}: {e:?}",
                                        message.channel
                                    );
                                }
                            });
                        }
                    }
                }
            })
        };

        Ok((fan_out, handle))
    }

    /// Stops the subscription loop.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    #[must_use]
    pub const fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    async fn publish(&self, channel: Channel, payload: &DistributedPayload) -> Result<(), FanOutError> {
        let payload = payload.to_json()?;
        log::trace!("publish: channel={channel} payload={payload}");
        self.pubsub.publish(channel.as_ref(), &payload).await?;
        Ok(())
    }

    /// Publishes a free-form line on the default channel. Every process logs it.
    ///
    /// # Errors
    ///
    /// * If the publish fails
    pub async fn publish_log(&self, line: &str) -> Result<(), FanOutError> {
        self.pubsub.publish(Channel::Default.as_ref(), line).await?;
        Ok(())
    }

    /// # Errors
    ///
    /// * If the publish fails
    pub async fn send_to_room(&self, room_id: &str, data: &[u8]) -> Result<(), FanOutError> {
        self.publish(
            Channel::Room,
            &DistributedPayload::message(Some(room_id.to_string()), data),
        )
        .await
    }

    /// # Errors
    ///
    /// * If the publish fails
    pub async fn send_event_to_room(&self, room_id: &str, event: &Event) -> Result<(), FanOutError> {
        self.publish(
            Channel::RoomEvent,
            &DistributedPayload::event(Some(room_id.to_string()), event.clone()),
        )
        .await
    }

    /// # Errors
    ///
    /// * If the publish fails
    pub async fn send_to_all(&self, data: &[u8]) -> Result<(), FanOutError> {
        self.publish(Channel::All, &DistributedPayload::message(None, data))
            .await
    }

    /// # Errors
    ///
    /// * If the publish fails
    pub async fn send_event_to_all(&self, event: &Event) -> Result<(), FanOutError> {
        self.publish(Channel::AllEvent, &DistributedPayload::event(None, event.clone()))
            .await
    }

    /// # Errors
    ///
    /// * If the publish fails
    pub async fn send_to_all_except(&self, client_id: &str, data: &[u8]) -> Result<(), FanOutError> {
        self.publish(
            Channel::All,
            &DistributedPayload::message(Some(client_id.to_string()), data),
        )
        .await
    }

    /// # Errors
    ///
    /// * If the publish fails
    pub async fn send_event_to_all_except(
        &self,
        client_id: &str,
        event: &Event,
    ) -> Result<(), FanOutError> {
        self.publish(
            Channel::AllEvent,
            &DistributedPayload::event(Some(client_id.to_string()), event.clone()),
        )
        .await
    }

    /// # Errors
    ///
    /// * If the publish fails
    pub async fn send_to_all_by_metadata(
        &self,
        key: &str,
        value: &MetadataValue,
        data: &[u8],
    ) -> Result<(), FanOutError> {
        self.publish(
            Channel::Metadata,
            &DistributedPayload::message(None, data).with_metadata(key, value.clone()),
        )
        .await
    }

    /// # Errors
    ///
    /// * If the publish fails
    pub async fn send_event_to_all_by_metadata(
        &self,
        key: &str,
        value: &MetadataValue,
        event: &Event,
    ) -> Result<(), FanOutError> {
        self.publish(
            Channel::MetadataEvent,
            &DistributedPayload::event(None, event.clone()).with_metadata(key, value.clone()),
        )
        .await
    }

    /// Succeeds once published; whether the client is connected anywhere is only
    /// known to the receiving processes.
    ///
    /// # Errors
    ///
    /// * If the publish fails
    pub async fn send_to_client(&self, client_id: &str, data: &[u8]) -> Result<(), FanOutError> {
        self.publish(
            Channel::Client,
            &DistributedPayload::message(Some(client_id.to_string()), data),
        )
        .await
    }

    /// # Errors
    ///
    /// * If the publish fails
    pub async fn send_event_to_client(&self, client_id: &str, event: &Event) -> Result<(), FanOutError> {
        self.publish(
            Channel::ClientEvent,
            &DistributedPayload::event(Some(client_id.to_string()), event.clone()),
        )
        .await
    }
}

const fn missing(channel: Channel, field: &'static str) -> FanOutError {
    FanOutError::MissingField { channel, field }
}

/// Re-delivers one backbone message to local clients.
async fn handle_message(registry: &Registry, message: &PubSubMessage) -> Result<(), FanOutError> {
    let channel = message
        .channel
        .parse::<Channel>()
        .map_err(|_| FanOutError::UnknownChannel(message.channel.clone()))?;

    if channel == Channel::Default {
        log::info!("backbone: {}", message.payload);
        return Ok(());
    }

    let payload = DistributedPayload::from_json(&message.payload)?;

    log::trace!("handle_message: channel={channel} payload={payload:?}");

    match channel {
        Channel::Default => {}
        Channel::Client => {
            let id = payload.id.ok_or_else(|| missing(channel, "id"))?;
            let data = payload.message.ok_or_else(|| missing(channel, "message"))?;
            if let Err(e) = registry.send_to_client(&id, &data).await {
                log::debug!("backbone: send_to_client client_id={id}: {e:?}");
            }
        }
        Channel::ClientEvent => {
            let id = payload.id.ok_or_else(|| missing(channel, "id"))?;
            let event = payload.event.ok_or_else(|| missing(channel, "event"))?;
            if let Err(e) = registry.send_event_to_client(&id, &event).await {
                log::debug!("backbone: send_event_to_client client_id={id}: {e:?}");
            }
        }
        Channel::Room => {
            let id = payload.id.ok_or_else(|| missing(channel, "id"))?;
            let data = payload.message.ok_or_else(|| missing(channel, "message"))?;
            registry.send_to_room(&id, &data).await;
        }
        Channel::RoomEvent => {
            let id = payload.id.ok_or_else(|| missing(channel, "id"))?;
            let event = payload.event.ok_or_else(|| missing(channel, "event"))?;
            registry.send_event_to_room(&id, &event).await;
        }
        Channel::All => {
            let data = payload.message.ok_or_else(|| missing(channel, "message"))?;
            match payload.id {
                Some(skip) => registry.send_to_all_except(&skip, &data).await,
                None => registry.send_to_all(&data).await,
            }
        }
        Channel::AllEvent => {
            let event = payload.event.ok_or_else(|| missing(channel, "event"))?;
            match payload.id {
                Some(skip) => registry.send_event_to_all_except(&skip, &event).await,
                None => registry.send_event_to_all(&event).await,
            }
        }
        Channel::Metadata => {
            let key = payload.meta_key.ok_or_else(|| missing(channel, "metaKey"))?;
            let value = payload.meta_value.ok_or_else(|| missing(channel, "metaValue"))?;
            let data = payload.message.ok_or_else(|| missing(channel, "message"))?;
            registry.send_to_all_by_metadata(&key, &value, &data).await;
        }
        Channel::MetadataEvent => {
            let key = payload.meta_key.ok_or_else(|| missing(channel, "metaKey"))?;
            let value = payload.meta_value.ok_or_else(|| missing(channel, "metaValue"))?;
            let event = payload.event.ok_or_else(|| missing(channel, "event"))?;
            registry.send_event_to_all_by_metadata(&key, &value, &event).await;
        }
    }

    Ok(())
}

#[cfg(all(test, feature = "simulator"))]
mod tests {
    use std::time::Duration;

    use pretty_assertions::assert_eq;
    use serde_json::json;
    use switchboard_pubsub::memory::MemoryPubSub;

    use super::*;
    use crate::{frame::Frame, simulator};

    const WAIT: Duration = Duration::from_secs(1);

    fn message(channel: Channel, payload: &DistributedPayload) -> PubSubMessage {
        PubSubMessage {
            channel: channel.to_string(),
            payload: payload.to_json().unwrap(),
        }
    }

    #[test_log::test(tokio::test)]
    async fn all_channel_id_names_the_client_to_skip() {
        let registry = Registry::new();
        let (a, peer_a) = simulator::client("/ws", vec![]);
        let (b, peer_b) = simulator::client("/ws", vec![]);
        registry.add(a.clone());
        registry.add(b);

        handle_message(
            &registry,
            &message(
                Channel::All,
                &DistributedPayload::message(Some(a.id().to_string()), b"x".to_vec()),
            ),
        )
        .await
        .unwrap();

        assert!(peer_a.received().is_empty());
        assert_eq!(peer_b.received(), vec![Frame::text("x")]);
    }

    #[test_log::test(tokio::test)]
    async fn metadata_channel_filters_recipients() {
        let registry = Registry::new();
        let (a, peer_a) = simulator::client("/ws", vec![]);
        let (b, peer_b) = simulator::client("/ws", vec![]);
        a.set_metadata("team", "red");
        b.set_metadata("team", "blue");
        registry.add(a);
        registry.add(b);

        handle_message(
            &registry,
            &message(
                Channel::MetadataEvent,
                &DistributedPayload::event(None, Event::new("goal", 1))
                    .with_metadata("team", json!("red")),
            ),
        )
        .await
        .unwrap();

        assert_eq!(peer_a.received().len(), 1);
        assert!(peer_b.received().is_empty());
    }

    #[test_log::test(tokio::test)]
    async fn malformed_payloads_are_rejected() {
        let registry = Registry::new();

        assert!(matches!(
            handle_message(
                &registry,
                &PubSubMessage {
                    channel: Channel::Room.to_string(),
                    payload: "not json".to_string(),
                },
            )
            .await,
            Err(FanOutError::Serde(_))
        ));
        assert!(matches!(
            handle_message(
                &registry,
                &message(Channel::Room, &DistributedPayload::message(None, b"x".to_vec())),
            )
            .await,
            Err(FanOutError::MissingField { field: "id", .. })
        ));
        assert!(matches!(
            handle_message(
                &registry,
                &PubSubMessage {
                    channel: "elsewhere".to_string(),
                    payload: "{}".to_string(),
                },
            )
            .await,
            Err(FanOutError::UnknownChannel(_))
        ));
    }

    #[test_log::test(tokio::test)]
    async fn publishing_process_receives_its_own_broadcast() {
        let registry = Arc::new(Registry::new());
        let (a, peer_a) = simulator::client("/ws", vec![]);
        registry.add(a.clone());
        registry.join_room(&a, "lobby");
        let token = CancellationToken::new();

        let (fan_out, handle) = FanOut::start(
            Arc::new(MemoryPubSub::new()),
            registry.clone(),
            token.clone(),
        )
        .await
        .unwrap();

        fan_out.send_to_room("lobby", b"hello").await.unwrap();

        assert_eq!(peer_a.next_frame(WAIT).await, Some(Frame::text("hello")));

        fan_out.shutdown();
        assert!(handle.await.unwrap().is_ok());
    }

    #[test_log::test(tokio::test)]
    async fn malformed_messages_do_not_stop_the_loop() {
        let registry = Arc::new(Registry::new());
        let (a, peer_a) = simulator::client("/ws", vec![]);
        registry.add(a.clone());
        let bus = MemoryPubSub::new();

        let (fan_out, _handle) = FanOut::start(
            Arc::new(bus.clone()),
            registry,
            CancellationToken::new(),
        )
        .await
        .unwrap();

        bus.publish(Channel::All.as_ref(), "garbage").await.unwrap();
        fan_out.send_to_client(a.id(), b"after").await.unwrap();

        assert_eq!(peer_a.next_frame(WAIT).await, Some(Frame::text("after")));
    }

    struct EndedPubSub;

    #[async_trait::async_trait]
    impl PubSub for EndedPubSub {
        async fn publish(&self, _channel: &str, _payload: &str) -> Result<(), PubSubError> {
            Ok(())
        }

        async fn subscribe(
            &self,
            _channels: &[String],
        ) -> Result<switchboard_pubsub::Subscription, PubSubError> {
            Ok(futures::stream::empty::<PubSubMessage>().boxed())
        }
    }

    #[test_log::test(tokio::test)]
    async fn ended_subscription_cancels_the_token_and_fails_the_loop() {
        let token = CancellationToken::new();

        let (_fan_out, handle) = FanOut::start(
            Arc::new(EndedPubSub),
            Arc::new(Registry::new()),
            token.clone(),
        )
        .await
        .unwrap();

        let result = tokio::time::timeout(WAIT, handle).await.unwrap().unwrap();

        assert!(matches!(result, Err(FanOutError::SubscriptionEnded)));
        assert!(token.is_cancelled());
    }
}
