//! Redis backed backbone.

use async_trait::async_trait;
use futures::StreamExt as _;
use redis::aio::ConnectionManager;

use crate::{PubSub, PubSubError, PubSubMessage, Subscription};

/// Redis `PUBLISH`/`SUBSCRIBE` backbone.
///
/// Publishing goes through a [`ConnectionManager`], which reconnects on its own.
/// Every [`PubSub::subscribe`] call opens a dedicated pub/sub connection.
#[derive(Clone)]
pub struct RedisPubSub {
    client: redis::Client,
    connection: ConnectionManager,
}

impl std::fmt::Debug for RedisPubSub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisPubSub")
            .field("client", &self.client)
            .finish_non_exhaustive()
    }
}

impl RedisPubSub {
    /// Connects to Redis at `url` and verifies the connection with a `PING`.
    ///
    /// # Errors
    ///
    /// * If the url is invalid
    /// * If Redis is unreachable
    /// * If the `PING` response is not `PONG`
    pub async fn connect(url: &str) -> Result<Self, PubSubError> {
        log::debug!("connect: url={url}");

        let client = redis::Client::open(url)?;
        let mut connection = ConnectionManager::new(client.clone()).await?;

        let pong = redis::cmd("PING")
            .query_async::<String>(&mut connection)
            .await?;

        if pong != "PONG" {
            return Err(PubSubError::UnexpectedPing(pong));
        }

        log::info!("Redis connection established");

        Ok(Self { client, connection })
    }
}

#[async_trait]
impl PubSub for RedisPubSub {
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), PubSubError> {
        let mut connection = self.connection.clone();

        redis::cmd("PUBLISH")
            .arg(channel)
            .arg(payload)
            .query_async::<()>(&mut connection)
            .await?;

        Ok(())
    }

    async fn subscribe(&self, channels: &[String]) -> Result<Subscription, PubSubError> {
        let mut pubsub = self.client.get_async_pubsub().await?;

        pubsub.subscribe(channels).await?;

        log::debug!("subscribe: channels={channels:?}");

        let stream = pubsub.into_on_message().filter_map(|msg| async move {
            let channel = msg.get_channel_name().to_string();

            match msg.get_payload::<String>() {
                Ok(payload) => Some(PubSubMessage { channel, payload }),
                Err(e) => {
                    log::error!("Dropping non-string payload on channel={channel}: {e:?}");
                    None
                }
            }
        });

        Ok(Box::pin(stream))
    }
}
