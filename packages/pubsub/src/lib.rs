//! Publish/subscribe backbone used to replicate broadcasts between `switchboard`
//! processes.
//!
//! The [`PubSub`] trait is the only thing the fan-out layer depends on. Two
//! implementations are provided:
//!
//! * [`redis::RedisPubSub`] (feature `redis`) - Redis `PUBLISH`/`SUBSCRIBE`
//! * [`memory::MemoryPubSub`] (feature `memory`) - an in-process bus that several
//!   simulated processes can share, used by tests

#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use thiserror::Error;

#[cfg(feature = "memory")]
pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

/// A message received from the backbone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubSubMessage {
    /// Channel the message was published on.
    pub channel: String,
    pub payload: String,
}

/// Stream of messages for every channel passed to [`PubSub::subscribe`].
pub type Subscription = Pin<Box<dyn Stream<Item = PubSubMessage> + Send>>;

#[derive(Debug, Error)]
pub enum PubSubError {
    #[cfg(feature = "redis")]
    #[error(transparent)]
    Redis(#[from] ::redis::RedisError),
    #[error("Backbone closed")]
    Closed,
    #[error("Unexpected PING response: {0}")]
    UnexpectedPing(String),
}

/// Named-channel publish/subscribe primitive.
#[async_trait]
pub trait PubSub: Send + Sync {
    /// Publishes `payload` on `channel`.
    ///
    /// # Errors
    ///
    /// * If the backbone rejects or fails to deliver the publish
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), PubSubError>;

    /// Subscribes to every channel in `channels`, returning a single stream of
    /// messages for all of them.
    ///
    /// # Errors
    ///
    /// * If the subscription cannot be established
    async fn subscribe(&self, channels: &[String]) -> Result<Subscription, PubSubError>;
}

impl std::fmt::Debug for dyn PubSub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{PubSub}}")
    }
}
