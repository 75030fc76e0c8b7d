//! Route-scoped middlewares.
//!
//! Middlewares are registered against a regular expression that is matched
//! against route paths. Each route resolves its middlewares once, when it is
//! registered, into a [`ResolvedMiddlewares`].

use std::{collections::BTreeMap, net::SocketAddr, sync::Arc};

use regex::Regex;
use thiserror::Error;

use crate::client::Client;

/// Data from the upgrade request, available to handshake middlewares.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandshakeRequest {
    pub path: String,
    /// Header names are lowercase.
    pub headers: BTreeMap<String, String>,
    pub query: BTreeMap<String, String>,
    pub peer_addr: Option<SocketAddr>,
}

impl HandshakeRequest {
    #[must_use]
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    #[must_use]
    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}

#[derive(Debug, Error)]
pub enum MiddlewareError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

#[derive(Debug, Error)]
pub enum MiddlewareRegistrationError {
    #[error("Invalid route pattern: {0}")]
    InvalidPattern(#[from] regex::Error),
}

/// Accepts (`true`) or rejects (`false`) a connection before it becomes active.
pub type HandshakeMiddleware = Arc<dyn Fn(&HandshakeRequest, &Arc<Client>) -> bool + Send + Sync>;

/// Transforms an inbound payload in place before dispatch.
pub type ReceiveMiddleware =
    Arc<dyn Fn(&Client, &mut Vec<u8>) -> Result<(), MiddlewareError> + Send + Sync>;

/// Transforms an outbound payload in place before it is written.
pub type SendMiddleware =
    Arc<dyn Fn(&Client, &mut Vec<u8>) -> Result<(), MiddlewareError> + Send + Sync>;

#[must_use]
pub fn handshake_middleware(
    f: impl Fn(&HandshakeRequest, &Arc<Client>) -> bool + Send + Sync + 'static,
) -> HandshakeMiddleware {
    Arc::new(f)
}

#[must_use]
pub fn receive_middleware(
    f: impl Fn(&Client, &mut Vec<u8>) -> Result<(), MiddlewareError> + Send + Sync + 'static,
) -> ReceiveMiddleware {
    Arc::new(f)
}

#[must_use]
pub fn send_middleware(
    f: impl Fn(&Client, &mut Vec<u8>) -> Result<(), MiddlewareError> + Send + Sync + 'static,
) -> SendMiddleware {
    Arc::new(f)
}

struct PatternEntry<T> {
    pattern: Regex,
    middlewares: Vec<T>,
}

impl<T: Clone> PatternEntry<T> {
    fn push(entries: &mut Vec<Self>, pattern: &str, middleware: T) -> Result<(), MiddlewareRegistrationError> {
        if let Some(entry) = entries.iter_mut().find(|x| x.pattern.as_str() == pattern) {
            entry.middlewares.push(middleware);
        } else {
            entries.push(Self {
                pattern: Regex::new(pattern)?,
                middlewares: vec![middleware],
            });
        }

        Ok(())
    }

    fn accumulate(entries: &[Self], path: &str) -> Vec<T> {
        entries
            .iter()
            .filter(|x| x.pattern.is_match(path))
            .flat_map(|x| x.middlewares.iter().cloned())
            .collect()
    }
}

/// Collects middlewares by route pattern until routes are registered.
#[derive(Default)]
pub struct MiddlewareBuilder {
    handshake: Vec<(Regex, HandshakeMiddleware)>,
    receive: Vec<PatternEntry<ReceiveMiddleware>>,
    send: Vec<PatternEntry<SendMiddleware>>,
}

impl std::fmt::Debug for MiddlewareBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MiddlewareBuilder")
            .field(
                "handshake",
                &self.handshake.iter().map(|(x, _)| x.as_str()).collect::<Vec<_>>(),
            )
            .field(
                "receive",
                &self.receive.iter().map(|x| x.pattern.as_str()).collect::<Vec<_>>(),
            )
            .field(
                "send",
                &self.send.iter().map(|x| x.pattern.as_str()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl MiddlewareBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the handshake middleware for `pattern`.
    ///
    /// Only one handshake middleware applies per route: the first registered
    /// pattern that matches. Registering the same pattern again replaces its
    /// middleware.
    ///
    /// # Errors
    ///
    /// * If `pattern` is not a valid regular expression
    pub fn add_handshake(
        &mut self,
        pattern: &str,
        middleware: HandshakeMiddleware,
    ) -> Result<(), MiddlewareRegistrationError> {
        if let Some((_, existing)) = self.handshake.iter_mut().find(|(x, _)| x.as_str() == pattern) {
            log::debug!("add_handshake: replacing middleware for pattern={pattern}");
            *existing = middleware;
        } else {
            self.handshake.push((Regex::new(pattern)?, middleware));
        }

        Ok(())
    }

    /// Adds a receive middleware for `pattern`. Every matching pattern
    /// contributes to a route's chain.
    ///
    /// # Errors
    ///
    /// * If `pattern` is not a valid regular expression
    pub fn add_receive(
        &mut self,
        pattern: &str,
        middleware: ReceiveMiddleware,
    ) -> Result<(), MiddlewareRegistrationError> {
        PatternEntry::push(&mut self.receive, pattern, middleware)
    }

    /// Adds a send middleware for `pattern`. Every matching pattern contributes
    /// to a route's chain.
    ///
    /// # Errors
    ///
    /// * If `pattern` is not a valid regular expression
    pub fn add_send(
        &mut self,
        pattern: &str,
        middleware: SendMiddleware,
    ) -> Result<(), MiddlewareRegistrationError> {
        PatternEntry::push(&mut self.send, pattern, middleware)
    }

    #[must_use]
    pub fn resolve(&self, path: &str) -> ResolvedMiddlewares {
        let handshake = self
            .handshake
            .iter()
            .find(|(pattern, _)| pattern.is_match(path))
            .map(|(_, middleware)| middleware.clone());

        let resolved = ResolvedMiddlewares {
            handshake,
            receive: PatternEntry::accumulate(&self.receive, path),
            send: PatternEntry::accumulate(&self.send, path),
        };

        log::debug!(
            "resolve: path={path} handshake={} receive={} send={}",
            resolved.handshake.is_some(),
            resolved.receive.len(),
            resolved.send.len(),
        );

        resolved
    }
}

/// Middlewares that apply to one route.
#[derive(Clone, Default)]
pub struct ResolvedMiddlewares {
    handshake: Option<HandshakeMiddleware>,
    receive: Vec<ReceiveMiddleware>,
    send: Vec<SendMiddleware>,
}

impl std::fmt::Debug for ResolvedMiddlewares {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedMiddlewares")
            .field("handshake", &self.handshake.is_some())
            .field("receive", &self.receive.len())
            .field("send", &self.send.len())
            .finish()
    }
}

impl ResolvedMiddlewares {
    /// Runs the handshake middleware. Routes without one accept everything.
    #[must_use]
    pub fn handshake(&self, request: &HandshakeRequest, client: &Arc<Client>) -> bool {
        self.handshake
            .as_ref()
            .is_none_or(|middleware| middleware(request, client))
    }

    /// Runs every receive middleware in order. A failing middleware is logged and
    /// the payload is passed on as it was left.
    #[must_use]
    pub fn apply_receive(&self, client: &Client, mut data: Vec<u8>) -> Vec<u8> {
        for middleware in &self.receive {
            if let Err(e) = middleware(client, &mut data) {
                log::error!(
                    "Receive middleware failed client_id={} route={}: {e:?}",
                    client.id(),
                    client.route()
                );
            }
        }

        data
    }

    #[must_use]
    pub fn send(&self) -> &[SendMiddleware] {
        &self.send
    }
}

#[cfg(all(test, feature = "simulator"))]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::simulator;

    fn appending(byte: u8) -> ReceiveMiddleware {
        receive_middleware(move |_, data| {
            data.push(byte);
            Ok(())
        })
    }

    #[test_log::test]
    fn only_one_handshake_applies() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut builder = MiddlewareBuilder::new();

        for pattern in ["^/chat", "/chat$"] {
            let calls = calls.clone();
            builder
                .add_handshake(
                    pattern,
                    handshake_middleware(move |_, _| {
                        calls.fetch_add(1, Ordering::SeqCst);
                        true
                    }),
                )
                .unwrap();
        }

        let resolved = builder.resolve("/chat");
        let (client, _peer) = simulator::client("/chat", vec![]);

        assert!(resolved.handshake(&HandshakeRequest::new("/chat"), &client));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test_log::test]
    fn handshake_defaults_to_accept() {
        let mut builder = MiddlewareBuilder::new();
        builder
            .add_handshake("^/admin", handshake_middleware(|_, _| false))
            .unwrap();

        let resolved = builder.resolve("/chat");
        let (client, _peer) = simulator::client("/chat", vec![]);

        assert!(resolved.handshake(&HandshakeRequest::new("/chat"), &client));
    }

    #[test_log::test]
    fn reregistering_a_handshake_pattern_replaces_it() {
        let mut builder = MiddlewareBuilder::new();
        builder
            .add_handshake("/chat", handshake_middleware(|_, _| true))
            .unwrap();
        builder
            .add_handshake("/chat", handshake_middleware(|_, _| false))
            .unwrap();

        let (client, _peer) = simulator::client("/chat", vec![]);

        assert!(!builder.resolve("/chat").handshake(&HandshakeRequest::new("/chat"), &client));
    }

    #[test_log::test]
    fn receive_accumulates_across_patterns_keeping_insertion_order() {
        let mut builder = MiddlewareBuilder::new();
        builder.add_receive("^/chat", appending(b'1')).unwrap();
        builder.add_receive("^/chat", appending(b'2')).unwrap();
        builder.add_receive("^/other", appending(b'x')).unwrap();
        builder.add_receive(".*", appending(b'3')).unwrap();

        let resolved = builder.resolve("/chat");
        let (client, _peer) = simulator::client("/chat", vec![]);

        assert_eq!(resolved.apply_receive(&client, b">".to_vec()), b">123".to_vec());
    }

    #[test_log::test]
    fn receive_errors_do_not_abort_the_chain() {
        let mut builder = MiddlewareBuilder::new();
        builder.add_receive("/", appending(b'a')).unwrap();
        builder
            .add_receive(
                "/",
                receive_middleware(|_, _| Err(MiddlewareError::Message("bad".to_string()))),
            )
            .unwrap();
        builder.add_receive("/", appending(b'b')).unwrap();

        let (client, _peer) = simulator::client("/", vec![]);

        assert_eq!(
            builder.resolve("/").apply_receive(&client, vec![]),
            b"ab".to_vec()
        );
    }

    #[test_log::test]
    fn send_resolves_per_route() {
        let mut builder = MiddlewareBuilder::new();
        builder
            .add_send("^/a", send_middleware(|_, _| Ok(())))
            .unwrap();

        assert_eq!(builder.resolve("/a").send().len(), 1);
        assert_eq!(builder.resolve("/b").send().len(), 0);
    }

    #[test_log::test]
    fn invalid_patterns_are_rejected() {
        let mut builder = MiddlewareBuilder::new();

        assert!(builder.add_send("(", send_middleware(|_, _| Ok(()))).is_err());
    }

    #[test_log::test]
    fn header_lookup_is_case_insensitive() {
        let request = HandshakeRequest::new("/").with_header("Authorization", "Basic abc");

        assert_eq!(request.header("authorization"), Some("Basic abc"));
        assert_eq!(request.header("AUTHORIZATION"), Some("Basic abc"));
    }
}
