//! Example application served by the `switchboard_server` binary.
//!
//! `/example` requires basic auth, joins every client to a shared room, answers
//! `TEST REQUEST` with `TEST RESPONSE`, replies to `server-info` events and
//! relays `broadcast` events to every connected client.

use std::collections::BTreeMap;

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64_STANDARD};
use serde::Serialize;
use switchboard_ws::{
    broadcast::Broadcaster,
    handler::{ClientHandler, HandlerError},
    middleware::{
        HandshakeMiddleware, ReceiveMiddleware, SendMiddleware, handshake_middleware,
        receive_middleware, send_middleware,
    },
    models::{Event, is_json_object},
};

use crate::{App, AppError, router::Router};

pub const ROUTE: &str = "/example";
pub const ROOM: &str = "broadcastingRoom";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerInfo {
    pub version: &'static str,
    pub server: &'static str,
    pub slogan: &'static str,
}

impl Default for ServerInfo {
    fn default() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION"),
            server: "switchboard",
            slogan: "Real-time websocket messaging",
        }
    }
}

#[must_use]
pub fn handler(broadcaster: Broadcaster) -> ClientHandler {
    let rooms = broadcaster.registry().clone();

    ClientHandler::new()
        .on_connect(move |client| {
            client.set_metadata("name", "TestUser");
            rooms.join_room(&client, ROOM);
            async { Ok(()) }
        })
        .on_disconnect(|client| async move {
            log::info!("Client {} disconnected", client.id());
            Ok(())
        })
        .on("TEST REQUEST", |client, _| async move {
            client.write("TEST RESPONSE").await?;
            Ok(())
        })
        .on_event("server-info", |client, _| async move {
            let event = Event::from_serializable("server-info", &ServerInfo::default())?;
            client.write_event(&event).await?;
            Ok(())
        })
        .on_event("broadcast", move |_, event| {
            let broadcaster = broadcaster.clone();
            async move {
                broadcaster
                    .send_event_to_all(&Event::new("broadcast", event.data))
                    .await
                    .map_err(|e| HandlerError::Other(Box::new(e)))
            }
        })
}

#[must_use]
pub fn router(broadcaster: Broadcaster) -> Router {
    Router::new().add_route(ROUTE, handler(broadcaster))
}

fn parse_basic_auth(header: &str) -> Option<(String, String)> {
    let encoded = header.strip_prefix("Basic ")?;
    let decoded = BASE64_STANDARD.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, password) = decoded.split_once(':')?;

    Some((user.to_string(), password.to_string()))
}

/// Accepts requests whose basic auth credentials match `users` and stores the
/// user name as the client's `role`.
#[must_use]
pub fn basic_auth(users: BTreeMap<String, String>) -> HandshakeMiddleware {
    handshake_middleware(move |request, client| {
        let Some((user, password)) = request.header("authorization").and_then(parse_basic_auth)
        else {
            log::debug!("basic_auth: missing credentials path={}", request.path);
            return false;
        };

        if users.get(&user) != Some(&password) {
            log::debug!("basic_auth: rejected user={user}");
            return false;
        }

        client.set_metadata("role", user);
        true
    })
}

#[must_use]
pub fn log_receive() -> ReceiveMiddleware {
    receive_middleware(|client, data| {
        log::info!(
            "Receive: {} - {}",
            client.get_metadata("role").unwrap_or_default(),
            String::from_utf8_lossy(data)
        );
        Ok(())
    })
}

#[must_use]
pub fn log_send() -> SendMiddleware {
    send_middleware(|_, data| {
        if is_json_object(data) {
            log::info!("Event sent: {}", String::from_utf8_lossy(data));
        } else {
            log::info!("Send: {}", String::from_utf8_lossy(data));
        }
        Ok(())
    })
}

/// Registers the example route and its middlewares.
///
/// # Errors
///
/// * If a middleware pattern fails to compile
pub fn install(app: &mut App) -> Result<(), AppError> {
    let users = [("admin", "admin"), ("user", "user")]
        .into_iter()
        .map(|(user, password)| (user.to_string(), password.to_string()))
        .collect();

    let router = router(app.broadcaster());

    app.add_router(router);
    app.add_handshake_middleware(ROUTE, basic_auth(users))?
        .add_receive_middleware(ROUTE, log_receive())?
        .add_send_middleware(ROUTE, log_send())?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use pretty_assertions::assert_eq;
    use serde_json::json;
    use switchboard_ws::{
        connection::{ConnectionOptions, DispatchMode},
        frame::Frame,
        middleware::{HandshakeRequest, MiddlewareBuilder},
        registry::Registry,
        simulator,
    };
    use tokio::task::LocalSet;

    use super::*;

    const WAIT: Duration = Duration::from_secs(1);

    fn authorization(user: &str, password: &str) -> String {
        format!("Basic {}", BASE64_STANDARD.encode(format!("{user}:{password}")))
    }

    fn users() -> BTreeMap<String, String> {
        BTreeMap::from([("admin".to_string(), "secret".to_string())])
    }

    #[test_log::test]
    fn parses_basic_auth_header() {
        assert_eq!(
            parse_basic_auth(&authorization("admin", "a:b")),
            Some(("admin".to_string(), "a:b".to_string()))
        );
        assert_eq!(parse_basic_auth("Bearer abc"), None);
        assert_eq!(parse_basic_auth("Basic !!!"), None);
    }

    #[test_log::test]
    fn basic_auth_stores_role_for_valid_credentials() {
        let middleware = basic_auth(users());
        let (client, _peer) = simulator::client(ROUTE, vec![]);

        let accepted = middleware(
            &HandshakeRequest::new(ROUTE).with_header("Authorization", authorization("admin", "secret")),
            &client,
        );

        assert!(accepted);
        assert_eq!(client.get_metadata("role"), Some(json!("admin")));
    }

    #[test_log::test]
    fn basic_auth_rejects_wrong_or_missing_credentials() {
        let middleware = basic_auth(users());
        let (client, _peer) = simulator::client(ROUTE, vec![]);

        assert!(!middleware(
            &HandshakeRequest::new(ROUTE).with_header("Authorization", authorization("admin", "nope")),
            &client,
        ));
        assert!(!middleware(&HandshakeRequest::new(ROUTE), &client));
        assert_eq!(client.get_metadata("role"), None);
    }

    #[test_log::test(tokio::test)]
    async fn example_route_answers_requests_and_relays_broadcasts() {
        let registry = Arc::new(Registry::new());
        let broadcaster = Broadcaster::local(registry.clone());
        let connection = switchboard_ws::connection::ConnectionHandler::new(
            ROUTE,
            handler(broadcaster),
            MiddlewareBuilder::new().resolve(ROUTE),
            registry.clone(),
            ConnectionOptions {
                dispatch: DispatchMode::Sequential,
                idle_timeout: None,
            },
        );

        LocalSet::new()
            .run_until(async move {
                let (reader, writer, peer) = simulator::connection();
                let task = tokio::task::spawn_local(async move {
                    connection
                        .serve(&HandshakeRequest::new(ROUTE), reader, writer)
                        .await
                });

                peer.send_text("TEST REQUEST");
                assert_eq!(peer.next_frame(WAIT).await, Some(Frame::text("TEST RESPONSE")));
                assert_eq!(registry.room_members(ROOM).map(|x| x.len()), Some(1));

                peer.send_text(r#"{"event":"server-info"}"#);
                let frame = peer.next_frame(WAIT).await.unwrap();
                assert_eq!(
                    Event::from_slice(&frame.payload).unwrap(),
                    Event::from_serializable("server-info", &ServerInfo::default()).unwrap()
                );

                peer.send_text(r#"{"event":"broadcast","data":{"text":"hi"}}"#);
                let frame = peer.next_frame(WAIT).await.unwrap();
                assert_eq!(
                    Event::from_slice(&frame.payload).unwrap(),
                    Event::new("broadcast", json!({ "text": "hi" }))
                );

                peer.close();
                task.await.unwrap();
                assert!(registry.room(ROOM).is_none());
            })
            .await;
    }

    #[test_log::test(tokio::test)]
    async fn install_registers_the_example_route() {
        let mut app = App::new(crate::config::Config::default()).await.unwrap();

        install(&mut app).unwrap();

        let handlers = app.connection_handlers().unwrap();
        assert_eq!(handlers.len(), 1);
        assert_eq!(handlers[0].path(), ROUTE);
    }
}
