use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use pretty_assertions::assert_eq;
use serde_json::json;
use switchboard_pubsub::memory::MemoryPubSub;
use switchboard_ws::{
    broadcast::Broadcaster,
    connection::{CloseReason, ConnectionHandler, ConnectionOptions, ConnectionOutcome},
    fanout::FanOut,
    frame::Frame,
    handler::ClientHandler,
    middleware::{HandshakeRequest, MiddlewareBuilder, ResolvedMiddlewares, handshake_middleware},
    models::Event,
    registry::Registry,
    simulator::{self, SimulatedPeer},
};
use tokio::task::{JoinHandle, LocalSet};
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(1);

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

fn connect(
    connection: &ConnectionHandler,
    request: HandshakeRequest,
) -> (JoinHandle<ConnectionOutcome>, SimulatedPeer) {
    let (reader, writer, peer) = simulator::connection();
    let connection = connection.clone();
    let task =
        tokio::task::spawn_local(async move { connection.serve(&request, reader, writer).await });

    (task, peer)
}

/// Clients pick their room with a `room` query parameter.
fn chat(registry: &Arc<Registry>, disconnects: &Arc<AtomicUsize>) -> ConnectionHandler {
    let mut middlewares = MiddlewareBuilder::new();
    middlewares
        .add_handshake(
            "^/chat$",
            handshake_middleware(|request, client| {
                let Some(rooms) = request.query.get("room") else {
                    return false;
                };
                client.set_metadata("rooms", rooms.clone());
                true
            }),
        )
        .unwrap();

    let rooms = registry.clone();
    let disconnects = disconnects.clone();
    let handler = ClientHandler::new()
        .on_connect(move |client| {
            if let Some(value) = client.get_metadata("rooms") {
                for room in value.as_str().unwrap_or_default().split(',') {
                    rooms.join_room(&client, room);
                }
            }
            async { Ok(()) }
        })
        .on_disconnect(move |_| {
            disconnects.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }
        });

    ConnectionHandler::new(
        "/chat",
        handler,
        middlewares.resolve("/chat"),
        registry.clone(),
        ConnectionOptions::default(),
    )
}

#[test_log::test(tokio::test)]
async fn room_broadcast_reaches_only_room_members() {
    let registry = Arc::new(Registry::new());
    let connection = chat(&registry, &Arc::new(AtomicUsize::new(0)));

    LocalSet::new()
        .run_until(async move {
            let (_a, peer_a) = connect(
                &connection,
                HandshakeRequest::new("/chat").with_query("room", "lobby"),
            );
            let (_b, peer_b) = connect(
                &connection,
                HandshakeRequest::new("/chat").with_query("room", "lobby"),
            );
            let (_c, peer_c) = connect(
                &connection,
                HandshakeRequest::new("/chat").with_query("room", "elsewhere"),
            );
            wait_until(|| registry.client_count() == 3).await;

            registry.send_to_room("lobby", b"hello lobby").await;

            assert_eq!(peer_a.next_frame(WAIT).await, Some(Frame::text("hello lobby")));
            assert_eq!(peer_b.next_frame(WAIT).await, Some(Frame::text("hello lobby")));
            assert_eq!(peer_c.next_frame(Duration::from_millis(50)).await, None);
        })
        .await;
}

#[test_log::test(tokio::test)]
async fn rejected_handshake_never_registers() {
    let registry = Arc::new(Registry::new());
    let disconnects = Arc::new(AtomicUsize::new(0));
    let connection = chat(&registry, &disconnects);

    LocalSet::new()
        .run_until(async move {
            let (task, peer) = connect(&connection, HandshakeRequest::new("/chat"));

            assert_eq!(task.await.unwrap(), ConnectionOutcome::HandshakeRejected);
            assert!(peer.is_closed());
            assert_eq!(registry.client_count(), 0);
            assert_eq!(disconnects.load(Ordering::SeqCst), 0);
        })
        .await;
}

#[test_log::test(tokio::test)]
async fn transport_failure_tears_down_client_in_two_rooms() {
    let registry = Arc::new(Registry::new());
    let disconnects = Arc::new(AtomicUsize::new(0));
    let connection = chat(&registry, &disconnects);

    LocalSet::new()
        .run_until(async move {
            let (_stay, _peer_stay) = connect(
                &connection,
                HandshakeRequest::new("/chat").with_query("room", "one"),
            );
            let (task, peer) = connect(
                &connection,
                HandshakeRequest::new("/chat").with_query("room", "one,two"),
            );
            wait_until(|| registry.client_count() == 2).await;

            let leaving = registry
                .all()
                .into_iter()
                .find(|x| x.rooms().len() == 2)
                .unwrap();
            assert_eq!(registry.room_members("one").map(|x| x.len()), Some(2));

            peer.reset();

            assert_eq!(
                task.await.unwrap(),
                ConnectionOutcome::Closed(CloseReason::ReadError)
            );
            assert!(registry.get(leaving.id()).is_none());
            assert!(!registry.room("one").unwrap().contains(leaving.id()));
            assert!(registry.room("two").is_none());
            assert!(leaving.rooms().is_empty());
            assert_eq!(disconnects.load(Ordering::SeqCst), 1);
        })
        .await;
}

#[test_log::test(tokio::test)]
async fn in_flight_join_after_close_leaves_no_room() {
    let registry = Arc::new(Registry::new());
    let rooms = registry.clone();
    let handler = ClientHandler::new().on("join", move |client, _| {
        let rooms = rooms.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            rooms.join_room(&client, "late");
            Ok(())
        }
    });
    let connection = ConnectionHandler::new(
        "/ws",
        handler,
        ResolvedMiddlewares::default(),
        registry.clone(),
        ConnectionOptions::default(),
    );
    let (reader, writer, peer) = simulator::connection();
    peer.send_text("join");
    peer.close();

    let outcome = connection
        .serve(&HandshakeRequest::new("/ws"), reader, writer)
        .await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(outcome, ConnectionOutcome::Closed(CloseReason::RemoteClosed));
    assert!(registry.room("late").is_none());
    assert_eq!(registry.room_count(), 0);
    assert_eq!(registry.client_count(), 0);
}

#[test_log::test(tokio::test)]
async fn broadcast_on_one_process_reaches_clients_on_another() {
    let bus = MemoryPubSub::new();
    let token = CancellationToken::new();

    let registry_a = Arc::new(Registry::new());
    let registry_b = Arc::new(Registry::new());
    let (fan_out_a, _) = FanOut::start(Arc::new(bus.clone()), registry_a.clone(), token.clone())
        .await
        .unwrap();
    let (_fan_out_b, _) = FanOut::start(Arc::new(bus.clone()), registry_b.clone(), token.clone())
        .await
        .unwrap();

    let (on_a, peer_on_a) = simulator::client("/chat", vec![]);
    let (on_b, peer_on_b) = simulator::client("/chat", vec![]);
    registry_a.add(on_a);
    registry_b.add(on_b);

    let broadcaster = Broadcaster::clustered(fan_out_a);
    broadcaster.send_to_all(b"everyone").await.unwrap();

    assert_eq!(peer_on_b.next_frame(WAIT).await, Some(Frame::text("everyone")));
    assert_eq!(peer_on_a.next_frame(WAIT).await, Some(Frame::text("everyone")));

    token.cancel();
}

#[test_log::test(tokio::test)]
async fn metadata_broadcast_is_cluster_wide() {
    let bus = MemoryPubSub::new();
    let token = CancellationToken::new();

    let registry_a = Arc::new(Registry::new());
    let registry_b = Arc::new(Registry::new());
    let (fan_out_a, _) = FanOut::start(Arc::new(bus.clone()), registry_a, token.clone())
        .await
        .unwrap();
    let (_fan_out_b, _) = FanOut::start(Arc::new(bus.clone()), registry_b.clone(), token.clone())
        .await
        .unwrap();

    let (admin, peer_admin) = simulator::client("/chat", vec![]);
    let (user, peer_user) = simulator::client("/chat", vec![]);
    admin.set_metadata("role", "admin");
    user.set_metadata("role", "user");
    registry_b.add(admin);
    registry_b.add(user);

    Broadcaster::clustered(fan_out_a)
        .send_event_to_all_by_metadata("role", &json!("admin"), &Event::new("notice", "restart"))
        .await
        .unwrap();

    let frame = peer_admin.next_frame(WAIT).await.unwrap();
    assert_eq!(
        Event::from_slice(&frame.payload).unwrap(),
        Event::new("notice", "restart")
    );
    assert_eq!(peer_user.next_frame(Duration::from_millis(50)).await, None);

    token.cancel();
}
