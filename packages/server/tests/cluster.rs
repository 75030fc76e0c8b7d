use std::{sync::Arc, time::Duration};

use pretty_assertions::assert_eq;
use serde_json::json;
use switchboard_pubsub::memory::MemoryPubSub;
use switchboard_server::{App, config::Config, demo};
use switchboard_ws::{
    connection::{ConnectionHandler, ConnectionOutcome},
    middleware::HandshakeRequest,
    models::Event,
    simulator::{self, SimulatedPeer},
};
use tokio::task::{JoinHandle, LocalSet};

const WAIT: Duration = Duration::from_secs(1);

async fn clustered_app(bus: &MemoryPubSub) -> (App, ConnectionHandler) {
    let mut app = App::with_pubsub(Config::default(), Some(Arc::new(bus.clone())))
        .await
        .unwrap();
    demo::install(&mut app).unwrap();
    let connection = app.connection_handlers().unwrap().remove(0);

    (app, connection)
}

fn authorized() -> HandshakeRequest {
    // admin:admin
    HandshakeRequest::new(demo::ROUTE).with_header("Authorization", "Basic YWRtaW46YWRtaW4=")
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

async fn wait_for_clients(app: &App, count: usize) {
    tokio::time::timeout(WAIT, async {
        while app.registry().client_count() != count {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("clients did not connect in time");
}

#[test_log::test(tokio::test)]
async fn broadcast_event_from_one_process_reaches_clients_of_another() {
    let bus = MemoryPubSub::new();
    let (app_a, connection_a) = clustered_app(&bus).await;
    let (app_b, connection_b) = clustered_app(&bus).await;

    LocalSet::new()
        .run_until(async move {
            let (_task_a, peer_a) = connect(&connection_a, authorized());
            let (_task_b, peer_b) = connect(&connection_b, authorized());
            wait_for_clients(&app_a, 1).await;
            wait_for_clients(&app_b, 1).await;

            peer_a.send_text(r#"{"event":"broadcast","data":"hello cluster"}"#);

            for peer in [&peer_a, &peer_b] {
                let frame = peer.next_frame(WAIT).await.unwrap();
                assert_eq!(
                    Event::from_slice(&frame.payload).unwrap(),
                    Event::new("broadcast", json!("hello cluster"))
                );
            }

            app_a.cancellation_token().cancel();
            app_b.cancellation_token().cancel();
        })
        .await;
}

#[test_log::test(tokio::test)]
async fn unauthorized_clients_are_rejected_without_registering() {
    let bus = MemoryPubSub::new();
    let (app, connection) = clustered_app(&bus).await;

    LocalSet::new()
        .run_until(async move {
            let (task, peer) = connect(
                &connection,
                HandshakeRequest::new(demo::ROUTE)
                    .with_header("Authorization", "Basic d3Jvbmc6d3Jvbmc="),
            );

            assert_eq!(task.await.unwrap(), ConnectionOutcome::HandshakeRejected);
            assert!(peer.is_closed());
            assert_eq!(app.registry().client_count(), 0);
            assert!(app.registry().rooms().is_empty());

            app.cancellation_token().cancel();
        })
        .await;
}
