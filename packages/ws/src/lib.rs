//! Real-time websocket messaging for `switchboard`.
//!
//! This crate holds everything between a websocket transport and application
//! code: clients, per-route handler pipelines, route-scoped middlewares, the
//! connection loop, the client registry with its rooms, and the fan-out layer that
//! makes broadcasts cluster-wide.
//!
//! # Features
//!
//! * `simulator` - In-memory transport for driving connections without a network
//!
//! # Main Components
//!
//! * [`client::Client`] - One live connection with metadata, rooms and a serialized writer
//! * [`handler::ClientHandler`] - Lifecycle callbacks plus raw and event handlers for a route
//! * [`middleware::MiddlewareBuilder`] - Handshake, receive and send middlewares by route pattern
//! * [`connection::ConnectionHandler`] - Runs the per-connection state machine
//! * [`registry::Registry`] - Connected clients and rooms
//! * [`fanout::FanOut`] and [`broadcast::Broadcaster`] - Local or cluster-wide broadcasts
//!
//! # Example
//!
//! ```rust,no_run
//! # use std::sync::Arc;
//! # use switchboard_ws::{
//! #     connection::{ConnectionHandler, ConnectionOptions},
//! #     handler::ClientHandler,
//! #     middleware::{HandshakeRequest, MiddlewareBuilder},
//! #     registry::Registry,
//! # };
//! # async fn run(reader: impl switchboard_ws::frame::FrameReader, writer: impl switchboard_ws::frame::FrameWriter + 'static) {
//! let registry = Arc::new(Registry::new());
//! let rooms = registry.clone();
//!
//! let handler = ClientHandler::new()
//!     .on_connect(move |client| {
//!         rooms.join_room(&client, "lobby");
//!         async { Ok(()) }
//!     })
//!     .on("ping", |client, _| async move {
//!         client.write("pong").await?;
//!         Ok(())
//!     });
//!
//! let connection = ConnectionHandler::new(
//!     "/chat",
//!     handler,
//!     MiddlewareBuilder::new().resolve("/chat"),
//!     registry,
//!     ConnectionOptions::default(),
//! );
//!
//! connection.serve(&HandshakeRequest::new("/chat"), reader, writer).await;
//! # }
//! ```

#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

pub mod broadcast;
pub mod client;
pub mod connection;
pub mod fanout;
pub mod frame;
pub mod handler;
pub mod middleware;
pub mod registry;

#[cfg(feature = "simulator")]
pub mod simulator;

pub use switchboard_ws_models as models;
