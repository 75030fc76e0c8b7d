//! In-memory transport.
//!
//! [`connection`] returns the server side halves of a connection together with a
//! [`SimulatedPeer`] that plays the remote websocket client.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;

use crate::{
    client::Client,
    frame::{Frame, FrameReader, FrameWriter, TransportError},
    middleware::SendMiddleware,
};

#[derive(Debug)]
pub struct SimulatedReader {
    inbound: flume::Receiver<Result<Frame, TransportError>>,
}

#[async_trait(?Send)]
impl FrameReader for SimulatedReader {
    async fn read_frame(&mut self) -> Result<Frame, TransportError> {
        self.inbound
            .recv_async()
            .await
            .unwrap_or(Err(TransportError::Closed))
    }
}

#[derive(Debug)]
pub struct SimulatedWriter {
    outbound: flume::Sender<Frame>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl FrameWriter for SimulatedWriter {
    async fn write_frame(&mut self, frame: Frame) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }

        self.outbound
            .send(frame)
            .map_err(|_| TransportError::Closed)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// The remote end of a simulated connection.
#[derive(Debug, Clone)]
pub struct SimulatedPeer {
    inbound: flume::Sender<Result<Frame, TransportError>>,
    outbound: flume::Receiver<Frame>,
    closed: Arc<AtomicBool>,
}

impl SimulatedPeer {
    pub fn send(&self, frame: Frame) {
        // the server may already have stopped reading
        let _ = self.inbound.send(Ok(frame));
    }

    pub fn send_text(&self, text: &str) {
        self.send(Frame::text(text.to_string()));
    }

    pub fn send_binary(&self, data: impl Into<Vec<u8>>) {
        self.send(Frame::binary(data.into()));
    }

    /// Sends a close frame.
    pub fn close(&self) {
        self.send(Frame::close());
    }

    /// Makes the server's next read fail with `error`.
    pub fn fail(&self, error: TransportError) {
        let _ = self.inbound.send(Err(error));
    }

    /// Simulates the connection being reset.
    pub fn reset(&self) {
        self.fail(TransportError::Io(std::io::Error::from(
            std::io::ErrorKind::ConnectionReset,
        )));
    }

    /// Drains every frame written by the server so far.
    #[must_use]
    pub fn received(&self) -> Vec<Frame> {
        self.outbound.try_iter().collect()
    }

    /// Waits up to `timeout` for the next frame written by the server.
    pub async fn next_frame(&self, timeout: Duration) -> Option<Frame> {
        tokio::time::timeout(timeout, self.outbound.recv_async())
            .await
            .ok()?
            .ok()
    }

    /// Whether the server closed the connection.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[must_use]
pub fn connection() -> (SimulatedReader, SimulatedWriter, SimulatedPeer) {
    let (inbound_tx, inbound_rx) = flume::unbounded();
    let (outbound_tx, outbound_rx) = flume::unbounded();
    let closed = Arc::new(AtomicBool::new(false));

    (
        SimulatedReader { inbound: inbound_rx },
        SimulatedWriter {
            outbound: outbound_tx,
            closed: closed.clone(),
        },
        SimulatedPeer {
            inbound: inbound_tx,
            outbound: outbound_rx,
            closed,
        },
    )
}

/// A standalone client wired to a simulated peer, for exercising code that only
/// needs to write.
#[must_use]
pub fn client(route: &str, send_middlewares: Vec<SendMiddleware>) -> (Arc<Client>, SimulatedPeer) {
    let (_reader, writer, peer) = connection();

    (
        Arc::new(Client::new(route, Box::new(writer), send_middlewares)),
        peer,
    )
}
