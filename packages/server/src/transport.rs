//! actix-ws adapters for the connection loop.

use std::collections::BTreeMap;

use actix_web::{HttpRequest, web};
use actix_ws::Message;
use async_trait::async_trait;
use futures_util::StreamExt as _;
use switchboard_ws::{
    frame::{Frame, FrameKind, FrameReader, FrameWriter, TransportError},
    middleware::HandshakeRequest,
};

/// Captures what handshake middlewares may inspect from an upgrade request.
#[must_use]
pub fn handshake_request(req: &HttpRequest) -> HandshakeRequest {
    let headers = req
        .headers()
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.as_str().to_ascii_lowercase(), value.to_string()))
        })
        .collect();

    let query = web::Query::<BTreeMap<String, String>>::from_query(req.query_string())
        .map(web::Query::into_inner)
        .unwrap_or_else(|e| {
            log::debug!("handshake_request: unparseable query string: {e:?}");
            BTreeMap::new()
        });

    HandshakeRequest {
        path: req.path().to_string(),
        headers,
        query,
        peer_addr: req.peer_addr(),
    }
}

pub struct ActixFrameReader {
    stream: actix_ws::MessageStream,
}

impl ActixFrameReader {
    #[must_use]
    pub const fn new(stream: actix_ws::MessageStream) -> Self {
        Self { stream }
    }
}

#[async_trait(?Send)]
impl FrameReader for ActixFrameReader {
    async fn read_frame(&mut self) -> Result<Frame, TransportError> {
        loop {
            let Some(message) = self.stream.next().await else {
                return Err(TransportError::Closed);
            };

            return Ok(
                match message.map_err(|e| TransportError::Protocol(e.to_string()))? {
                    Message::Text(text) => Frame::text(text.into_bytes()),
                    Message::Binary(bytes) => Frame::binary(bytes),
                    Message::Ping(bytes) => Frame::ping(bytes),
                    Message::Pong(bytes) => Frame::pong(bytes),
                    Message::Close(reason) => {
                        log::debug!("read_frame: close reason={reason:?}");
                        Frame::close()
                    }
                    Message::Continuation(_) => {
                        log::warn!("read_frame: fragmented messages are not supported, dropping");
                        continue;
                    }
                    Message::Nop => continue,
                },
            );
        }
    }
}

/// Owns the session until the connection is closed.
pub struct ActixFrameWriter {
    session: Option<actix_ws::Session>,
}

impl ActixFrameWriter {
    #[must_use]
    pub const fn new(session: actix_ws::Session) -> Self {
        Self {
            session: Some(session),
        }
    }
}

#[async_trait]
impl FrameWriter for ActixFrameWriter {
    async fn write_frame(&mut self, frame: Frame) -> Result<(), TransportError> {
        let session = self.session.as_mut().ok_or(TransportError::Closed)?;

        match frame.kind {
            FrameKind::Text => {
                let text = String::from_utf8(frame.payload.to_vec())
                    .map_err(|e| TransportError::Protocol(e.to_string()))?;
                session.text(text).await
            }
            FrameKind::Binary => session.binary(frame.payload).await,
            FrameKind::Ping => session.ping(&frame.payload).await,
            FrameKind::Pong => session.pong(&frame.payload).await,
            FrameKind::Close => return self.close().await,
        }
        .map_err(|_| TransportError::Closed)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if let Some(session) = self.session.take() {
            session
                .close(None)
                .await
                .map_err(|_| TransportError::Closed)?;
        }

        Ok(())
    }
}
