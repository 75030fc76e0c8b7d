//! HTTP endpoints: the health check and the per-route websocket upgrade.

use std::sync::Arc;

use actix_web::{
    HttpRequest, HttpResponse, Result, route,
    web::{self, Json},
};
use serde_json::{Value, json};
use switchboard_ws::{connection::ConnectionHandler, registry::Registry};

use crate::transport::{ActixFrameReader, ActixFrameWriter, handshake_request};

/// Health check endpoint.
///
/// # Returns
///
/// Returns a JSON object containing:
/// * `healthy` - Always `true` when the server is responding
/// * `clients` - Number of clients connected to this process
/// * `rooms` - Number of non-empty rooms on this process
///
/// # Errors
///
/// This function does not currently return errors.
#[route("/health", method = "GET")]
pub async fn health_endpoint(registry: web::Data<Arc<Registry>>) -> Result<Json<Value>> {
    log::trace!("Healthy");
    Ok(Json(json!({
        "healthy": true,
        "clients": registry.client_count(),
        "rooms": registry.room_count(),
    })))
}

/// Upgrades the request and serves the connection with the route's
/// [`ConnectionHandler`].
///
/// # Errors
///
/// * If the websocket upgrade handshake fails
#[allow(clippy::future_not_send)]
pub async fn websocket(
    req: HttpRequest,
    stream: web::Payload,
    connection: web::Data<ConnectionHandler>,
) -> Result<HttpResponse> {
    let request = handshake_request(&req);
    let (response, session, msg_stream) = actix_ws::handle(&req, stream)?;
    let connection = connection.get_ref().clone();

    // the response must be returned before the connection can make progress
    actix_web::rt::spawn(async move {
        let outcome = connection
            .serve(
                &request,
                ActixFrameReader::new(msg_stream),
                ActixFrameWriter::new(session),
            )
            .await;

        log::debug!("websocket: path={} outcome={outcome:?}", connection.path());
    });

    Ok(response)
}
