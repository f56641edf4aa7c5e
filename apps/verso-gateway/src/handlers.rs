use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde_json::json;
use tracing::{debug, error};

use engage_proto::{thread_topic, AcceptedResponse, ErrorBody, PushEvent};

use crate::ws::FanoutState;

pub async fn health_check() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

/// Internal publish endpoint: origin processes that handled a write post the
/// resulting event here; it lands on the shared bus and fans out to every
/// interested connection on every gateway instance.
pub async fn publish_event(
    State(state): State<FanoutState>,
    Json(event): Json<PushEvent>,
) -> Response {
    if event.thread_id.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(ErrorBody {
                error: "thread_id is required".to_string(),
                code: Some("invalid_event".to_string()),
            }),
        )
            .into_response();
    }

    let topic = thread_topic(&event.thread_id);
    let payload = match serde_json::to_vec(&event) {
        Ok(bytes) => bytes,
        Err(err) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(ErrorBody {
                    error: format!("unserializable event: {}", err),
                    code: Some("invalid_event".to_string()),
                }),
            )
                .into_response();
        }
    };

    match state.bus().publish(&topic, payload.into()).await {
        Ok(reached) => {
            debug!(
                topic = %topic,
                entity = %event.entity_id,
                reached,
                "event published"
            );
            (
                StatusCode::ACCEPTED,
                Json(AcceptedResponse { accepted: true }),
            )
                .into_response()
        }
        Err(err) => {
            error!(topic = %topic, error = %err, "bus publish failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorBody {
                    error: err.to_string(),
                    code: Some("bus_error".to_string()),
                }),
            )
                .into_response()
        }
    }
}
