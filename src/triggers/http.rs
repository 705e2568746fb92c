use axum::{extract::State, Json};
use serde::Deserialize;
use serde_json::Value;

use crate::broadcast::DeliveryReport;
use crate::error::Result;
use crate::server::AppState;

use super::resolve_publish_topic;

/// Request to publish a data change
#[derive(Debug, Deserialize)]
pub struct PublishRequest {
    /// Concrete topic name, e.g. "products"
    pub topic: String,
    /// Delta payload forwarded as the `update` envelope's payload
    #[serde(default)]
    pub payload: Value,
}

/// POST /api/v1/publish
#[tracing::instrument(name = "api.publish", skip(state, request), fields(topic = %request.topic))]
pub async fn publish(
    State(state): State<AppState>,
    Json(request): Json<PublishRequest>,
) -> Result<Json<DeliveryReport>> {
    let topic = resolve_publish_topic(&request.topic)?;
    let report = state.hub.publish(topic, request.payload);

    tracing::info!(
        delivered = report.delivered,
        failed = report.failed,
        "Change published via HTTP API"
    );

    Ok(Json(report))
}
