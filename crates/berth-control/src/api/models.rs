//! Model catalog endpoint.

use axum::{extract::State, Json};
use serde_json::{json, Value};

use super::AppState;

/// List all catalog models with family annotations.
pub async fn list_models(State(state): State<AppState>) -> Json<Vec<Value>> {
    let rows = state
        .catalog
        .all()
        .iter()
        .map(|model| {
            json!({
                "model_id": model.model_id,
                "name": model.name,
                "category": model.family,
                "family": model.family,
                "is_multimodal": model.is_multimodal,
                "requires": model.requires,
                "max_model_len": model.max_model_len,
            })
        })
        .collect();
    Json(rows)
}
