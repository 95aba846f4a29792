//! Patient directory endpoint.

use std::collections::BTreeSet;

use axum::extract::State;
use axum::Json;

use crate::api::error::ApiError;
use crate::api::types::ApiContext;

/// `GET /api/patients` — basic info for every patient with stored data.
///
/// Derives patient ids from the `patient_data/` listing and reads each
/// patient's `basic_info.json`; patients without one are skipped.
pub async fn list(State(ctx): State<ApiContext>) -> Result<Json<Vec<serde_json::Value>>, ApiError> {
    let paths = ctx.store.list("patient_data/").await.map_err(ApiError::from)?;

    let ids: BTreeSet<String> = paths
        .iter()
        .filter_map(|path| {
            path.strip_prefix("patient_data/")
                .and_then(|rest| rest.split('/').next())
                .filter(|id| !id.is_empty())
                .map(str::to_string)
        })
        .collect();

    let mut patients = Vec::new();
    for id in ids {
        let path = format!("patient_data/{id}/basic_info.json");
        match ctx.store.read_json(&path).await {
            Ok(Some(info)) => patients.push(info),
            Ok(None) => tracing::debug!(patient_id = %id, "No basic_info.json, skipping"),
            Err(e) => tracing::warn!(patient_id = %id, error = %e, "Failed to read basic info"),
        }
    }

    Ok(Json(patients))
}
