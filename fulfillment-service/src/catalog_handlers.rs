use axum::extract::{Path, State};
use axum::Json;
use common_http_errors::{ApiError, ApiResult};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::app::AppState;
use crate::cache::keys;
use crate::catalog;

/// Read-through availability view: the one cached read the propagator
/// invalidates. A cache hit serves the stored JSON; a miss recomputes from
/// the inventory tables and repopulates the key.
pub async fn get_catalog_entity(
    State(state): State<AppState>,
    Path(entity_id): Path<Uuid>,
) -> ApiResult<Json<Value>> {
    let key = keys::catalog_detail(entity_id);
    if let Some(cached) = state.cache.get(&key).await {
        if let Ok(view) = serde_json::from_str::<Value>(&cached) {
            return Ok(Json(view));
        }
    }

    let entity = catalog::load_entity(&state.db, entity_id)
        .await
        .map_err(ApiError::internal)?
        .ok_or(ApiError::not_found("entity_not_found"))?;
    let tiers = catalog::tiers_for_entity(&state.db, entity_id)
        .await
        .map_err(ApiError::internal)?;

    let view = json!({ "entity": entity, "tiers": tiers });
    state
        .cache
        .set(&key, view.to_string(), state.cache_ttl)
        .await;
    Ok(Json(view))
}
