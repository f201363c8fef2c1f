use std::collections::BTreeMap;

use axum::response::Json;

use crate::error::Result;
use crate::models::registry;

/// Mapping of model key to description, derived from the registry listing.
pub async fn list_models() -> Result<Json<BTreeMap<&'static str, &'static str>>> {
    let models: BTreeMap<_, _> = registry::global()?.list().collect();
    Ok(Json(models))
}
