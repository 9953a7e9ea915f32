use axum::extract::{Path, Query, State};
use bytes::Bytes;
use serde::Deserialize;
use tilesmith_service::service::TileService;
use tilesmith_service::types::TileRequest;

use super::ResponseError;

/// Query parameters of tile and meta requests.
#[derive(Debug, Default, Deserialize)]
pub struct PayloadQueryParams {
    /// Only return a payload that was generated before, never start a computation.
    #[serde(default)]
    pub cached_only: bool,
}

pub async fn handle_tile_request(
    State(service): State<TileService>,
    Path(pipeline): Path<String>,
    Query(params): Query<PayloadQueryParams>,
    body: Bytes,
) -> Result<Bytes, ResponseError> {
    let request: TileRequest = serde_json::from_slice(&body)?;
    let pipeline = service.pipeline(&pipeline)?;

    let tile = if params.cached_only {
        pipeline.fetch_tile(&request).await?
    } else {
        pipeline.get_tile(&request).await?
    };
    Ok(tile)
}
