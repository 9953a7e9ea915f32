use axum::extract::{Path, Query, State};
use bytes::Bytes;
use tilesmith_service::service::TileService;
use tilesmith_service::types::MetaRequest;

use super::ResponseError;
use super::tile::PayloadQueryParams;

pub async fn handle_meta_request(
    State(service): State<TileService>,
    Path(pipeline): Path<String>,
    Query(params): Query<PayloadQueryParams>,
    body: Bytes,
) -> Result<Bytes, ResponseError> {
    let request: MetaRequest = serde_json::from_slice(&body)?;
    let pipeline = service.pipeline(&pipeline)?;

    let meta = if params.cached_only {
        pipeline.fetch_meta(&request).await?
    } else {
        pipeline.get_meta(&request).await?
    };
    Ok(meta)
}
