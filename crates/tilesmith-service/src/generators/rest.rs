use std::time::Instant;

use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use futures::future;
use reqwest::header;
use serde::Deserialize;
use url::Url;

use crate::error::{TileError, TileResult};
use crate::registry::{TileFactory, TileGenerator};
use crate::types::{TileCoord, TileRequest};

fn default_scheme() -> String {
    "http".into()
}

fn default_ext() -> String {
    "json".into()
}

/// Parameters of the `rest` tile type.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct RestParams {
    /// Host and optional path prefix of the tile server, without scheme.
    pub endpoint: String,
    #[serde(default = "default_scheme")]
    pub scheme: String,
    /// The file extension of tiles, which also selects the `Accept` header.
    #[serde(default = "default_ext")]
    pub ext: String,
    /// Zero-pads coordinates in tile URLs.
    #[serde(default)]
    pub pad_coords: bool,
    /// Serves an empty tile instead of failing if the server responds with an error status.
    #[serde(default)]
    pub ignore_errors: bool,
}

impl RestParams {
    /// Checks that tile URLs can be built from these parameters.
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(!self.endpoint.is_empty(), "missing `endpoint` parameter");
        let base = format!("{}://{}/", self.scheme, self.endpoint);
        Url::parse(&base).with_context(|| format!("invalid endpoint `{base}`"))?;
        Ok(())
    }

    /// Builds the URL of the tile at `coord` of dataset `uri`.
    pub fn tile_url(&self, uri: &str, coord: TileCoord) -> String {
        let TileCoord { z, x, y } = coord;
        let (scheme, endpoint, ext) = (&self.scheme, &self.endpoint, &self.ext);

        if self.pad_coords {
            // x and y are padded to the width of the largest coordinate on this level
            let width = 2u64
                .checked_pow(z)
                .map_or(20, |tiles| tiles.ilog10() as usize + 1);
            format!("{scheme}://{endpoint}/{uri}/{z:02}/{x:0width$}/{y:0width$}.{ext}")
        } else {
            format!("{scheme}://{endpoint}/{uri}/{z}/{x}/{y}.{ext}")
        }
    }

    /// Returns the media type requested for tiles with this extension.
    pub fn accept(&self) -> &'static str {
        match self.ext.as_str() {
            "png" => "image/png",
            "jpg" => "image/jpg",
            "jpeg" => "image/jpeg",
            "bin" => "application/octet-stream",
            _ => "application/json",
        }
    }
}

async fn fetch_tile(
    client: &reqwest::Client,
    params: &RestParams,
    request: &TileRequest,
) -> TileResult {
    let url = params.tile_url(&request.uri, request.coord);
    tracing::trace!(%url, "fetching tile");

    let started = Instant::now();
    let response = client
        .get(&url)
        .header(header::ACCEPT, params.accept())
        .send()
        .await
        .map_err(TileError::generation)?;

    let status = response.status();
    metric!(counter("rest.responses") += 1, "status" => status.as_str());

    if status.is_client_error() || status.is_server_error() {
        if params.ignore_errors {
            tracing::debug!(%url, %status, "ignoring tile server error");
            return Ok(Bytes::new());
        }
        let body = response.text().await.unwrap_or_default();
        return Err(TileError::Generation(format!(
            "tile server responded with {status}: {body}"
        )));
    }

    let tile = response.bytes().await.map_err(TileError::generation)?;
    metric!(timer("rest.duration") = started.elapsed());
    Ok(tile)
}

/// Fetches tiles from a remote tile server.
#[derive(Debug)]
pub struct RestTile {
    client: reqwest::Client,
    params: RestParams,
}

impl RestTile {
    pub fn new(client: reqwest::Client, params: RestParams) -> anyhow::Result<Self> {
        params.validate()?;
        Ok(Self { client, params })
    }
}

#[async_trait]
impl TileGenerator for RestTile {
    async fn create(&self, request: &TileRequest) -> TileResult {
        fetch_tile(&self.client, &self.params, request).await
    }
}

/// Fetches a whole batch of tiles from remote tile servers.
///
/// Every request in the batch carries its own [`RestParams`]. All tiles are fetched
/// concurrently through one client.
#[derive(Debug)]
pub struct RestBatchFactory {
    client: reqwest::Client,
}

impl RestBatchFactory {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn fetch(&self, request: &TileRequest) -> TileResult {
        let params = RestParams::deserialize(&request.tile.params).map_err(|err| {
            TileError::InvalidRequest(format!("invalid `{}` parameters: {err}", request.tile.id))
        })?;
        params
            .validate()
            .map_err(|err| TileError::constructor(&request.tile.id, err))?;
        fetch_tile(&self.client, &params, request).await
    }
}

#[async_trait]
impl TileFactory for RestBatchFactory {
    async fn create_tiles(&self, requests: &[TileRequest]) -> Vec<TileResult> {
        future::join_all(requests.iter().map(|request| self.fetch(request))).await
    }
}
