use axum::Router;
use axum::extract::{DefaultBodyLimit, Request};
use axum::middleware;
use axum::routing::{get, post};
use sentry::integrations::tower::{NewSentryLayer, SentryHttpLayer};
use tilesmith_service::metric;
use tilesmith_service::service::TileService;
use tower::ServiceBuilder;

mod error;
mod meta;
mod metrics;
mod tile;

pub use error::ResponseError;

use meta::handle_meta_request as meta;
use tile::handle_tile_request as tile;

pub async fn healthcheck() -> &'static str {
    metric!(counter("healthcheck") += 1);
    "ok"
}

pub fn create_app(service: TileService) -> Router {
    // The layers here go "top to bottom" according to the reading order here.
    let layer = ServiceBuilder::new()
        .layer(NewSentryLayer::<Request>::new_from_top())
        .layer(SentryHttpLayer::new().enable_transaction())
        .layer(middleware::from_fn(metrics::record_metrics))
        .layer(DefaultBodyLimit::max(1024 * 1024));
    Router::new()
        .route("/tile/:pipeline", post(tile))
        .route("/meta/:pipeline", post(meta))
        .with_state(service)
        .layer(layer)
        // the healthcheck is last, as it will bypass all the middlewares
        .route("/healthcheck", get(healthcheck))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use axum::body::{Body, to_bytes};
    use axum::http::{Request, StatusCode};
    use axum::response::Response;
    use bytes::Bytes;
    use serde_json::{Value, json};
    use tilesmith_service::config::Config;
    use tilesmith_service::error::TileResult;
    use tilesmith_service::generators::{RestConfig, default_registry};
    use tilesmith_service::registry::{MetaGenerator, NoParams};
    use tower::ServiceExt;

    use super::*;

    struct UriMeta;

    #[async_trait]
    impl MetaGenerator for UriMeta {
        async fn create(&self, uri: &str) -> TileResult {
            Ok(Bytes::from(format!(r#"{{"uri":"{uri}"}}"#)))
        }
    }

    fn app() -> Router {
        let mut registry = default_registry(&RestConfig::default()).unwrap();
        registry.register_meta("uri", |_: NoParams| Ok(UriMeta));
        let service = TileService::with_registry(&Config::default(), Arc::new(registry)).unwrap();
        create_app(service)
    }

    async fn post(app: &Router, uri: &str, body: impl Into<Body>) -> Response {
        let request = Request::post(uri)
            .header("content-type", "application/json")
            .body(body.into())
            .unwrap();
        app.clone().oneshot(request).await.unwrap()
    }

    async fn body(response: Response) -> Bytes {
        to_bytes(response.into_body(), usize::MAX).await.unwrap()
    }

    fn tile_request(tile: Value, x: u32) -> String {
        json!({
            "uri": "dataset",
            "coord": {"z": 1, "x": x, "y": 1},
            "tile": tile,
        })
        .to_string()
    }

    #[tokio::test]
    async fn test_healthcheck() {
        tilesmith_test::setup();
        let app = app();

        let request = Request::get("/healthcheck").body(Body::empty()).unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body(response).await, "ok");
    }

    #[tokio::test]
    async fn test_tile() {
        tilesmith_test::setup();
        let server = tilesmith_test::TileServer::new();
        let app = app();

        let request = tile_request(json!({"rest": {"endpoint": server.endpoint("tiles")}}), 0);
        for _ in 0..2 {
            let response = post(&app, "/tile/default", request.clone()).await;
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(body(response).await, "dataset/1/0/1.json");
        }

        // the second response was served from the cache
        assert_eq!(
            server.all_hits(),
            [("/tiles/dataset/1/0/1.json".to_owned(), 1)]
        );

        let response = post(&app, "/tile/default?cached_only=true", request).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(server.accesses(), 0);
    }

    #[tokio::test]
    async fn test_batched_tiles() {
        tilesmith_test::setup();
        let server = tilesmith_test::TileServer::new();
        let app = app();

        let tile = json!({"rest-batch": {"endpoint": server.endpoint("tiles")}});
        let (first, second) = tokio::join!(
            post(&app, "/tile/default", tile_request(tile.clone(), 0)),
            post(&app, "/tile/default", tile_request(tile, 1)),
        );

        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(body(first).await, "dataset/1/0/1.json");
        assert_eq!(second.status(), StatusCode::OK);
        assert_eq!(body(second).await, "dataset/1/1/1.json");
        assert_eq!(server.accesses(), 2);
    }

    #[tokio::test]
    async fn test_meta() {
        tilesmith_test::setup();
        let app = app();

        let request = json!({"uri": "twitter/2016", "meta": {"uri": {}}}).to_string();

        let response = post(&app, "/meta/default?cached_only=true", request.clone()).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        insta::assert_snapshot!(String::from_utf8_lossy(&body(response).await), @r#"{"detail":"not cached"}"#);

        let response = post(&app, "/meta/default", request.clone()).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body(response).await, r#"{"uri":"twitter/2016"}"#);

        let response = post(&app, "/meta/default?cached_only=true", request).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_unknown_pipeline() {
        tilesmith_test::setup();
        let app = app();

        let request = tile_request(json!({"rest": {"endpoint": "localhost:1"}}), 0);
        let response = post(&app, "/tile/salt", request).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        insta::assert_snapshot!(String::from_utf8_lossy(&body(response).await), @r#"{"detail":"unrecognized pipeline type `salt`"}"#);
    }

    #[tokio::test]
    async fn test_bad_requests() {
        tilesmith_test::setup();
        let app = app();

        let response = post(&app, "/tile/default", "{").await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let error: Value = serde_json::from_slice(&body(response).await).unwrap();
        assert_eq!(error["detail"], "failed to parse request body");

        let request = tile_request(json!({"heatmap": {}}), 0);
        let response = post(&app, "/tile/default", request).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        insta::assert_snapshot!(String::from_utf8_lossy(&body(response).await), @r#"{"detail":"unrecognized tile type `heatmap`"}"#);

        let request = tile_request(json!({"rest": {"scheme": "https"}}), 0);
        let response = post(&app, "/tile/default", request).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_generation_failure() {
        tilesmith_test::setup();
        let server = tilesmith_test::TileServer::new();
        let app = app();

        let request = tile_request(json!({"rest": {"endpoint": server.endpoint("status/503")}}), 0);
        let response = post(&app, "/tile/default", request).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        insta::assert_snapshot!(String::from_utf8_lossy(&body(response).await), @r#"{"detail":"generation failed: tile server responded with 503 Service Unavailable: tile server failure"}"#);
        assert_eq!(server.accesses(), 1);
    }
}
