use std::time::Instant;

use axum::extract::{MatchedPath, Request};
use axum::middleware::Next;
use axum::response::Response;
use tilesmith_service::metric;

/// Records the duration and status code of every response, tagged by route.
pub async fn record_metrics(request: Request, next: Next) -> Response {
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map(|path| path.as_str().to_owned())
        .unwrap_or_else(|| "unmatched".to_owned());

    let start = Instant::now();
    let response = next.run(request).await;

    metric!(timer("requests.duration") = start.elapsed(), "route" => &route);
    metric!(
        counter("responses.status_code") += 1,
        "status" => response.status().as_str(),
        "route" => &route,
    );
    response
}
