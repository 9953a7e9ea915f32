//! Helpers for testing the web server and service.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - When using [`tempdir`], make sure that the handle to the temp directory is held for the
//!    entire lifetime of the test. The filesystem store creates its directory eagerly, so a
//!    directory dropped too early leaves the store writing into a deleted path.
//!
//!  - When using [`TileServer`], make sure that the server is held until all requests to
//!    it have been made. The server stops serving when dropped.

use std::collections::BTreeMap;
use std::net::{SocketAddr, TcpListener};
use std::sync::{Arc, Mutex};

use axum::{Json, Router};
use axum::extract::{self, OriginalUri, Request};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::routing::{get, post};
use serde_json::json;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

pub use tempfile::TempDir;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `tilesmith` crates and mutes all
///    other logs (such as hyper or reqwest).
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("tilesmith_service=trace,tilesmith=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates a temporary directory.
///
/// The directory is deleted when the [`TempDir`] instance is dropped, unless
/// [`into_path`](TempDir::into_path) is called. Use it as a guard to automatically clean up after
/// tests.
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
}

/// A test server that binds to a random port and serves a web app.
///
/// This server requires a `tokio` runtime and is supposed to be run in a `tokio::test`. It
/// automatically stops serving when dropped.
#[derive(Debug)]
pub struct Server {
    pub handle: tokio::task::JoinHandle<()>,
    pub socket: SocketAddr,
}

impl Server {
    /// Creates a new test server serving the given `router`.
    pub fn with_router(router: Router) -> Self {
        let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0))).unwrap();
        listener.set_nonblocking(true).unwrap();
        let socket = listener.local_addr().unwrap();
        let listener = tokio::net::TcpListener::from_std(listener).unwrap();

        let handle = tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        Self { handle, socket }
    }

    /// Returns the socket address that this server listens on.
    pub fn addr(&self) -> SocketAddr {
        self.socket
    }

    /// Returns the port that this server listens on.
    pub fn port(&self) -> u16 {
        self.addr().port()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn respond_status(
    extract::Path((num, _)): extract::Path<(u16, String)>,
) -> (StatusCode, &'static str) {
    let status = StatusCode::from_u16(num).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, "tile server failure")
}

/// A tile server counting the requests it receives.
///
/// Routes:
///
///  - `/tiles/*path`: responds with `path` as the tile contents.
///  - `/status/:num/*tail`: responds with status `num` and a short error body.
///  - `/bulk/*index`: accepts bulk payloads, like an Elasticsearch bulk endpoint.
///  - `/rejecting/*index`: accepts bulk payloads but reports a rejected document.
pub struct TileServer {
    server: Server,
    hits: Arc<Mutex<BTreeMap<String, usize>>>,
}

impl TileServer {
    pub fn new() -> Self {
        let hits = Arc::new(Mutex::new(BTreeMap::new()));

        let hitcounter = {
            let hits = hits.clone();
            move |OriginalUri(uri): OriginalUri, req: Request, next: Next| {
                let hits = hits.clone();
                async move {
                    {
                        let mut hits = hits.lock().unwrap();
                        let hits = hits.entry(uri.to_string()).or_default();
                        *hits += 1;
                    }

                    next.run(req).await
                }
            }
        };

        let router = Router::new()
            .route(
                "/tiles/*path",
                get(|extract::Path(path): extract::Path<String>| async move { path }),
            )
            .route("/status/:num/*tail", get(respond_status).post(respond_status))
            .route(
                "/bulk/*index",
                post(|| async { Json(json!({ "took": 1, "errors": false, "items": [] })) }),
            )
            .route(
                "/rejecting/*index",
                post(|| async {
                    Json(json!({
                        "took": 1,
                        "errors": true,
                        "items": [{
                            "index": {
                                "status": 400,
                                "error": {
                                    "type": "mapper_parsing_exception",
                                    "reason": "failed to parse"
                                }
                            }
                        }]
                    }))
                }),
            )
            .layer(middleware::from_fn(hitcounter));

        let server = Server::with_router(router);

        Self { server, hits }
    }

    /// Returns the endpoint of a `rest` generator pointing below `prefix`.
    ///
    /// Endpoints carry no scheme, for example `127.0.0.1:4711/tiles`.
    pub fn endpoint(&self, prefix: &str) -> String {
        format!("127.0.0.1:{}/{}", self.server.port(), prefix.trim_matches('/'))
    }

    /// Returns and resets the number of requests received.
    pub fn accesses(&self) -> usize {
        let map = std::mem::take(&mut *self.hits.lock().unwrap());
        map.into_values().sum()
    }

    /// Returns and resets the requests received, by path.
    pub fn all_hits(&self) -> Vec<(String, usize)> {
        let map = std::mem::take(&mut *self.hits.lock().unwrap());
        map.into_iter().collect()
    }
}

impl Default for TileServer {
    fn default() -> Self {
        Self::new()
    }
}
