//! Router assembly and server lifecycle

use axum::extract::Request;
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, head, post};
use axum::Router;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;

use crate::api::{events, handlers};
use crate::common::{Config, Result};
use crate::leader::Election;
use crate::registry::Registry;
use crate::storage::StorageClient;
use crate::watcher::{Dispatcher, FileWatcher};

/// Shared state for every handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub election: Arc<Election>,
    pub registry: Arc<Registry>,
    pub storage: Arc<StorageClient>,
    pub watcher: Option<Arc<FileWatcher>>,
    pub dispatcher: Option<Arc<Dispatcher>>,
    pub started_at: Instant,
}

/// Assemble the control surface. Event routes are mounted only when the
/// watcher exists.
pub fn build_router(state: AppState) -> Router {
    let mut router = Router::new()
        // Health and leadership
        .route("/health", get(handlers::health))
        .route("/status", get(handlers::status))
        .route("/leader", get(handlers::leader))
        .route("/role", get(handlers::role))
        // Metadata: full records
        .route("/meta", get(handlers::list_meta))
        .route(
            "/meta/:hash",
            get(handlers::get_meta)
                .put(handlers::put_meta)
                .patch(handlers::patch_meta)
                .delete(handlers::delete_meta),
        )
        // Set-valued property append (before the property wildcard)
        .route("/meta/:hash/_add/*key", post(handlers::add_to_set))
        // Single properties; keys may contain slashes
        .route(
            "/meta/:hash/*key",
            get(handlers::get_property)
                .put(handlers::put_property)
                .delete(handlers::delete_property),
        )
        // Data paths
        .route("/data/:hash/path", get(handlers::data_path))
        .route("/data/:hash", head(handlers::head_data))
        // Files by content identifier
        .route("/file/cid", post(handlers::compute_cid))
        .route("/file/:cid", get(handlers::get_file_by_cid))
        // Service registry
        .route("/services", get(handlers::list_services))
        .route("/services/:name", get(handlers::get_service));

    if state.watcher.is_some() {
        router = router.merge(events::router());
    }

    router
        .layer(middleware::from_fn(log_requests))
        .layer(middleware::from_fn(cors))
        .with_state(state)
}

/// Serve until the shutdown channel fires.
pub async fn serve(
    router: Router,
    addr: &str,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("HTTP control surface listening on {}", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await?;

    Ok(())
}

async fn log_requests(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let start = Instant::now();

    let response = next.run(request).await;

    tracing::info!(
        "{} {} {} {:?}",
        method,
        path,
        response.status().as_u16(),
        start.elapsed()
    );
    response
}

async fn cors(request: Request, next: Next) -> Response {
    if request.method() == Method::OPTIONS {
        let mut response = Response::new(axum::body::Body::empty());
        *response.status_mut() = StatusCode::OK;
        apply_cors_headers(&mut response);
        return response;
    }

    let mut response = next.run(request).await;
    apply_cors_headers(&mut response);
    response
}

fn apply_cors_headers(response: &mut Response) {
    let headers = response.headers_mut();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, PUT, PATCH, DELETE, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Content-Type"),
    );
}
