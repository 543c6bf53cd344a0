//! Local proxy server: debug endpoints under `/rundev/`, everything else
//! forwarded through the syncing transport.

use std::sync::Arc;

use axum::body::to_bytes;
use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::Router;

use rundev_common::constants::HDR_CHECKSUM;
use rundev_common::{walk, FsNode};

use crate::syncer::Syncer;
use crate::transport::SyncingTransport;

pub struct LocalContext {
    pub syncer: Arc<Syncer>,
    pub transport: SyncingTransport,
}

impl LocalContext {
    pub fn new(syncer: Arc<Syncer>) -> Arc<Self> {
        let transport = SyncingTransport::new(Arc::clone(&syncer));
        Arc::new(Self { syncer, transport })
    }
}

/// Builds the local proxy router.
pub fn local_router(ctx: Arc<LocalContext>) -> Router {
    Router::new()
        .route("/rundev/fsz", get(fsz_handler))
        .route("/rundev/debugz", get(debugz_handler))
        .route("/rundev/{*rest}", any(unknown_debug_handler))
        .fallback(proxy_handler)
        .with_state(ctx)
}

async fn proxy_handler(State(ctx): State<Arc<LocalContext>>, req: Request) -> Response {
    let (parts, body) = req.into_parts();
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let body = match to_bytes(body, usize::MAX).await {
        Ok(b) => b,
        Err(e) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("failed to buffer request body: {e}"),
            )
                .into_response()
        }
    };
    ctx.transport
        .round_trip(parts.method, &path_and_query, parts.headers, body)
        .await
}

async fn fsz_handler(State(ctx): State<Arc<LocalContext>>, req: Request) -> Response {
    let full = req
        .uri()
        .query()
        .is_some_and(|q| q.split('&').any(|kv| kv == "full" || kv.starts_with("full=")));
    let opts = ctx.syncer.opts();
    let ignores = if full { None } else { opts.ignores.as_ref() };
    match walk(&opts.local_dir, ignores) {
        Ok(fs) => fs_dump_response(&fs),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to fetch local filesystem: {e}"),
        )
            .into_response(),
    }
}

async fn debugz_handler(State(ctx): State<Arc<LocalContext>>) -> Response {
    let checksum = match ctx.syncer.checksum() {
        Ok(sum) => sum.to_string(),
        Err(e) => format!("(walk failed: {e})"),
    };
    let cwd = std::env::current_dir()
        .map(|p| p.display().to_string())
        .unwrap_or_default();
    let opts = ctx.syncer.opts();
    let body = format!(
        "fs checksum: {checksum}\n\
         pid: {}\n\
         cwd: {cwd}\n\
         sync:\n\
         \x20 dir: {}\n\
         \x20 target: {}\n\
         \x20 ignores: {:?}\n",
        std::process::id(),
        opts.local_dir.display(),
        opts.remote_url,
        opts.ignores.as_ref().map(|i| i.rules()).unwrap_or(&[]),
    );
    (StatusCode::OK, body).into_response()
}

async fn unknown_debug_handler(req: Request) -> Response {
    (
        StatusCode::NOT_FOUND,
        format!("not found: debug endpoint {} does not exist.", req.uri().path()),
    )
        .into_response()
}

fn fs_dump_response(fs: &FsNode) -> Response {
    match serde_json::to_vec_pretty(fs) {
        Ok(body) => {
            let mut resp = (
                StatusCode::OK,
                [(header::CONTENT_TYPE, "application/json")],
                body,
            )
                .into_response();
            if let Ok(value) = fs.root_checksum().to_string().parse() {
                resp.headers_mut().insert(HDR_CHECKSUM, value);
            }
            resp
        }
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to encode json: {e}"),
        )
            .into_response(),
    }
}
