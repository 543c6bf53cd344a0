//! Daemon HTTP surface.
//!
//! Every non-debug request goes through the proxy gate: the caller's tree
//! fingerprint is compared against a fresh walk of the sync directory, and
//! only matching requests reach the user process. The patch endpoint is the
//! only writer to the sync directory; a reader/writer lock keeps requests
//! from ever observing a half-applied tree.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::{to_bytes, Body};
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::Router;
use subtle::ConstantTimeEq;
use tokio::time::timeout;
use tracing::{info, warn};
use uuid::Uuid;

use rundev_common::constants::{
    HDR_CHECKSUM, HDR_CLIENT_SECRET, HDR_PATCH_PRECONDITION_SUM, MIME_CHECKSUM_MISMATCH,
    MIME_PATCH, MIME_PROCESS_ERROR, WHITEOUT_DELETE_SUFFIX,
};
use rundev_common::types::{BuildCmd, Cmd, ProcError};
use rundev_common::unarchive::apply_patch;
use rundev_common::{walk, FileIgnores, FsNode};

use crate::logbuf::LogBuffer;
use crate::nanny::{Nanny, ProcNanny, ProcOpts};
use crate::portcheck::{PortChecker, TcpPortChecker};

/// Daemon configuration, resolved from flags at startup.
#[derive(Debug, Clone)]
pub struct DaemonOpts {
    pub sync_dir: PathBuf,
    /// Empty string disables patch authentication.
    pub client_secret: String,
    pub run_cmd: Cmd,
    pub build_cmds: Vec<BuildCmd>,
    /// Port the user app is told to listen on via `PORT`.
    pub user_port: u16,
    /// How long a request waits for the user app's port to open.
    pub port_wait_timeout: Duration,
    pub ignores: Option<FileIgnores>,
}

/// Shared daemon context passed to all handlers.
pub struct DaemonContext {
    opts: DaemonOpts,
    /// Proxied requests hold the read half; patch application holds the
    /// write half.
    patch_lock: tokio::sync::RwLock<()>,
    /// Serializes nanny state transitions and the build sequence.
    nanny_lock: tokio::sync::Mutex<()>,
    nanny: Arc<dyn Nanny>,
    port_check: Arc<dyn PortChecker>,
    proc_logs: Arc<LogBuffer>,
    upstream: reqwest::Client,
    /// Paths touched by patches since the last successful rebuild. `None`
    /// means unknown history, which makes every conditional build run.
    changed_paths: std::sync::Mutex<Option<Vec<String>>>,
}

impl DaemonContext {
    pub fn new(opts: DaemonOpts) -> Arc<Self> {
        let proc_logs = Arc::new(LogBuffer::default());
        let nanny = Arc::new(ProcNanny::new(
            opts.run_cmd.clone(),
            ProcOpts {
                port: opts.user_port,
                dir: opts.sync_dir.clone(),
            },
            Arc::clone(&proc_logs),
        ));
        let port_check = Arc::new(TcpPortChecker::new(opts.user_port));
        Self::with_parts(opts, nanny, port_check, proc_logs)
    }

    /// Injection point for tests: substitute nanny and port checker fakes.
    pub fn with_parts(
        opts: DaemonOpts,
        nanny: Arc<dyn Nanny>,
        port_check: Arc<dyn PortChecker>,
        proc_logs: Arc<LogBuffer>,
    ) -> Arc<Self> {
        Arc::new(Self {
            opts,
            patch_lock: tokio::sync::RwLock::new(()),
            nanny_lock: tokio::sync::Mutex::new(()),
            nanny,
            port_check,
            proc_logs,
            upstream: reqwest::Client::builder()
                .redirect(reqwest::redirect::Policy::none())
                .build()
                .expect("reqwest client"),
            changed_paths: std::sync::Mutex::new(None),
        })
    }
}

/// Builds the daemon router.
pub fn daemon_router(ctx: Arc<DaemonContext>) -> Router {
    Router::new()
        .route("/rundevd/fsz", get(fsz_handler))
        .route("/rundevd/debugz", get(debugz_handler))
        .route("/rundevd/procz", get(procz_handler))
        .route("/rundevd/restart", get(restart_handler))
        .route("/rundevd/kill", get(kill_handler))
        .route("/rundevd/patch", any(patch_handler))
        .route("/rundevd/{*rest}", any(unknown_debug_handler))
        .fallback(proxy_handler)
        .with_state(ctx)
}

// ---------------------------------------------------------------------------
// Proxy gate
// ---------------------------------------------------------------------------

async fn proxy_handler(State(ctx): State<Arc<DaemonContext>>, req: Request) -> Response {
    let _read_guard = ctx.patch_lock.read().await;

    let id = Uuid::new_v4();
    let start = Instant::now();
    let path = req.uri().path().to_string();
    let method = req.method().clone();
    info!(%id, %path, %method, "proxy request accepted");

    let resp = gate_and_forward(&ctx, req).await;

    info!(
        %id,
        %path,
        status = resp.status().as_u16(),
        took_ms = start.elapsed().as_millis() as u64,
        "proxy request complete"
    );
    resp
}

async fn gate_and_forward(ctx: &DaemonContext, req: Request) -> Response {
    let req_checksum = match parse_checksum_header(req.headers(), HDR_CHECKSUM) {
        Ok(v) => v,
        Err(msg) => return text_response(StatusCode::BAD_REQUEST, msg),
    };

    let fs = match walk(&ctx.opts.sync_dir, ctx.opts.ignores.as_ref()) {
        Ok(fs) => fs,
        Err(e) => {
            return text_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("failed to walk the sync directory: {e}"),
            )
        }
    };
    let local_checksum = fs.root_checksum();

    if local_checksum != req_checksum {
        return mismatch_response(&fs);
    }

    {
        let _nanny_guard = ctx.nanny_lock.lock().await;
        if !ctx.nanny.running() {
            info!("user process not running, rebuilding and restarting");
            if let Err(resp) = run_build_cmds(ctx).await {
                return with_checksum_header(resp, local_checksum);
            }
            if let Err(e) = ctx.nanny.restart() {
                let resp = proc_error_response(
                    format!("failed to start child process: {e}"),
                    ctx.proc_logs.snapshot_string(),
                );
                return with_checksum_header(resp, local_checksum);
            }
            *ctx.changed_paths.lock().unwrap() = Some(Vec::new());
        }
    }

    if timeout(ctx.opts.port_wait_timeout, ctx.port_check.wait_port())
        .await
        .is_err()
    {
        let resp = proc_error_response(
            format!(
                "child process did not start listening on $PORT ({}) in {:?}",
                ctx.opts.user_port, ctx.opts.port_wait_timeout
            ),
            ctx.proc_logs.snapshot_string(),
        );
        return with_checksum_header(resp, local_checksum);
    }

    match forward_to_user_app(ctx, req).await {
        Ok(resp) => with_checksum_header(resp, local_checksum),
        Err(e) => with_checksum_header(
            text_response(
                StatusCode::BAD_GATEWAY,
                format!("failed to reach user process: {e}"),
            ),
            local_checksum,
        ),
    }
}

/// Runs the configured build commands in the sync directory. A command with
/// `on` patterns is skipped unless a path changed by a patch matches.
async fn run_build_cmds(ctx: &DaemonContext) -> Result<(), Response> {
    let changed = ctx.changed_paths.lock().unwrap().clone();
    let total = ctx.opts.build_cmds.len();
    for (i, bc) in ctx.opts.build_cmds.iter().enumerate() {
        if !build_cmd_applies(bc, changed.as_deref()) {
            info!(cmd = %bc.c, "skipping build command, no matching changed files");
            continue;
        }
        info!(cmd = %bc.c, step = i + 1, total, "executing build command");
        let output = tokio::process::Command::new(bc.c.command())
            .args(bc.c.args())
            .current_dir(&ctx.opts.sync_dir)
            .kill_on_drop(true)
            .output()
            .await;
        match output {
            Err(e) => {
                return Err(proc_error_response(
                    format!("executing build command ({}) failed: {e}", bc.c),
                    String::new(),
                ));
            }
            Ok(out) if !out.status.success() => {
                let mut combined = String::from_utf8_lossy(&out.stdout).into_owned();
                combined.push_str(&String::from_utf8_lossy(&out.stderr));
                warn!(cmd = %bc.c, status = %out.status, "build command failed");
                return Err(proc_error_response(
                    format!("executing build command ({}) failed: {}", bc.c, out.status),
                    combined,
                ));
            }
            Ok(_) => info!(cmd = %bc.c, "build step succeeded"),
        }
    }
    Ok(())
}

/// True when the build command must run for the given change history.
fn build_cmd_applies(cmd: &BuildCmd, changed: Option<&[String]>) -> bool {
    if cmd.on.is_empty() {
        return true;
    }
    // Unknown history (fresh daemon): run everything once.
    let Some(changed) = changed else { return true };
    let Ok(matcher) = FileIgnores::new(&cmd.on) else {
        return true;
    };
    changed.iter().any(|path| matcher.matches_any(path))
}

async fn forward_to_user_app(ctx: &DaemonContext, req: Request) -> Result<Response, String> {
    let (parts, body) = req.into_parts();
    let body = to_bytes(body, usize::MAX)
        .await
        .map_err(|e| format!("failed to buffer request body: {e}"))?;

    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let url = format!("http://localhost:{}{}", ctx.opts.user_port, path_and_query);

    let mut upstream_req = ctx.upstream.request(parts.method, &url);
    for (name, value) in &parts.headers {
        if is_hop_by_hop(name.as_str()) {
            continue;
        }
        upstream_req = upstream_req.header(name, value);
    }
    let upstream_resp = upstream_req
        .body(body)
        .send()
        .await
        .map_err(|e| e.to_string())?;

    let status = upstream_resp.status();
    let headers = upstream_resp.headers().clone();
    let bytes = upstream_resp.bytes().await.map_err(|e| e.to_string())?;

    let mut builder = Response::builder().status(status);
    for (name, value) in &headers {
        if is_hop_by_hop(name.as_str()) {
            continue;
        }
        builder = builder.header(name, value);
    }
    builder
        .body(Body::from(bytes))
        .map_err(|e| e.to_string())
}

fn is_hop_by_hop(name: &str) -> bool {
    matches!(
        name,
        "host" | "connection" | "transfer-encoding" | "content-length" | "keep-alive" | "upgrade"
    )
}

// ---------------------------------------------------------------------------
// Patch endpoint
// ---------------------------------------------------------------------------

async fn patch_handler(State(ctx): State<Arc<DaemonContext>>, req: Request) -> Response {
    if let Err(resp) = check_client_secret(&ctx.opts.client_secret, req.headers()) {
        return resp;
    }
    if req.method() != Method::PATCH {
        return StatusCode::METHOD_NOT_ALLOWED.into_response();
    }
    match req.headers().get(header::CONTENT_TYPE) {
        Some(ct) if ct.as_bytes() == MIME_PATCH.as_bytes() => {}
        _ => return StatusCode::UNSUPPORTED_MEDIA_TYPE.into_response(),
    }

    let Some(expected_sum) = header_string(req.headers(), HDR_PATCH_PRECONDITION_SUM) else {
        return text_response(
            StatusCode::BAD_REQUEST,
            format!("patch request did not contain {HDR_PATCH_PRECONDITION_SUM} header"),
        );
    };
    let Some(incoming_sum) = header_string(req.headers(), HDR_CHECKSUM) else {
        return text_response(
            StatusCode::BAD_REQUEST,
            format!("patch request did not contain {HDR_CHECKSUM} header"),
        );
    };

    // Stop accepting proxied and other patch requests while the tree is
    // potentially being modified.
    let _write_guard = ctx.patch_lock.write().await;

    let fs = match walk(&ctx.opts.sync_dir, ctx.opts.ignores.as_ref()) {
        Ok(fs) => fs,
        Err(e) => {
            return text_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("failed to walk the sync directory: {e}"),
            )
        }
    };
    let local_sum = fs.root_checksum().to_string();

    if local_sum == incoming_sum {
        // Already at the target state.
        return StatusCode::ACCEPTED.into_response();
    }
    if local_sum != expected_sum {
        // The client's picture of this tree is stale.
        return with_checksum_header(
            StatusCode::PRECONDITION_FAILED.into_response(),
            fs.root_checksum(),
        );
    }

    let body = match to_bytes(req.into_body(), usize::MAX).await {
        Ok(b) => b,
        Err(e) => {
            return text_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("failed to read patch body: {e}"),
            )
        }
    };
    let touched = match apply_patch(&ctx.opts.sync_dir, body.as_ref()) {
        Ok(touched) => touched,
        Err(e) => {
            return text_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("failed to uncompress patch tar: {e}"),
            )
        }
    };
    info!(entries = touched.len(), "patch applied");
    record_changed_paths(&ctx, &touched);

    {
        let _nanny_guard = ctx.nanny_lock.lock().await;
        // The next proxied request triggers rebuild and restart.
        ctx.nanny.kill();
        info!("existing proc killed after patch");
    }

    info!(checksum = %incoming_sum, "patch accepted");
    StatusCode::ACCEPTED.into_response()
}

fn check_client_secret(secret: &str, headers: &HeaderMap) -> Result<(), Response> {
    if secret.is_empty() {
        return Ok(());
    }
    let Some(presented) = header_string(headers, HDR_CLIENT_SECRET) else {
        return Err(text_response(
            StatusCode::UNAUTHORIZED,
            format!("{HDR_CLIENT_SECRET} header not specified"),
        ));
    };
    if bool::from(secret.as_bytes().ct_eq(presented.as_bytes())) {
        Ok(())
    } else {
        Err(text_response(
            StatusCode::FORBIDDEN,
            format!(
                "client secret ({HDR_CLIENT_SECRET} header) on the request \
                 not matching the one configured on the daemon"
            ),
        ))
    }
}

fn record_changed_paths(ctx: &DaemonContext, touched: &[String]) {
    let mut guard = ctx.changed_paths.lock().unwrap();
    let list = guard.get_or_insert_with(Vec::new);
    for name in touched {
        let path = name.strip_suffix(WHITEOUT_DELETE_SUFFIX).unwrap_or(name);
        list.push(path.to_string());
    }
}

// ---------------------------------------------------------------------------
// Debug endpoints
// ---------------------------------------------------------------------------

async fn fsz_handler(State(ctx): State<Arc<DaemonContext>>, req: Request) -> Response {
    let full = has_query_flag(req.uri().query(), "full");
    let ignores = if full { None } else { ctx.opts.ignores.as_ref() };
    match walk(&ctx.opts.sync_dir, ignores) {
        Ok(fs) => fs_dump_response(&fs),
        Err(e) => text_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to fetch local filesystem: {e}"),
        ),
    }
}

async fn debugz_handler(State(ctx): State<Arc<DaemonContext>>) -> Response {
    let checksum = match walk(&ctx.opts.sync_dir, ctx.opts.ignores.as_ref()) {
        Ok(fs) => fs.root_checksum().to_string(),
        Err(e) => format!("(walk failed: {e})"),
    };
    let cwd = std::env::current_dir()
        .map(|p| p.display().to_string())
        .unwrap_or_default();
    let body = format!(
        "fs checksum: {checksum}\n\
         pid: {}\n\
         cwd: {cwd}\n\
         child process running: {}\n\
         opts:\n\
         \x20 sync dir: {}\n\
         \x20 ignores: {:?}\n\
         \x20 run-cmd: {}\n\
         \x20 build-cmds: {:?}\n\
         \x20 port wait timeout: {:?}\n",
        std::process::id(),
        ctx.nanny.running(),
        ctx.opts.sync_dir.display(),
        ctx.opts.ignores.as_ref().map(|i| i.rules()).unwrap_or(&[]),
        ctx.opts.run_cmd,
        ctx.opts.build_cmds,
        ctx.opts.port_wait_timeout,
    );
    text_response(StatusCode::OK, body)
}

async fn procz_handler(State(ctx): State<Arc<DaemonContext>>) -> Response {
    let _nanny_guard = ctx.nanny_lock.lock().await;
    ctx.proc_logs.snapshot().into_response()
}

async fn restart_handler(State(ctx): State<Arc<DaemonContext>>) -> Response {
    let _nanny_guard = ctx.nanny_lock.lock().await;
    match ctx.nanny.restart() {
        Ok(()) => text_response(StatusCode::OK, "ok".to_string()),
        Err(e) => text_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("error restarting process: {e}"),
        ),
    }
}

async fn kill_handler(State(ctx): State<Arc<DaemonContext>>) -> Response {
    let _nanny_guard = ctx.nanny_lock.lock().await;
    ctx.nanny.kill();
    StatusCode::OK.into_response()
}

async fn unknown_debug_handler(req: Request) -> Response {
    text_response(
        StatusCode::NOT_FOUND,
        format!("not found: debug endpoint {} does not exist.", req.uri().path()),
    )
}

// ---------------------------------------------------------------------------
// Response helpers
// ---------------------------------------------------------------------------

fn parse_checksum_header(headers: &HeaderMap, name: &str) -> Result<u64, String> {
    let Some(raw) = header_string(headers, name) else {
        return Err(format!("missing {name} header from the client"));
    };
    raw.parse::<u64>()
        .map_err(|e| format!("malformed {name} header: {e}"))
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn has_query_flag(query: Option<&str>, flag: &str) -> bool {
    query.is_some_and(|q| {
        q.split('&')
            .any(|kv| kv == flag || kv.starts_with(&format!("{flag}=")))
    })
}

fn text_response(status: StatusCode, body: String) -> Response {
    (status, body).into_response()
}

fn with_checksum_header(mut resp: Response, checksum: u64) -> Response {
    if let Ok(value) = checksum.to_string().parse() {
        resp.headers_mut().insert(HDR_CHECKSUM, value);
    }
    resp
}

/// 412 response carrying the daemon's current tree so the client can
/// compute a patch.
fn mismatch_response(fs: &FsNode) -> Response {
    let body = match serde_json::to_vec(fs) {
        Ok(b) => b,
        Err(e) => {
            return text_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("error while marshaling remote fs: {e}"),
            )
        }
    };
    let resp = (
        StatusCode::PRECONDITION_FAILED,
        [(header::CONTENT_TYPE, MIME_CHECKSUM_MISMATCH)],
        body,
    )
        .into_response();
    with_checksum_header(resp, fs.root_checksum())
}

/// 500 response carrying a structured process error.
fn proc_error_response(message: String, output: String) -> Response {
    let body = serde_json::to_vec_pretty(&ProcError { message, output }).unwrap_or_default();
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        [(header::CONTENT_TYPE, MIME_PROCESS_ERROR)],
        body,
    )
        .into_response()
}

/// JSON dump of a walked tree with its checksum in the response header.
fn fs_dump_response(fs: &FsNode) -> Response {
    match serde_json::to_vec_pretty(fs) {
        Ok(body) => {
            let resp = (
                StatusCode::OK,
                [(header::CONTENT_TYPE, "application/json")],
                body,
            )
                .into_response();
            with_checksum_header(resp, fs.root_checksum())
        }
        Err(e) => text_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to encode json: {e}"),
        ),
    }
}
