//! The syncing round-tripper: every outbound request carries the local
//! fingerprint, and mismatch responses trigger a patch-and-retry cycle.

use std::sync::Arc;
use std::time::Instant;

use axum::body::{Body, Bytes};
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use tracing::{info, warn};

use rundev_common::constants::{
    HDR_CHECKSUM, MIME_CHECKSUM_MISMATCH, MIME_DUMB_REPEAT, MIME_PROCESS_ERROR,
};
use rundev_common::types::ProcError;
use rundev_common::FsNode;

use crate::syncer::Syncer;

const MAX_RETRIES: usize = 10;

/// Wraps the outbound HTTP client with the mismatch-sync-retry loop.
pub struct SyncingTransport {
    syncer: Arc<Syncer>,
    client: reqwest::Client,
    max_retries: usize,
}

impl SyncingTransport {
    pub fn new(syncer: Arc<Syncer>) -> Self {
        Self {
            syncer,
            client: reqwest::Client::builder()
                .redirect(reqwest::redirect::Policy::none())
                .build()
                .expect("reqwest client"),
            max_retries: MAX_RETRIES,
        }
    }

    /// Forwards one request to the daemon, patching and retrying on
    /// checksum mismatches. Errors are synthesized into responses so the
    /// caller always has something to hand back to the browser.
    pub async fn round_trip(
        &self,
        method: Method,
        path_and_query: &str,
        headers: HeaderMap,
        body: Bytes,
    ) -> Response {
        let start = Instant::now();
        info!(%method, path = %path_and_query, "request received");

        let local_checksum = match self.syncer.checksum() {
            Ok(sum) => sum,
            Err(e) => {
                return text_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("failed to walk the local sync directory: {e}"),
                )
            }
        };

        let url = format!("{}{}", self.syncer.opts().remote_url, path_and_query);

        for retry in 0..self.max_retries {
            if retry != 0 {
                info!(n = retry, path = %path_and_query, "repeating request");
            }

            let mut req = self.client.request(method.clone(), &url);
            for (name, value) in &headers {
                if is_hop_by_hop(name.as_str()) {
                    continue;
                }
                req = req.header(name, value);
            }
            // The Host header is derived from the upstream URL; the buffered
            // body makes the request repeatable.
            req = req.header(HDR_CHECKSUM, local_checksum.to_string());
            let resp = match req.body(body.clone()).send().await {
                Ok(resp) => resp,
                Err(e) => {
                    return text_response(
                        StatusCode::BAD_GATEWAY,
                        format!("error reaching remote daemon: {e}"),
                    )
                }
            };

            let content_type = resp
                .headers()
                .get(header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string();

            match content_type.as_str() {
                MIME_PROCESS_ERROR => {
                    info!("remote responded with process error");
                    return proc_error_passthrough(resp).await;
                }
                MIME_DUMB_REPEAT => {
                    info!("remote responded with dumb-repeat");
                }
                MIME_CHECKSUM_MISMATCH => {
                    let remote_sum = resp
                        .headers()
                        .get(HDR_CHECKSUM)
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("")
                        .to_string();
                    info!(remote = %remote_sum, "remote responded with checksum mismatch");
                    let remote_fs = match parse_mismatch_body(resp).await {
                        Ok(fs) => fs,
                        Err(msg) => return text_response(StatusCode::INTERNAL_SERVER_ERROR, msg),
                    };
                    if let Err(e) = self.syncer.upload_patch(&remote_fs, &remote_sum).await {
                        warn!(retry, error = %e, "sync failed");
                        continue;
                    }
                }
                _ => {
                    info!(
                        retry,
                        path = %path_and_query,
                        status = resp.status().as_u16(),
                        took_ms = start.elapsed().as_millis() as u64,
                        "request completed"
                    );
                    return passthrough(resp).await;
                }
            }
        }

        text_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!(
                "rundev tried {} times syncing code, but it was still getting a checksum \
                 mismatch.\nplease report an issue with console logs, /rundev/fsz and \
                 /rundevd/fsz responses.",
                self.max_retries
            ),
        )
    }
}

/// Decodes a mismatch body into the remote tree. Unknown fields are
/// rejected so protocol drift fails loudly.
async fn parse_mismatch_body(resp: reqwest::Response) -> Result<FsNode, String> {
    let bytes = resp
        .bytes()
        .await
        .map_err(|e| format!("failed to read remote fs in the response: {e}"))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| format!("failed to decode checksum mismatch response body: {e}"))
}

/// Renders a structured process error as a readable text response, keeping
/// the upstream status code.
async fn proc_error_passthrough(resp: reqwest::Response) -> Response {
    let status = resp.status();
    let pe: ProcError = match resp.bytes().await.map_err(|e| e.to_string()).and_then(|b| {
        serde_json::from_slice(&b).map_err(|e| e.to_string())
    }) {
        Ok(pe) => pe,
        Err(e) => {
            return text_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("failed to parse proc error response body: {e}"),
            )
        }
    };
    text_response(
        status,
        format!("process error: {}\n\noutput:\n{}", pe.message, pe.output),
    )
}

/// Converts an upstream response into an axum response unchanged.
async fn passthrough(resp: reqwest::Response) -> Response {
    let status = resp.status();
    let headers = resp.headers().clone();
    let bytes = match resp.bytes().await {
        Ok(b) => b,
        Err(e) => {
            return text_response(
                StatusCode::BAD_GATEWAY,
                format!("error reading remote response body: {e}"),
            )
        }
    };
    let mut builder = Response::builder().status(status);
    for (name, value) in &headers {
        if is_hop_by_hop(name.as_str()) {
            continue;
        }
        builder = builder.header(name, value);
    }
    builder
        .body(Body::from(bytes))
        .unwrap_or_else(|e| {
            text_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("failed to assemble response: {e}"),
            )
        })
}

fn is_hop_by_hop(name: &str) -> bool {
    matches!(
        name,
        "host" | "connection" | "transfer-encoding" | "content-length" | "keep-alive" | "upgrade"
    )
}

fn text_response(status: StatusCode, body: String) -> Response {
    (status, body).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syncer::SyncOpts;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    use axum::extract::State;
    use axum::routing::patch;
    use axum::Router;

    struct MockDaemon {
        hits: AtomicUsize,
        /// Responses served for successive proxied requests.
        script: Vec<MockResponse>,
    }

    #[derive(Clone)]
    enum MockResponse {
        Ok(&'static str),
        Repeat,
        Mismatch,
        ProcError,
    }

    async fn mock_handler(State(state): State<Arc<MockDaemon>>) -> Response {
        let n = state.hits.fetch_add(1, Ordering::SeqCst);
        let step = state.script.get(n).cloned().unwrap_or(MockResponse::Mismatch);
        match step {
            MockResponse::Ok(body) => (StatusCode::OK, body).into_response(),
            MockResponse::Repeat => (
                StatusCode::OK,
                [(header::CONTENT_TYPE, MIME_DUMB_REPEAT)],
                "",
            )
                .into_response(),
            MockResponse::Mismatch => {
                let empty_tree = FsNode {
                    name: "$root".into(),
                    ..FsNode::default()
                };
                let mut resp = (
                    StatusCode::PRECONDITION_FAILED,
                    [(header::CONTENT_TYPE, MIME_CHECKSUM_MISMATCH)],
                    serde_json::to_vec(&empty_tree).unwrap(),
                )
                    .into_response();
                resp.headers_mut()
                    .insert(HDR_CHECKSUM, "999".parse().unwrap());
                resp
            }
            MockResponse::ProcError => (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(header::CONTENT_TYPE, MIME_PROCESS_ERROR)],
                serde_json::to_vec(&ProcError {
                    message: "build exploded".into(),
                    output: "compiler says no".into(),
                })
                .unwrap(),
            )
                .into_response(),
        }
    }

    async fn patch_ok() -> StatusCode {
        StatusCode::ACCEPTED
    }

    async fn serve_mock(script: Vec<MockResponse>) -> (String, Arc<MockDaemon>) {
        let state = Arc::new(MockDaemon {
            hits: AtomicUsize::new(0),
            script,
        });
        let router = Router::new()
            .route("/rundevd/patch", patch(patch_ok))
            .fallback(mock_handler)
            .with_state(Arc::clone(&state));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        (format!("http://{addr}"), state)
    }

    fn transport_for(dir: &TempDir, remote_url: String) -> SyncingTransport {
        SyncingTransport::new(Arc::new(Syncer::new(SyncOpts {
            local_dir: dir.path().to_path_buf(),
            remote_url,
            client_secret: "test-secret".into(),
            ignores: None,
        })))
    }

    async fn body_string(resp: Response) -> String {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    #[tokio::test]
    async fn plain_response_passes_through() {
        let tmp = TempDir::new().unwrap();
        let (url, state) = serve_mock(vec![MockResponse::Ok("hello from app")]).await;
        let t = transport_for(&tmp, url);
        let resp = t
            .round_trip(Method::GET, "/", HeaderMap::new(), Bytes::new())
            .await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_string(resp).await, "hello from app");
        assert_eq!(state.hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn proc_error_is_surfaced_without_retry() {
        let tmp = TempDir::new().unwrap();
        let (url, state) = serve_mock(vec![MockResponse::ProcError, MockResponse::Ok("no")]).await;
        let t = transport_for(&tmp, url);
        let resp = t
            .round_trip(Method::GET, "/", HeaderMap::new(), Bytes::new())
            .await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_string(resp).await;
        assert!(body.contains("process error: build exploded"));
        assert!(body.contains("compiler says no"));
        assert_eq!(state.hits.load(Ordering::SeqCst), 1, "must not retry");
    }

    #[tokio::test]
    async fn repeat_signal_causes_a_retry() {
        let tmp = TempDir::new().unwrap();
        let (url, state) =
            serve_mock(vec![MockResponse::Repeat, MockResponse::Ok("second try")]).await;
        let t = transport_for(&tmp, url);
        let resp = t
            .round_trip(Method::GET, "/", HeaderMap::new(), Bytes::new())
            .await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_string(resp).await, "second try");
        assert_eq!(state.hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn mismatch_triggers_patch_then_retry() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("foo.txt"), "v2").unwrap();
        let (url, state) =
            serve_mock(vec![MockResponse::Mismatch, MockResponse::Ok("synced")]).await;
        let t = transport_for(&tmp, url);
        let resp = t
            .round_trip(Method::GET, "/", HeaderMap::new(), Bytes::new())
            .await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_string(resp).await, "synced");
        assert_eq!(state.hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn persistent_mismatch_exhausts_retries() {
        let tmp = TempDir::new().unwrap();
        let (url, state) = serve_mock(Vec::new()).await; // always mismatch
        let t = transport_for(&tmp, url);
        let resp = t
            .round_trip(Method::GET, "/", HeaderMap::new(), Bytes::new())
            .await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_string(resp).await;
        assert!(body.contains("tried 10 times"));
        assert_eq!(state.hits.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn unreachable_daemon_is_a_bad_gateway() {
        let tmp = TempDir::new().unwrap();
        let t = transport_for(&tmp, "http://127.0.0.1:1".into());
        let resp = t
            .round_trip(Method::GET, "/", HeaderMap::new(), Bytes::new())
            .await;
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    }
}
