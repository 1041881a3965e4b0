//! HTTP variant of the mount surface: `/` lists snapshots, everything
//! under `/<snapshot>/` is served from that snapshot's tree.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path as AxumPath, State};
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::Router;

use coffre_types::{CoffreError, Result};

use crate::snapshot::ItemKind;

use super::{Node, SnapshotFs};

#[derive(Clone)]
struct MountState {
    fs: Arc<SnapshotFs>,
}

/// Serve the mount over HTTP until the shutdown flag is raised.
/// `mountpoint` accepts `http://addr:port` or a bare `addr:port`.
pub fn serve(fs: Arc<SnapshotFs>, mountpoint: &str, shutdown: Arc<AtomicBool>) -> Result<()> {
    let addr = mountpoint
        .trim_start_matches("http://")
        .trim_end_matches('/')
        .to_string();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .map_err(CoffreError::Io)?;

    runtime.block_on(async move {
        let app = router(fs);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(CoffreError::Io)?;
        tracing::info!("HTTP mount serving at http://{addr}");

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                while !shutdown.load(Ordering::SeqCst) {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            })
            .await
            .map_err(|e| CoffreError::Other(format!("http mount: {e}")))
    })
}

fn router(fs: Arc<SnapshotFs>) -> Router {
    let state = MountState { fs };
    Router::new()
        .route("/", get(list_snapshots))
        .route("/{snapshot}", get(snapshot_root))
        .route("/{snapshot}/", get(snapshot_root))
        .route("/{snapshot}/{*path}", get(snapshot_path))
        .with_state(state)
}

async fn list_snapshots(State(state): State<MountState>) -> Response {
    let fs = Arc::clone(&state.fs);
    let entries = match tokio::task::spawn_blocking(move || fs.root_entries()).await {
        Ok(Ok(entries)) => entries,
        Ok(Err(e)) => {
            tracing::error!("failed to rebuild state: {e}");
            return (StatusCode::INTERNAL_SERVER_ERROR, "failed to rebuild state")
                .into_response();
        }
        Err(_) => return StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    };

    let mut body = String::new();
    body.push_str("<!doctype html>\n");
    body.push_str("<meta name=\"viewport\" content=\"width=device-width\">\n");
    body.push_str("<pre>\n");
    for entry in entries {
        body.push_str(&format!(
            "<a href=\"/{}/\">{}</a>\n",
            entry.snapshot_id.to_hex(),
            entry.name
        ));
    }
    body.push_str("</pre>\n");
    Html(body).into_response()
}

async fn snapshot_root(
    State(state): State<MountState>,
    AxumPath(snapshot): AxumPath<String>,
) -> Response {
    serve_path(state, snapshot, String::new()).await
}

async fn snapshot_path(
    State(state): State<MountState>,
    AxumPath((snapshot, path)): AxumPath<(String, String)>,
) -> Response {
    serve_path(state, snapshot, path).await
}

async fn serve_path(state: MountState, snapshot: String, path: String) -> Response {
    let fs = Arc::clone(&state.fs);
    let result = tokio::task::spawn_blocking(move || render(&fs, &snapshot, &path)).await;
    match result {
        Ok(Ok(resp)) => resp,
        Ok(Err(CoffreError::SnapshotNotFound(_))) | Ok(Err(CoffreError::ResourceNotFound(_))) => {
            StatusCode::NOT_FOUND.into_response()
        }
        Ok(Err(e)) => {
            tracing::error!("failed to open snapshot: {e}");
            (StatusCode::INTERNAL_SERVER_ERROR, "failed to open snapshot").into_response()
        }
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

fn render(fs: &SnapshotFs, snapshot: &str, path: &str) -> Result<Response> {
    let root = fs.lookup_snapshot(snapshot)?;
    let path = path.trim_matches('/');

    let node = if path.is_empty() {
        Node::Dir(root)
    } else {
        // Walk components so intermediate nodes land in the cache.
        let mut dir = root;
        let mut components = path.split('/').peekable();
        loop {
            let name = components.next().expect("non-empty path");
            let node = fs.lookup(&dir, name)?;
            if components.peek().is_none() {
                break node;
            }
            match node {
                Node::Dir(d) => dir = d,
                Node::File(_) => {
                    return Err(CoffreError::ResourceNotFound(path.to_string()))
                }
            }
        }
    };

    match node {
        Node::Dir(dir) => {
            let mut body = String::new();
            body.push_str("<!doctype html>\n<pre>\n");
            if !dir.path.is_empty() {
                body.push_str("<a href=\"..\">..</a>\n");
            }
            for (name, kind) in fs.read_dir(&dir)? {
                match kind {
                    ItemKind::Directory => body.push_str(&format!("<a href=\"{name}/\">{name}/</a>\n")),
                    _ => body.push_str(&format!("<a href=\"{name}\">{name}</a>\n")),
                }
            }
            body.push_str("</pre>\n");
            Ok(Html(body).into_response())
        }
        Node::File(file) => {
            if let Some(target) = &file.link_target {
                return Ok((
                    [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
                    target.clone(),
                )
                    .into_response());
            }
            let data = fs.open(&file).read_all()?;
            Ok((
                [(header::CONTENT_TYPE, "application/octet-stream")],
                data,
            )
                .into_response())
        }
    }
}
