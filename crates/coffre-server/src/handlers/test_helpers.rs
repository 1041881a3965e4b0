use axum::body::Body;
use axum::http::Request;
use axum::response::Response;
use axum::Router;
use tower::ServiceExt;

use coffre_core::storage::mock_backend::MockStore;
use coffre_core::storage::Store;

use crate::state::AppState;

/// Router over a fresh mock-backed repository. Returns the wrapped
/// configuration bytes for assertions against `GET /`.
pub(crate) fn setup_app(name: &str, no_delete: bool) -> (Router, Vec<u8>) {
    MockStore::reset(name);
    let store = MockStore::shared(name);
    let config =
        coffre_core::repo::Configuration::new(None).wrap().unwrap();
    store.create(&config).unwrap();

    let state = AppState::new(Box::new(store), no_delete);
    (super::router(state), config)
}

pub(crate) async fn do_get(router: Router, path: &str) -> Response {
    let req = Request::builder()
        .method("GET")
        .uri(path)
        .body(Body::empty())
        .unwrap();
    router.oneshot(req).await.unwrap()
}

pub(crate) async fn do_get_range(router: Router, path: &str, range: &str) -> Response {
    let req = Request::builder()
        .method("GET")
        .uri(path)
        .header("Range", range)
        .body(Body::empty())
        .unwrap();
    router.oneshot(req).await.unwrap()
}

pub(crate) async fn do_put(router: Router, path: &str, body: Vec<u8>) -> Response {
    let req = Request::builder()
        .method("PUT")
        .uri(path)
        .body(Body::from(body))
        .unwrap();
    router.oneshot(req).await.unwrap()
}

pub(crate) async fn do_delete(router: Router, path: &str) -> Response {
    let req = Request::builder()
        .method("DELETE")
        .uri(path)
        .body(Body::empty())
        .unwrap();
    router.oneshot(req).await.unwrap()
}

pub(crate) async fn body_bytes(resp: Response) -> Vec<u8> {
    axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap()
        .to_vec()
}

pub(crate) async fn body_string(resp: Response) -> String {
    String::from_utf8(body_bytes(resp).await).unwrap()
}
