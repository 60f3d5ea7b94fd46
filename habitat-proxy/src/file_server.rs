//! Serves `file` rules from a directory on the host.

use axum::body::Body;
use axum::extract::Request;
use axum::http::{HeaderValue, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use std::path::Path;
use tower::ServiceExt;
use tower_http::services::ServeDir;

/// Serves `path` (the request path with the rule matcher removed) from
/// `root`. Directory redirects issued by the file service are rewritten to
/// keep `matcher` in front.
pub async fn serve_dir(root: &Path, matcher: &str, path: &str, mut request: Request) -> Response {
    match tokio::fs::try_exists(root).await {
        Ok(true) => {}
        Ok(false) | Err(_) => {
            tracing::warn!("File server root {} does not exist", root.display());
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("path {} not found on host system", root.display()),
            )
                .into_response();
        }
    }

    let uri = match request.uri().query() {
        Some(query) => format!("{}?{}", path, query),
        None => path.to_string(),
    };
    match uri.parse::<Uri>() {
        Ok(uri) => *request.uri_mut() = uri,
        Err(_) => return StatusCode::BAD_REQUEST.into_response(),
    }

    let mut response = match ServeDir::new(root).oneshot(request).await {
        Ok(response) => response.map(Body::new),
        Err(never) => match never {},
    };

    let prefix = matcher.trim_end_matches('/');
    if !prefix.is_empty() {
        let rewritten = response
            .headers()
            .get(header::LOCATION)
            .and_then(|location| location.to_str().ok())
            .filter(|location| location.starts_with('/'))
            .and_then(|location| HeaderValue::from_str(&format!("{}{}", prefix, location)).ok());
        if let Some(location) = rewritten {
            response.headers_mut().insert(header::LOCATION, location);
        }
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Method;

    fn get(uri: &str) -> Request {
        Request::builder()
            .method(Method::GET)
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_serves_files_under_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.html"), "hello").unwrap();
        std::fs::create_dir(dir.path().join("docs")).unwrap();
        std::fs::write(dir.path().join("docs/index.html"), "docs").unwrap();

        let response = serve_dir(dir.path(), "/app", "/index.html", get("/app/index.html")).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"hello");

        let response = serve_dir(dir.path(), "/app", "/missing.txt", get("/app/missing.txt")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = serve_dir(dir.path(), "/app", "/docs", get("/app/docs")).await;
        assert!(response.status().is_redirection());
        assert_eq!(response.headers()[header::LOCATION], "/app/docs/");
    }

    #[tokio::test]
    async fn test_missing_root_is_server_error() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("absent");

        let response = serve_dir(&root, "/", "/index.html", get("/index.html")).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
