//! Forwards `redirect` rules to an upstream HTTP server.

use axum::body::Body;
use axum::extract::Request;
use axum::http::{HeaderMap, HeaderName, StatusCode, header};
use axum::response::{IntoResponse, Response};
use reqwest::Url;
use std::time::Duration;

pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Largest request body buffered before forwarding.
pub const MAX_FORWARD_BODY: usize = 64 * 1024 * 1024;

const HOP_BY_HOP: [HeaderName; 6] = [
    header::CONNECTION,
    header::HOST,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
];

/// Client used for every forwarded request. Upstream redirects are handed
/// back to the caller untouched.
pub fn forward_client() -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(DIAL_TIMEOUT)
        .redirect(reqwest::redirect::Policy::none())
        .build()
}

/// Joins the target's own path with the stripped request path.
pub fn upstream_url(target: &Url, path: &str, query: Option<&str>) -> Url {
    let mut url = target.clone();
    let base = target.path().trim_end_matches('/');
    url.set_path(&format!("{}{}", base, path));
    url.set_query(query);
    url
}

fn copy_headers(source: &HeaderMap) -> HeaderMap {
    let mut headers = source.clone();
    for name in HOP_BY_HOP.iter() {
        headers.remove(name);
    }
    headers
}

pub async fn forward(
    client: &reqwest::Client,
    target: &Url,
    path: &str,
    request: Request,
) -> Response {
    let url = upstream_url(target, path, request.uri().query());
    let (parts, body) = request.into_parts();

    let body = match axum::body::to_bytes(body, MAX_FORWARD_BODY).await {
        Ok(body) => body,
        Err(e) => {
            tracing::warn!("Failed to read request body for {}: {}", url, e);
            return StatusCode::PAYLOAD_TOO_LARGE.into_response();
        }
    };

    let upstream = client
        .request(parts.method, url.clone())
        .headers(copy_headers(&parts.headers))
        .body(body)
        .send()
        .await;

    let upstream = match upstream {
        Ok(response) => response,
        Err(e) => {
            tracing::error!("Reverse proxy forwarding to {} failed: {}", url, e);
            return (StatusCode::BAD_GATEWAY, e.to_string()).into_response();
        }
    };

    let status =
        StatusCode::from_u16(upstream.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let headers = copy_headers(upstream.headers());
    let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}
