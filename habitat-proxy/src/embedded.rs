//! In-binary file trees served by `embedded` rules.

use axum::body::Body;
use axum::http::{HeaderValue, Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use std::collections::HashMap;

#[derive(Debug, Clone, Default)]
pub struct EmbeddedFs {
    files: HashMap<String, Bytes>,
}

impl EmbeddedFs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a file; `path` is relative to the tree root.
    pub fn with_file(mut self, path: &str, contents: &'static [u8]) -> Self {
        self.files
            .insert(path.trim_start_matches('/').to_string(), Bytes::from_static(contents));
        self
    }

    pub fn get(&self, path: &str) -> Option<&Bytes> {
        self.files.get(path.trim_start_matches('/'))
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Looks `path` up, falling back to `index.html` for directory paths.
    fn lookup(&self, path: &str) -> Option<(String, &Bytes)> {
        let relative = path.trim_start_matches('/');
        let candidates = if relative.is_empty() || relative.ends_with('/') {
            vec![format!("{}index.html", relative)]
        } else {
            vec![relative.to_string(), format!("{}/index.html", relative)]
        };
        candidates
            .into_iter()
            .find_map(|candidate| self.files.get(&candidate).map(|body| (candidate, body)))
    }
}

pub fn content_type(path: &str) -> &'static str {
    let extension = path.rsplit_once('.').map(|(_, ext)| ext).unwrap_or("");
    match extension.to_ascii_lowercase().as_str() {
        "html" | "htm" => "text/html; charset=utf-8",
        "css" => "text/css; charset=utf-8",
        "js" | "mjs" => "text/javascript; charset=utf-8",
        "json" | "map" => "application/json",
        "svg" => "image/svg+xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "ico" => "image/x-icon",
        "webp" => "image/webp",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        "txt" => "text/plain; charset=utf-8",
        "wasm" => "application/wasm",
        _ => "application/octet-stream",
    }
}

/// Serves `path` (already stripped of the rule matcher) from `fs`.
pub fn serve_embedded(fs: &EmbeddedFs, method: &Method, path: &str) -> Response {
    if method != Method::GET && method != Method::HEAD {
        return StatusCode::METHOD_NOT_ALLOWED.into_response();
    }

    let Some((name, contents)) = fs.lookup(path) else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let body = if method == Method::HEAD {
        Body::empty()
    } else {
        Body::from(contents.clone())
    };
    let mut response = Response::new(body);
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(content_type(&name)),
    );
    response
        .headers_mut()
        .insert(header::CONTENT_LENGTH, HeaderValue::from(contents.len()));
    response
}
