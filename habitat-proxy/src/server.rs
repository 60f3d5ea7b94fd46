use crate::embedded::serve_embedded;
use crate::file_server::serve_dir;
use crate::redirect::{forward, forward_client};
use crate::rules::{Rule, RuleSet, strip_matcher};
use axum::Router;
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use habitat_core::{HabitatError, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

pub struct ProxyState {
    pub rules: Arc<RuleSet>,
    pub client: reqwest::Client,
}

#[derive(Clone)]
pub struct ProxyServer {
    state: Arc<ProxyState>,
}

impl ProxyServer {
    pub fn new(rules: Arc<RuleSet>) -> Result<Self> {
        let client = forward_client().map_err(|e| HabitatError::Http(e.to_string()))?;
        Ok(Self {
            state: Arc::new(ProxyState { rules, client }),
        })
    }

    pub fn rules(&self) -> Arc<RuleSet> {
        self.state.rules.clone()
    }

    pub fn router(&self) -> Router {
        Router::new()
            .fallback(proxy_handler)
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Serves until `shutdown` resolves.
    pub async fn serve<F>(&self, addr: SocketAddr, shutdown: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!("Reverse proxy listening on {}", listener.local_addr()?);
        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await?;
        Ok(())
    }
}

async fn proxy_handler(State(state): State<Arc<ProxyState>>, request: Request) -> Response {
    let path = request.uri().path().to_string();
    let Some(entry) = state.rules.find(&path).await else {
        tracing::debug!("No proxy rule matches {}", path);
        return StatusCode::NOT_FOUND.into_response();
    };

    let stripped = strip_matcher(&path, entry.rule.matcher());
    match entry.rule.as_ref() {
        Rule::Redirect { target, .. } => forward(&state.client, target, &stripped, request).await,
        Rule::FileServer { matcher, path: root } => {
            serve_dir(root, matcher, &stripped, request).await
        }
        Rule::Embedded { fs, .. } => serve_embedded(fs, request.method(), &stripped),
    }
}
