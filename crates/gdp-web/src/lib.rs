//! HTTP trigger and search endpoints for the discovery pipeline.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use gdp_core::RunTrigger;
use gdp_sync::{DiscoveryError, DiscoveryPipeline, DiscoveryRequest, SyncConfig};
use serde::Deserialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "gdp-web";

const DEFAULT_SEARCH_LIMIT: usize = 50;
const MAX_SEARCH_LIMIT: usize = 500;

/// Bearer-secret gate for the trigger and search endpoints. Only the SHA-256
/// digest of the secret is kept.
#[derive(Clone)]
pub struct TriggerAuth {
    secret_digest: Option<[u8; 32]>,
    allow_unauthenticated: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthRejection {
    /// No secret configured and unauthenticated triggering not allowed.
    NotConfigured,
    MissingCredentials,
    InvalidCredentials,
}

impl TriggerAuth {
    pub fn new(secret: Option<&str>, allow_unauthenticated: bool) -> Self {
        Self {
            secret_digest: secret.filter(|s| !s.is_empty()).map(digest),
            allow_unauthenticated,
        }
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(
            config.trigger_secret.as_deref(),
            config.allow_unauthenticated_trigger,
        )
    }

    pub fn is_configured(&self) -> bool {
        self.secret_digest.is_some()
    }

    /// Short hex prefix of the secret digest, safe to log.
    pub fn fingerprint(&self) -> Option<String> {
        self.secret_digest.map(|d| hex::encode(&d[..4]))
    }

    pub fn check(&self, headers: &HeaderMap) -> Result<(), AuthRejection> {
        let Some(expected) = &self.secret_digest else {
            return if self.allow_unauthenticated {
                Ok(())
            } else {
                Err(AuthRejection::NotConfigured)
            };
        };

        let token = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().split_once(' '))
            .filter(|(scheme, _)| scheme.eq_ignore_ascii_case("bearer"))
            .map(|(_, token)| token.trim())
            .filter(|t| !t.is_empty())
            .ok_or(AuthRejection::MissingCredentials)?;

        let presented = digest(token);
        let diff = presented
            .iter()
            .zip(expected.iter())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b));
        if diff == 0 {
            Ok(())
        } else {
            Err(AuthRejection::InvalidCredentials)
        }
    }
}

fn digest(value: &str) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(&Sha256::digest(value.as_bytes()));
    out
}

impl IntoResponse for AuthRejection {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AuthRejection::NotConfigured => (
                StatusCode::FORBIDDEN,
                "trigger secret not configured; endpoint disabled",
            ),
            AuthRejection::MissingCredentials => (StatusCode::UNAUTHORIZED, "missing bearer token"),
            AuthRejection::InvalidCredentials => (StatusCode::UNAUTHORIZED, "invalid bearer token"),
        };
        let mut response = (status, Json(json!({ "success": false, "error": message }))).into_response();
        if status == StatusCode::UNAUTHORIZED {
            response
                .headers_mut()
                .insert(header::WWW_AUTHENTICATE, header::HeaderValue::from_static("Bearer"));
        }
        response
    }
}

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<DiscoveryPipeline>,
    pub auth: TriggerAuth,
}

impl AppState {
    pub fn new(pipeline: Arc<DiscoveryPipeline>, auth: TriggerAuth) -> Self {
        Self { pipeline, auth }
    }
}

#[derive(Debug, Default, Deserialize)]
struct DiscoverParams {
    tags: Option<String>,
    historical: Option<bool>,
    limit: Option<usize>,
}

impl DiscoverParams {
    fn request(&self, trigger: RunTrigger) -> DiscoveryRequest {
        let tags = self
            .tags
            .as_deref()
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(ToString::to_string)
            .collect();
        DiscoveryRequest::new(trigger)
            .with_tags(tags)
            .with_historical(self.historical.unwrap_or(false))
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/grants/taxonomy", get(taxonomy_handler))
        .route("/api/grants/search", get(search_handler))
        .route("/api/grants/discover", get(discover_handler).post(discover_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "grant discovery web listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}

/// Builds the pipeline from the environment, starts the cron trigger when
/// enabled, and serves until interrupted.
pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = SyncConfig::from_env();
    let port = config.web_port;
    let auth = TriggerAuth::from_config(&config);
    match (auth.fingerprint(), config.allow_unauthenticated_trigger) {
        (Some(fingerprint), _) => info!(%fingerprint, "trigger endpoints require bearer secret"),
        (None, true) => warn!("GDP_ALLOW_UNAUTHENTICATED_TRIGGER is set; trigger endpoints are open"),
        (None, false) => warn!("GDP_TRIGGER_SECRET not set; trigger endpoints will refuse requests"),
    }

    let pipeline = Arc::new(DiscoveryPipeline::from_config(config).await?);
    let scheduler = pipeline.maybe_build_scheduler().await?;
    if let Some(sched) = &scheduler {
        sched.start().await?;
    }

    serve(AppState::new(pipeline, auth), port).await
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(json!({
        "status": "ok",
        "taxonomyVersion": state.pipeline.taxonomy().version(),
        "store": state.pipeline.store().backend_name(),
    }))
    .into_response()
}

async fn taxonomy_handler(State(state): State<Arc<AppState>>) -> Response {
    let taxonomy = state.pipeline.taxonomy();
    Json(json!({
        "version": taxonomy.version(),
        "tags": taxonomy.tags(),
    }))
    .into_response()
}

async fn discover_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(params): Query<DiscoverParams>,
) -> Response {
    if let Err(rejection) = state.auth.check(&headers) {
        return rejection.into_response();
    }

    let request = params.request(RunTrigger::Http);
    match state.pipeline.run_once(&request).await {
        Ok(summary) => Json(summary).into_response(),
        Err(err) => discovery_error(err),
    }
}

async fn search_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(params): Query<DiscoverParams>,
) -> Response {
    if let Err(rejection) = state.auth.check(&headers) {
        return rejection.into_response();
    }

    let limit = params
        .limit
        .unwrap_or(DEFAULT_SEARCH_LIMIT)
        .min(MAX_SEARCH_LIMIT);
    let request = params.request(RunTrigger::Http);
    match state.pipeline.search(&request, Some(limit)).await {
        Ok(results) => Json(results).into_response(),
        Err(err) => discovery_error(err),
    }
}

/// Unknown tags are the caller's fault; anything else is logged in full and
/// reported generically.
fn discovery_error(err: DiscoveryError) -> Response {
    match err {
        DiscoveryError::UnknownTags(_) => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "success": false, "error": err.to_string() })),
        )
            .into_response(),
        DiscoveryError::Other(inner) => {
            error!(error = %format!("{inner:#}"), "discovery request failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "success": false, "error": "grant discovery failed" })),
            )
                .into_response()
        }
    }
}
