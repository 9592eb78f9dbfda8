//! Source adapter contract and the registry adapters that normalize public
//! funding APIs into [`Opportunity`] records.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use gdp_core::{GrantSource, Opportunity};
use gdp_storage::{FetchError, FetchedResponse, HttpFetcher, OutboundRequest, StatusCode};
use scraper::Html;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

mod sources;

pub use sources::federal_register::FederalRegisterAdapter;
pub use sources::fema::FemaDeclarationsAdapter;
pub use sources::grants_gov::GrantsGovAdapter;
pub use sources::nih_reporter::NihReporterAdapter;
pub use sources::nsf_awards::NsfAwardsAdapter;

pub const CRATE_NAME: &str = "gdp-adapters";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterContext {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub today: NaiveDate,
}

impl AdapterContext {
    pub fn new(run_id: Uuid, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            started_at,
            today: started_at.date_naive(),
        }
    }
}

/// Adapter-specific volume caps; upstream APIs limit query length and rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryPolicy {
    pub max_keywords: usize,
    pub max_results: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceQuery {
    pub keywords: Vec<String>,
    pub limit: usize,
}

impl SourceQuery {
    pub fn for_policy(policy: QueryPolicy, keywords: &[String]) -> Self {
        Self {
            keywords: keywords.iter().take(policy.max_keywords).cloned().collect(),
            limit: policy.max_results,
        }
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("malformed {source_id} response: {message}")]
    Malformed {
        source_id: &'static str,
        message: String,
    },
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source(&self) -> GrantSource;

    fn policy(&self) -> QueryPolicy;

    fn build_request(&self, query: &SourceQuery, ctx: &AdapterContext) -> OutboundRequest;

    async fn fetch(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        query: &SourceQuery,
    ) -> Result<FetchedResponse, AdapterError> {
        let request = self.build_request(query, ctx);
        Ok(http.send(ctx.run_id, self.source().as_str(), &request).await?)
    }

    fn parse(&self, body: &[u8], ctx: &AdapterContext) -> Result<Vec<Opportunity>, AdapterError>;
}

/// Result of running one adapter. Failures never escape as errors; they are
/// reported through `error` next to an empty record list.
#[derive(Debug, Clone)]
pub struct AdapterOutcome {
    pub source: GrantSource,
    pub opportunities: Vec<Opportunity>,
    pub error: Option<String>,
    pub raw: Option<FetchedResponse>,
    pub elapsed_ms: u64,
}

impl AdapterOutcome {
    pub fn failed(source: GrantSource, error: impl Into<String>, elapsed_ms: u64) -> Self {
        Self {
            source,
            opportunities: Vec::new(),
            error: Some(error.into()),
            raw: None,
            elapsed_ms,
        }
    }
}

pub async fn discover(
    adapter: &dyn SourceAdapter,
    http: &HttpFetcher,
    ctx: &AdapterContext,
    keywords: &[String],
) -> AdapterOutcome {
    let started = Instant::now();
    let source = adapter.source();
    let policy = adapter.policy();
    let query = SourceQuery::for_policy(policy, keywords);

    let result = match adapter.fetch(http, ctx, &query).await {
        Ok(raw) => adapter.parse(&raw.body, ctx).map(|opps| (opps, raw)),
        Err(err) => Err(err),
    };
    let elapsed_ms = started.elapsed().as_millis() as u64;

    match result {
        Ok((mut opportunities, raw)) => {
            opportunities.truncate(policy.max_results);
            debug!(
                run_id = %ctx.run_id,
                source = source.as_str(),
                count = opportunities.len(),
                elapsed_ms,
                "adapter finished"
            );
            AdapterOutcome {
                source,
                opportunities,
                error: None,
                raw: Some(raw),
                elapsed_ms,
            }
        }
        Err(err) => {
            warn!(
                run_id = %ctx.run_id,
                source = source.as_str(),
                error = %err,
                elapsed_ms,
                "adapter failed; continuing without this source"
            );
            AdapterOutcome::failed(source, format!("{}: {err}", source.as_str()), elapsed_ms)
        }
    }
}

pub fn adapter_for_source(source: GrantSource) -> Arc<dyn SourceAdapter> {
    match source {
        GrantSource::GrantsGov => Arc::new(GrantsGovAdapter::new()),
        GrantSource::NihReporter => Arc::new(NihReporterAdapter::new()),
        GrantSource::NsfAwards => Arc::new(NsfAwardsAdapter::new()),
        GrantSource::FederalRegister => Arc::new(FederalRegisterAdapter::new()),
        GrantSource::FemaDeclarations => Arc::new(FemaDeclarationsAdapter::new()),
    }
}

pub fn default_adapters() -> Vec<Arc<dyn SourceAdapter>> {
    GrantSource::ALL.into_iter().map(adapter_for_source).collect()
}

/// Serves a recorded response body through another adapter's parser. Used for
/// offline runs against `fixtures/` and in tests.
pub struct ReplayAdapter {
    inner: Arc<dyn SourceAdapter>,
    body: Vec<u8>,
}

impl ReplayAdapter {
    pub fn new(inner: Arc<dyn SourceAdapter>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            inner,
            body: body.into(),
        }
    }

    pub fn from_fixture(inner: Arc<dyn SourceAdapter>, path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let body = std::fs::read(path).with_context(|| format!("reading fixture {}", path.display()))?;
        Ok(Self::new(inner, body))
    }

    /// Replay adapters for every source that has `<dir>/<source-id>.json`.
    pub fn load_fixture_dir(dir: impl AsRef<Path>) -> anyhow::Result<Vec<Arc<dyn SourceAdapter>>> {
        let dir = dir.as_ref();
        let mut adapters: Vec<Arc<dyn SourceAdapter>> = Vec::new();
        for source in GrantSource::ALL {
            let path = dir.join(format!("{}.json", source.as_str()));
            if path.exists() {
                adapters.push(Arc::new(Self::from_fixture(adapter_for_source(source), &path)?));
            }
        }
        if adapters.is_empty() {
            anyhow::bail!("no source fixtures found in {}", dir.display());
        }
        Ok(adapters)
    }
}

#[async_trait]
impl SourceAdapter for ReplayAdapter {
    fn source(&self) -> GrantSource {
        self.inner.source()
    }

    fn policy(&self) -> QueryPolicy {
        self.inner.policy()
    }

    fn build_request(&self, query: &SourceQuery, ctx: &AdapterContext) -> OutboundRequest {
        self.inner.build_request(query, ctx)
    }

    async fn fetch(
        &self,
        _http: &HttpFetcher,
        ctx: &AdapterContext,
        query: &SourceQuery,
    ) -> Result<FetchedResponse, AdapterError> {
        let request = self.inner.build_request(query, ctx);
        Ok(FetchedResponse {
            status: StatusCode::OK,
            final_url: request.url().to_string(),
            fetched_at: ctx.started_at,
            body: self.body.clone(),
        })
    }

    fn parse(&self, body: &[u8], ctx: &AdapterContext) -> Result<Vec<Opportunity>, AdapterError> {
        self.inner.parse(body, ctx)
    }
}

pub(crate) fn parse_json<T: DeserializeOwned>(
    source: GrantSource,
    body: &[u8],
) -> Result<T, AdapterError> {
    serde_json::from_slice(body).map_err(|e| AdapterError::Malformed {
        source_id: source.as_str(),
        message: e.to_string(),
    })
}

/// Accepts the date shapes the registries emit: `MM/DD/YYYY`, `YYYY-MM-DD`,
/// and RFC 3339 timestamps.
pub(crate) fn parse_date(raw: Option<&str>) -> Option<NaiveDate> {
    let raw = raw?.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%m/%d/%Y") {
        return Some(date);
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Some(date);
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.date_naive());
    }
    raw.get(..10)
        .and_then(|prefix| NaiveDate::parse_from_str(prefix, "%Y-%m-%d").ok())
}

/// `None` for missing, non-finite, or negative amounts. Never zero-fills.
pub(crate) fn normalize_amount(value: Option<f64>) -> Option<f64> {
    value.filter(|v| v.is_finite() && *v >= 0.0)
}

/// Parses amounts reported as text, e.g. `"$1,250,000.00"`.
pub(crate) fn parse_amount_text(raw: Option<&str>) -> Option<f64> {
    let cleaned: String = raw?
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    normalize_amount(cleaned.parse::<f64>().ok())
}

/// Joins keywords into an OR query, quoting multi-word phrases.
pub(crate) fn or_query(keywords: &[String], separator: &str) -> String {
    keywords
        .iter()
        .map(|k| {
            if k.contains(char::is_whitespace) {
                format!("\"{k}\"")
            } else {
                k.clone()
            }
        })
        .collect::<Vec<_>>()
        .join(separator)
}

/// Registry identifiers arrive as strings or bare numbers.
pub(crate) fn id_string(value: Option<&serde_json::Value>) -> Option<String> {
    match value? {
        serde_json::Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Text content of a markup fragment with entities decoded and whitespace
/// collapsed. A bare `<` that does not open a tag is kept as text.
pub(crate) fn clean_text(raw: Option<&str>) -> String {
    let Some(raw) = raw else {
        return String::new();
    };
    let fragment = Html::parse_fragment(raw);
    fragment
        .root_element()
        .text()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .canonicalize()
            .expect("workspace root")
    }

    pub(crate) fn fixture_bytes(source: GrantSource) -> Vec<u8> {
        let path = workspace_root()
            .join("fixtures")
            .join(format!("{}.json", source.as_str()));
        std::fs::read(&path).unwrap_or_else(|e| panic!("reading {}: {e}", path.display()))
    }

    pub(crate) fn ctx() -> AdapterContext {
        let started_at = DateTime::parse_from_rfc3339("2026-03-01T06:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        AdapterContext::new(Uuid::nil(), started_at)
    }

    struct Broken;

    #[async_trait]
    impl SourceAdapter for Broken {
        fn source(&self) -> GrantSource {
            GrantSource::NsfAwards
        }

        fn policy(&self) -> QueryPolicy {
            QueryPolicy {
                max_keywords: 1,
                max_results: 1,
            }
        }

        fn build_request(&self, _query: &SourceQuery, _ctx: &AdapterContext) -> OutboundRequest {
            OutboundRequest::get("http://127.0.0.1:9/unused", vec![])
        }

        fn parse(&self, body: &[u8], _ctx: &AdapterContext) -> Result<Vec<Opportunity>, AdapterError> {
            parse_json::<Vec<Opportunity>>(self.source(), body)
        }
    }

    #[test]
    fn query_is_truncated_to_policy() {
        let keywords: Vec<String> = ["a", "b", "c", "d"].iter().map(|s| s.to_string()).collect();
        let query = SourceQuery::for_policy(
            QueryPolicy {
                max_keywords: 3,
                max_results: 25,
            },
            &keywords,
        );
        assert_eq!(query.keywords, vec!["a", "b", "c"]);
        assert_eq!(query.limit, 25);
    }

    #[test]
    fn dates_in_registry_formats_parse() {
        let expected = NaiveDate::from_ymd_opt(2026, 4, 15);
        assert_eq!(parse_date(Some("04/15/2026")), expected);
        assert_eq!(parse_date(Some("2026-04-15")), expected);
        assert_eq!(parse_date(Some("2026-04-15T00:00:00.000Z")), expected);
        assert_eq!(parse_date(Some("2026-04-15T00:00:00")), expected);
        assert_eq!(parse_date(Some("")), None);
        assert_eq!(parse_date(Some("soon")), None);
        assert_eq!(parse_date(None), None);
    }

    #[test]
    fn amounts_never_default_to_zero() {
        assert_eq!(parse_amount_text(Some("$1,250,000.00")), Some(1_250_000.0));
        assert_eq!(parse_amount_text(Some("")), None);
        assert_eq!(parse_amount_text(Some("n/a")), None);
        assert_eq!(parse_amount_text(None), None);
        assert_eq!(normalize_amount(Some(-5.0)), None);
        assert_eq!(normalize_amount(Some(f64::INFINITY)), None);
        assert_eq!(normalize_amount(Some(0.0)), Some(0.0));
    }

    #[test]
    fn or_query_quotes_phrases() {
        let keywords = vec!["rural".to_string(), "critical access".to_string()];
        assert_eq!(or_query(&keywords, " OR "), "rural OR \"critical access\"");
        assert_eq!(or_query(&[], " OR "), "");
    }

    #[test]
    fn ids_accept_strings_and_numbers() {
        assert_eq!(id_string(Some(&serde_json::json!(4800))), Some("4800".into()));
        assert_eq!(id_string(Some(&serde_json::json!(" 357190 "))), Some("357190".into()));
        assert_eq!(id_string(Some(&serde_json::json!(""))), None);
        assert_eq!(id_string(None), None);
    }

    #[test]
    fn clean_text_strips_markup() {
        assert_eq!(
            clean_text(Some("Rural<br/>telehealth  <b>access</b>\n program")),
            "Rural telehealth access program"
        );
        assert_eq!(clean_text(None), "");
    }

    #[test]
    fn clean_text_keeps_bare_angle_brackets() {
        assert_eq!(
            clean_text(Some("Awards of < $50,000 for rural telehealth clinics")),
            "Awards of < $50,000 for rural telehealth clinics"
        );
        assert_eq!(
            clean_text(Some("Outcomes improved (p < 0.05) in frontier clinics")),
            "Outcomes improved (p < 0.05) in frontier clinics"
        );
    }

    #[test]
    fn clean_text_decodes_entities() {
        assert_eq!(
            clean_text(Some("Rural &amp; frontier telehealth&nbsp;access")),
            "Rural & frontier telehealth access"
        );
        assert_eq!(clean_text(Some("Arts &lt;and&gt; humanities")), "Arts <and> humanities");
    }

    #[tokio::test]
    async fn replay_adapter_serves_fixture_through_inner_parser() {
        let adapter = ReplayAdapter::new(
            Arc::new(GrantsGovAdapter::new()),
            fixture_bytes(GrantSource::GrantsGov),
        );
        let http = HttpFetcher::new(Default::default()).unwrap();
        let outcome = discover(&adapter, &http, &ctx(), &["rural".to_string()]).await;
        assert!(outcome.error.is_none(), "{:?}", outcome.error);
        assert_eq!(outcome.source, GrantSource::GrantsGov);
        assert!(!outcome.opportunities.is_empty());
        assert!(outcome.raw.is_some());
    }

    #[tokio::test]
    async fn malformed_body_becomes_empty_outcome_with_reason() {
        let adapter = ReplayAdapter::new(Arc::new(Broken), b"<html>maintenance</html>".to_vec());
        let http = HttpFetcher::new(Default::default()).unwrap();
        let outcome = discover(&adapter, &http, &ctx(), &[]).await;
        assert!(outcome.opportunities.is_empty());
        let error = outcome.error.expect("error reason recorded");
        assert!(error.starts_with("nsf-awards: malformed nsf-awards response"), "{error}");
    }

    #[tokio::test]
    async fn unreachable_endpoint_becomes_empty_outcome() {
        let http = HttpFetcher::new(gdp_storage::HttpClientConfig {
            timeout: std::time::Duration::from_millis(500),
            backoff: gdp_storage::BackoffPolicy {
                max_retries: 0,
                ..Default::default()
            },
            ..Default::default()
        })
        .unwrap();
        let outcome = discover(&Broken, &http, &ctx(), &[]).await;
        assert!(outcome.opportunities.is_empty());
        assert!(outcome.error.is_some());
        assert!(outcome.raw.is_none());
    }

    #[test]
    fn fixture_dir_loads_every_recorded_source() {
        let adapters = ReplayAdapter::load_fixture_dir(workspace_root().join("fixtures")).unwrap();
        let sources: Vec<_> = adapters.iter().map(|a| a.source()).collect();
        assert_eq!(sources, GrantSource::ALL.to_vec());
    }

    #[test]
    fn default_registry_covers_every_source() {
        let adapters = default_adapters();
        assert_eq!(adapters.len(), GrantSource::ALL.len());
        for (adapter, source) in adapters.iter().zip(GrantSource::ALL) {
            assert_eq!(adapter.source(), source);
        }
    }
}
