//! Discovery run orchestration: adapter fan-out under a run deadline, scoring,
//! deduplication, import, run reports and the optional cron trigger.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use gdp_adapters::{default_adapters, discover, AdapterContext, AdapterOutcome, SourceAdapter};
use gdp_core::{
    score_opportunity, RunSummary, RunTrigger, ScoredOpportunity, SourceCount, Taxonomy,
    TaxonomyError, TaxonomyTag,
};
use gdp_storage::{
    GrantStore, HttpClientConfig, HttpFetcher, ImportPolicy, InMemoryGrantStore, PgGrantStore,
    ResponseArchive,
};
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio::time::{timeout, timeout_at, Instant};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod dedup;
pub mod import;
pub mod report;

pub use dedup::{dedup_and_rank, title_key};
pub use import::{select_for_import, ImportReport, Importer};
pub use report::{report_recent_runs_markdown, write_run_reports};

pub const CRATE_NAME: &str = "gdp-sync";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: Option<String>,
    pub scheduler_enabled: bool,
    pub discovery_cron: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub run_deadline: Duration,
    /// Bound on each summary write (store and report files) after the run.
    pub summary_flush_timeout: Duration,
    pub import_policy: ImportPolicy,
    pub min_match_score: u8,
    pub trigger_secret: Option<String>,
    pub allow_unauthenticated_trigger: bool,
    pub taxonomy_path: Option<PathBuf>,
    pub archive_dir: Option<PathBuf>,
    pub reports_dir: Option<PathBuf>,
    pub web_port: u16,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key lookup; unset or unparsable values fall
    /// back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let flag = |key: &str| {
            non_empty(key)
                .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True" | "yes"))
                .unwrap_or(false)
        };

        let import_policy = match non_empty("GDP_IMPORT_POLICY").map(|v| v.parse::<ImportPolicy>()) {
            Some(Ok(policy)) => policy,
            Some(Err(err)) => {
                warn!(error = %err, "ignoring GDP_IMPORT_POLICY");
                ImportPolicy::default()
            }
            None => ImportPolicy::default(),
        };

        Self {
            database_url: non_empty("DATABASE_URL"),
            scheduler_enabled: flag("GDP_SCHEDULER_ENABLED"),
            discovery_cron: non_empty("GDP_DISCOVERY_CRON")
                .unwrap_or_else(|| "0 0 6 * * *".to_string()),
            user_agent: non_empty("GDP_USER_AGENT")
                .unwrap_or_else(|| format!("gdp-bot/{}", env!("CARGO_PKG_VERSION"))),
            http_timeout_secs: non_empty("GDP_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(15),
            run_deadline: Duration::from_secs(
                non_empty("GDP_RUN_DEADLINE_SECS")
                    .and_then(|v| v.trim().parse().ok())
                    .unwrap_or(50),
            ),
            summary_flush_timeout: Duration::from_secs(
                non_empty("GDP_SUMMARY_FLUSH_SECS")
                    .and_then(|v| v.trim().parse().ok())
                    .unwrap_or(5),
            ),
            import_policy,
            min_match_score: non_empty("GDP_MIN_MATCH_SCORE")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(20),
            trigger_secret: non_empty("GDP_TRIGGER_SECRET"),
            allow_unauthenticated_trigger: flag("GDP_ALLOW_UNAUTHENTICATED_TRIGGER"),
            taxonomy_path: non_empty("GDP_TAXONOMY_PATH").map(PathBuf::from),
            archive_dir: non_empty("GDP_ARCHIVE_DIR").map(PathBuf::from),
            reports_dir: Some(
                non_empty("GDP_REPORTS_DIR")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("./reports")),
            ),
            web_port: non_empty("GDP_WEB_PORT")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(8000),
        }
    }

    pub fn load_taxonomy(&self) -> Result<Taxonomy> {
        match &self.taxonomy_path {
            Some(path) => Taxonomy::from_yaml_path(path)
                .with_context(|| format!("loading taxonomy override {}", path.display())),
            None => Ok(Taxonomy::builtin()),
        }
    }

    /// Postgres when `DATABASE_URL` is set (migrations applied), otherwise a
    /// process-local store.
    pub async fn connect_store(&self) -> Result<Arc<dyn GrantStore>> {
        match &self.database_url {
            Some(url) => {
                let store = PgGrantStore::connect(url)
                    .await
                    .context("connecting to grant database")?;
                store.migrate().await.context("applying migrations")?;
                Ok(Arc::new(store))
            }
            None => {
                warn!("DATABASE_URL not set; imported grants are kept in memory only");
                Ok(Arc::new(InMemoryGrantStore::new()))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryRequest {
    /// Taxonomy tags to target; empty selects every tag.
    pub tags: Vec<String>,
    pub include_historical: bool,
    pub trigger: RunTrigger,
}

impl DiscoveryRequest {
    pub fn new(trigger: RunTrigger) -> Self {
        Self {
            tags: Vec::new(),
            include_historical: false,
            trigger,
        }
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_historical(mut self, include_historical: bool) -> Self {
        self.include_historical = include_historical;
        self
    }
}

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error(transparent)]
    UnknownTags(TaxonomyError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<TaxonomyError> for DiscoveryError {
    fn from(err: TaxonomyError) -> Self {
        match err {
            TaxonomyError::UnknownTags(tags) => {
                DiscoveryError::UnknownTags(TaxonomyError::UnknownTags(tags))
            }
            other => DiscoveryError::Other(other.into()),
        }
    }
}

/// Ranked results of a search; nothing is persisted.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResults {
    pub run_id: Uuid,
    pub taxonomy_version: String,
    pub discovered: usize,
    pub timed_out: bool,
    pub errors: Vec<String>,
    pub sources: Vec<SourceCount>,
    pub results: Vec<ScoredOpportunity>,
}

/// Scored fan-out results before dedup.
struct Collected {
    scored: Vec<ScoredOpportunity>,
    sources: Vec<SourceCount>,
    errors: Vec<String>,
    timed_out: bool,
}

pub struct DiscoveryPipeline {
    config: SyncConfig,
    taxonomy: Arc<Taxonomy>,
    http: Arc<HttpFetcher>,
    adapters: Vec<Arc<dyn SourceAdapter>>,
    store: Arc<dyn GrantStore>,
    archive: Option<ResponseArchive>,
}

impl DiscoveryPipeline {
    pub fn new(config: SyncConfig, taxonomy: Arc<Taxonomy>, store: Arc<dyn GrantStore>) -> Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })?;
        let archive = config.archive_dir.clone().map(ResponseArchive::new);
        Ok(Self {
            config,
            taxonomy,
            http: Arc::new(http),
            adapters: default_adapters(),
            store,
            archive,
        })
    }

    /// Loads taxonomy and store from the config.
    pub async fn from_config(config: SyncConfig) -> Result<Self> {
        let taxonomy = Arc::new(config.load_taxonomy()?);
        let store = config.connect_store().await?;
        Self::new(config, taxonomy, store)
    }

    pub fn with_adapters(mut self, adapters: Vec<Arc<dyn SourceAdapter>>) -> Self {
        self.adapters = adapters;
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn taxonomy(&self) -> &Arc<Taxonomy> {
        &self.taxonomy
    }

    pub fn store(&self) -> &Arc<dyn GrantStore> {
        &self.store
    }

    /// Fan-out, scoring and dedup with the run's taxonomy; imports nothing.
    pub async fn search(
        &self,
        request: &DiscoveryRequest,
        limit: Option<usize>,
    ) -> Result<SearchResults, DiscoveryError> {
        let run_id = Uuid::new_v4();
        let deadline = Instant::now() + self.config.run_deadline;
        let targets = self.taxonomy.resolve_targets(&request.tags)?;
        let ctx = AdapterContext::new(run_id, Utc::now());

        let collected = self
            .collect(&ctx, &targets, request.include_historical, deadline)
            .instrument(info_span!("grant_search", %run_id))
            .await;
        let discovered = collected.scored.len();

        let mut results: Vec<ScoredOpportunity> = dedup_and_rank(collected.scored)
            .into_iter()
            .filter(|r| !r.matched_tags.is_empty())
            .collect();
        if let Some(limit) = limit {
            results.truncate(limit);
        }

        Ok(SearchResults {
            run_id,
            taxonomy_version: self.taxonomy.version().to_string(),
            discovered,
            timed_out: collected.timed_out,
            errors: collected.errors,
            sources: collected.sources,
            results,
        })
    }

    /// One full discovery run. The summary is always produced and persisted,
    /// including when the run deadline cuts the run short; only an invalid
    /// request is returned as an error.
    pub async fn run_once(&self, request: &DiscoveryRequest) -> Result<RunSummary, DiscoveryError> {
        let run_id = Uuid::new_v4();
        let started = Instant::now();
        let deadline = started + self.config.run_deadline;
        let targets = self.taxonomy.resolve_targets(&request.tags)?;
        let ctx = AdapterContext::new(run_id, Utc::now());

        let span = info_span!("discovery_run", %run_id, trigger = request.trigger.as_str());
        let summary = async {
            let mut summary = RunSummary::started(run_id, request.trigger, self.taxonomy.version());
            summary.timestamp = ctx.started_at;

            let collected = self
                .collect(&ctx, &targets, request.include_historical, deadline)
                .await;
            summary.discovered = collected.scored.len();
            summary.sources = collected.sources;
            summary.errors = collected.errors;
            summary.timed_out = collected.timed_out;

            let selected = select_for_import(
                dedup_and_rank(collected.scored),
                self.config.min_match_score,
            );
            let imported = Importer::new(self.store.as_ref(), self.config.import_policy)
                .import(run_id, &selected, deadline)
                .await;
            summary.imported = imported.inserted;
            summary.updated = imported.updated;
            summary.skipped = imported.skipped;
            summary.high_priority = imported.high_priority;
            summary.timed_out |= imported.timed_out;
            summary.errors.extend(imported.errors);

            summary.success = !summary.timed_out;
            summary.duration_ms = started.elapsed().as_millis() as u64;
            self.flush_summary(&mut summary, &selected).await;

            info!(
                discovered = summary.discovered,
                selected = selected.len(),
                imported = summary.imported,
                updated = summary.updated,
                skipped = summary.skipped,
                high_priority = summary.high_priority,
                errors = summary.errors.len(),
                timed_out = summary.timed_out,
                duration_ms = summary.duration_ms,
                "discovery run finished"
            );
            summary
        }
        .instrument(span)
        .await;
        Ok(summary)
    }

    async fn collect(
        &self,
        ctx: &AdapterContext,
        targets: &[&TaxonomyTag],
        include_historical: bool,
        deadline: Instant,
    ) -> Collected {
        let keywords = Taxonomy::query_keywords(targets);
        let mut tasks = JoinSet::new();

        for adapter in &self.adapters {
            let source = adapter.source();
            if source.is_historical() && !include_historical {
                continue;
            }
            let adapter = Arc::clone(adapter);
            let http = Arc::clone(&self.http);
            let archive = self.archive.clone();
            let ctx = ctx.clone();
            let keywords = keywords.clone();

            tasks.spawn(async move {
                let run = async {
                    let outcome = discover(adapter.as_ref(), &http, &ctx, &keywords).await;
                    if let (Some(archive), Some(raw)) = (&archive, &outcome.raw) {
                        if let Err(err) = archive.archive(raw.fetched_at, source.as_str(), &raw.body).await {
                            warn!(source = source.as_str(), error = %err, "archiving response failed");
                        }
                    }
                    outcome
                };
                match timeout_at(deadline, run).await {
                    Ok(outcome) => (outcome, false),
                    Err(_) => (
                        AdapterOutcome::failed(
                            source,
                            format!("{}: abandoned at run deadline", source.as_str()),
                            0,
                        ),
                        true,
                    ),
                }
            });
        }

        let mut outcomes = Vec::new();
        let mut task_errors = Vec::new();
        let mut timed_out = false;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((outcome, expired)) => {
                    timed_out |= expired;
                    outcomes.push(outcome);
                }
                Err(err) => {
                    error!(error = %err, "adapter task panicked");
                    task_errors.push(format!("adapter task failed: {err}"));
                }
            }
        }
        // Completion order is arbitrary; report sources in registry order.
        outcomes.sort_by_key(|o| o.source);

        let mut collected = Collected {
            scored: Vec::new(),
            sources: Vec::with_capacity(outcomes.len()),
            errors: task_errors,
            timed_out,
        };
        for outcome in outcomes {
            collected.sources.push(SourceCount {
                name: outcome.source.as_str().to_string(),
                count: outcome.opportunities.len(),
            });
            if let Some(error) = outcome.error {
                collected.errors.push(error);
            }
            collected.scored.extend(
                outcome
                    .opportunities
                    .iter()
                    .map(|opp| score_opportunity(opp, targets, ctx.today)),
            );
        }
        collected
    }

    /// Persists the summary to the store and the reports directory, each write
    /// bounded by `summary_flush_timeout`. Failures here are logged and
    /// appended to the summary; the summary itself is never dropped.
    async fn flush_summary(&self, summary: &mut RunSummary, selected: &[ScoredOpportunity]) {
        let limit = self.config.summary_flush_timeout;
        let recorded = timeout(limit, self.store.record_run(summary)).await;
        match recorded {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                error!(error = %err, backend = self.store.backend_name(), "recording run summary failed");
                summary.errors.push(format!("recording run summary: {err}"));
            }
            Err(_) => {
                error!(backend = self.store.backend_name(), timeout_ms = limit.as_millis() as u64, "recording run summary timed out");
                summary
                    .errors
                    .push(format!("recording run summary: timed out after {} ms", limit.as_millis()));
            }
        }
        if let Some(dir) = &self.config.reports_dir {
            let written = timeout(limit, write_run_reports(dir, summary, selected)).await;
            match written {
                Ok(Ok(_)) => {}
                Ok(Err(err)) => {
                    error!(error = %err, "writing run reports failed");
                    summary.errors.push(format!("writing run reports: {err:#}"));
                }
                Err(_) => {
                    error!(timeout_ms = limit.as_millis() as u64, "writing run reports timed out");
                    summary
                        .errors
                        .push(format!("writing run reports: timed out after {} ms", limit.as_millis()));
                }
            }
        }
    }

    /// Registers the cron trigger when the scheduler is enabled. The returned
    /// scheduler still has to be started by the caller.
    pub async fn maybe_build_scheduler(self: &Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let cron = self.config.discovery_cron.clone();
        let pipeline = Arc::clone(self);
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let pipeline = Arc::clone(&pipeline);
            Box::pin(async move {
                let request = DiscoveryRequest::new(RunTrigger::Scheduled).with_historical(true);
                match pipeline.run_once(&request).await {
                    Ok(summary) => info!(run_id = %summary.run_id, "scheduled discovery run complete"),
                    Err(err) => error!(error = %err, "scheduled discovery run failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        info!(cron = %cron, "discovery scheduler registered");
        Ok(Some(sched))
    }
}

pub async fn run_discovery_once_from_env(request: &DiscoveryRequest) -> Result<RunSummary> {
    let pipeline = DiscoveryPipeline::from_config(SyncConfig::from_env()).await?;
    Ok(pipeline.run_once(request).await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, NaiveDate};
    use gdp_adapters::{AdapterError, QueryPolicy, ReplayAdapter, SourceQuery};
    use gdp_core::{GrantSource, Opportunity, Priority};
    use gdp_storage::{FetchedResponse, OutboundRequest, StatusCode};

    /// Returns fixed opportunities, optionally after a delay or with a failure.
    struct StaticAdapter {
        source: GrantSource,
        opportunities: Vec<Opportunity>,
        delay: Option<Duration>,
        fail: bool,
    }

    impl StaticAdapter {
        fn new(source: GrantSource, opportunities: Vec<Opportunity>) -> Self {
            Self {
                source,
                opportunities,
                delay: None,
                fail: false,
            }
        }
    }

    #[async_trait]
    impl SourceAdapter for StaticAdapter {
        fn source(&self) -> GrantSource {
            self.source
        }

        fn policy(&self) -> QueryPolicy {
            QueryPolicy {
                max_keywords: 10,
                max_results: 100,
            }
        }

        fn build_request(&self, _query: &SourceQuery, _ctx: &AdapterContext) -> OutboundRequest {
            OutboundRequest::get("http://static.invalid/", vec![])
        }

        async fn fetch(
            &self,
            _http: &HttpFetcher,
            ctx: &AdapterContext,
            _query: &SourceQuery,
        ) -> Result<FetchedResponse, AdapterError> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail {
                return Err(AdapterError::Malformed {
                    source_id: self.source.as_str(),
                    message: "upstream maintenance page".into(),
                });
            }
            Ok(FetchedResponse {
                status: StatusCode::OK,
                final_url: "http://static.invalid/".into(),
                fetched_at: ctx.started_at,
                body: serde_json::to_vec(&self.opportunities).map_err(anyhow::Error::from)?,
            })
        }

        fn parse(&self, body: &[u8], _ctx: &AdapterContext) -> Result<Vec<Opportunity>, AdapterError> {
            serde_json::from_slice(body).map_err(|e| AdapterError::Malformed {
                source_id: self.source.as_str(),
                message: e.to_string(),
            })
        }
    }

    fn opportunity(source: GrantSource, id: &str, title: &str, description: &str) -> Opportunity {
        Opportunity {
            source,
            external_id: id.to_string(),
            title: title.to_string(),
            agency_name: "Health Resources and Services Administration".into(),
            description: description.to_string(),
            amount_ceiling: Some(250_000.0),
            open_date: None,
            close_date: Some(Utc::now().date_naive() + ChronoDuration::days(90)),
            url: format!("https://example.test/{id}"),
        }
    }

    fn telehealth(source: GrantSource, id: &str) -> Opportunity {
        opportunity(
            source,
            id,
            "Rural Telehealth Access Grant",
            "Expands telehealth services for rural clinics.",
        )
    }

    fn test_config(reports_dir: Option<PathBuf>) -> SyncConfig {
        SyncConfig {
            reports_dir,
            run_deadline: Duration::from_secs(10),
            ..SyncConfig::default()
        }
    }

    fn pipeline(
        config: SyncConfig,
        adapters: Vec<Arc<dyn SourceAdapter>>,
    ) -> (DiscoveryPipeline, Arc<InMemoryGrantStore>) {
        let store = Arc::new(InMemoryGrantStore::new());
        let pipeline = DiscoveryPipeline::new(config, Arc::new(Taxonomy::builtin()), store.clone())
            .unwrap()
            .with_adapters(adapters);
        (pipeline, store)
    }

    fn cli_request() -> DiscoveryRequest {
        DiscoveryRequest::new(RunTrigger::Cli).with_historical(true)
    }

    #[test]
    fn config_reads_overrides_and_defaults() {
        let vars: HashMap<&str, &str> = [
            ("GDP_RUN_DEADLINE_SECS", "20"),
            ("GDP_IMPORT_POLICY", "merge"),
            ("GDP_MIN_MATCH_SCORE", "35"),
            ("GDP_ALLOW_UNAUTHENTICATED_TRIGGER", "true"),
            ("GDP_TRIGGER_SECRET", "  "),
        ]
        .into_iter()
        .collect();
        let config = SyncConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(config.run_deadline, Duration::from_secs(20));
        assert_eq!(config.import_policy, ImportPolicy::Merge);
        assert_eq!(config.min_match_score, 35);
        assert!(config.allow_unauthenticated_trigger);
        assert_eq!(config.trigger_secret, None, "blank secret counts as unset");
        assert_eq!(config.http_timeout_secs, 15);
        assert_eq!(config.discovery_cron, "0 0 6 * * *");
        assert_eq!(config.web_port, 8000);
        assert_eq!(config.summary_flush_timeout, Duration::from_secs(5));
        assert!(config.database_url.is_none());
    }

    #[test]
    fn invalid_import_policy_falls_back_to_skip() {
        let config = SyncConfig::from_lookup(|k| (k == "GDP_IMPORT_POLICY").then(|| "replace".to_string()));
        assert_eq!(config.import_policy, ImportPolicy::Skip);
    }

    #[tokio::test]
    async fn rural_telehealth_record_is_imported_with_rural_health_tag() {
        let dir = tempfile::tempdir().unwrap();
        let adapters: Vec<Arc<dyn SourceAdapter>> = vec![Arc::new(StaticAdapter::new(
            GrantSource::GrantsGov,
            vec![telehealth(GrantSource::GrantsGov, "HRSA-26-001")],
        ))];
        let (pipeline, store) = pipeline(test_config(Some(dir.path().to_path_buf())), adapters);

        let summary = pipeline.run_once(&cli_request()).await.unwrap();
        assert!(summary.success);
        assert!(!summary.timed_out);
        assert_eq!(summary.discovered, 1);
        assert_eq!(summary.imported, 1);
        assert!(summary.errors.is_empty(), "{:?}", summary.errors);

        let grants = store.grants().await;
        assert_eq!(grants.len(), 1);
        let grant = &grants[0];
        assert_eq!(grant.opportunity_number, "HRSA-26-001");
        assert_eq!(grant.target_modules, vec!["rural-health"]);
        assert!(grant.match_score >= 20);
        assert_eq!(grant.priority, Priority::from_score(grant.match_score));
        assert_eq!(grant.status, "researching");

        assert_eq!(store.runs().await, vec![summary.clone()]);
        let run_dir = dir.path().join(summary.run_id.to_string());
        assert!(run_dir.join(report::SUMMARY_FILE).is_file());
        assert!(run_dir.join(report::BRIEF_FILE).is_file());
    }

    #[tokio::test]
    async fn same_title_from_two_sources_imports_once() {
        let adapters: Vec<Arc<dyn SourceAdapter>> = vec![
            Arc::new(StaticAdapter::new(
                GrantSource::FederalRegister,
                vec![telehealth(GrantSource::FederalRegister, "FR-2026-1")],
            )),
            Arc::new(StaticAdapter::new(
                GrantSource::GrantsGov,
                vec![telehealth(GrantSource::GrantsGov, "HRSA-26-001")],
            )),
        ];
        let (pipeline, store) = pipeline(test_config(None), adapters);

        let summary = pipeline.run_once(&cli_request()).await.unwrap();
        assert_eq!(summary.discovered, 2);
        assert_eq!(summary.imported, 1);
        let grants = store.grants().await;
        assert_eq!(grants.len(), 1);
        assert_eq!(grants[0].discovery_source, GrantSource::GrantsGov);
        assert_eq!(
            summary.sources,
            vec![
                SourceCount { name: "grants-gov".into(), count: 1 },
                SourceCount { name: "federal-register".into(), count: 1 },
            ]
        );
    }

    #[tokio::test]
    async fn repeated_runs_do_not_duplicate_rows() {
        let adapters: Vec<Arc<dyn SourceAdapter>> = vec![Arc::new(StaticAdapter::new(
            GrantSource::GrantsGov,
            vec![telehealth(GrantSource::GrantsGov, "HRSA-26-001")],
        ))];
        let (pipeline, store) = pipeline(test_config(None), adapters);

        let first = pipeline.run_once(&cli_request()).await.unwrap();
        let second = pipeline.run_once(&cli_request()).await.unwrap();
        assert_eq!((first.imported, first.skipped), (1, 0));
        assert_eq!((second.imported, second.skipped), (0, 1));
        assert_eq!(store.grants().await.len(), 1);
        assert_eq!(store.runs().await.len(), 2);
    }

    #[tokio::test]
    async fn failing_adapter_does_not_abort_run() {
        let mut broken = StaticAdapter::new(GrantSource::NsfAwards, vec![]);
        broken.fail = true;
        let adapters: Vec<Arc<dyn SourceAdapter>> = vec![
            Arc::new(broken),
            Arc::new(StaticAdapter::new(
                GrantSource::GrantsGov,
                vec![telehealth(GrantSource::GrantsGov, "HRSA-26-001")],
            )),
        ];
        let (pipeline, _store) = pipeline(test_config(None), adapters);

        let summary = pipeline.run_once(&cli_request()).await.unwrap();
        assert!(summary.success);
        assert_eq!(summary.imported, 1);
        assert_eq!(summary.errors.len(), 1);
        assert!(summary.errors[0].starts_with("nsf-awards:"), "{:?}", summary.errors);
    }

    #[tokio::test]
    async fn historical_sources_are_skipped_unless_requested() {
        let adapters: Vec<Arc<dyn SourceAdapter>> = vec![
            Arc::new(StaticAdapter::new(
                GrantSource::NihReporter,
                vec![telehealth(GrantSource::NihReporter, "5R01-1")],
            )),
            Arc::new(StaticAdapter::new(GrantSource::GrantsGov, vec![])),
        ];
        let (pipeline, _store) = pipeline(test_config(None), adapters);

        let current = pipeline
            .run_once(&DiscoveryRequest::new(RunTrigger::Http))
            .await
            .unwrap();
        assert_eq!(current.discovered, 0);
        assert_eq!(current.sources.len(), 1);

        let with_history = pipeline.run_once(&cli_request()).await.unwrap();
        assert_eq!(with_history.discovered, 1);
    }

    #[tokio::test]
    async fn deadline_flushes_partial_summary() {
        let dir = tempfile::tempdir().unwrap();
        let mut slow = StaticAdapter::new(
            GrantSource::FederalRegister,
            vec![telehealth(GrantSource::FederalRegister, "FR-1")],
        );
        slow.delay = Some(Duration::from_secs(5));
        let adapters: Vec<Arc<dyn SourceAdapter>> = vec![
            Arc::new(slow),
            Arc::new(StaticAdapter::new(
                GrantSource::GrantsGov,
                vec![opportunity(
                    GrantSource::GrantsGov,
                    "ED-1",
                    "School Literacy Grants",
                    "Student literacy curriculum for every school.",
                )],
            )),
        ];
        let config = SyncConfig {
            run_deadline: Duration::from_millis(300),
            ..test_config(Some(dir.path().to_path_buf()))
        };
        let (pipeline, store) = pipeline(config, adapters);

        let summary = pipeline.run_once(&cli_request()).await.unwrap();
        assert!(summary.timed_out);
        assert!(!summary.success);
        assert!(summary
            .errors
            .iter()
            .any(|e| e == "federal-register: abandoned at run deadline"));
        assert!(summary.duration_ms < 5_000);
        assert_eq!(store.runs().await.len(), 1, "partial summary persisted");
        assert!(dir
            .path()
            .join(summary.run_id.to_string())
            .join(report::SUMMARY_FILE)
            .is_file());
    }

    /// Store whose run log never answers.
    struct HungRunLog {
        inner: InMemoryGrantStore,
    }

    #[async_trait]
    impl GrantStore for HungRunLog {
        fn backend_name(&self) -> &'static str {
            "hung"
        }

        async fn upsert_grant(
            &self,
            record: &gdp_core::PersistedGrantRecord,
            policy: ImportPolicy,
        ) -> Result<gdp_storage::UpsertOutcome, gdp_storage::StoreError> {
            self.inner.upsert_grant(record, policy).await
        }

        async fn get_grant(
            &self,
            number: &str,
        ) -> Result<Option<gdp_core::PersistedGrantRecord>, gdp_storage::StoreError> {
            self.inner.get_grant(number).await
        }

        async fn record_run(&self, _summary: &RunSummary) -> Result<(), gdp_storage::StoreError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn hung_run_log_does_not_hold_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let config = SyncConfig {
            summary_flush_timeout: Duration::from_millis(200),
            ..test_config(Some(dir.path().to_path_buf()))
        };
        let store = Arc::new(HungRunLog {
            inner: InMemoryGrantStore::new(),
        });
        let pipeline = DiscoveryPipeline::new(config, Arc::new(Taxonomy::builtin()), store.clone())
            .unwrap()
            .with_adapters(vec![Arc::new(StaticAdapter::new(
                GrantSource::GrantsGov,
                vec![telehealth(GrantSource::GrantsGov, "HRSA-26-001")],
            ))]);

        let started = std::time::Instant::now();
        let summary = pipeline.run_once(&cli_request()).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(summary.imported, 1);
        assert!(
            summary
                .errors
                .iter()
                .any(|e| e == "recording run summary: timed out after 200 ms"),
            "{:?}",
            summary.errors
        );
        assert!(dir
            .path()
            .join(summary.run_id.to_string())
            .join(report::SUMMARY_FILE)
            .is_file());
        assert!(store.inner.get_grant("HRSA-26-001").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn unknown_tags_are_rejected_before_any_fetch() {
        let (pipeline, store) = pipeline(test_config(None), vec![]);
        let request = cli_request().with_tags(vec!["rural-health".into(), "space-travel".into()]);
        let err = pipeline.run_once(&request).await.unwrap_err();
        assert!(matches!(err, DiscoveryError::UnknownTags(_)));
        assert!(err.to_string().contains("space-travel"));
        assert!(store.runs().await.is_empty());
    }

    #[tokio::test]
    async fn search_ranks_without_persisting() {
        let adapters: Vec<Arc<dyn SourceAdapter>> = vec![Arc::new(StaticAdapter::new(
            GrantSource::GrantsGov,
            vec![
                telehealth(GrantSource::GrantsGov, "HRSA-26-001"),
                opportunity(GrantSource::GrantsGov, "X-1", "Parking Lot Resurfacing", ""),
            ],
        ))];
        let (pipeline, store) = pipeline(test_config(None), adapters);

        let results = pipeline.search(&cli_request(), Some(10)).await.unwrap();
        assert_eq!(results.discovered, 2);
        assert_eq!(results.results.len(), 1);
        assert_eq!(results.results[0].matched_tags, vec!["rural-health"]);
        assert!(store.grants().await.is_empty());
        assert!(store.runs().await.is_empty());
    }

    #[tokio::test]
    async fn replayed_fixtures_run_end_to_end() {
        let fixtures = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures");
        let adapters = ReplayAdapter::load_fixture_dir(&fixtures).unwrap();
        let (pipeline, store) = pipeline(test_config(None), adapters);

        let summary = pipeline.run_once(&cli_request()).await.unwrap();
        assert!(summary.errors.is_empty(), "{:?}", summary.errors);
        assert_eq!(summary.sources.len(), GrantSource::ALL.len());
        assert!(summary.discovered > 0);
        assert_eq!(store.grants().await.len(), summary.imported);
        let telehealth = store.get_grant("HRSA-26-045").await.unwrap().unwrap();
        assert!(telehealth.target_modules.contains(&"rural-health".to_string()));
    }

    #[test]
    fn scoring_date_comes_from_run_context() {
        let started_at = chrono::DateTime::parse_from_rfc3339("2026-03-01T23:59:59Z")
            .unwrap()
            .with_timezone(&Utc);
        let ctx = AdapterContext::new(Uuid::nil(), started_at);
        assert_eq!(ctx.today, NaiveDate::from_ymd_opt(2026, 3, 1).unwrap());
    }
}
