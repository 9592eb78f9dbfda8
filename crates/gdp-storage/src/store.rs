//! Grant record persistence. Uniqueness of `opportunity_number` is enforced by
//! the store itself; an insert conflict is the "already imported" signal.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use gdp_core::{GrantSource, PersistedGrantRecord, Priority, RunSummary};
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("encoding run summary: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("decoding stored grant {opportunity_number}: {message}")]
    Decode {
        opportunity_number: String,
        message: String,
    },
}

/// What to do when a discovered opportunity already has a stored row.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImportPolicy {
    /// First import wins; later discoveries are ignored.
    #[default]
    Skip,
    /// Overwrite discovery fields; workflow `status` is left alone.
    Update,
    /// Fill empty fields, union tags, keep the higher scores.
    Merge,
}

impl ImportPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImportPolicy::Skip => "skip",
            ImportPolicy::Update => "update",
            ImportPolicy::Merge => "merge",
        }
    }
}

impl fmt::Display for ImportPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ImportPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "skip" => Ok(ImportPolicy::Skip),
            "update" => Ok(ImportPolicy::Update),
            "merge" => Ok(ImportPolicy::Merge),
            other => Err(format!("unknown import policy: {other} (expected skip|update|merge)")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    Skipped,
}

#[async_trait]
pub trait GrantStore: Send + Sync {
    fn backend_name(&self) -> &'static str;

    async fn upsert_grant(
        &self,
        record: &PersistedGrantRecord,
        policy: ImportPolicy,
    ) -> Result<UpsertOutcome, StoreError>;

    async fn get_grant(
        &self,
        opportunity_number: &str,
    ) -> Result<Option<PersistedGrantRecord>, StoreError>;

    /// Appends one run to the audit log.
    async fn record_run(&self, summary: &RunSummary) -> Result<(), StoreError>;
}

const INSERT_COLUMNS: &str = r#"
    INSERT INTO grant_opportunities (
        grant_name, opportunity_number, agency_name, description,
        amount_available, application_opens, application_deadline,
        status, priority, target_modules, match_score, win_probability,
        website_url, discovery_source
    )
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
"#;

const ON_CONFLICT_SKIP: &str = r#"
    ON CONFLICT (opportunity_number) DO NOTHING
    RETURNING TRUE AS inserted
"#;

const ON_CONFLICT_UPDATE: &str = r#"
    ON CONFLICT (opportunity_number) DO UPDATE SET
        grant_name = EXCLUDED.grant_name,
        agency_name = EXCLUDED.agency_name,
        description = EXCLUDED.description,
        amount_available = EXCLUDED.amount_available,
        application_opens = EXCLUDED.application_opens,
        application_deadline = EXCLUDED.application_deadline,
        priority = EXCLUDED.priority,
        target_modules = EXCLUDED.target_modules,
        match_score = EXCLUDED.match_score,
        win_probability = EXCLUDED.win_probability,
        website_url = EXCLUDED.website_url,
        discovery_source = EXCLUDED.discovery_source,
        updated_at = NOW()
    RETURNING (xmax = 0) AS inserted
"#;

const ON_CONFLICT_MERGE: &str = r#"
    ON CONFLICT (opportunity_number) DO UPDATE SET
        agency_name = COALESCE(NULLIF(grant_opportunities.agency_name, ''), EXCLUDED.agency_name),
        description = COALESCE(NULLIF(grant_opportunities.description, ''), EXCLUDED.description),
        amount_available = COALESCE(grant_opportunities.amount_available, EXCLUDED.amount_available),
        application_opens = COALESCE(grant_opportunities.application_opens, EXCLUDED.application_opens),
        application_deadline = COALESCE(grant_opportunities.application_deadline, EXCLUDED.application_deadline),
        website_url = COALESCE(NULLIF(grant_opportunities.website_url, ''), EXCLUDED.website_url),
        target_modules = ARRAY(
            SELECT DISTINCT unnest(grant_opportunities.target_modules || EXCLUDED.target_modules)
            ORDER BY 1
        ),
        priority = CASE
            WHEN EXCLUDED.match_score > grant_opportunities.match_score THEN EXCLUDED.priority
            ELSE grant_opportunities.priority
        END,
        match_score = GREATEST(grant_opportunities.match_score, EXCLUDED.match_score),
        win_probability = GREATEST(grant_opportunities.win_probability, EXCLUDED.win_probability),
        updated_at = NOW()
    RETURNING (xmax = 0) AS inserted
"#;

#[derive(Debug, Clone)]
pub struct PgGrantStore {
    pool: PgPool,
}

impl PgGrantStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(std::time::Duration::from_secs(5))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        info!("grant store migrations applied");
        Ok(())
    }

    fn decode_row(row: &PgRow) -> Result<PersistedGrantRecord, StoreError> {
        let opportunity_number: String = row.try_get("opportunity_number")?;
        let decode_err = |message: String| StoreError::Decode {
            opportunity_number: opportunity_number.clone(),
            message,
        };
        let priority: String = row.try_get("priority")?;
        let source: String = row.try_get("discovery_source")?;
        let match_score: i16 = row.try_get("match_score")?;
        let win_probability: i16 = row.try_get("win_probability")?;

        Ok(PersistedGrantRecord {
            grant_name: row.try_get("grant_name")?,
            opportunity_number: opportunity_number.clone(),
            agency_name: row.try_get("agency_name")?,
            description: row.try_get("description")?,
            amount_available: row.try_get("amount_available")?,
            application_opens: row.try_get("application_opens")?,
            application_deadline: row.try_get("application_deadline")?,
            status: row.try_get("status")?,
            priority: priority.parse::<Priority>().map_err(decode_err)?,
            target_modules: row.try_get("target_modules")?,
            match_score: u8::try_from(match_score).map_err(|e| decode_err(e.to_string()))?,
            win_probability: u8::try_from(win_probability).map_err(|e| decode_err(e.to_string()))?,
            website_url: row.try_get("website_url")?,
            discovery_source: source.parse::<GrantSource>().map_err(decode_err)?,
        })
    }
}

#[async_trait]
impl GrantStore for PgGrantStore {
    fn backend_name(&self) -> &'static str {
        "postgres"
    }

    async fn upsert_grant(
        &self,
        record: &PersistedGrantRecord,
        policy: ImportPolicy,
    ) -> Result<UpsertOutcome, StoreError> {
        let conflict_clause = match policy {
            ImportPolicy::Skip => ON_CONFLICT_SKIP,
            ImportPolicy::Update => ON_CONFLICT_UPDATE,
            ImportPolicy::Merge => ON_CONFLICT_MERGE,
        };
        let sql = format!("{INSERT_COLUMNS}{conflict_clause}");

        let row = sqlx::query(&sql)
            .bind(&record.grant_name)
            .bind(&record.opportunity_number)
            .bind(&record.agency_name)
            .bind(&record.description)
            .bind(record.amount_available)
            .bind(record.application_opens)
            .bind(record.application_deadline)
            .bind(&record.status)
            .bind(record.priority.as_str())
            .bind(&record.target_modules)
            .bind(i16::from(record.match_score))
            .bind(i16::from(record.win_probability))
            .bind(&record.website_url)
            .bind(record.discovery_source.as_str())
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(UpsertOutcome::Skipped);
        };
        let inserted: bool = row.try_get("inserted")?;
        Ok(if inserted {
            UpsertOutcome::Inserted
        } else {
            UpsertOutcome::Updated
        })
    }

    async fn get_grant(
        &self,
        opportunity_number: &str,
    ) -> Result<Option<PersistedGrantRecord>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT grant_name, opportunity_number, agency_name, description,
                   amount_available, application_opens, application_deadline,
                   status, priority, target_modules, match_score, win_probability,
                   website_url, discovery_source
              FROM grant_opportunities
             WHERE opportunity_number = $1
            "#,
        )
        .bind(opportunity_number)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::decode_row).transpose()
    }

    async fn record_run(&self, summary: &RunSummary) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO grant_discovery_runs (
                run_id, trigger, success, started_at, duration_ms,
                discovered, imported, updated, skipped, high_priority,
                timed_out, taxonomy_version, errors, sources
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(summary.run_id)
        .bind(summary.trigger.as_str())
        .bind(summary.success)
        .bind(summary.timestamp)
        .bind(summary.duration_ms as i64)
        .bind(summary.discovered as i64)
        .bind(summary.imported as i64)
        .bind(summary.updated as i64)
        .bind(summary.skipped as i64)
        .bind(summary.high_priority as i64)
        .bind(summary.timed_out)
        .bind(&summary.taxonomy_version)
        .bind(serde_json::to_value(&summary.errors)?)
        .bind(serde_json::to_value(&summary.sources)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Process-local store used when no database is configured, and in tests.
#[derive(Debug, Default)]
pub struct InMemoryGrantStore {
    grants: Mutex<BTreeMap<String, PersistedGrantRecord>>,
    runs: Mutex<Vec<RunSummary>>,
}

impl InMemoryGrantStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn grants(&self) -> Vec<PersistedGrantRecord> {
        self.grants.lock().await.values().cloned().collect()
    }

    pub async fn runs(&self) -> Vec<RunSummary> {
        self.runs.lock().await.clone()
    }
}

fn merge_into(existing: &mut PersistedGrantRecord, incoming: &PersistedGrantRecord) {
    fn fill_text(slot: &mut String, value: &str) {
        if slot.is_empty() {
            *slot = value.to_string();
        }
    }

    fill_text(&mut existing.agency_name, &incoming.agency_name);
    fill_text(&mut existing.description, &incoming.description);
    fill_text(&mut existing.website_url, &incoming.website_url);
    existing.amount_available = existing.amount_available.or(incoming.amount_available);
    existing.application_opens = existing.application_opens.or(incoming.application_opens);
    existing.application_deadline = existing
        .application_deadline
        .or(incoming.application_deadline);
    let tags: BTreeSet<String> = existing
        .target_modules
        .iter()
        .chain(incoming.target_modules.iter())
        .cloned()
        .collect();
    existing.target_modules = tags.into_iter().collect();
    if incoming.match_score > existing.match_score {
        existing.match_score = incoming.match_score;
        existing.priority = incoming.priority;
    }
    existing.win_probability = existing.win_probability.max(incoming.win_probability);
}

#[async_trait]
impl GrantStore for InMemoryGrantStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn upsert_grant(
        &self,
        record: &PersistedGrantRecord,
        policy: ImportPolicy,
    ) -> Result<UpsertOutcome, StoreError> {
        let mut grants = self.grants.lock().await;
        let Some(existing) = grants.get_mut(&record.opportunity_number) else {
            grants.insert(record.opportunity_number.clone(), record.clone());
            return Ok(UpsertOutcome::Inserted);
        };

        match policy {
            ImportPolicy::Skip => Ok(UpsertOutcome::Skipped),
            ImportPolicy::Update => {
                let status = std::mem::take(&mut existing.status);
                *existing = record.clone();
                existing.status = status;
                Ok(UpsertOutcome::Updated)
            }
            ImportPolicy::Merge => {
                merge_into(existing, record);
                Ok(UpsertOutcome::Updated)
            }
        }
    }

    async fn get_grant(
        &self,
        opportunity_number: &str,
    ) -> Result<Option<PersistedGrantRecord>, StoreError> {
        Ok(self.grants.lock().await.get(opportunity_number).cloned())
    }

    async fn record_run(&self, summary: &RunSummary) -> Result<(), StoreError> {
        self.runs.lock().await.push(summary.clone());
        Ok(())
    }
}
