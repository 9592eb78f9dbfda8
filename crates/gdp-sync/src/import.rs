//! Selection and upsert of ranked opportunities into the grant store.

use gdp_core::{PersistedGrantRecord, ScoredOpportunity};
use gdp_storage::{GrantStore, ImportPolicy, UpsertOutcome};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

/// Records worth importing: at least one matched tag and a score at or above
/// the configured floor.
pub fn select_for_import(ranked: Vec<ScoredOpportunity>, min_match_score: u8) -> Vec<ScoredOpportunity> {
    ranked
        .into_iter()
        .filter(|r| !r.matched_tags.is_empty() && r.match_score >= min_match_score)
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportReport {
    pub inserted: usize,
    pub updated: usize,
    pub skipped: usize,
    pub high_priority: usize,
    /// Records never attempted because the run deadline passed.
    pub not_attempted: usize,
    pub timed_out: bool,
    pub errors: Vec<String>,
}

pub struct Importer<'a> {
    store: &'a dyn GrantStore,
    policy: ImportPolicy,
}

impl<'a> Importer<'a> {
    pub fn new(store: &'a dyn GrantStore, policy: ImportPolicy) -> Self {
        Self { store, policy }
    }

    /// Upserts each record in order. A failed upsert is recorded and the loop
    /// moves on; nothing is retried or rolled back. Stops at `deadline`.
    pub async fn import(
        &self,
        run_id: Uuid,
        records: &[ScoredOpportunity],
        deadline: Instant,
    ) -> ImportReport {
        let mut report = ImportReport::default();

        for (index, scored) in records.iter().enumerate() {
            let record = PersistedGrantRecord::from_scored(scored);
            let number = record.opportunity_number.as_str();

            if Instant::now() >= deadline {
                report.timed_out = true;
                report.not_attempted = records.len() - index;
                break;
            }

            match timeout_at(deadline, self.store.upsert_grant(&record, self.policy)).await {
                Ok(Ok(UpsertOutcome::Inserted)) => {
                    report.inserted += 1;
                    if record.priority.is_high_priority() {
                        report.high_priority += 1;
                    }
                    debug!(%run_id, opportunity_number = number, priority = %record.priority, "grant imported");
                }
                Ok(Ok(UpsertOutcome::Updated)) => report.updated += 1,
                Ok(Ok(UpsertOutcome::Skipped)) => report.skipped += 1,
                Ok(Err(err)) => {
                    warn!(%run_id, opportunity_number = number, error = %err, "grant upsert failed");
                    report.errors.push(format!("import {number}: {err}"));
                }
                Err(_) => {
                    report.timed_out = true;
                    report.not_attempted = records.len() - index;
                    break;
                }
            }
        }

        if report.timed_out {
            warn!(
                %run_id,
                not_attempted = report.not_attempted,
                "run deadline reached during import"
            );
            report.errors.push(format!(
                "run deadline reached during import; {} records not imported",
                report.not_attempted
            ));
        }
        report
    }
}
