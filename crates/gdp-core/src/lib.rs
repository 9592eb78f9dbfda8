//! Core domain model for the grant discovery pipeline: sources, opportunities,
//! scored results, persisted grant rows and run summaries.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod scoring;
pub mod taxonomy;

pub use scoring::{amount_bonus, score_opportunity, win_probability, KeywordMatch};
pub use taxonomy::{Taxonomy, TaxonomyError, TaxonomyTag};

pub const CRATE_NAME: &str = "gdp-core";

/// Maximum number of characters of an opportunity description kept in storage.
pub const MAX_DESCRIPTION_CHARS: usize = 5000;

/// Workflow status assigned to every freshly imported grant.
pub const INITIAL_STATUS: &str = "researching";

/// Identity of the external registry an opportunity was discovered in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GrantSource {
    GrantsGov,
    NihReporter,
    NsfAwards,
    FederalRegister,
    FemaDeclarations,
}

impl GrantSource {
    pub const ALL: [GrantSource; 5] = [
        GrantSource::GrantsGov,
        GrantSource::NihReporter,
        GrantSource::NsfAwards,
        GrantSource::FederalRegister,
        GrantSource::FemaDeclarations,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            GrantSource::GrantsGov => "grants-gov",
            GrantSource::NihReporter => "nih-reporter",
            GrantSource::NsfAwards => "nsf-awards",
            GrantSource::FederalRegister => "federal-register",
            GrantSource::FemaDeclarations => "fema-declarations",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            GrantSource::GrantsGov => "Grants.gov",
            GrantSource::NihReporter => "NIH RePORTER",
            GrantSource::NsfAwards => "NSF Awards",
            GrantSource::FederalRegister => "Federal Register",
            GrantSource::FemaDeclarations => "OpenFEMA Disaster Declarations",
        }
    }

    /// Tie-break rank used when two sources report the same opportunity.
    /// Lower wins.
    pub fn dedup_priority(&self) -> u8 {
        match self {
            GrantSource::GrantsGov => 0,
            GrantSource::FederalRegister => 1,
            GrantSource::NihReporter => 2,
            GrantSource::NsfAwards => 3,
            GrantSource::FemaDeclarations => 4,
        }
    }

    /// Backward-looking sources report past awards or declarations rather than
    /// open solicitations; they only run when a caller asks for history.
    pub fn is_historical(&self) -> bool {
        matches!(
            self,
            GrantSource::NihReporter | GrantSource::NsfAwards | GrantSource::FemaDeclarations
        )
    }

    pub fn is_primary_registry(&self) -> bool {
        matches!(self, GrantSource::GrantsGov)
    }
}

impl fmt::Display for GrantSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GrantSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        GrantSource::ALL
            .into_iter()
            .find(|source| source.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown grant source: {s}"))
    }
}

/// Normalized handoff record produced by a source adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Opportunity {
    pub source: GrantSource,
    pub external_id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub agency_name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub amount_ceiling: Option<f64>,
    #[serde(default)]
    pub open_date: Option<NaiveDate>,
    #[serde(default)]
    pub close_date: Option<NaiveDate>,
    #[serde(default)]
    pub url: String,
}

/// Opportunity plus its taxonomy match results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoredOpportunity {
    #[serde(flatten)]
    pub opportunity: Opportunity,
    pub match_score: u8,
    /// Heuristic estimate only; not a calibrated or validated probability.
    pub win_probability: u8,
    pub matched_tags: Vec<String>,
}

impl ScoredOpportunity {
    pub fn priority(&self) -> Priority {
        Priority::from_score(self.match_score)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

impl Priority {
    pub fn from_score(match_score: u8) -> Self {
        match match_score {
            80.. => Priority::Critical,
            60..=79 => Priority::High,
            40..=59 => Priority::Medium,
            _ => Priority::Low,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
            Priority::Critical => "critical",
        }
    }

    pub fn is_high_priority(&self) -> bool {
        matches!(self, Priority::High | Priority::Critical)
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "medium" => Ok(Priority::Medium),
            "high" => Ok(Priority::High),
            "critical" => Ok(Priority::Critical),
            other => Err(format!("unknown priority: {other}")),
        }
    }
}

/// Durable grant row, keyed by `opportunity_number`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedGrantRecord {
    pub grant_name: String,
    pub opportunity_number: String,
    pub agency_name: String,
    pub description: String,
    pub amount_available: Option<f64>,
    pub application_opens: Option<NaiveDate>,
    pub application_deadline: Option<NaiveDate>,
    pub status: String,
    pub priority: Priority,
    pub target_modules: Vec<String>,
    pub match_score: u8,
    pub win_probability: u8,
    pub website_url: String,
    pub discovery_source: GrantSource,
}

impl PersistedGrantRecord {
    pub fn from_scored(scored: &ScoredOpportunity) -> Self {
        let opp = &scored.opportunity;
        Self {
            grant_name: opp.title.trim().to_string(),
            opportunity_number: opp.external_id.clone(),
            agency_name: opp.agency_name.clone(),
            description: truncate_chars(&opp.description, MAX_DESCRIPTION_CHARS),
            amount_available: opp.amount_ceiling,
            application_opens: opp.open_date,
            application_deadline: opp.close_date,
            status: INITIAL_STATUS.to_string(),
            priority: scored.priority(),
            target_modules: scored.matched_tags.clone(),
            match_score: scored.match_score,
            win_probability: scored.win_probability,
            website_url: opp.url.clone(),
            discovery_source: opp.source,
        }
    }
}

pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => text[..byte_idx].to_string(),
        None => text.to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunTrigger {
    Http,
    Scheduled,
    Cli,
}

impl RunTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunTrigger::Http => "http",
            RunTrigger::Scheduled => "scheduled",
            RunTrigger::Cli => "cli",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceCount {
    pub name: String,
    pub count: usize,
}

/// Per-invocation audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub run_id: Uuid,
    pub trigger: RunTrigger,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
    pub duration_ms: u64,
    pub discovered: usize,
    pub imported: usize,
    pub updated: usize,
    pub skipped: usize,
    pub high_priority: usize,
    pub timed_out: bool,
    pub taxonomy_version: String,
    pub errors: Vec<String>,
    pub sources: Vec<SourceCount>,
}

impl RunSummary {
    pub fn started(run_id: Uuid, trigger: RunTrigger, taxonomy_version: &str) -> Self {
        Self {
            run_id,
            trigger,
            success: false,
            timestamp: Utc::now(),
            duration_ms: 0,
            discovered: 0,
            imported: 0,
            updated: 0,
            skipped: 0,
            high_priority: 0,
            timed_out: false,
            taxonomy_version: taxonomy_version.to_string(),
            errors: Vec::new(),
            sources: Vec::new(),
        }
    }
}
