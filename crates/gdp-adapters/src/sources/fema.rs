//! OpenFEMA disaster declaration summaries. Declarations open the door to
//! recovery funding, so each recent declaration becomes one record. The API
//! returns one row per designated area; rows are folded per declaration.

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::Duration;
use gdp_core::{GrantSource, Opportunity};
use gdp_storage::OutboundRequest;
use serde::Deserialize;
use serde_json::Value as JsonValue;

use crate::{
    id_string, parse_date, parse_json, AdapterContext, AdapterError, QueryPolicy, SourceAdapter,
    SourceQuery,
};

pub const FEMA_DECLARATIONS_URL: &str =
    "https://www.fema.gov/api/open/v2/DisasterDeclarationsSummaries";
const AGENCY: &str = "Federal Emergency Management Agency";
const LOOKBACK_DAYS: i64 = 90;
const ROWS_PER_DECLARATION: usize = 20;
const MAX_ROWS: usize = 1000;
const MAX_AREAS_LISTED: usize = 12;

#[derive(Debug, Clone)]
pub struct FemaDeclarationsAdapter {
    endpoint: String,
}

impl FemaDeclarationsAdapter {
    pub fn new() -> Self {
        Self::with_endpoint(FEMA_DECLARATIONS_URL)
    }

    pub fn with_endpoint(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
        }
    }
}

impl Default for FemaDeclarationsAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Deserialize)]
struct SummaryPage {
    #[serde(default, rename = "DisasterDeclarationsSummaries")]
    rows: Vec<DeclarationRow>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeclarationRow {
    #[serde(default)]
    fema_declaration_string: Option<String>,
    #[serde(default)]
    disaster_number: Option<JsonValue>,
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    declaration_type: Option<String>,
    #[serde(default)]
    declaration_date: Option<String>,
    #[serde(default)]
    incident_type: Option<String>,
    #[serde(default)]
    declaration_title: Option<String>,
    #[serde(default)]
    designated_area: Option<String>,
    #[serde(default)]
    incident_end_date: Option<String>,
    #[serde(default)]
    ih_program_declared: Option<bool>,
    #[serde(default)]
    ia_program_declared: Option<bool>,
    #[serde(default)]
    pa_program_declared: Option<bool>,
    #[serde(default)]
    hm_program_declared: Option<bool>,
}

/// One declaration assembled from its per-area rows.
#[derive(Debug)]
struct Declaration {
    id: String,
    disaster_number: Option<String>,
    state: String,
    declaration_type: String,
    incident_type: String,
    title: String,
    declared_on: Option<String>,
    incident_end: Option<String>,
    areas: BTreeSet<String>,
    programs: BTreeSet<&'static str>,
}

impl Declaration {
    fn from_row(id: String, row: &DeclarationRow) -> Self {
        let text = |v: &Option<String>| v.as_deref().unwrap_or_default().trim().to_string();
        Self {
            id,
            disaster_number: id_string(row.disaster_number.as_ref()),
            state: text(&row.state),
            declaration_type: text(&row.declaration_type),
            incident_type: text(&row.incident_type),
            title: text(&row.declaration_title),
            declared_on: row.declaration_date.clone(),
            incident_end: row.incident_end_date.clone(),
            areas: BTreeSet::new(),
            programs: BTreeSet::new(),
        }
    }

    fn absorb(&mut self, row: &DeclarationRow) {
        if let Some(area) = row.designated_area.as_deref().map(str::trim) {
            if !area.is_empty() {
                self.areas.insert(area.to_string());
            }
        }
        let flags = [
            (row.ih_program_declared, "Individuals and Households"),
            (row.ia_program_declared, "Individual Assistance"),
            (row.pa_program_declared, "Public Assistance"),
            (row.hm_program_declared, "Hazard Mitigation"),
        ];
        for (declared, program) in flags {
            if declared == Some(true) {
                self.programs.insert(program);
            }
        }
    }

    fn description(&self) -> String {
        let mut text = format!(
            "{} disaster declaration ({}) in {}.",
            if self.incident_type.is_empty() {
                "Major"
            } else {
                self.incident_type.as_str()
            },
            self.declaration_type,
            self.state
        );
        if !self.areas.is_empty() {
            let listed: Vec<&str> = self
                .areas
                .iter()
                .take(MAX_AREAS_LISTED)
                .map(String::as_str)
                .collect();
            text.push_str(&format!(" Designated areas: {}", listed.join(", ")));
            let remaining = self.areas.len().saturating_sub(MAX_AREAS_LISTED);
            if remaining > 0 {
                text.push_str(&format!(" and {remaining} more"));
            }
            text.push('.');
        }
        if self.programs.is_empty() {
            text.push_str(" No assistance programs declared yet.");
        } else {
            let programs: Vec<&str> = self.programs.iter().copied().collect();
            text.push_str(&format!(" Programs declared: {}.", programs.join(", ")));
        }
        text
    }

    fn into_opportunity(self) -> Opportunity {
        let description = self.description();
        let title = if self.title.is_empty() {
            format!("{} {} disaster declaration", self.state, self.incident_type)
                .trim()
                .to_string()
        } else {
            format!("{} ({})", self.title, self.state)
        };
        let url = match &self.disaster_number {
            Some(number) => format!("https://www.fema.gov/disaster/{number}"),
            None => String::new(),
        };
        Opportunity {
            source: GrantSource::FemaDeclarations,
            external_id: self.id,
            title,
            agency_name: AGENCY.to_string(),
            description,
            amount_ceiling: None,
            open_date: parse_date(self.declared_on.as_deref()),
            close_date: parse_date(self.incident_end.as_deref()),
            url,
        }
    }
}

#[async_trait]
impl SourceAdapter for FemaDeclarationsAdapter {
    fn source(&self) -> GrantSource {
        GrantSource::FemaDeclarations
    }

    /// No keyword filter upstream; relevance comes entirely from scoring.
    fn policy(&self) -> QueryPolicy {
        QueryPolicy {
            max_keywords: 0,
            max_results: 50,
        }
    }

    fn build_request(&self, query: &SourceQuery, ctx: &AdapterContext) -> OutboundRequest {
        let since = ctx.today - Duration::days(LOOKBACK_DAYS);
        let top = (query.limit * ROWS_PER_DECLARATION).min(MAX_ROWS);
        OutboundRequest::get(
            self.endpoint.clone(),
            vec![
                (
                    "$filter".to_string(),
                    format!("declarationDate ge '{}'", since.format("%Y-%m-%d")),
                ),
                ("$orderby".to_string(), "declarationDate desc".to_string()),
                ("$top".to_string(), top.to_string()),
            ],
        )
    }

    fn parse(&self, body: &[u8], _ctx: &AdapterContext) -> Result<Vec<Opportunity>, AdapterError> {
        let page: SummaryPage = parse_json(self.source(), body)?;

        // Keep first-seen order, which is newest-first from the API.
        let mut declarations: Vec<Declaration> = Vec::new();
        for row in &page.rows {
            let Some(id) = row
                .fema_declaration_string
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
            else {
                continue;
            };
            let index = match declarations.iter().position(|d| d.id == id) {
                Some(index) => index,
                None => {
                    declarations.push(Declaration::from_row(id.to_string(), row));
                    declarations.len() - 1
                }
            };
            declarations[index].absorb(row);
        }

        Ok(declarations
            .into_iter()
            .map(Declaration::into_opportunity)
            .collect())
    }
}
