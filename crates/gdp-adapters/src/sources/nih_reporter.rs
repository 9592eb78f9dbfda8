//! NIH RePORTER project search. Historical awards, used to gauge who funds
//! similar work rather than to find open solicitations.

use async_trait::async_trait;
use gdp_core::{GrantSource, Opportunity};
use gdp_storage::OutboundRequest;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};

use crate::{
    clean_text, id_string, normalize_amount, parse_date, parse_json, AdapterContext, AdapterError,
    QueryPolicy, SourceAdapter, SourceQuery,
};

pub const NIH_REPORTER_SEARCH_URL: &str = "https://api.reporter.nih.gov/v2/projects/search";
const SEARCH_FIELDS: &str = "projecttitle,terms,abstracttext";
const FALLBACK_AGENCY: &str = "National Institutes of Health";

#[derive(Debug, Clone)]
pub struct NihReporterAdapter {
    endpoint: String,
}

impl NihReporterAdapter {
    pub fn new() -> Self {
        Self::with_endpoint(NIH_REPORTER_SEARCH_URL)
    }

    pub fn with_endpoint(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
        }
    }
}

impl Default for NihReporterAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<Project>,
}

#[derive(Debug, Deserialize)]
struct Project {
    #[serde(default)]
    appl_id: Option<JsonValue>,
    #[serde(default)]
    project_num: Option<String>,
    #[serde(default)]
    project_title: Option<String>,
    #[serde(default)]
    abstract_text: Option<String>,
    #[serde(default)]
    agency_ic_admin: Option<AgencyIc>,
    #[serde(default)]
    award_amount: Option<f64>,
    #[serde(default)]
    project_start_date: Option<String>,
    #[serde(default)]
    project_end_date: Option<String>,
    #[serde(default)]
    project_detail_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AgencyIc {
    #[serde(default)]
    name: Option<String>,
}

#[async_trait]
impl SourceAdapter for NihReporterAdapter {
    fn source(&self) -> GrantSource {
        GrantSource::NihReporter
    }

    fn policy(&self) -> QueryPolicy {
        QueryPolicy {
            max_keywords: 15,
            max_results: 50,
        }
    }

    fn build_request(&self, query: &SourceQuery, _ctx: &AdapterContext) -> OutboundRequest {
        OutboundRequest::post_json(
            self.endpoint.clone(),
            json!({
                "criteria": {
                    "advanced_text_search": {
                        "operator": "or",
                        "search_field": SEARCH_FIELDS,
                        "search_text": query.keywords.join(" "),
                    }
                },
                "limit": query.limit,
                "offset": 0,
            }),
        )
    }

    fn parse(&self, body: &[u8], _ctx: &AdapterContext) -> Result<Vec<Opportunity>, AdapterError> {
        let response: SearchResponse = parse_json(self.source(), body)?;
        let opportunities = response
            .results
            .into_iter()
            .filter_map(|project| {
                let appl_id = id_string(project.appl_id.as_ref());
                let external_id = project
                    .project_num
                    .as_deref()
                    .map(str::trim)
                    .filter(|n| !n.is_empty())
                    .map(ToString::to_string)
                    .or_else(|| appl_id.clone())?;
                let url = project
                    .project_detail_url
                    .filter(|u| !u.trim().is_empty())
                    .or_else(|| {
                        appl_id.map(|id| format!("https://reporter.nih.gov/project-details/{id}"))
                    })
                    .unwrap_or_default();

                Some(Opportunity {
                    source: self.source(),
                    external_id,
                    title: clean_text(project.project_title.as_deref()),
                    agency_name: project
                        .agency_ic_admin
                        .and_then(|ic| ic.name)
                        .filter(|n| !n.trim().is_empty())
                        .unwrap_or_else(|| FALLBACK_AGENCY.to_string()),
                    description: clean_text(project.abstract_text.as_deref()),
                    amount_ceiling: normalize_amount(project.award_amount),
                    open_date: parse_date(project.project_start_date.as_deref()),
                    close_date: parse_date(project.project_end_date.as_deref()),
                    url,
                })
            })
            .collect();
        Ok(opportunities)
    }
}
