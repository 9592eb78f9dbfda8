//! Grants.gov `search2`, the primary federal registry of open solicitations.

use async_trait::async_trait;
use gdp_core::{GrantSource, Opportunity};
use gdp_storage::OutboundRequest;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::{
    clean_text, id_string, normalize_amount, or_query, parse_amount_text, parse_date, parse_json,
    AdapterContext, AdapterError, QueryPolicy, SourceAdapter, SourceQuery,
};

pub const GRANTS_GOV_SEARCH_URL: &str = "https://api.grants.gov/v1/api/search2";
const DETAIL_URL_PREFIX: &str = "https://www.grants.gov/search-results-detail/";

#[derive(Debug, Clone)]
pub struct GrantsGovAdapter {
    endpoint: String,
}

impl GrantsGovAdapter {
    pub fn new() -> Self {
        Self::with_endpoint(GRANTS_GOV_SEARCH_URL)
    }

    pub fn with_endpoint(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
        }
    }
}

impl Default for GrantsGovAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    errorcode: i64,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    data: Option<SearchData>,
}

#[derive(Debug, Deserialize)]
struct SearchData {
    #[serde(default, rename = "oppHits")]
    opp_hits: Vec<OppHit>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OppHit {
    #[serde(default)]
    id: Option<JsonValue>,
    #[serde(default)]
    number: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default, alias = "agencyName")]
    agency: Option<String>,
    #[serde(default)]
    agency_code: Option<String>,
    #[serde(default, alias = "synopsis")]
    description: Option<String>,
    #[serde(default)]
    award_ceiling: Option<JsonValue>,
    #[serde(default)]
    open_date: Option<String>,
    #[serde(default)]
    close_date: Option<String>,
}

fn amount_from_json(value: Option<&JsonValue>) -> Option<f64> {
    match value? {
        JsonValue::Number(n) => normalize_amount(n.as_f64()),
        JsonValue::String(s) => parse_amount_text(Some(s)),
        _ => None,
    }
}

#[async_trait]
impl SourceAdapter for GrantsGovAdapter {
    fn source(&self) -> GrantSource {
        GrantSource::GrantsGov
    }

    fn policy(&self) -> QueryPolicy {
        QueryPolicy {
            max_keywords: 10,
            max_results: 100,
        }
    }

    fn build_request(&self, query: &SourceQuery, _ctx: &AdapterContext) -> OutboundRequest {
        OutboundRequest::post_json(
            self.endpoint.clone(),
            serde_json::json!({
                "keyword": or_query(&query.keywords, " OR "),
                "rows": query.limit,
                "oppStatuses": "forecasted|posted",
            }),
        )
    }

    fn parse(&self, body: &[u8], _ctx: &AdapterContext) -> Result<Vec<Opportunity>, AdapterError> {
        let response: SearchResponse = parse_json(self.source(), body)?;
        if response.errorcode != 0 {
            return Err(AdapterError::Malformed {
                source_id: self.source().as_str(),
                message: format!("errorcode {}: {}", response.errorcode, response.msg),
            });
        }

        let hits = response.data.map(|d| d.opp_hits).unwrap_or_default();
        let mut out = Vec::with_capacity(hits.len());
        for hit in hits {
            let id = id_string(hit.id.as_ref());
            let Some(external_id) = hit
                .number
                .as_deref()
                .map(str::trim)
                .filter(|n| !n.is_empty())
                .map(ToString::to_string)
                .or_else(|| id.clone())
            else {
                debug!("skipping grants.gov hit without number or id");
                continue;
            };

            out.push(Opportunity {
                source: self.source(),
                external_id,
                title: clean_text(hit.title.as_deref()),
                agency_name: hit
                    .agency
                    .or(hit.agency_code)
                    .map(|a| a.trim().to_string())
                    .unwrap_or_default(),
                description: clean_text(hit.description.as_deref()),
                amount_ceiling: amount_from_json(hit.award_ceiling.as_ref()),
                open_date: parse_date(hit.open_date.as_deref()),
                close_date: parse_date(hit.close_date.as_deref()),
                url: id
                    .map(|id| format!("{DETAIL_URL_PREFIX}{id}"))
                    .unwrap_or_default(),
            });
        }
        Ok(out)
    }
}
