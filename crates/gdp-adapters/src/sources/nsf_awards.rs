//! NSF award search. Historical awards; the API only accepts a single short
//! keyword expression, so the query is capped at three terms.

use async_trait::async_trait;
use gdp_core::{GrantSource, Opportunity};
use gdp_storage::OutboundRequest;
use serde::Deserialize;
use serde_json::Value as JsonValue;

use crate::{
    clean_text, id_string, parse_amount_text, parse_date, parse_json, AdapterContext,
    AdapterError, QueryPolicy, SourceAdapter, SourceQuery,
};

pub const NSF_AWARDS_URL: &str = "https://api.nsf.gov/services/v1/awards.json";
const PRINT_FIELDS: &str =
    "id,title,agency,awardeeName,abstractText,estimatedTotalAmt,fundsObligatedAmt,startDate,expDate";
const AGENCY: &str = "National Science Foundation";

#[derive(Debug, Clone)]
pub struct NsfAwardsAdapter {
    endpoint: String,
}

impl NsfAwardsAdapter {
    pub fn new() -> Self {
        Self::with_endpoint(NSF_AWARDS_URL)
    }

    pub fn with_endpoint(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
        }
    }
}

impl Default for NsfAwardsAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Deserialize)]
struct Envelope {
    response: AwardList,
}

#[derive(Debug, Deserialize)]
struct AwardList {
    #[serde(default)]
    award: Vec<Award>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Award {
    #[serde(default)]
    id: Option<JsonValue>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    abstract_text: Option<String>,
    #[serde(default)]
    estimated_total_amt: Option<String>,
    #[serde(default)]
    funds_obligated_amt: Option<String>,
    #[serde(default)]
    start_date: Option<String>,
    #[serde(default)]
    exp_date: Option<String>,
}

#[async_trait]
impl SourceAdapter for NsfAwardsAdapter {
    fn source(&self) -> GrantSource {
        GrantSource::NsfAwards
    }

    fn policy(&self) -> QueryPolicy {
        QueryPolicy {
            max_keywords: 3,
            max_results: 25,
        }
    }

    fn build_request(&self, query: &SourceQuery, _ctx: &AdapterContext) -> OutboundRequest {
        OutboundRequest::get(
            self.endpoint.clone(),
            vec![
                ("keyword".to_string(), query.keywords.join(" ")),
                ("rpp".to_string(), query.limit.to_string()),
                ("printFields".to_string(), PRINT_FIELDS.to_string()),
            ],
        )
    }

    fn parse(&self, body: &[u8], _ctx: &AdapterContext) -> Result<Vec<Opportunity>, AdapterError> {
        let envelope: Envelope = parse_json(self.source(), body)?;
        let opportunities = envelope
            .response
            .award
            .into_iter()
            .filter_map(|award| {
                let id = id_string(award.id.as_ref())?;
                let amount = parse_amount_text(award.estimated_total_amt.as_deref())
                    .or_else(|| parse_amount_text(award.funds_obligated_amt.as_deref()));
                Some(Opportunity {
                    source: self.source(),
                    external_id: format!("NSF-{id}"),
                    title: clean_text(award.title.as_deref()),
                    agency_name: AGENCY.to_string(),
                    description: clean_text(award.abstract_text.as_deref()),
                    amount_ceiling: amount,
                    open_date: parse_date(award.start_date.as_deref()),
                    close_date: parse_date(award.exp_date.as_deref()),
                    url: format!("https://www.nsf.gov/awardsearch/showAward?AWD_ID={id}"),
                })
            })
            .collect();
        Ok(opportunities)
    }
}
