//! Federal Register notices from the last 90 days. Funding availability
//! notices often appear here before they reach the registry.

use async_trait::async_trait;
use chrono::Duration;
use gdp_core::{GrantSource, Opportunity};
use gdp_storage::OutboundRequest;
use serde::Deserialize;

use crate::{
    clean_text, or_query, parse_date, parse_json, AdapterContext, AdapterError, QueryPolicy,
    SourceAdapter, SourceQuery,
};

pub const FEDERAL_REGISTER_URL: &str = "https://www.federalregister.gov/api/v1/documents.json";
pub const LOOKBACK_DAYS: i64 = 90;

#[derive(Debug, Clone)]
pub struct FederalRegisterAdapter {
    endpoint: String,
}

impl FederalRegisterAdapter {
    pub fn new() -> Self {
        Self::with_endpoint(FEDERAL_REGISTER_URL)
    }

    pub fn with_endpoint(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
        }
    }
}

impl Default for FederalRegisterAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Deserialize)]
struct DocumentPage {
    #[serde(default)]
    results: Vec<Document>,
}

#[derive(Debug, Deserialize)]
struct Document {
    #[serde(default)]
    document_number: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default, rename = "abstract")]
    summary: Option<String>,
    #[serde(default)]
    agencies: Vec<DocumentAgency>,
    #[serde(default)]
    publication_date: Option<String>,
    #[serde(default)]
    comments_close_on: Option<String>,
    #[serde(default)]
    html_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DocumentAgency {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    raw_name: Option<String>,
}

#[async_trait]
impl SourceAdapter for FederalRegisterAdapter {
    fn source(&self) -> GrantSource {
        GrantSource::FederalRegister
    }

    fn policy(&self) -> QueryPolicy {
        QueryPolicy {
            max_keywords: 5,
            max_results: 50,
        }
    }

    fn build_request(&self, query: &SourceQuery, ctx: &AdapterContext) -> OutboundRequest {
        let since = ctx.today - Duration::days(LOOKBACK_DAYS);
        OutboundRequest::get(
            self.endpoint.clone(),
            vec![
                ("conditions[term]".to_string(), or_query(&query.keywords, " | ")),
                ("conditions[type][]".to_string(), "NOTICE".to_string()),
                (
                    "conditions[publication_date][gte]".to_string(),
                    since.format("%Y-%m-%d").to_string(),
                ),
                ("per_page".to_string(), query.limit.to_string()),
                ("order".to_string(), "newest".to_string()),
            ],
        )
    }

    fn parse(&self, body: &[u8], _ctx: &AdapterContext) -> Result<Vec<Opportunity>, AdapterError> {
        let page: DocumentPage = parse_json(self.source(), body)?;
        let opportunities = page
            .results
            .into_iter()
            .filter_map(|doc| {
                let number = doc
                    .document_number
                    .as_deref()
                    .map(str::trim)
                    .filter(|n| !n.is_empty())?
                    .to_string();
                let agency_name = doc
                    .agencies
                    .into_iter()
                    .next()
                    .and_then(|a| a.name.or(a.raw_name))
                    .unwrap_or_default();
                Some(Opportunity {
                    source: self.source(),
                    external_id: format!("FR-{number}"),
                    title: clean_text(doc.title.as_deref()),
                    agency_name,
                    description: clean_text(doc.summary.as_deref()),
                    amount_ceiling: None,
                    open_date: parse_date(doc.publication_date.as_deref()),
                    close_date: parse_date(doc.comments_close_on.as_deref()),
                    url: doc.html_url.unwrap_or_else(|| {
                        format!("https://www.federalregister.gov/d/{number}")
                    }),
                })
            })
            .collect();
        Ok(opportunities)
    }
}
