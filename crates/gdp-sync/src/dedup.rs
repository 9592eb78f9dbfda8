//! Cross-source deduplication by title prefix.

use std::cmp::Ordering;

use gdp_core::{Opportunity, ScoredOpportunity};

pub const TITLE_KEY_CHARS: usize = 50;

/// Lowercased first 50 characters of the trimmed title. Untitled records fall
/// back to their source-scoped id so they never collapse into each other.
pub fn title_key(opportunity: &Opportunity) -> String {
    let title = opportunity.title.trim();
    if title.is_empty() {
        return format!("{}:{}", opportunity.source.as_str(), opportunity.external_id);
    }
    title
        .chars()
        .take(TITLE_KEY_CHARS)
        .collect::<String>()
        .to_lowercase()
}

fn canonical_order(a: &(String, ScoredOpportunity), b: &(String, ScoredOpportunity)) -> Ordering {
    let (key_a, a) = a;
    let (key_b, b) = b;
    key_a
        .cmp(key_b)
        .then_with(|| {
            a.opportunity
                .source
                .dedup_priority()
                .cmp(&b.opportunity.source.dedup_priority())
        })
        .then_with(|| b.match_score.cmp(&a.match_score))
        .then_with(|| a.opportunity.external_id.cmp(&b.opportunity.external_id))
}

/// Keeps one record per title key and ranks survivors by score.
///
/// Input is first put in a total order (title key, source priority, score
/// descending, external id), so the survivor of each group and the final
/// ranking do not depend on the order adapters finished in.
pub fn dedup_and_rank(records: Vec<ScoredOpportunity>) -> Vec<ScoredOpportunity> {
    let mut keyed: Vec<(String, ScoredOpportunity)> = records
        .into_iter()
        .map(|r| (title_key(&r.opportunity), r))
        .collect();
    keyed.sort_by(canonical_order);
    keyed.dedup_by(|later, earlier| later.0 == earlier.0);

    let mut survivors: Vec<ScoredOpportunity> = keyed.into_iter().map(|(_, r)| r).collect();
    survivors.sort_by(|a, b| b.match_score.cmp(&a.match_score));
    survivors
}
