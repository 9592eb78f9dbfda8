//! Keyword-taxonomy scoring and the win-probability heuristic.
//!
//! Matching is plain substring containment on the lowercased title and
//! description, so a short keyword such as `"art"` also hits inside words like
//! `"party"` or `"department"`. Scores are deterministic for a given taxonomy
//! and evaluation date.

use chrono::NaiveDate;

use crate::taxonomy::TaxonomyTag;
use crate::{Opportunity, ScoredOpportunity};

/// Distinct keyword hits a tag needs before it counts as matched.
pub const TAG_MATCH_THRESHOLD: usize = 2;
pub const POINTS_PER_KEYWORD: u32 = 10;
pub const PRIMARY_REGISTRY_BONUS: u32 = 10;
pub const OPEN_WINDOW_BONUS: u32 = 5;
/// Close dates further out than this earn the open-window bonus.
pub const OPEN_WINDOW_DAYS: i64 = 30;
pub const MAX_MATCH_SCORE: u32 = 100;
pub const MAX_WIN_PROBABILITY: f64 = 80.0;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeywordMatch {
    pub tag: String,
    pub hits: usize,
}

/// Tags among `targets` whose keyword hit count reaches the match threshold,
/// in taxonomy order.
pub fn keyword_matches(search_text: &str, targets: &[&TaxonomyTag]) -> Vec<KeywordMatch> {
    targets
        .iter()
        .filter_map(|tag| {
            let hits = tag
                .keywords
                .iter()
                .filter(|keyword| search_text.contains(keyword.as_str()))
                .count();
            (hits >= TAG_MATCH_THRESHOLD).then(|| KeywordMatch {
                tag: tag.tag.clone(),
                hits,
            })
        })
        .collect()
}

pub fn search_text(opportunity: &Opportunity) -> String {
    format!("{} {}", opportunity.title, opportunity.description).to_lowercase()
}

/// Step bonus favoring smaller awards, which are assumed to draw fewer
/// applicants. Unknown amounts earn nothing.
pub fn amount_bonus(amount_ceiling: Option<f64>) -> u8 {
    match amount_ceiling {
        Some(amount) if amount.is_finite() && amount >= 0.0 => {
            if amount <= 50_000.0 {
                20
            } else if amount <= 250_000.0 {
                15
            } else if amount <= 1_000_000.0 {
                10
            } else if amount <= 5_000_000.0 {
                5
            } else {
                0
            }
        }
        _ => 0,
    }
}

/// Heuristic win estimate in `0..=80`. Not statistically validated.
pub fn win_probability(match_score: u8, amount_ceiling: Option<f64>) -> u8 {
    let raw = f64::from(match_score) * 0.4 + f64::from(amount_bonus(amount_ceiling));
    raw.min(MAX_WIN_PROBABILITY).round() as u8
}

pub fn score_opportunity(
    opportunity: &Opportunity,
    targets: &[&TaxonomyTag],
    today: NaiveDate,
) -> ScoredOpportunity {
    let text = search_text(opportunity);
    let matches = keyword_matches(&text, targets);

    let keyword_score: u32 = matches
        .iter()
        .map(|m| m.hits as u32 * POINTS_PER_KEYWORD)
        .sum();

    let mut score = keyword_score;
    if keyword_score > 0 {
        if opportunity.source.is_primary_registry() {
            score += PRIMARY_REGISTRY_BONUS;
        }
        if let Some(close) = opportunity.close_date {
            if (close - today).num_days() > OPEN_WINDOW_DAYS {
                score += OPEN_WINDOW_BONUS;
            }
        }
    }
    let match_score = score.min(MAX_MATCH_SCORE) as u8;

    ScoredOpportunity {
        opportunity: opportunity.clone(),
        match_score,
        win_probability: win_probability(match_score, opportunity.amount_ceiling),
        matched_tags: matches.into_iter().map(|m| m.tag).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{GrantSource, Taxonomy};

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, 1).unwrap()
    }

    fn opportunity(source: GrantSource, title: &str, description: &str) -> Opportunity {
        Opportunity {
            source,
            external_id: "X-1".into(),
            title: title.into(),
            agency_name: String::new(),
            description: description.into(),
            amount_ceiling: None,
            open_date: None,
            close_date: None,
            url: String::new(),
        }
    }

    fn single_tag_taxonomy() -> Taxonomy {
        Taxonomy::new(
            "test",
            vec![TaxonomyTag {
                tag: "rural-health".into(),
                keywords: vec!["rural".into(), "telehealth".into(), "clinic".into()],
            }],
        )
        .unwrap()
    }

    #[test]
    fn empty_text_scores_zero_and_keeps_amount_bonus() {
        let taxonomy = Taxonomy::builtin();
        let targets = taxonomy.resolve_targets(&[]).unwrap();
        let mut opp = opportunity(GrantSource::GrantsGov, "", "");
        opp.amount_ceiling = Some(40_000.0);
        opp.close_date = NaiveDate::from_ymd_opt(2026, 12, 31);

        let scored = score_opportunity(&opp, &targets, today());
        assert_eq!(scored.match_score, 0);
        assert_eq!(scored.win_probability, 20);
        assert!(scored.matched_tags.is_empty());
    }

    #[test]
    fn two_distinct_keywords_reach_the_threshold() {
        let taxonomy = single_tag_taxonomy();
        let targets = taxonomy.resolve_targets(&[]).unwrap();
        let opp = opportunity(GrantSource::NsfAwards, "Rural telehealth pilot", "");

        let scored = score_opportunity(&opp, &targets, today());
        assert_eq!(scored.matched_tags, vec!["rural-health"]);
        assert_eq!(scored.match_score, 20);
    }

    #[test]
    fn one_keyword_repeated_stays_below_threshold() {
        let taxonomy = single_tag_taxonomy();
        let targets = taxonomy.resolve_targets(&[]).unwrap();
        let opp = opportunity(GrantSource::GrantsGov, "Rural roads", "rural bridges, rural transit");

        let scored = score_opportunity(&opp, &targets, today());
        assert!(scored.matched_tags.is_empty());
        assert_eq!(scored.match_score, 0);
    }

    #[test]
    fn one_word_never_matches_a_builtin_tag() {
        let taxonomy = Taxonomy::builtin();
        let targets = taxonomy.resolve_targets(&[]).unwrap();
        let opp = opportunity(GrantSource::GrantsGov, "Artist", "");

        let scored = score_opportunity(&opp, &targets, today());
        assert!(scored.matched_tags.is_empty(), "{:?}", scored.matched_tags);
        assert_eq!(scored.match_score, 0);
    }

    #[test]
    fn substring_matching_is_not_tokenized() {
        let taxonomy = Taxonomy::new(
            "test",
            vec![TaxonomyTag {
                tag: "arts-culture".into(),
                keywords: vec!["art".into(), "music".into()],
            }],
        )
        .unwrap();
        let targets = taxonomy.resolve_targets(&[]).unwrap();
        let opp = opportunity(GrantSource::NsfAwards, "Block party with live music", "");

        let scored = score_opportunity(&opp, &targets, today());
        assert_eq!(scored.matched_tags, vec!["arts-culture"]);
    }

    #[test]
    fn bonuses_apply_to_matched_records_and_score_is_capped() {
        let taxonomy = single_tag_taxonomy();
        let targets = taxonomy.resolve_targets(&[]).unwrap();
        let mut opp = opportunity(GrantSource::GrantsGov, "Rural telehealth clinic", "");
        opp.close_date = NaiveDate::from_ymd_opt(2026, 4, 15);

        let scored = score_opportunity(&opp, &targets, today());
        assert_eq!(scored.match_score, 30 + 10 + 5);

        opp.close_date = NaiveDate::from_ymd_opt(2026, 3, 31);
        let scored = score_opportunity(&opp, &targets, today());
        assert_eq!(scored.match_score, 30 + 10, "exactly 30 days out earns no bonus");

        let many: Vec<String> = (0..15).map(|i| format!("kw{i:02}")).collect();
        let big = Taxonomy::new(
            "big",
            vec![TaxonomyTag {
                tag: "big".into(),
                keywords: many.clone(),
            }],
        )
        .unwrap();
        let targets = big.resolve_targets(&[]).unwrap();
        let opp = opportunity(GrantSource::GrantsGov, &many.join(" "), "");
        assert_eq!(score_opportunity(&opp, &targets, today()).match_score, 100);
    }

    #[test]
    fn only_requested_tags_are_considered() {
        let taxonomy = Taxonomy::builtin();
        let opp = opportunity(
            GrantSource::FederalRegister,
            "Veteran employment and military career training",
            "workforce apprenticeship for veterans",
        );

        let all = taxonomy.resolve_targets(&[]).unwrap();
        let scored = score_opportunity(&opp, &all, today());
        assert!(scored.matched_tags.contains(&"veterans".to_string()));
        assert!(scored.matched_tags.contains(&"workforce-development".to_string()));

        let only = taxonomy.resolve_targets(&["veterans".into()]).unwrap();
        let scored = score_opportunity(&opp, &only, today());
        assert_eq!(scored.matched_tags, vec!["veterans"]);
    }

    #[test]
    fn scoring_is_pure() {
        let taxonomy = Taxonomy::builtin();
        let targets = taxonomy.resolve_targets(&[]).unwrap();
        let mut opp = opportunity(
            GrantSource::GrantsGov,
            "Rural Telehealth Access Grant",
            "Expands rural telehealth services and community health clinics.",
        );
        opp.amount_ceiling = Some(300_000.0);
        let first = score_opportunity(&opp, &targets, today());
        let second = score_opportunity(&opp, &targets, today());
        assert_eq!(first, second);
    }

    #[test]
    fn amount_bonus_steps() {
        assert_eq!(amount_bonus(None), 0);
        assert_eq!(amount_bonus(Some(f64::NAN)), 0);
        assert_eq!(amount_bonus(Some(50_000.0)), 20);
        assert_eq!(amount_bonus(Some(50_000.01)), 15);
        assert_eq!(amount_bonus(Some(250_000.0)), 15);
        assert_eq!(amount_bonus(Some(1_000_000.0)), 10);
        assert_eq!(amount_bonus(Some(5_000_000.0)), 5);
        assert_eq!(amount_bonus(Some(5_000_001.0)), 0);
    }

    #[test]
    fn win_probability_is_rounded_and_capped() {
        assert_eq!(win_probability(0, None), 0);
        assert_eq!(win_probability(33, None), 13);
        assert_eq!(win_probability(34, Some(10_000.0)), 34);
        assert_eq!(win_probability(100, Some(10_000.0)), 60);
        assert_eq!(win_probability(100, None), 40);
        assert!(win_probability(u8::MAX, Some(1.0)) <= 80);
    }
}
