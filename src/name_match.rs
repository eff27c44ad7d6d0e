//! Fuzzy name comparison used for dedup identity and post-hoc verification
//! of returned contacts.
//!
//! Comparison is case-insensitive and token-order invariant: "Lee, Ann" and
//! "ann lee" compare equal. Similarity is Jaro-Winkler over the sorted token
//! string, with a whole-token containment shortcut so "Ann Lee" matches
//! "Ann Marie Lee".

use crate::models::{normalize_component, NameMatchScore};
use strsim::jaro_winkler;

/// Lowercased tokens in sorted order. Single-letter initials are kept; they
/// matter for middle-initial comparisons.
fn sorted_tokens(name: &str) -> Vec<String> {
    let mut tokens: Vec<String> = normalize_component(name)
        .split_whitespace()
        .map(String::from)
        .collect();
    tokens.sort();
    tokens
}

/// Similarity in 0..=1 between two names, invariant to token order.
pub fn name_similarity(a: &str, b: &str) -> f64 {
    let ta = sorted_tokens(a);
    let tb = sorted_tokens(b);
    if ta.is_empty() || tb.is_empty() {
        return 0.0;
    }

    // Whole-token containment: one name carrying extra middle tokens still
    // refers to the same person.
    let (shorter, longer) = if ta.len() <= tb.len() {
        (&ta, &tb)
    } else {
        (&tb, &ta)
    };
    if shorter.iter().all(|t| longer.contains(t)) {
        return 1.0;
    }

    jaro_winkler(&ta.join(" "), &tb.join(" "))
}

/// Whether two names refer to the same person at the given threshold.
pub fn names_match(a: &str, b: &str, threshold: f64) -> bool {
    name_similarity(a, b) >= threshold
}

#[derive(Debug, Clone, PartialEq)]
pub struct NameMatchOutcome {
    pub score: NameMatchScore,
    /// Principal names with no matching contact name, in input order,
    /// capped by configuration.
    pub unmatched: Vec<String>,
}

/// Score the known principal names for a record against the set of names
/// recovered across its contact slots.
///
/// Score = matched/total x 100. When every principal matched and the
/// contacts carry extra names beyond the principals, the score is reported
/// as "100+" rather than a number.
pub fn score_names(
    principals: &[String],
    recovered: &[String],
    threshold: f64,
    max_unmatched: usize,
) -> Option<NameMatchOutcome> {
    let principals: Vec<&String> = principals
        .iter()
        .filter(|p| !normalize_component(p).is_empty())
        .collect();
    if principals.is_empty() {
        return None;
    }
    // Blank contact names can never match anything; without this filter
    // they would count as surplus and inflate the score to "100+".
    let recovered: Vec<&String> = recovered
        .iter()
        .filter(|r| !normalize_component(r).is_empty())
        .collect();

    let mut matched = 0usize;
    let mut unmatched = Vec::new();
    for principal in &principals {
        if recovered.iter().any(|r| names_match(principal, r, threshold)) {
            matched += 1;
        } else if unmatched.len() < max_unmatched {
            unmatched.push((*principal).clone());
        }
    }

    let score = if matched == principals.len() {
        let surplus = recovered
            .iter()
            .any(|r| !principals.iter().any(|p| names_match(p, r, threshold)));
        if surplus {
            NameMatchScore::Surplus
        } else {
            NameMatchScore::Percent(100)
        }
    } else {
        let pct = (matched as f64 / principals.len() as f64 * 100.0).round() as u8;
        NameMatchScore::Percent(pct)
    };

    Some(NameMatchOutcome { score, unmatched })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_order_invariant() {
        assert_eq!(name_similarity("Ann Lee", "Lee Ann"), 1.0);
        assert_eq!(name_similarity("Lee, Ann", "ann lee"), 1.0);
    }

    #[test]
    fn containment_matches_middle_names() {
        assert!(names_match("Ann Lee", "Ann Marie Lee", 0.85));
    }

    #[test]
    fn near_spellings_match_at_default_threshold() {
        assert!(names_match("Jon Smith", "John Smith", 0.85));
        assert!(!names_match("Ann Lee", "Robert Garcia", 0.85));
    }

    #[test]
    fn empty_names_never_match() {
        assert_eq!(name_similarity("", "Ann Lee"), 0.0);
        assert_eq!(name_similarity("   ", ""), 0.0);
    }

    #[test]
    fn full_match_scores_100() {
        let outcome = score_names(
            &["Ann Lee".to_string()],
            &["Lee Ann".to_string()],
            0.85,
            8,
        )
        .unwrap();
        assert_eq!(outcome.score, NameMatchScore::Percent(100));
        assert!(outcome.unmatched.is_empty());
    }

    #[test]
    fn surplus_contact_names_score_over_100() {
        let outcome = score_names(
            &["Ann Lee".to_string()],
            &["Ann Lee".to_string(), "Robert Garcia".to_string()],
            0.85,
            8,
        )
        .unwrap();
        assert_eq!(outcome.score, NameMatchScore::Surplus);
    }

    #[test]
    fn partial_match_scores_proportionally() {
        let outcome = score_names(
            &["Ann Lee".to_string(), "Bo Chen".to_string()],
            &["Ann Lee".to_string()],
            0.85,
            8,
        )
        .unwrap();
        assert_eq!(outcome.score, NameMatchScore::Percent(50));
        assert_eq!(outcome.unmatched, vec!["Bo Chen".to_string()]);
    }

    #[test]
    fn unmatched_collection_is_capped() {
        let principals: Vec<String> = (0..12).map(|i| format!("Person Number{}", i)).collect();
        let outcome = score_names(&principals, &[], 0.85, 8).unwrap();
        assert_eq!(outcome.score, NameMatchScore::Percent(0));
        assert_eq!(outcome.unmatched.len(), 8);
        assert_eq!(outcome.unmatched[0], "Person Number0");
    }

    #[test]
    fn blank_recovered_names_do_not_count_as_surplus() {
        let outcome = score_names(
            &["Ann Lee".to_string()],
            &["Ann Lee".to_string(), "  ".to_string(), String::new()],
            0.85,
            8,
        )
        .unwrap();
        assert_eq!(outcome.score, NameMatchScore::Percent(100));
    }

    #[test]
    fn no_principals_yields_no_score() {
        assert!(score_names(&[], &["Ann Lee".to_string()], 0.85, 8).is_none());
        assert!(score_names(&["  ".to_string()], &[], 0.85, 8).is_none());
    }
}
