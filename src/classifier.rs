//! # Intent Classifier
//!
//! Maps a query to an ordered set of candidate domain ids. Scoring is the
//! count of a domain's keywords found as case-insensitive substrings of the
//! query, weighted by the domain's configured priority. Ties break by
//! priority, then lexicographic id. When nothing scores the configured
//! fallback domain is emitted alone.

use crate::types::{AdvancedFilters, DomainAnalysisResult, DomainSelection};

/// Algorithm name surfaced in the domain analysis
pub const ANALYSIS_ALGORITHM: &str = "keyword_priority";

/// Static description of one registered domain, as seen by the classifier
#[derive(Debug, Clone)]
pub struct DomainProfile {
    pub id: String,
    pub name: String,
    pub keywords: Vec<String>,
    pub priority: i32,
}

#[derive(Debug, Clone)]
struct ScoredDomain {
    profile: DomainProfile,
    keyword_hits: u32,
    score: f64,
}

/// Classifier output: the ordered candidate list plus the analysis record
/// explaining every selection and rejection.
#[derive(Debug, Clone)]
pub struct Classification {
    pub domains: Vec<String>,
    pub analysis: DomainAnalysisResult,
}

/// Classifies a query against the given domain profiles.
pub fn classify(
    query: &str,
    profiles: &[DomainProfile],
    filters: Option<&AdvancedFilters>,
    fallback_domain: &str,
) -> Classification {
    let query_lower = query.to_lowercase();

    let mut scored: Vec<ScoredDomain> = profiles
        .iter()
        .map(|profile| {
            let keyword_hits = profile
                .keywords
                .iter()
                .filter(|kw| query_lower.contains(&kw.to_lowercase()))
                .count() as u32;
            let score = keyword_hits as f64 * (profile.priority.max(1) as f64);
            ScoredDomain { profile: profile.clone(), keyword_hits, score }
        })
        .collect();

    scored.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(b.profile.priority.cmp(&a.profile.priority))
            .then(a.profile.id.cmp(&b.profile.id))
    });

    let mut selected: Vec<ScoredDomain> = Vec::new();
    let mut rejected: Vec<(ScoredDomain, String)> = Vec::new();

    for domain in scored {
        if domain.keyword_hits == 0 {
            rejected.push((domain, "no keyword match".to_string()));
        } else {
            selected.push(domain);
        }
    }

    // Fallback when nothing matched: a single default domain
    if selected.is_empty() {
        if let Some(pos) = rejected.iter().position(|(d, _)| d.profile.id == fallback_domain) {
            let (fallback, _) = rejected.remove(pos);
            selected.push(fallback);
        }
    }

    // Filters restrict and subtract after scoring
    if let Some(filters) = filters {
        if let Some(allowed) = filters.domains.as_ref().filter(|d| !d.is_empty()) {
            let (kept, dropped): (Vec<_>, Vec<_>) = selected
                .into_iter()
                .partition(|d| allowed.contains(&d.profile.id));
            selected = kept;
            rejected.extend(
                dropped
                    .into_iter()
                    .map(|d| (d, "excluded by filters.domains".to_string())),
            );
        }
        if let Some(excluded) = filters.exclude_domains.as_ref().filter(|d| !d.is_empty()) {
            let (dropped, kept): (Vec<_>, Vec<_>) = selected
                .into_iter()
                .partition(|d| excluded.contains(&d.profile.id));
            selected = kept;
            rejected.extend(
                dropped
                    .into_iter()
                    .map(|d| (d, "excluded by filters.exclude_domains".to_string())),
            );
        }
    }

    let max_score = selected.iter().map(|d| d.score).fold(0.0_f64, f64::max);
    let confidence = if max_score > 0.0 {
        (max_score / (max_score + 10.0)).min(1.0) as f32
    } else {
        0.3
    };

    let to_selection = |domain: &ScoredDomain, reason: Option<String>| DomainSelection {
        domain_id: domain.profile.id.clone(),
        name: domain.profile.name.clone(),
        confidence: if max_score > 0.0 {
            (domain.score / max_score.max(1.0)).min(1.0) as f32
        } else {
            0.3
        },
        relevance: (domain.keyword_hits as f32 / 5.0).min(1.0),
        reason,
        priority: domain.profile.priority,
    };

    let analysis = DomainAnalysisResult {
        selected_domains: selected
            .iter()
            .map(|d| {
                let reason = if d.keyword_hits > 0 {
                    format!("{} keyword match(es)", d.keyword_hits)
                } else {
                    "fallback domain".to_string()
                };
                to_selection(d, Some(reason))
            })
            .collect(),
        rejected_domains: rejected
            .iter()
            .map(|(d, reason)| to_selection(d, Some(reason.clone())))
            .collect(),
        confidence,
        analysis_algorithm: ANALYSIS_ALGORITHM.to_string(),
    };

    Classification {
        domains: selected.into_iter().map(|d| d.profile.id).collect(),
        analysis,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profiles() -> Vec<DomainProfile> {
        vec![
            DomainProfile {
                id: "commerce".to_string(),
                name: "Commerce".to_string(),
                keywords: vec!["купить".into(), "цена".into(), "магазин".into(), "заказать".into()],
                priority: 80,
            },
            DomainProfile {
                id: "recipes".to_string(),
                name: "Recipes".to_string(),
                keywords: vec!["рецепт".into(), "готовить".into(), "еда".into()],
                priority: 70,
            },
            DomainProfile {
                id: "travel".to_string(),
                name: "Travel".to_string(),
                keywords: vec!["отель".into(), "бронировать".into(), "путешествие".into()],
                priority: 70,
            },
            DomainProfile {
                id: "knowledge".to_string(),
                name: "Knowledge".to_string(),
                keywords: vec!["документ".into(), "инструкция".into(), "справка".into()],
                priority: 50,
            },
        ]
    }

    #[test]
    fn test_single_domain_match() {
        let result = classify("купить ноутбук", &profiles(), None, "commerce");
        assert_eq!(result.domains, vec!["commerce"]);
        assert_eq!(result.analysis.selected_domains.len(), 1);
        assert_eq!(result.analysis.rejected_domains.len(), 3);
    }

    #[test]
    fn test_multi_domain_match_ordered_by_score() {
        // Three commerce keywords beat one travel keyword
        let result = classify("купить товар в магазине и тур", &profiles(), None, "commerce");
        assert_eq!(result.domains[0], "commerce");
        assert!(result.domains.contains(&"travel".to_string()));
    }

    #[test]
    fn test_fallback_when_nothing_scores() {
        let result = classify("случайный запрос без темы", &profiles(), None, "commerce");
        assert_eq!(result.domains, vec!["commerce"]);
        let selected = &result.analysis.selected_domains[0];
        assert_eq!(selected.reason.as_deref(), Some("fallback domain"));
    }

    #[test]
    fn test_case_insensitive_matching() {
        let result = classify("КУПИТЬ НОУТБУК", &profiles(), None, "commerce");
        assert_eq!(result.domains, vec!["commerce"]);
    }

    #[test]
    fn test_allow_filter_restricts() {
        let filters = AdvancedFilters {
            domains: Some(vec!["travel".to_string()]),
            ..Default::default()
        };
        let result = classify(
            "купить билет и забронировать отель",
            &profiles(),
            Some(&filters),
            "commerce",
        );
        assert_eq!(result.domains, vec!["travel"]);
        assert!(result
            .analysis
            .rejected_domains
            .iter()
            .any(|d| d.domain_id == "commerce" && d.reason.as_deref() == Some("excluded by filters.domains")));
    }

    #[test]
    fn test_exclude_filter_subtracts() {
        let filters = AdvancedFilters {
            exclude_domains: Some(vec!["commerce".to_string()]),
            ..Default::default()
        };
        let result = classify(
            "купить билет и забронировать отель",
            &profiles(),
            Some(&filters),
            "commerce",
        );
        assert_eq!(result.domains, vec!["travel"]);
    }

    #[test]
    fn test_tie_break_by_priority_then_id() {
        // recipes and travel share priority 70; single hit each; tie falls to id order
        let result = classify("рецепт и тур", &profiles(), None, "commerce");
        assert_eq!(result.domains, vec!["recipes", "travel"]);
    }

    #[test]
    fn test_analysis_algorithm_name() {
        let result = classify("купить", &profiles(), None, "commerce");
        assert_eq!(result.analysis.analysis_algorithm, "keyword_priority");
    }
}
