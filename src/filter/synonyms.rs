//! Synonym expansion and fuzzy matching for the recovery layer.
//!
//! When the lexical pass comes up short, each canonical keyword's
//! synonyms are searched in the object text: exact word-boundary match
//! first, then a fuzzy comparison with similarity ≥ 0.8 (subsequence
//! ratio, tunable). Two distinct canonical keywords recovered through
//! synonyms auto-approve the bid; exactly one defers to the LLM arbiter.

use crate::models::sector::Sector;

use super::keywords::{matches_word, normalize_text, tokenize};

/// Empirically chosen; a tunable, not a contract.
pub const SIMILARITY_THRESHOLD: f64 = 0.8;

/// Minimum distinct canonical keywords matched via synonyms for
/// auto-recovery without consulting the arbiter.
pub const AUTO_APPROVE_SYNONYMS: usize = 2;

/// A synonym hit: which canonical keyword it stands for and the text
/// that matched.
#[derive(Debug, Clone, PartialEq)]
pub struct SynonymMatch {
    pub canonical: String,
    pub matched_text: String,
    pub fuzzy: bool,
}

/// Similarity ratio in [0, 1] between two words, defined as
/// `2·LCS(a, b) / (|a| + |b|)`.
pub fn similarity_ratio(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }

    // Classic LCS over two rows.
    let mut prev = vec![0usize; b.len() + 1];
    let mut curr = vec![0usize; b.len() + 1];
    for i in 1..=a.len() {
        for j in 1..=b.len() {
            curr[j] = if a[i - 1] == b[j - 1] {
                prev[j - 1] + 1
            } else {
                prev[j].max(curr[j - 1])
            };
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    let lcs = prev[b.len()];
    2.0 * lcs as f64 / (a.len() + b.len()) as f64
}

/// Find synonym matches for a sector's canonical keywords in the object
/// text. Canonical keywords that already match directly are skipped;
/// they were counted by the lexical layer.
pub fn find_synonym_matches(
    objeto: &str,
    sector: &Sector,
    similarity_threshold: f64,
) -> Vec<SynonymMatch> {
    let normalized = normalize_text(objeto);
    if normalized.is_empty() {
        return Vec::new();
    }
    let tokens = tokenize(&normalized);

    let mut matches = Vec::new();
    for (canonical, synonyms) in &sector.synonyms {
        let canonical_norm = normalize_text(canonical);
        if matches_word(&normalized, &canonical_norm) {
            continue;
        }

        let mut best: Option<SynonymMatch> = None;
        for synonym in synonyms {
            let syn_norm = normalize_text(synonym);

            if matches_word(&normalized, &syn_norm) {
                best = Some(SynonymMatch {
                    canonical: canonical.to_string(),
                    matched_text: synonym.to_string(),
                    fuzzy: false,
                });
                break;
            }

            // Fuzzy pass: slide a window of the synonym's word count
            // over the object tokens.
            let syn_words = tokenize(&syn_norm).len().max(1);
            if tokens.len() < syn_words {
                continue;
            }
            for window in tokens.windows(syn_words) {
                let candidate = window.join(" ");
                if similarity_ratio(&candidate, &syn_norm) >= similarity_threshold {
                    best.get_or_insert(SynonymMatch {
                        canonical: canonical.to_string(),
                        matched_text: candidate.clone(),
                        fuzzy: true,
                    });
                }
            }
        }

        if let Some(m) = best {
            matches.push(m);
        }
    }

    matches
}

/// Count distinct canonical keywords reached through synonyms.
pub fn count_distinct_canonicals(matches: &[SynonymMatch]) -> usize {
    let mut canonicals: Vec<&str> = matches.iter().map(|m| m.canonical.as_str()).collect();
    canonicals.sort();
    canonicals.dedup();
    canonicals.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::sector::get_sector;

    #[test]
    fn test_similarity_identical() {
        assert_eq!(similarity_ratio("fardamento", "fardamento"), 1.0);
    }

    #[test]
    fn test_similarity_typo_above_threshold() {
        // One inserted letter keeps the ratio above 0.8.
        assert!(similarity_ratio("fardamennto", "fardamento") >= SIMILARITY_THRESHOLD);
        assert!(similarity_ratio("fardamentos", "fardamento") >= SIMILARITY_THRESHOLD);
    }

    #[test]
    fn test_similarity_unrelated_below_threshold() {
        assert!(similarity_ratio("construcao", "fardamento") < SIMILARITY_THRESHOLD);
    }

    #[test]
    fn test_exact_synonym_match() {
        let sector = get_sector("vestuario").unwrap();
        let matches =
            find_synonym_matches("Fardamento para guardas municipais", sector, SIMILARITY_THRESHOLD);
        assert!(matches
            .iter()
            .any(|m| m.canonical == "uniforme" || m.canonical == "farda"));
    }

    #[test]
    fn test_fuzzy_synonym_match_with_typo() {
        let sector = get_sector("vestuario").unwrap();
        let matches = find_synonym_matches(
            "Fornecimento de fardamennto para guardas",
            sector,
            SIMILARITY_THRESHOLD,
        );
        assert!(!matches.is_empty());
        assert!(matches.iter().any(|m| m.fuzzy));
    }

    #[test]
    fn test_no_synonym_match_when_canonical_present() {
        let sector = get_sector("vestuario").unwrap();
        // "uniformes" already satisfies the canonical "uniforme" at the
        // lexical layer, so the synonym pass skips that keyword.
        let matches = find_synonym_matches(
            "Fornecimento de uniformes escolares",
            sector,
            SIMILARITY_THRESHOLD,
        );
        assert!(matches.iter().all(|m| m.canonical != "uniforme"));
    }

    #[test]
    fn test_case_insensitive() {
        let sector = get_sector("vestuario").unwrap();
        let matches = find_synonym_matches(
            "FARDAMENTO PARA GUARDAS MUNICIPAIS",
            sector,
            SIMILARITY_THRESHOLD,
        );
        assert!(!matches.is_empty());
    }

    #[test]
    fn test_empty_object_no_matches() {
        let sector = get_sector("vestuario").unwrap();
        assert!(find_synonym_matches("", sector, SIMILARITY_THRESHOLD).is_empty());
    }

    #[test]
    fn test_distinct_canonical_count() {
        let matches = vec![
            SynonymMatch {
                canonical: "limpeza".into(),
                matched_text: "asseio".into(),
                fuzzy: false,
            },
            SynonymMatch {
                canonical: "limpeza".into(),
                matched_text: "zeladoria".into(),
                fuzzy: false,
            },
            SynonymMatch {
                canonical: "conservacao".into(),
                matched_text: "manutencao predial".into(),
                fuzzy: false,
            },
        ];
        assert_eq!(count_distinct_canonicals(&matches), 2);
    }

    #[test]
    fn test_facilities_asseio_maps_to_limpeza() {
        let sector = get_sector("facilities").unwrap();
        let matches = find_synonym_matches(
            "Serviços de asseio e conservação predial",
            sector,
            SIMILARITY_THRESHOLD,
        );
        assert!(matches.iter().any(|m| m.canonical == "limpeza"));
    }
}
