//! Lexical keyword matching.
//!
//! Matching is accent- and case-insensitive and token-based: a keyword
//! word matches a text token exactly or as a prefix with at most two
//! trailing characters, which covers Portuguese plurals ("uniformes",
//! "servidores") without matching inside unrelated words. Density of
//! hits relative to the object length in tokens defines the uncertain
//! zone where the lexical layer defers to the LLM arbiter.

use unicode_normalization::UnicodeNormalization;

/// Uncertain-zone bands, as fractions of tokens.
pub const CONSERVATIVE_BAND: (f64, f64) = (0.01, 0.03);
pub const STANDARD_BAND: (f64, f64) = (0.03, 0.08);

/// Plural tolerance: a token may extend the keyword by this many chars.
const MAX_SUFFIX_CHARS: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptLevel {
    Conservative,
    Standard,
}

impl PromptLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            PromptLevel::Conservative => "conservative",
            PromptLevel::Standard => "standard",
        }
    }
}

/// Lowercase and strip combining marks so "Manutenção" == "manutencao".
pub fn normalize_text(s: &str) -> String {
    s.nfd()
        .filter(|c| !unicode_normalization::char::is_combining_mark(*c))
        .collect::<String>()
        .to_lowercase()
}

/// Split normalized text into alphanumeric tokens, dropping punctuation.
pub fn tokenize(normalized: &str) -> Vec<String> {
    normalized
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_string())
        .collect()
}

/// One keyword word against one text token: exact, or prefix with at
/// most `MAX_SUFFIX_CHARS` extra characters ("uniforme" → "uniformes").
fn word_matches_token(word: &str, token: &str) -> bool {
    if word == token {
        return true;
    }
    token.starts_with(word) && token.chars().count() - word.chars().count() <= MAX_SUFFIX_CHARS
}

/// Non-overlapping occurrences of a (possibly multi-word) needle in a
/// token sequence.
pub fn count_occurrences_in_tokens(tokens: &[String], needle: &str) -> usize {
    let needle_words: Vec<&str> = needle
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();
    if needle_words.is_empty() || tokens.len() < needle_words.len() {
        return 0;
    }

    let mut count = 0;
    let mut i = 0;
    while i + needle_words.len() <= tokens.len() {
        let window = &tokens[i..i + needle_words.len()];
        let hit = needle_words
            .iter()
            .zip(window)
            .all(|(word, token)| word_matches_token(word, token));
        if hit {
            count += 1;
            i += needle_words.len();
        } else {
            i += 1;
        }
    }
    count
}

/// Word-boundary match of `needle` in already-normalized text.
pub fn matches_word(normalized_haystack: &str, needle: &str) -> bool {
    let tokens = tokenize(normalized_haystack);
    count_occurrences_in_tokens(&tokens, needle) > 0
}

/// Outcome of the lexical pass over one object description.
#[derive(Debug, Clone, Default)]
pub struct KeywordMatch {
    /// Distinct canonical keywords that matched.
    pub matched: Vec<String>,
    /// Total keyword occurrences (a keyword appearing twice counts twice).
    pub total_hits: usize,
    /// Exclusion keywords that matched, if any.
    pub exclusions_hit: Vec<String>,
    /// Token count of the normalized object.
    pub token_count: usize,
}

impl KeywordMatch {
    /// Hit density relative to object length in tokens.
    pub fn density(&self) -> f64 {
        if self.token_count == 0 {
            return 0.0;
        }
        self.total_hits as f64 / self.token_count as f64
    }

    /// Which arbiter prompt, if any, the density calls for.
    pub fn uncertain_zone(&self) -> Option<PromptLevel> {
        let d = self.density();
        if d >= CONSERVATIVE_BAND.0 && d < CONSERVATIVE_BAND.1 {
            Some(PromptLevel::Conservative)
        } else if d >= STANDARD_BAND.0 && d <= STANDARD_BAND.1 {
            Some(PromptLevel::Standard)
        } else {
            None
        }
    }
}

/// Run the lexical pass: keywords and exclusions against one object.
pub fn match_keywords(objeto: &str, keywords: &[String], exclusions: &[String]) -> KeywordMatch {
    let normalized = normalize_text(objeto);
    let tokens = tokenize(&normalized);
    let token_count = tokens.len();

    let mut matched = Vec::new();
    let mut total_hits = 0;
    for keyword in keywords {
        let needle = normalize_text(keyword);
        let hits = count_occurrences_in_tokens(&tokens, &needle);
        if hits > 0 {
            matched.push(keyword.clone());
            total_hits += hits;
        }
    }

    let mut exclusions_hit = Vec::new();
    for exclusion in exclusions {
        let needle = normalize_text(exclusion);
        if count_occurrences_in_tokens(&tokens, &needle) > 0 {
            exclusions_hit.push(exclusion.clone());
        }
    }

    KeywordMatch {
        matched,
        total_hits,
        exclusions_hit,
        token_count,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_strips_accents_and_case() {
        assert_eq!(normalize_text("Manutenção PREDIAL"), "manutencao predial");
        assert_eq!(normalize_text("Pregão"), "pregao");
    }

    #[test]
    fn test_word_boundary_respected() {
        let hay = normalize_text("Uniformes escolares e fardamento");
        assert!(matches_word(&hay, "uniformes"));
        // Prefix with a long tail is not a match.
        assert!(!matches_word(&hay, "unifo"));
        // Not at a word start at all.
        assert!(!matches_word(&hay, "formes"));
    }

    #[test]
    fn test_plural_tolerance() {
        let hay = normalize_text("Aquisição de uniformes e servidores");
        assert!(matches_word(&hay, "uniforme"));
        assert!(matches_word(&hay, "servidor"));
        // "farda" + "mento" exceeds the suffix budget.
        assert!(!matches_word(&normalize_text("fardamento novo"), "farda"));
    }

    #[test]
    fn test_multiword_needle() {
        let hay = normalize_text("Serviço de manutenção predial contínua");
        assert!(matches_word(&hay, "manutencao predial"));
        assert!(!matches_word(&hay, "manutencao eletrica"));
    }

    #[test]
    fn test_multiword_needle_with_plurals() {
        let hay = normalize_text("Capacitação de servidores públicos municipais");
        assert!(matches_word(&hay, "servidor publico"));
    }

    #[test]
    fn test_occurrences_counted() {
        let tokens = tokenize(&normalize_text("uniforme azul e uniforme branco"));
        assert_eq!(count_occurrences_in_tokens(&tokens, "uniforme"), 2);
    }

    #[test]
    fn test_punctuation_ignored() {
        let hay = normalize_text("Objeto: aquisição de uniformes, fardas etc.");
        assert!(matches_word(&hay, "uniforme"));
        assert!(matches_word(&hay, "farda"));
    }

    #[test]
    fn test_match_keywords_collects_exclusions() {
        let m = match_keywords(
            "Aquisição de servidores públicos e servidor de rede",
            &["servidor".into()],
            &["servidor publico".into()],
        );
        assert_eq!(m.matched, vec!["servidor".to_string()]);
        assert_eq!(m.total_hits, 2);
        assert_eq!(m.exclusions_hit, vec!["servidor publico".to_string()]);
    }

    #[test]
    fn test_density_and_zones() {
        // 1 hit in 50 tokens → 2% → conservative band.
        let filler = "palavra ".repeat(49);
        let objeto = format!("{}uniforme", filler);
        let m = match_keywords(&objeto, &["uniforme".into()], &[]);
        assert_eq!(m.total_hits, 1);
        assert_eq!(m.token_count, 50);
        assert!((m.density() - 0.02).abs() < 1e-9);
        assert_eq!(m.uncertain_zone(), Some(PromptLevel::Conservative));

        // 1 hit in 20 tokens → 5% → standard band.
        let filler = "palavra ".repeat(19);
        let m = match_keywords(&format!("{}uniforme", filler), &["uniforme".into()], &[]);
        assert_eq!(m.uncertain_zone(), Some(PromptLevel::Standard));

        // 2 hits in 6 tokens → 33% → outside the zone.
        let m = match_keywords(
            "uniforme escolar e uniforme esportivo novo",
            &["uniforme".into()],
            &[],
        );
        assert!(m.density() > 0.08);
        assert_eq!(m.uncertain_zone(), None);
    }

    #[test]
    fn test_empty_object_has_zero_density() {
        let m = match_keywords("", &["uniforme".into()], &[]);
        assert_eq!(m.density(), 0.0);
        assert_eq!(m.uncertain_zone(), None);
    }
}
