use crate::error::IngestError;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChunkingConfig {
    pub target_chars: usize,
    pub overlap_chars: usize,
    /// Fragments whose trimmed length is at or below this are dropped.
    pub min_chars: usize,
    pub lookback_chars: usize,
    pub lookahead_chars: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            target_chars: 600,
            overlap_chars: 100,
            min_chars: 10,
            lookback_chars: 100,
            lookahead_chars: 20,
        }
    }
}

impl ChunkingConfig {
    pub fn with_size(target_chars: usize, overlap_chars: usize) -> Self {
        Self {
            target_chars,
            overlap_chars,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), IngestError> {
        if self.target_chars == 0 {
            return Err(IngestError::InvalidChunkConfig(
                "target_chars must be greater than zero".to_string(),
            ));
        }
        if self.overlap_chars >= self.target_chars {
            return Err(IngestError::InvalidChunkConfig(format!(
                "overlap_chars {} must be smaller than target_chars {}",
                self.overlap_chars, self.target_chars
            )));
        }
        Ok(())
    }
}

/// Collapses runs of spaces and tabs inside each line and drops blank lines.
///
/// Line breaks survive so the splitter can still use them as cut points.
pub fn normalize_whitespace(text: &str) -> String {
    text.lines()
        .map(|line| {
            line.replace('\u{a0}', " ")
                .split_whitespace()
                .collect::<Vec<_>>()
                .join(" ")
        })
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Splits `text` into overlapping fragments of roughly `target_chars` characters.
///
/// Each cut is moved back to the latest sentence end, newline or space found
/// around the nominal cut point. Consecutive fragments share `overlap_chars`
/// characters. Splitting always terminates, even for text without any break
/// candidates or for configs that [`ChunkingConfig::validate`] would reject.
pub fn split_text(text: &str, config: &ChunkingConfig) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    let len = chars.len();
    let target = config.target_chars.max(1);

    let mut fragments = Vec::new();
    let mut start = 0usize;

    while start < len {
        let nominal_end = start.saturating_add(target);
        let cut = if nominal_end.saturating_add(config.lookahead_chars) >= len {
            len
        } else {
            find_cut(&chars, start, nominal_end, config).unwrap_or(nominal_end)
        };

        let piece: String = chars[start..cut].iter().collect();
        let trimmed = piece.trim();
        if trimmed.chars().count() > config.min_chars {
            fragments.push(trimmed.to_string());
        }

        if cut >= len {
            break;
        }

        let next = cut.saturating_sub(config.overlap_chars);
        start = if next <= start { nominal_end } else { next };
    }

    fragments
}

/// Looks for the best break in `[nominal_end - lookback, nominal_end + lookahead)`,
/// restricted to cuts that still move the cursor forward once overlap is applied.
fn find_cut(
    chars: &[char],
    start: usize,
    nominal_end: usize,
    config: &ChunkingConfig,
) -> Option<usize> {
    let window_start = nominal_end
        .saturating_sub(config.lookback_chars)
        .max(start + config.overlap_chars + 1);
    let window_end = nominal_end
        .saturating_add(config.lookahead_chars)
        .min(chars.len());
    if window_start >= window_end {
        return None;
    }

    let window = &chars[window_start..window_end];

    let sentence_end = window
        .windows(2)
        .rposition(|pair| pair[0] == '.' && pair[1] == ' ');
    let newline = || window.iter().rposition(|ch| *ch == '\n');
    let space = || window.iter().rposition(|ch| *ch == ' ');

    sentence_end
        .or_else(newline)
        .or_else(space)
        .map(|offset| window_start + offset + 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Asserts the fragments, laid over `source` in order, leave no uncovered text.
    fn assert_covers(source: &str, fragments: &[String]) {
        let mut covered_to = 0usize;
        let mut search_from = 0usize;
        for fragment in fragments {
            let offset = source[search_from..]
                .find(fragment.as_str())
                .map(|found| found + search_from)
                .unwrap_or_else(|| panic!("fragment not found in order: {fragment:?}"));
            assert!(
                source[covered_to.min(offset)..offset].trim().is_empty(),
                "gap before fragment {fragment:?}"
            );
            covered_to = covered_to.max(offset + fragment.len());
            search_from = offset + fragment.chars().next().map_or(1, char::len_utf8);
        }
        assert!(source[covered_to..].trim().is_empty(), "uncovered tail");
    }

    fn sample_document(sentences: usize) -> String {
        (0..sentences)
            .map(|index| {
                format!("Sentence number {index} describes the pump calibration procedure in detail.")
            })
            .collect::<Vec<_>>()
            .join(" ")
    }

    #[test]
    fn whitespace_is_normalized_per_line() {
        let input = "A  \t  lot\n\n  of   spacing\u{a0}here ";
        assert_eq!(normalize_whitespace(input), "A lot\nof spacing here");
    }

    #[test]
    fn short_text_yields_single_fragment() {
        let text = "A short paragraph about hydraulics.";
        let fragments = split_text(text, &ChunkingConfig::default());
        assert_eq!(fragments, vec![text.to_string()]);
    }

    #[test]
    fn tiny_fragments_are_discarded() {
        assert!(split_text("   ok   ", &ChunkingConfig::default()).is_empty());
        assert!(split_text("", &ChunkingConfig::default()).is_empty());
    }

    #[test]
    fn small_window_example_covers_every_sentence() {
        let text = "Paris is the capital of France. Lyon is a major city.";
        let fragments = split_text(text, &ChunkingConfig::with_size(20, 5));

        assert!(fragments.len() >= 2, "got {fragments:?}");
        for fragment in &fragments {
            assert!(fragment.chars().count() <= 20 + 20, "{fragment:?} too long");
            assert!(fragment.chars().count() > 10);
        }
        let joined = fragments.join(" ");
        assert!(joined.contains("Paris is the capital of France."));
        assert!(joined.contains("Lyon is a major city."));
        assert_covers(text, &fragments);
    }

    #[test]
    fn cuts_land_on_sentence_boundaries() {
        let text = sample_document(40);
        let fragments = split_text(&text, &ChunkingConfig::default());

        assert!(fragments.len() > 1);
        for fragment in &fragments[..fragments.len() - 1] {
            assert!(fragment.ends_with('.'), "{fragment:?} should end a sentence");
        }
        assert_covers(&text, &fragments);
    }

    #[test]
    fn consecutive_fragments_overlap() {
        let text = sample_document(30);
        let config = ChunkingConfig::default();
        let fragments = split_text(&text, &config);

        for pair in fragments.windows(2) {
            let tail: String = pair[0]
                .chars()
                .rev()
                .take(20)
                .collect::<Vec<_>>()
                .into_iter()
                .rev()
                .collect();
            assert!(pair[1].contains(tail.trim()), "missing overlap between {pair:?}");
        }
    }

    #[test]
    fn text_without_break_candidates_terminates() {
        let text = "x".repeat(5_000);
        let fragments = split_text(&text, &ChunkingConfig::default());
        assert!(fragments.len() >= 8);
        assert!(fragments.iter().all(|fragment| fragment.len() <= 620));
        let total: usize = fragments.iter().map(String::len).sum();
        assert!(total >= text.len());
    }

    #[test]
    fn degenerate_overlap_still_terminates() {
        let config = ChunkingConfig::with_size(10, 50);
        assert!(config.validate().is_err());

        let fragments = split_text(&sample_document(5), &config);
        assert!(!fragments.is_empty());
    }

    #[test]
    fn splitting_is_deterministic() {
        let text = sample_document(25);
        let config = ChunkingConfig::default();
        assert_eq!(split_text(&text, &config), split_text(&text, &config));
    }

    #[test]
    fn newlines_are_preferred_over_spaces() {
        let mut text = "word ".repeat(100);
        text.push('\n');
        text.push_str(&"next ".repeat(100));
        let config = ChunkingConfig::with_size(520, 100);

        let fragments = split_text(&text, &config);
        assert!(fragments[0].ends_with("word"));
        assert!(!fragments[0].contains("next"));
    }

    #[test]
    fn multibyte_text_is_split_on_char_boundaries() {
        let text = "Überprüfung der Druckfestigkeit. ".repeat(60);
        let fragments = split_text(&text, &ChunkingConfig::default());
        assert!(fragments.len() > 1);
        assert!(fragments.iter().all(|fragment| text.contains(fragment.as_str())));
    }
}
