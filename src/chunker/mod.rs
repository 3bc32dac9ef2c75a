//! Size-bounded splitting and truncation of text.
//!
//! Sizes are measured in *units*, an estimate of the backend's tokens derived
//! from a configurable characters-per-unit ratio. The estimate is an
//! approximation; it never calls a real tokenizer.
//!
//! Materialized repositories separate files with `# File: <path>` header
//! lines. With file sections enabled the chunker cuts at those headers
//! wherever it can, packing small files together, and every piece of a file
//! that had to be split starts with a copy of the file's header line.

use crate::error::ChunkingError;
use crate::models::Chunk;

/// Characters per unit used when none is configured.
pub const DEFAULT_CHARS_PER_UNIT: f64 = 4.0;

/// Line prefix that opens a file section in materialized repository text.
pub const FILE_HEADER: &str = "# File: ";

// Absorbs float error when dividing an exact multiple back into units.
const EPSILON: f64 = 1e-9;

/// Converts between characters and estimated backend units.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UnitEstimator {
    chars_per_unit: f64,
}

impl Default for UnitEstimator {
    fn default() -> Self {
        Self {
            chars_per_unit: DEFAULT_CHARS_PER_UNIT,
        }
    }
}

impl UnitEstimator {
    /// Create an estimator. Non-positive or non-finite ratios fall back to the default.
    pub fn new(chars_per_unit: f64) -> Self {
        if chars_per_unit.is_finite() && chars_per_unit > 0.0 {
            Self { chars_per_unit }
        } else {
            Self::default()
        }
    }

    /// Estimated units of `text`.
    pub fn units(&self, text: &str) -> usize {
        self.units_for_chars(text.chars().count())
    }

    pub fn units_for_chars(&self, chars: usize) -> usize {
        ((chars as f64) / self.chars_per_unit - EPSILON).ceil().max(0.0) as usize
    }

    /// Largest character count that stays within `units`.
    pub fn chars_for_units(&self, units: usize) -> usize {
        ((units as f64) * self.chars_per_unit + EPSILON).floor() as usize
    }
}

/// A prefix of a text cut to a budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Truncated<'a> {
    pub text: &'a str,
    /// Content was dropped.
    pub lossy: bool,
}

/// Splits and truncates text against unit budgets.
#[derive(Debug, Clone, Copy, Default)]
pub struct Chunker {
    estimator: UnitEstimator,
    file_sections: bool,
}

/// Byte offsets of one `# File:` section.
#[derive(Debug, Clone, Copy)]
struct Section {
    start: usize,
    body: usize,
}

/// One chunk before materialization.
struct Span<'a> {
    header: Option<&'a str>,
    start: usize,
    fresh: usize,
    end: usize,
}

impl Chunker {
    pub fn new(estimator: UnitEstimator) -> Self {
        Self {
            estimator,
            file_sections: false,
        }
    }

    /// Cut at `# File:` headers and repeat the header in every piece of a split file.
    pub fn with_file_sections(mut self, enabled: bool) -> Self {
        self.file_sections = enabled;
        self
    }

    pub fn estimator(&self) -> &UnitEstimator {
        &self.estimator
    }

    /// Split `text` into chunks of at most `unit_budget` units.
    ///
    /// Each chunk after the first starts with the `overlap` units of text that
    /// precede its fresh content. Splits land after the last newline in the
    /// window, else after the last whitespace, else on a character boundary.
    ///
    /// With file sections, a split lands on the last file header in the
    /// window when there is one. Overlap never reaches back into a previous
    /// file, and a chunk that continues a file carries the file's header line
    /// in front of its overlap when the budget leaves room for it. The
    /// carried text is counted in [`Chunk::overlap_len`].
    pub fn chunk(
        &self,
        text: &str,
        unit_budget: usize,
        overlap: usize,
    ) -> Result<Vec<Chunk>, ChunkingError> {
        if text.is_empty() {
            return Ok(Vec::new());
        }

        let char_budget = self.char_budget(unit_budget)?;
        let overlap_chars = self.estimator.chars_for_units(overlap);
        if overlap >= unit_budget || overlap_chars >= char_budget {
            return Err(ChunkingError::OverlapTooLarge {
                overlap,
                budget: unit_budget,
            });
        }

        let sections = if self.file_sections {
            find_sections(text)
        } else {
            Vec::new()
        };

        let mut spans: Vec<Span> = Vec::new();
        let mut pos = 0;

        while pos < text.len() {
            let mut start = back_up(text, pos, overlap_chars);
            let mut header = None;

            if let Some(section) = section_at(&sections, pos) {
                if pos == section.start {
                    start = pos;
                } else {
                    start = start.max(section.body.min(pos));
                    let line = &text[section.start..section.body];
                    let needed = line.chars().count() + text[start..pos].chars().count();
                    if line.ends_with('\n') && needed < char_budget {
                        header = Some(line);
                    }
                }
            }

            let carried =
                header.map_or(0, |h| h.chars().count()) + text[start..pos].chars().count();
            let window_end = advance(text, pos, char_budget - carried);

            let end = if window_end == text.len() {
                window_end
            } else if let Some(boundary) = last_section_start(&sections, pos, window_end) {
                boundary
            } else {
                split_point(text, pos, window_end)
            };

            spans.push(Span {
                header,
                start,
                fresh: pos,
                end,
            });
            pos = end;
        }

        let total = spans.len();
        Ok(spans
            .into_iter()
            .enumerate()
            .map(|(ordinal, span)| {
                let header = span.header.unwrap_or_default();
                Chunk {
                    text: format!("{}{}", header, &text[span.start..span.end]),
                    ordinal,
                    total,
                    overlap_len: header.len() + (span.fresh - span.start),
                }
            })
            .collect())
    }

    /// Keep the first `unit_budget` units of `text`.
    pub fn truncate<'a>(
        &self,
        text: &'a str,
        unit_budget: usize,
    ) -> Result<Truncated<'a>, ChunkingError> {
        let char_budget = self.char_budget(unit_budget)?;
        let end = advance(text, 0, char_budget);
        Ok(Truncated {
            text: &text[..end],
            lossy: end < text.len(),
        })
    }

    /// Characters available in `unit_budget`; fails when not even one fits.
    pub fn char_budget(&self, unit_budget: usize) -> Result<usize, ChunkingError> {
        let chars = self.estimator.chars_for_units(unit_budget);
        if unit_budget == 0 || chars == 0 {
            return Err(ChunkingError::BudgetTooSmall {
                budget: unit_budget,
            });
        }
        Ok(chars)
    }
}

/// Byte index `n` characters after `pos`, clamped to the end.
fn advance(text: &str, pos: usize, n: usize) -> usize {
    text[pos..]
        .char_indices()
        .nth(n)
        .map(|(i, _)| pos + i)
        .unwrap_or(text.len())
}

/// Byte index up to `n` characters before `pos`.
fn back_up(text: &str, pos: usize, n: usize) -> usize {
    text[..pos]
        .char_indices()
        .rev()
        .take(n)
        .last()
        .map(|(i, _)| i)
        .unwrap_or(pos)
}

fn find_sections(text: &str) -> Vec<Section> {
    let mut sections = Vec::new();
    let mut line_start = 0;
    for line in text.split_inclusive('\n') {
        if line.starts_with(FILE_HEADER) {
            sections.push(Section {
                start: line_start,
                body: line_start + line.len(),
            });
        }
        line_start += line.len();
    }
    sections
}

/// The file section containing `pos`; `None` in the preamble.
fn section_at(sections: &[Section], pos: usize) -> Option<Section> {
    let opened = sections.partition_point(|s| s.start <= pos);
    opened.checked_sub(1).map(|i| sections[i])
}

/// Start of the last section beginning in `(pos, window_end]`.
fn last_section_start(sections: &[Section], pos: usize, window_end: usize) -> Option<usize> {
    let opened = sections.partition_point(|s| s.start <= window_end);
    opened
        .checked_sub(1)
        .map(|i| sections[i].start)
        .filter(|&start| start > pos)
}

fn split_point(text: &str, pos: usize, window_end: usize) -> usize {
    let window = &text[pos..window_end];

    if let Some(i) = window.rfind('\n') {
        return pos + i + 1;
    }

    if let Some((i, c)) = window.char_indices().rev().find(|(_, c)| c.is_whitespace()) {
        return pos + i + c.len_utf8();
    }

    window_end
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chars_chunker() -> Chunker {
        Chunker::new(UnitEstimator::new(1.0))
    }

    fn sample_text() -> String {
        let mut text = String::new();
        for i in 0..40 {
            text.push_str(&format!("line {} holds some words ünïcödé ✓\n", i));
        }
        text.push_str("averyveryverylongtokenwithoutanybreaksatallthatmustbehardcut");
        text
    }

    #[test]
    fn test_estimator_rounds_up() {
        let est = UnitEstimator::new(4.0);
        assert_eq!(est.units(""), 0);
        assert_eq!(est.units("abcd"), 1);
        assert_eq!(est.units("abcde"), 2);
        assert_eq!(est.chars_for_units(3), 12);
    }

    #[test]
    fn test_estimator_rejects_bad_ratio() {
        assert_eq!(UnitEstimator::new(0.0), UnitEstimator::default());
        assert_eq!(UnitEstimator::new(f64::NAN), UnitEstimator::default());
    }

    #[test]
    fn test_empty_input_yields_no_chunks() {
        assert!(chars_chunker().chunk("", 10, 0).unwrap().is_empty());
    }

    #[test]
    fn test_zero_overlap_concatenates_to_original() {
        let text = sample_text();
        for budget in [7, 16, 33, 100, 5000] {
            let chunks = chars_chunker().chunk(&text, budget, 0).unwrap();
            let joined: String = chunks.iter().map(|c| c.text.as_str()).collect();
            assert_eq!(joined, text, "budget {}", budget);
        }
    }

    #[test]
    fn test_overlap_reconstructs_after_dropping_prefix() {
        let text = sample_text();
        for (budget, overlap) in [(20, 5), (64, 16), (9, 8)] {
            let chunks = chars_chunker().chunk(&text, budget, overlap).unwrap();
            assert_eq!(chunks[0].overlap_len, 0);
            let rebuilt: String = chunks.iter().map(|c| c.fresh_text()).collect();
            assert_eq!(rebuilt, text);
            for pair in chunks.windows(2) {
                assert!(pair[0].text.ends_with(&pair[1].text[..pair[1].overlap_len]));
            }
        }
    }

    #[test]
    fn test_chunks_never_exceed_budget() {
        let text = sample_text();
        for chars_per_unit in [1.0, 3.0, 3.7, 4.0] {
            let chunker = Chunker::new(UnitEstimator::new(chars_per_unit));
            for budget in [1, 2, 5, 13, 50] {
                for overlap in [0, budget / 2] {
                    let chunks = chunker.chunk(&text, budget, overlap).unwrap();
                    for c in &chunks {
                        assert!(chunker.estimator().units(&c.text) <= budget);
                        assert_eq!(c.total, chunks.len());
                    }
                }
            }
        }
    }

    #[test]
    fn test_prefers_line_boundaries() {
        let text = "aaaa\nbbbb\ncccc\n";
        let chunks = chars_chunker().chunk(text, 12, 0).unwrap();
        assert_eq!(chunks[0].text, "aaaa\nbbbb\n");
        assert_eq!(chunks[1].text, "cccc\n");
    }

    #[test]
    fn test_falls_back_to_whitespace_then_hard_cut() {
        let chunks = chars_chunker().chunk("alpha beta gamma", 8, 0).unwrap();
        assert_eq!(chunks[0].text, "alpha ");

        let chunks = chars_chunker().chunk("abcdefghij", 4, 0).unwrap();
        let texts: Vec<_> = chunks.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(texts, vec!["abcd", "efgh", "ij"]);
    }

    #[test]
    fn test_hard_cut_respects_char_boundaries() {
        let text = "日本語のテキスト";
        let chunks = chars_chunker().chunk(text, 3, 0).unwrap();
        assert_eq!(chunks[0].text, "日本語");
        assert_eq!(chunks.len(), 3);
    }

    #[test]
    fn test_chunking_is_deterministic() {
        let text = sample_text();
        let a = chars_chunker().chunk(&text, 30, 4).unwrap();
        let b = chars_chunker().chunk(&text, 30, 4).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_invalid_budgets() {
        assert_eq!(
            chars_chunker().chunk("abc", 0, 0),
            Err(ChunkingError::BudgetTooSmall { budget: 0 })
        );
        assert_eq!(
            chars_chunker().chunk("abc", 4, 4),
            Err(ChunkingError::OverlapTooLarge {
                overlap: 4,
                budget: 4
            })
        );
        let tiny = Chunker::new(UnitEstimator::new(0.5));
        assert_eq!(
            tiny.chunk("abc", 1, 0),
            Err(ChunkingError::BudgetTooSmall { budget: 1 })
        );
    }

    fn repository() -> String {
        let mut text = String::from("Repository: demo\n\n");
        text.push_str("# File: src/lib.rs\npub mod a;\npub mod b;\n");
        text.push_str("# File: src/a.rs\n");
        for i in 0..12 {
            text.push_str(&format!("fn a{}() -> u32 {{ {} }}\n", i, i));
        }
        text.push_str("# File: src/b.rs\nfn b() {}\n");
        text.push_str("# File: README.md\nA small demo.\n");
        text
    }

    fn section_chunker() -> Chunker {
        chars_chunker().with_file_sections(true)
    }

    #[test]
    fn test_file_sections_keep_size_and_reconstruct() {
        let text = repository();
        for (budget, overlap) in [(40, 0), (60, 0), (60, 10), (120, 30), (5000, 0)] {
            let chunks = section_chunker().chunk(&text, budget, overlap).unwrap();
            let rebuilt: String = chunks.iter().map(|c| c.fresh_text()).collect();
            assert_eq!(rebuilt, text, "budget {} overlap {}", budget, overlap);
            for c in &chunks {
                assert!(c.text.chars().count() <= budget, "{:?}", c.text);
            }
        }
    }

    #[test]
    fn test_file_sections_cut_at_headers() {
        let text = repository();
        let chunks = section_chunker().chunk(&text, 60, 0).unwrap();

        // Preamble and the first small file share a chunk; the large file starts fresh.
        assert_eq!(
            chunks[0].text,
            "Repository: demo\n\n# File: src/lib.rs\npub mod a;\npub mod b;\n"
        );
        assert!(chunks[1].text.starts_with("# File: src/a.rs\nfn a0()"));
        assert_eq!(chunks[1].overlap_len, 0);

        let small_files = chunks.last().unwrap();
        assert_eq!(
            small_files.text,
            "# File: src/b.rs\nfn b() {}\n# File: README.md\nA small demo.\n"
        );
        assert_eq!(small_files.overlap_len, 0);
    }

    #[test]
    fn test_split_file_pieces_repeat_header() {
        let text = repository();
        let chunks = section_chunker().chunk(&text, 60, 8).unwrap();

        let pieces: Vec<_> = chunks
            .iter()
            .filter(|c| c.fresh_text().contains("fn a"))
            .collect();
        assert!(pieces.len() > 1);
        for piece in &pieces {
            assert!(piece.text.starts_with("# File: src/a.rs\n"), "{:?}", piece.text);
        }
        for piece in &pieces[1..] {
            let carried = &piece.text[..piece.overlap_len];
            assert!(carried.len() > "# File: src/a.rs\n".len());
            assert!(!carried.contains("src/lib.rs"));
        }
    }

    #[test]
    fn test_file_sections_without_headers_match_plain_split() {
        let text = sample_text();
        assert_eq!(
            section_chunker().chunk(&text, 30, 4).unwrap(),
            chars_chunker().chunk(&text, 30, 4).unwrap()
        );
    }

    #[test]
    fn test_header_dropped_when_budget_too_small() {
        let text = "# File: a/very/long/path/name.rs\nxxxxxxxxxxxxxxxxxxxxxxxx\n";
        let chunks = section_chunker().chunk(text, 10, 0).unwrap();
        let rebuilt: String = chunks.iter().map(|c| c.fresh_text()).collect();
        assert_eq!(rebuilt, text);
        assert!(chunks.iter().all(|c| c.text.chars().count() <= 10));
    }

    #[test]
    fn test_truncate_is_prefix_within_budget() {
        let chunker = Chunker::new(UnitEstimator::new(4.0));
        let text = sample_text();
        let cut = chunker.truncate(&text, 10).unwrap();
        assert!(cut.lossy);
        assert!(text.starts_with(cut.text));
        assert!(chunker.estimator().units(cut.text) <= 10);
        assert_eq!(cut.text.chars().count(), 40);

        let whole = chunker.truncate("short", 10).unwrap();
        assert!(!whole.lossy);
        assert_eq!(whole.text, "short");
    }
}
