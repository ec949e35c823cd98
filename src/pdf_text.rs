//! In-process PDF parsing and text-based/scanned classification (the
//! first stage of component F). Thresholds and rule ordering follow the
//! classification table exactly; the overall shape of "inspect embedded
//! text density before deciding whether OCR is needed" is grounded on the
//! corpus's native-text-density heuristic for skipping unnecessary OCR.

use std::path::Path;

use regex::Regex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PdfTextError {
    #[error("PDF is unparseable, empty, or password protected: {0}")]
    InvalidInput(String),
}

#[derive(Debug, Clone)]
pub struct ParsedPdf {
    /// Per-page extracted text, in page order. Length is the page count.
    pub pages: Vec<String>,
}

impl ParsedPdf {
    pub fn page_count(&self) -> u32 {
        self.pages.len() as u32
    }

    pub fn full_text(&self) -> String {
        self.pages.join("\n\x0c\n")
    }
}

/// Parses a PDF in-process, extracting embedded text per page and the
/// page count. Treats a password-protected/unparseable file as
/// `ConversionInvalidInput`; callers decide whether to retry with a
/// password, which this crate does not support (no spec mention).
pub fn parse_pdf(path: &Path) -> Result<ParsedPdf, PdfTextError> {
    match pdf_extract::extract_text_by_pages(path) {
        Ok(pages) => Ok(ParsedPdf { pages }),
        Err(e) => Err(PdfTextError::InvalidInput(e.to_string())),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    TextBased,
    Scanned,
}

#[derive(Debug, Clone)]
pub struct ClassificationResult {
    pub classification: Classification,
    pub reason: &'static str,
    pub word_count: usize,
    pub char_count: usize,
    pub words_per_page: f64,
    pub chars_per_page: f64,
}

fn only_digits() -> &'static Regex {
    static RE: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[0-9\s]*[0-9][0-9\s]*$").unwrap())
}

fn only_whitespace() -> &'static Regex {
    static RE: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*$").unwrap())
}

fn only_non_wordchars() -> &'static Regex {
    static RE: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[^\w]*$").unwrap())
}

/// Classifies extracted text per §4.F's ordered rule list: the first
/// matching rule wins and supplies the reason. Adding characters to the
/// text never flips a text-based verdict to scanned, since every rule
/// checks either a floor on `C`/`W`/densities or a suspicious-pattern
/// match against the *whole* string — appending real words only raises
/// `C`/`W`/densities and can only remove a whole-string pattern match.
pub fn classify(text: &str, page_count: u32) -> ClassificationResult {
    let word_count = text.split_whitespace().count();
    let char_count = text.chars().count();
    let pages = page_count.max(1) as f64;
    let words_per_page = word_count as f64 / pages;
    let chars_per_page = char_count as f64 / pages;

    let reason = if char_count == 0 {
        Some("no extractable text")
    } else if word_count < 20 {
        Some("too few total words")
    } else if words_per_page < 50.0 {
        Some("low word density")
    } else if chars_per_page < 200.0 {
        Some("low character density")
    } else if only_digits().is_match(text) || only_whitespace().is_match(text) || only_non_wordchars().is_match(text)
    {
        Some("suspicious pattern")
    } else {
        None
    };

    match reason {
        Some(reason) => ClassificationResult {
            classification: Classification::Scanned,
            reason,
            word_count,
            char_count,
            words_per_page,
            chars_per_page,
        },
        None => ClassificationResult {
            classification: Classification::TextBased,
            reason: "sufficient content",
            word_count,
            char_count,
            words_per_page,
            chars_per_page,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SUFFICIENT: &str = "Hello world. This document has well over twenty words to clear \
        the density thresholds handily and so on and so forth, again and again, repeating \
        content to reach the required character count per page for a single-page document \
        under this classifier's thresholds, padding further still so the floor is cleared.";

    #[test]
    fn empty_text_is_scanned_no_extractable_text() {
        let result = classify("", 3);
        assert_eq!(result.classification, Classification::Scanned);
        assert_eq!(result.reason, "no extractable text");
    }

    #[test]
    fn too_few_words_is_scanned() {
        let result = classify("one two three", 1);
        assert_eq!(result.classification, Classification::Scanned);
        assert_eq!(result.reason, "too few total words");
    }

    #[test]
    fn low_word_density_across_many_pages() {
        let text = "word ".repeat(25);
        let result = classify(&text, 10);
        assert_eq!(result.classification, Classification::Scanned);
        assert_eq!(result.reason, "low word density");
    }

    #[test]
    fn only_digits_is_suspicious_pattern() {
        // Enough words/chars/density to clear the earlier floors, but the
        // whole string is digits and whitespace.
        let text = "1234567890 ".repeat(60);
        let result = classify(&text, 1);
        assert_eq!(result.classification, Classification::Scanned);
        assert_eq!(result.reason, "suspicious pattern");
    }

    #[test]
    fn sufficient_content_is_text_based() {
        let result = classify(SUFFICIENT, 1);
        assert_eq!(result.classification, Classification::TextBased);
        assert_eq!(result.reason, "sufficient content");
    }

    #[test]
    fn classification_is_monotone_under_appended_words() {
        let base = classify(SUFFICIENT, 1);
        assert_eq!(base.classification, Classification::TextBased);
        let extended = format!("{SUFFICIENT} Extra words appended at the end of the document.");
        let after = classify(&extended, 1);
        assert_eq!(after.classification, Classification::TextBased);
    }
}
