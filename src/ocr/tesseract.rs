//! Tesseract OCR backend: shells out to the `tesseract` CLI, same
//! subprocess-and-capture-stderr shape the corpus uses for its OCR and
//! rasterization backends.

use std::path::Path;
use std::process::Command;

use which::which;

use super::backend::{OcrBackend, OcrError, OcrOutput};

pub struct TesseractBackend;

impl TesseractBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Default for TesseractBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl OcrBackend for TesseractBackend {
    fn is_available(&self) -> bool {
        which("tesseract").is_ok()
    }

    fn availability_hint(&self) -> String {
        if which("tesseract").is_err() {
            "tesseract not installed. Install with: apt install tesseract-ocr".to_string()
        } else {
            "tesseract is available".to_string()
        }
    }

    fn recognize(&self, image_path: &Path, language: &str) -> Result<OcrOutput, OcrError> {
        let output = Command::new("tesseract")
            .arg(image_path)
            .arg("stdout")
            .args(["-l", language])
            .arg("tsv")
            .output();

        match output {
            Ok(output) if output.status.success() => {
                let tsv = String::from_utf8_lossy(&output.stdout);
                Ok(parse_tsv_output(&tsv))
            }
            Ok(output) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                Err(OcrError::RecognitionFailed(stderr.to_string()))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(
                OcrError::BackendNotAvailable("tesseract not found on PATH".to_string()),
            ),
            Err(e) => Err(OcrError::Io(e)),
        }
    }
}

/// Parses `tesseract ... tsv` output into recognized text plus a mean
/// per-page confidence, normalized to [0,1].
///
/// TSV columns are `level page_num block_num par_num line_num word_num
/// left top width height conf text`; only `level == 5` (word) rows carry
/// real text and a `conf` in `[0,100]`. Words are rejoined with spaces,
/// lines with newlines, tracked by `(block_num, par_num, line_num)`.
fn parse_tsv_output(tsv: &str) -> OcrOutput {
    let mut text = String::new();
    let mut confidences: Vec<f32> = Vec::new();
    let mut last_line_key: Option<(i64, i64, i64)> = None;

    for row in tsv.lines().skip(1) {
        let fields: Vec<&str> = row.split('\t').collect();
        if fields.len() < 12 {
            continue;
        }
        if fields[0] != "5" {
            continue;
        }
        let word = fields[11];
        if word.is_empty() {
            continue;
        }
        let line_key = (
            fields[2].parse().unwrap_or(0),
            fields[3].parse().unwrap_or(0),
            fields[4].parse().unwrap_or(0),
        );
        match last_line_key {
            Some(prev) if prev == line_key => text.push(' '),
            Some(_) => text.push('\n'),
            None => {}
        }
        last_line_key = Some(line_key);
        text.push_str(word);

        if let Ok(conf) = fields[10].parse::<f32>() {
            if conf >= 0.0 {
                confidences.push(conf / 100.0);
            }
        }
    }

    let confidence = if confidences.is_empty() {
        None
    } else {
        Some(confidences.iter().sum::<f32>() / confidences.len() as f32)
    };

    OcrOutput { text, confidence }
}

#[cfg(test)]
mod tests {
    use super::parse_tsv_output;

    #[test]
    fn parses_mean_word_confidence_and_reflows_lines() {
        let tsv = "level\tpage_num\tblock_num\tpar_num\tline_num\tword_num\tleft\ttop\twidth\theight\tconf\ttext\n\
                   1\t1\t0\t0\t0\t0\t0\t0\t100\t100\t-1\t\n\
                   5\t1\t1\t1\t1\t1\t0\t0\t10\t10\t92.5\tHello\n\
                   5\t1\t1\t1\t1\t2\t11\t0\t10\t10\t87.5\tworld\n\
                   5\t1\t1\t1\t2\t1\t0\t10\t10\t10\t60.0\tSecond\n";
        let output = parse_tsv_output(tsv);
        assert_eq!(output.text, "Hello world\nSecond");
        let confidence = output.confidence.unwrap();
        assert!((confidence - 0.8).abs() < 0.001, "confidence was {confidence}");
    }

    #[test]
    fn empty_output_yields_no_confidence() {
        let tsv = "level\tpage_num\tblock_num\tpar_num\tline_num\tword_num\tleft\ttop\twidth\theight\tconf\ttext\n";
        let output = parse_tsv_output(tsv);
        assert_eq!(output.text, "");
        assert!(output.confidence.is_none());
    }
}
