//! PDF-page-to-image conversion, shared by the conversion gate and any OCR
//! backend that needs to locate a rasterized page file on disk.

use std::path::{Path, PathBuf};

/// `pdftoppm` names files `page-<n>.<ext>` with a variable padding width
/// depending on total page count; search the plausible widths.
pub fn find_page_image(dir: &Path, page_num: u32, ext: &str) -> Option<PathBuf> {
    for digits in [1, 2, 3, 4] {
        let filename = format!("page-{:0width$}.{ext}", page_num, width = digits);
        let path = dir.join(&filename);
        if path.exists() {
            return Some(path);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn not_found_returns_none() {
        let dir = tempdir().unwrap();
        assert!(find_page_image(dir.path(), 1, "png").is_none());
    }

    #[test]
    fn finds_zero_padded_name() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("page-01.png");
        std::fs::write(&path, b"fake").unwrap();
        assert_eq!(find_page_image(dir.path(), 1, "png"), Some(path));
    }

    #[test]
    fn finds_three_digit_padding() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("page-001.png");
        std::fs::write(&path, b"fake").unwrap();
        assert_eq!(find_page_image(dir.path(), 1, "png"), Some(path));
    }
}
