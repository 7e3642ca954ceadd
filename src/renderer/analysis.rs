//! Pre-render document analysis
//!
//! A byte-level scan that runs before any rendering is attempted. It does
//! not parse the document. Only bytes that are not a PDF at all are
//! rejected here; encryption is recorded as a hint, and whether a password
//! is actually required is decided by the page renderer when it loads the
//! document. The page count and content complexity are estimates used for
//! method selection until a loaded document reports its own.

use serde::{Deserialize, Serialize};

use crate::error::RenderError;

const HEADER: &[u8] = b"%PDF-";
const TRAILER: &[u8] = b"%%EOF";
/// The header may be preceded by a little junk
const HEADER_WINDOW: usize = 1024;

/// Estimated content complexity
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum ContentComplexity {
    #[default]
    Low,
    Medium,
    High,
}

/// What the renderer knows about a document before rendering it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentCharacteristics {
    pub size_bytes: u64,
    pub page_count: u32,
    /// An `/Encrypt` dictionary is present; many such files open without a password
    pub encrypted: bool,
    pub corrupted: bool,
    pub image_count: u32,
    pub font_count: u32,
    pub image_heavy: bool,
    pub complexity: ContentComplexity,
}

impl DocumentCharacteristics {
    /// Error that makes rendering pointless, if any
    pub fn rejection(&self) -> Option<RenderError> {
        self.corrupted.then(|| {
            RenderError::Corrupted("missing PDF header or end-of-file marker".to_string())
        })
    }

    pub fn size_mb(&self) -> f64 {
        self.size_bytes as f64 / (1024.0 * 1024.0)
    }
}

/// Byte-level document analyzer
#[derive(Debug, Clone, Copy, Default)]
pub struct DocumentAnalyzer;

impl DocumentAnalyzer {
    pub fn new() -> Self {
        Self
    }

    pub fn analyze(&self, data: &[u8]) -> DocumentCharacteristics {
        let header_region = &data[..data.len().min(HEADER_WINDOW)];
        // Junk after the last %%EOF is tolerated
        let corrupted = find(header_region, HEADER).is_none() || find(data, TRAILER).is_none();

        let page_count = count_page_objects(data).max(1);
        let image_count = count(data, b"/Subtype /Image") + count(data, b"/Subtype/Image");
        let font_count = count(data, b"/Type /Font") + count(data, b"/Type/Font");
        let image_heavy = image_count >= page_count;

        let per_page = (image_count + font_count) as f64 / page_count as f64;
        let complexity = if per_page >= 4.0 || (image_heavy && image_count > 50) {
            ContentComplexity::High
        } else if per_page >= 1.0 {
            ContentComplexity::Medium
        } else {
            ContentComplexity::Low
        };

        let characteristics = DocumentCharacteristics {
            size_bytes: data.len() as u64,
            page_count,
            encrypted: find(data, b"/Encrypt").is_some(),
            corrupted,
            image_count,
            font_count,
            image_heavy,
            complexity,
        };

        tracing::debug!(
            size = characteristics.size_bytes,
            pages = characteristics.page_count,
            complexity = ?characteristics.complexity,
            corrupted = characteristics.corrupted,
            encrypted = characteristics.encrypted,
            "Document analyzed"
        );

        characteristics
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn count(haystack: &[u8], needle: &[u8]) -> u32 {
    if haystack.len() < needle.len() {
        return 0;
    }
    haystack
        .windows(needle.len())
        .filter(|w| *w == needle)
        .count() as u32
}

/// Count `/Type /Page` and `/Type/Page` that are not `/Pages`
fn count_page_objects(data: &[u8]) -> u32 {
    [b"/Type /Page".as_slice(), b"/Type/Page".as_slice()]
        .iter()
        .map(|needle| {
            data.windows(needle.len())
                .enumerate()
                .filter(|(i, w)| *w == *needle && data.get(i + needle.len()) != Some(&b's'))
                .count() as u32
        })
        .sum()
}

#[cfg(test)]
pub(crate) mod fixtures {
    /// Minimal PDF-shaped bytes with the given number of pages and images
    pub fn pdf_bytes(pages: u32, images: u32) -> Vec<u8> {
        let mut out = String::from("%PDF-1.7\n1 0 obj << /Type /Catalog /Pages 2 0 R >> endobj\n");
        out.push_str(&format!("2 0 obj << /Type /Pages /Count {} >> endobj\n", pages));
        for i in 0..pages {
            out.push_str(&format!(
                "{} 0 obj << /Type /Page /Parent 2 0 R /MediaBox [0 0 612 792] >> endobj\n",
                i + 3
            ));
        }
        for i in 0..images {
            out.push_str(&format!(
                "{} 0 obj << /Type /XObject /Subtype /Image /Width 10 /Height 10 >> endobj\n",
                i + 3 + pages
            ));
        }
        out.push_str("trailer << /Root 1 0 R >>\n%%EOF\n");
        out.into_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::pdf_bytes;
    use super::*;

    #[test]
    fn test_counts_pages_not_page_tree() {
        let characteristics = DocumentAnalyzer::new().analyze(&pdf_bytes(7, 0));
        assert_eq!(characteristics.page_count, 7);
        assert!(!characteristics.corrupted);
        assert!(!characteristics.encrypted);
        assert_eq!(characteristics.complexity, ContentComplexity::Low);
        assert!(characteristics.rejection().is_none());
    }

    #[test]
    fn test_image_heavy_document() {
        let characteristics = DocumentAnalyzer::new().analyze(&pdf_bytes(2, 10));
        assert!(characteristics.image_heavy);
        assert_eq!(characteristics.complexity, ContentComplexity::High);
    }

    #[test]
    fn test_missing_trailer_is_corrupted() {
        let mut data = pdf_bytes(1, 0);
        data.truncate(data.len() - 7);
        let characteristics = DocumentAnalyzer::new().analyze(&data);
        assert!(characteristics.corrupted);
        assert_eq!(
            characteristics.rejection().map(|e| e.kind()),
            Some(crate::error::ErrorKind::PdfCorrupted)
        );
    }

    #[test]
    fn test_not_a_pdf() {
        let characteristics = DocumentAnalyzer::new().analyze(b"<html>expired</html>");
        assert!(characteristics.corrupted);
        assert_eq!(characteristics.page_count, 1);
    }

    #[test]
    fn test_encryption_is_only_a_hint() {
        let mut data = pdf_bytes(1, 0);
        let trailer = b"trailer << /Root 1 0 R /Encrypt 9 0 R >>\n%%EOF\n";
        let cut = data.len() - b"trailer << /Root 1 0 R >>\n%%EOF\n".len();
        data.truncate(cut);
        data.extend_from_slice(trailer);

        let characteristics = DocumentAnalyzer::new().analyze(&data);
        assert!(characteristics.encrypted);
        assert!(!characteristics.corrupted);
        assert!(characteristics.rejection().is_none());
    }

    #[test]
    fn test_junk_after_trailer_is_tolerated() {
        let mut data = pdf_bytes(2, 0);
        data.extend(std::iter::repeat(b'\0').take(4096));

        let characteristics = DocumentAnalyzer::new().analyze(&data);
        assert!(!characteristics.corrupted);
        assert!(characteristics.rejection().is_none());
        assert_eq!(characteristics.page_count, 2);
    }
}
