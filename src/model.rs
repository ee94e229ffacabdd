//! The canonical OCR result model.
//!
//! Every backend is normalized into [`RecognitionOutput`], and the
//! orchestrator assembles those into [`PageResult`]s and [`BatchResult`]s.

use image::DynamicImage;
use schemars::JsonSchema;

use crate::prelude::*;

/// A page image, ready for OCR.
pub struct PageImage {
    /// 0-based page index, unique within the source document.
    pub index: usize,

    /// The decoded page.
    pub image: DynamicImage,
}

/// An axis-aligned box in the pixel space of the preprocessed image.
#[derive(Clone, Copy, Debug, Default, Deserialize, JsonSchema, PartialEq, Eq, Serialize)]
pub struct BoundingBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl BoundingBox {
    /// Create a new bounding box.
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// The area of this box, in pixels.
    pub fn area(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }

    /// Build the smallest box containing a set of (possibly rotated) points.
    ///
    /// Negative coordinates are clamped to 0. Returns `None` for an empty
    /// point set.
    pub fn from_points(points: &[(f64, f64)]) -> Option<Self> {
        let first = points.first()?;
        let (mut min_x, mut min_y, mut max_x, mut max_y) =
            (first.0, first.1, first.0, first.1);
        for &(x, y) in &points[1..] {
            min_x = min_x.min(x);
            min_y = min_y.min(y);
            max_x = max_x.max(x);
            max_y = max_y.max(y);
        }
        let clamp = |v: f64| v.max(0.0).round() as u32;
        let (x, y) = (clamp(min_x), clamp(min_y));
        Some(Self {
            x,
            y,
            width: clamp(max_x).saturating_sub(x),
            height: clamp(max_y).saturating_sub(y),
        })
    }

    /// Shift this box by an offset, e.g. from region to page coordinates.
    pub fn offset(self, dx: u32, dy: u32) -> Self {
        Self {
            x: self.x + dx,
            y: self.y + dy,
            ..self
        }
    }
}

/// One recognized span of text (a word or a line, depending on the backend).
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct TextFragment {
    /// The recognized text.
    pub text: String,

    /// Where it was found.
    pub bbox: BoundingBox,

    /// Confidence in `[0, 100]`, if the backend reported one.
    pub confidence: Option<f64>,
}

/// The canonical result every backend is normalized into.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RecognitionOutput {
    /// Merged text for the page (or region).
    pub text: String,

    /// Mean of the available fragment confidences.
    pub confidence: Option<f64>,

    /// Fragments, in backend emission order.
    pub fragments: Vec<TextFragment>,
}

impl RecognitionOutput {
    /// Build an output from fragments and merged text, computing the overall
    /// confidence from the fragments.
    pub fn from_fragments(text: String, fragments: Vec<TextFragment>) -> Self {
        let confidence = overall_confidence(fragments.iter().map(|f| f.confidence));
        Self {
            text,
            confidence,
            fragments,
        }
    }
}

/// OCR output for a single page.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct PageResult {
    /// 0-based page index.
    pub page: usize,

    /// Merged page text.
    pub text: String,

    /// Mean fragment confidence, if any fragment had one.
    pub confidence: Option<f64>,

    /// Recognized fragments, in reading order as reported by the backend.
    pub boxes: Vec<TextFragment>,
}

impl PageResult {
    /// Wrap a [`RecognitionOutput`] for a given page.
    pub fn from_output(page: usize, output: RecognitionOutput) -> Self {
        Self {
            page,
            text: output.text,
            confidence: output.confidence,
            boxes: output.fragments,
        }
    }
}

/// OCR output for one document.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct BatchResult {
    /// The input document.
    pub source: PathBuf,

    /// The backend used.
    pub engine: String,

    /// The languages requested.
    pub languages: Vec<String>,

    /// Number of pages in the document, including any skipped because of
    /// `--max-pages`.
    pub total_pages: usize,

    /// One result per page, in page order.
    pub pages: Vec<PageResult>,
}

impl BatchResult {
    /// Return an error describing skipped pages, if any were skipped.
    pub fn check_complete(&self) -> Result<()> {
        if self.pages.len() < self.total_pages {
            Err(anyhow!(
                "Only {}/{} pages processed (because of --max-pages)",
                self.pages.len(),
                self.total_pages
            ))
        } else {
            Ok(())
        }
    }

    /// The text of every page, joined with blank lines.
    pub fn full_text(&self) -> String {
        self.pages
            .iter()
            .map(|p| p.text.as_str())
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

/// Arithmetic mean of the confidences that are present.
///
/// Missing values are skipped, not counted as zero.
pub fn overall_confidence(confidences: impl IntoIterator<Item = Option<f64>>) -> Option<f64> {
    let (sum, count) = confidences
        .into_iter()
        .flatten()
        .fold((0.0, 0usize), |(sum, count), c| (sum + c, count + 1));
    if count == 0 {
        None
    } else {
        Some(sum / count as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overall_confidence_skips_missing_values() {
        assert_eq!(
            overall_confidence([Some(80.0), None, Some(60.0)]),
            Some(70.0)
        );
        assert_eq!(overall_confidence([None, None]), None);
        assert_eq!(overall_confidence([]), None);
    }

    #[test]
    fn quad_is_converted_to_enclosing_box() {
        let quad = [(10.0, 10.0), (50.0, 10.0), (50.0, 30.0), (10.0, 30.0)];
        assert_eq!(
            BoundingBox::from_points(&quad),
            Some(BoundingBox::new(10, 10, 40, 20))
        );
    }

    #[test]
    fn rotated_quad_uses_extremes_and_clamps_negatives() {
        let quad = [(-3.0, 12.0), (40.2, 5.0), (44.0, 25.6), (2.0, 31.0)];
        assert_eq!(
            BoundingBox::from_points(&quad),
            Some(BoundingBox::new(0, 5, 44, 26))
        );
        assert_eq!(BoundingBox::from_points(&[]), None);
    }

    #[test]
    fn batch_result_serializes_in_the_documented_shape() -> Result<()> {
        let batch = BatchResult {
            source: PathBuf::from("scan.png"),
            engine: "tesseract".to_owned(),
            languages: vec!["pol".to_owned(), "eng".to_owned()],
            total_pages: 1,
            pages: vec![PageResult {
                page: 0,
                text: "Hi".to_owned(),
                confidence: Some(91.5),
                boxes: vec![TextFragment {
                    text: "Hi".to_owned(),
                    bbox: BoundingBox::new(1, 2, 3, 4),
                    confidence: Some(91.5),
                }],
            }],
        };
        let value = serde_json::to_value(&batch)?;
        assert_eq!(
            value,
            serde_json::json!({
                "source": "scan.png",
                "engine": "tesseract",
                "languages": ["pol", "eng"],
                "total_pages": 1,
                "pages": [{
                    "page": 0,
                    "text": "Hi",
                    "confidence": 91.5,
                    "boxes": [{
                        "text": "Hi",
                        "bbox": {"x": 1, "y": 2, "width": 3, "height": 4},
                        "confidence": 91.5,
                    }],
                }],
            })
        );
        Ok(())
    }

    #[test]
    fn skipped_pages_make_a_batch_incomplete() {
        let page = PageResult {
            page: 0,
            text: String::new(),
            confidence: None,
            boxes: vec![],
        };
        let mut batch = BatchResult {
            source: PathBuf::from("long.pdf"),
            engine: "tesseract".to_owned(),
            languages: vec!["eng".to_owned()],
            total_pages: 3,
            pages: vec![page],
        };
        let err = batch.check_complete().unwrap_err();
        assert_eq!(
            err.to_string(),
            "Only 1/3 pages processed (because of --max-pages)"
        );

        batch.total_pages = 1;
        assert!(batch.check_complete().is_ok());
    }
}
