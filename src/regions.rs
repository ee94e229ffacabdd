//! Text region detection.
//!
//! A region detector proposes boxes that probably contain text, so a page can
//! be recognized one region at a time. There are two strategies:
//!
//! - [`ContourRegionDetector`] binarizes the page, smears nearby glyphs
//!   together with a dilation, and boxes the outer contours.
//! - [`LearnedRegionDetector`] asks EasyOCR where the text is.
//!
//! Both return boxes sorted top to bottom, then left to right.

use std::sync::Arc;

use image::{DynamicImage, GrayImage, Luma, imageops};
use imageproc::contours::{BorderType, find_contours};

use crate::{
    async_utils::blocking_iter_streams::spawn_blocking_propagating_panics,
    backends::{BackendKind, BackendOptions, RecognitionBackend, backend_for},
    errors::{OcrError, find_ocr_error},
    model::BoundingBox,
    prelude::*,
    preprocess::otsu_binarize,
};

/// Contours with a bounding box smaller than this are noise.
pub const DEFAULT_MIN_AREA: u64 = 300;

/// Horizontal radius of the dilation kernel (5 pixels wide).
const DILATE_RADIUS_X: u32 = 2;

/// Vertical radius of the dilation kernel (3 pixels tall).
const DILATE_RADIUS_Y: u32 = 1;

/// How many times we dilate.
const DILATE_ITERATIONS: usize = 2;

/// Interface to a text region detector.
#[async_trait]
pub trait RegionDetector: Send + Sync + 'static {
    /// A short name for logs.
    fn name(&self) -> &'static str;

    /// Find text regions, sorted by `(y, x)`.
    async fn detect(&self, image: &DynamicImage) -> Result<Vec<BoundingBox>>;
}

/// Classical detection: threshold, dilate, and box the outer contours.
pub struct ContourRegionDetector {
    min_area: u64,
}

impl ContourRegionDetector {
    pub fn new(min_area: u64) -> Self {
        Self { min_area }
    }
}

impl Default for ContourRegionDetector {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_AREA)
    }
}

#[async_trait]
impl RegionDetector for ContourRegionDetector {
    fn name(&self) -> &'static str {
        "contours"
    }

    async fn detect(&self, image: &DynamicImage) -> Result<Vec<BoundingBox>> {
        let gray = image.to_luma8();
        let min_area = self.min_area;
        Ok(spawn_blocking_propagating_panics(move || detect_contour_regions(&gray, min_area)).await)
    }
}

/// Box the connected blobs of ink on a page.
pub fn detect_contour_regions(gray: &GrayImage, min_area: u64) -> Vec<BoundingBox> {
    // A flat page has no ink, whatever Otsu picks as its level.
    let mut values = gray.pixels().map(|p| p[0]);
    if let Some(first) = values.next()
        && values.all(|v| v == first)
    {
        return vec![];
    }

    // Ink becomes white, so contours trace text rather than paper.
    let mut binary = otsu_binarize(gray);
    imageops::invert(&mut binary);
    let mut dilated = binary;
    for _ in 0..DILATE_ITERATIONS {
        dilated = dilate_rect(&dilated, DILATE_RADIUS_X, DILATE_RADIUS_Y);
    }

    let boxes = find_contours::<u32>(&dilated)
        .into_iter()
        .filter(|contour| contour.border_type == BorderType::Outer && contour.parent.is_none())
        .filter_map(|contour| {
            let points = contour
                .points
                .iter()
                .map(|p| (f64::from(p.x), f64::from(p.y)))
                .collect::<Vec<_>>();
            // Contour points are pixel centers, so the box is one pixel wider.
            BoundingBox::from_points(&points)
                .map(|bbox| BoundingBox::new(bbox.x, bbox.y, bbox.width + 1, bbox.height + 1))
        })
        .filter(|bbox| bbox.area() >= min_area)
        .collect();
    sort_regions(boxes)
}

/// Dilate with a `(2 * rx + 1) × (2 * ry + 1)` rectangle. The rectangle is
/// separable, so we take a horizontal max and then a vertical one.
fn dilate_rect(img: &GrayImage, rx: u32, ry: u32) -> GrayImage {
    let (w, h) = img.dimensions();
    let horizontal = GrayImage::from_fn(w, h, |x, y| {
        let lo = x.saturating_sub(rx);
        let hi = (x + rx).min(w.saturating_sub(1));
        Luma([(lo..=hi).map(|xx| img.get_pixel(xx, y)[0]).max().unwrap_or(0)])
    });
    GrayImage::from_fn(w, h, |x, y| {
        let lo = y.saturating_sub(ry);
        let hi = (y + ry).min(h.saturating_sub(1));
        Luma([(lo..=hi)
            .map(|yy| horizontal.get_pixel(x, yy)[0])
            .max()
            .unwrap_or(0)])
    })
}

/// Learned detection, using the boxes from a recognition backend.
pub struct LearnedRegionDetector {
    backend: Arc<dyn RecognitionBackend>,
}

impl LearnedRegionDetector {
    pub fn new(backend: Arc<dyn RecognitionBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl RegionDetector for LearnedRegionDetector {
    fn name(&self) -> &'static str {
        "learned"
    }

    async fn detect(&self, image: &DynamicImage) -> Result<Vec<BoundingBox>> {
        let output = self.backend.recognize(image).await?;
        Ok(sort_regions(
            output
                .fragments
                .into_iter()
                .map(|fragment| fragment.bbox)
                .collect(),
        ))
    }
}

/// Choose a region detector by name.
///
/// `"easyocr"` (or `"learned"`) uses EasyOCR when it is available, and falls
/// back to contours when it isn't installed. Other errors, such as an empty
/// language list, are returned. `"contours"` always uses contours.
pub async fn detector_for(
    name: &str,
    languages: &[String],
    options: &BackendOptions,
) -> Result<Arc<dyn RegionDetector>> {
    match name.trim().to_ascii_lowercase().as_str() {
        "contours" => Ok(Arc::new(ContourRegionDetector::default())),
        "easyocr" | "learned" => {
            match backend_for(BackendKind::EasyOcr, languages.to_vec(), options).await {
                Ok(backend) => Ok(Arc::new(LearnedRegionDetector::new(backend))),
                Err(err) if matches!(
                    find_ocr_error(&err),
                    Some(OcrError::BackendUnavailable { .. })
                ) =>
                {
                    warn!("Learned region detector unavailable, using contours: {err:#}");
                    Ok(Arc::new(ContourRegionDetector::default()))
                }
                Err(err) => Err(err),
            }
        }
        other => Err(OcrError::Configuration(format!(
            "unknown region detector {other:?} (expected \"easyocr\" or \"contours\")"
        ))
        .into()),
    }
}

/// Sort boxes top to bottom, then left to right.
pub fn sort_regions(mut boxes: Vec<BoundingBox>) -> Vec<BoundingBox> {
    boxes.sort_by_key(|bbox| (bbox.y, bbox.x));
    boxes
}

/// Cut a region out of an image. The region is clipped to the image.
pub fn crop(image: &DynamicImage, bbox: &BoundingBox) -> DynamicImage {
    image.crop_imm(bbox.x, bbox.y, bbox.width, bbox.height)
}

#[cfg(test)]
mod tests {
    use image::RgbImage;

    use super::*;
    use crate::test_util::FakeBackend;

    /// A white page with two black blocks, the lower one further left.
    fn two_block_page() -> GrayImage {
        let mut page = GrayImage::from_pixel(200, 120, Luma([255]));
        for (x0, y0, w, h) in [(100, 10, 60, 20), (20, 70, 80, 25)] {
            for y in y0..y0 + h {
                for x in x0..x0 + w {
                    page.put_pixel(x, y, Luma([0]));
                }
            }
        }
        page
    }

    #[test]
    fn contours_find_blocks_in_reading_order() {
        let boxes = detect_contour_regions(&two_block_page(), DEFAULT_MIN_AREA);
        assert_eq!(boxes.len(), 2);
        // Each block grows by the dilation: 4 px sideways, 2 px up and down.
        assert_eq!(boxes[0], BoundingBox::new(96, 8, 68, 24));
        assert_eq!(boxes[1], BoundingBox::new(16, 68, 88, 29));
    }

    #[test]
    fn small_specks_are_dropped() {
        let mut page = GrayImage::from_pixel(100, 100, Luma([255]));
        page.put_pixel(50, 50, Luma([0]));
        page.put_pixel(51, 50, Luma([0]));
        assert!(detect_contour_regions(&page, DEFAULT_MIN_AREA).is_empty());
        assert_eq!(detect_contour_regions(&page, 1).len(), 1);
    }

    #[test]
    fn blank_page_has_no_regions() {
        let page = GrayImage::from_pixel(64, 64, Luma([255]));
        assert!(detect_contour_regions(&page, DEFAULT_MIN_AREA).is_empty());
    }

    #[test]
    fn regions_sort_by_top_then_left() {
        let sorted = sort_regions(vec![
            BoundingBox::new(50, 10, 1, 1),
            BoundingBox::new(5, 40, 1, 1),
            BoundingBox::new(10, 10, 1, 1),
        ]);
        assert_eq!(
            sorted,
            vec![
                BoundingBox::new(10, 10, 1, 1),
                BoundingBox::new(50, 10, 1, 1),
                BoundingBox::new(5, 40, 1, 1),
            ]
        );
    }

    #[test]
    fn crop_is_clipped_to_the_image() {
        let image = DynamicImage::ImageRgb8(RgbImage::new(50, 40));
        let region = crop(&image, &BoundingBox::new(30, 30, 100, 100));
        assert_eq!((region.width(), region.height()), (20, 10));
    }

    #[tokio::test]
    async fn learned_detector_sorts_backend_boxes() -> Result<()> {
        let detector = LearnedRegionDetector::new(FakeBackend::new());
        let image = DynamicImage::ImageRgb8(RgbImage::new(30, 20));
        let boxes = detector.detect(&image).await?;
        assert_eq!(boxes, vec![BoundingBox::new(0, 0, 30, 20)]);
        Ok(())
    }

    #[tokio::test]
    async fn contour_detector_runs_on_color_images() -> Result<()> {
        let image = DynamicImage::ImageLuma8(two_block_page()).to_rgb8();
        let boxes = ContourRegionDetector::default()
            .detect(&DynamicImage::ImageRgb8(image))
            .await?;
        assert_eq!(boxes.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn unavailable_learned_detector_falls_back_to_contours() -> Result<()> {
        let options = BackendOptions {
            easyocr_cmd: Some(PathBuf::from("/nonexistent/bin/easyocr")),
            ..BackendOptions::default()
        };
        let detector = detector_for("easyocr", &["eng".to_owned()], &options).await?;
        assert_eq!(detector.name(), "contours");
        Ok(())
    }

    #[tokio::test]
    async fn learned_detector_without_languages_is_an_error() {
        let options = BackendOptions {
            easyocr_cmd: Some(PathBuf::from("/nonexistent/bin/easyocr")),
            ..BackendOptions::default()
        };
        let err = detector_for("easyocr", &[], &options).await.err().unwrap();
        assert!(matches!(
            find_ocr_error(&err),
            Some(OcrError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn unknown_detector_is_a_configuration_error() {
        let err = detector_for("magic", &[], &BackendOptions::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(
            find_ocr_error(&err),
            Some(OcrError::Configuration(_))
        ));
    }
}
