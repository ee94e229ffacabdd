//! Helpers shared by unit tests.

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use image::DynamicImage;

use crate::{
    backends::{BackendKind, RecognitionBackend},
    model::{BoundingBox, RecognitionOutput, TextFragment},
    prelude::*,
};

/// Build a small valid PDF with `pages` blank pages, 200×100pt each, with a
/// black bar whose width depends on the page number.
pub fn minimal_pdf(pages: usize) -> Vec<u8> {
    let mut objects = vec![
        "<< /Type /Catalog /Pages 2 0 R >>".to_owned(),
        format!(
            "<< /Type /Pages /Kids [{}] /Count {pages} >>",
            (0..pages)
                .map(|i| format!("{} 0 R", 3 + i))
                .collect::<Vec<_>>()
                .join(" ")
        ),
    ];
    for i in 0..pages {
        objects.push(format!(
            "<< /Type /Page /Parent 2 0 R /MediaBox [0 0 200 100] /Contents {} 0 R >>",
            3 + pages + i
        ));
    }
    for i in 0..pages {
        let content = format!("0 0 0 rg 10 40 {} 20 re f", 30 + 40 * i);
        objects.push(format!(
            "<< /Length {} >>\nstream\n{content}\nendstream",
            content.len()
        ));
    }

    let mut pdf = b"%PDF-1.4\n".to_vec();
    let mut offsets = vec![];
    for (i, body) in objects.iter().enumerate() {
        offsets.push(pdf.len());
        pdf.extend_from_slice(format!("{} 0 obj\n{body}\nendobj\n", i + 1).as_bytes());
    }
    let xref_offset = pdf.len();
    let mut xref = format!("xref\n0 {}\n0000000000 65535 f \n", objects.len() + 1);
    for offset in offsets {
        xref.push_str(&format!("{offset:010} 00000 n \n"));
    }
    xref.push_str(&format!(
        "trailer\n<< /Size {} /Root 1 0 R >>\nstartxref\n{xref_offset}\n%%EOF\n",
        objects.len() + 1
    ));
    pdf.extend_from_slice(xref.as_bytes());
    pdf
}

/// A backend that "recognizes" the image width, optionally with a delay that
/// shrinks as the width grows, so later pages can finish first.
pub struct FakeBackend {
    pub calls: AtomicUsize,
    pub reverse_delay: bool,
    pub fail_on_width: Option<u32>,
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::unshared())
    }

    /// A plain backend, for struct update syntax.
    pub fn unshared() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            reverse_delay: false,
            fail_on_width: None,
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RecognitionBackend for FakeBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Tesseract
    }

    fn languages(&self) -> &[String] {
        &[]
    }

    async fn recognize(&self, image: &DynamicImage) -> Result<RecognitionOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let width = image.width();
        if self.reverse_delay {
            let delay = 200u64.saturating_sub(u64::from(width));
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.fail_on_width == Some(width) {
            return Err(anyhow!("fake backend refused width {width}"));
        }
        let fragment = TextFragment {
            text: format!("w{width}"),
            bbox: BoundingBox::new(0, 0, width, image.height()),
            confidence: Some(90.0),
        };
        Ok(RecognitionOutput::from_fragments(
            fragment.text.clone(),
            vec![fragment],
        ))
    }
}
