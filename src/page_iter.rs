//! Iterate over the pages of a document as decoded images.
//!
//! A raster image is a one-page document. A PDF is rendered one page at a
//! time with Poppler's `pdftocairo`, so only the page currently being handed
//! out is held in memory.

use std::{collections::BTreeMap, io, process::Command as StdCommand, sync::LazyLock};

use image::{DynamicImage, ImageReader};
use regex::Regex;
use tokio::process::Command;

use crate::{
    async_utils::{
        blocking_iter_streams::spawn_blocking_propagating_panics,
        check_for_command_failure,
    },
    cpu_limit::with_cpu_semaphore_blocking,
    errors::OcrError,
    model::PageImage,
    prelude::*,
};

/// Raster suffixes we accept when content sniffing is inconclusive.
const IMAGE_SUFFIXES: &[&str] = &["png", "jpg", "jpeg", "tif", "tiff", "bmp", "webp"];

/// The resolution PDF coordinates are defined in.
const PDF_BASE_DPI: f64 = 72.0;

static ERROR_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)error").expect("failed to compile regex"));

static DOWNGRADE_TO_WARNING_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)error: xref num").expect("failed to compile regex")
});

/// Does this line of Poppler output report a real error?
fn is_error_line(line: &str) -> bool {
    ERROR_REGEX.is_match(line) && !DOWNGRADE_TO_WARNING_REGEX.is_match(line)
}

/// Options for constructing a [`PageIter`].
#[derive(Clone, Debug)]
pub struct PageIterOptions {
    /// Resolution used to render PDF pages. Raster images are never rescaled.
    pub dpi: u32,

    /// The maximum number of pages to process. Pages past this are skipped,
    /// and [`crate::model::BatchResult::check_complete`] reports it.
    pub max_pages: Option<usize>,
}

impl Default for PageIterOptions {
    fn default() -> Self {
        Self {
            dpi: 300,
            max_pages: None,
        }
    }
}

/// What kind of document are we reading?
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DocumentKind {
    Image,
    Pdf,
}

impl DocumentKind {
    /// Classify by MIME type, falling back to the file name's suffix.
    fn detect(mime_type: Option<&str>, name: &Path) -> Option<Self> {
        match mime_type {
            Some("application/pdf") => return Some(Self::Pdf),
            Some(mime) if mime.starts_with("image/") => return Some(Self::Image),
            _ => {}
        }
        let suffix = name.extension()?.to_str()?.to_ascii_lowercase();
        if suffix == "pdf" {
            Some(Self::Pdf)
        } else if IMAGE_SUFFIXES.contains(&suffix.as_str()) {
            Some(Self::Image)
        } else {
            None
        }
    }
}

/// Where our pages come from.
enum PageSource {
    /// A single decoded image, handed out on the first call to `next`.
    Image(Option<DynamicImage>),

    /// A PDF on disk, rendered lazily.
    Pdf { path: PathBuf, dpi: u32 },
}

/// A lazy, single-pass sequence of page images.
///
/// To read a document twice, construct a new [`PageIter`].
pub struct PageIter {
    /// The document, for error messages.
    path: PathBuf,
    source: PageSource,
    /// Scratch space for rendered pages, and for PDFs we were handed as bytes.
    ///
    /// This is released by [`Drop`].
    tmpdir: Option<tempfile::TempDir>,
    /// Index of the next page to yield.
    next_index: usize,
    /// Pages in the document.
    total_pages: usize,
    /// The maximum number of pages we are allowed to process.
    max_pages: Option<usize>,
}

impl PageIter {
    /// Open a document from disk.
    #[instrument(level = "debug", skip_all, fields(path = %path.display()))]
    pub async fn from_path(path: &Path, options: &PageIterOptions) -> Result<Self> {
        let mime_type = infer::get_from_path(path)
            .map_err(|err| OcrError::document(path, format!("cannot open file: {err}")))?
            .map(|t| t.mime_type());
        let kind = DocumentKind::detect(mime_type, path).ok_or_else(|| {
            OcrError::document(
                path,
                format!(
                    "unsupported file type {} (supported: PNG, JPEG, TIFF, BMP, WebP, PDF)",
                    mime_type.unwrap_or("unknown")
                ),
            )
        })?;

        match kind {
            DocumentKind::Image => {
                let owned_path = path.to_owned();
                let image =
                    spawn_blocking_propagating_panics(move || decode_image_file(&owned_path))
                        .await?;
                Ok(Self::from_image(path.to_owned(), image, options))
            }
            DocumentKind::Pdf => {
                Self::from_pdf(path.to_owned(), path.to_owned(), None, options).await
            }
        }
    }

    /// Open a document held in memory, such as an upload.
    ///
    /// `filename` is used for error messages and as a type hint when the
    /// content itself is ambiguous.
    #[instrument(level = "debug", skip_all, fields(filename = %filename))]
    pub async fn from_bytes(
        bytes: Vec<u8>,
        filename: &str,
        options: &PageIterOptions,
    ) -> Result<Self> {
        let name = Path::new(filename);
        let mime_type = infer::get(&bytes).map(|t| t.mime_type());
        let kind = DocumentKind::detect(mime_type, name).ok_or_else(|| {
            OcrError::document(name, "unsupported file type (supported: images and PDF)")
        })?;

        match kind {
            DocumentKind::Image => {
                let owned_name = name.to_owned();
                let image = spawn_blocking_propagating_panics(move || {
                    image::load_from_memory(&bytes)
                        .map_err(|err| OcrError::document(&owned_name, err.to_string()))
                })
                .await?;
                Ok(Self::from_image(name.to_owned(), image, options))
            }
            DocumentKind::Pdf => {
                let tmpdir = tempfile::TempDir::with_prefix("textmill-upload")
                    .context("failed to create temporary directory")?;
                let spooled = tmpdir.path().join("input.pdf");
                tokio::fs::write(&spooled, &bytes)
                    .await
                    .with_context(|| format!("failed to spool {filename} to disk"))?;
                Self::from_pdf(name.to_owned(), spooled, Some(tmpdir), options).await
            }
        }
    }

    /// A one-page document.
    fn from_image(path: PathBuf, image: DynamicImage, options: &PageIterOptions) -> Self {
        Self {
            path,
            source: PageSource::Image(Some(image)),
            tmpdir: None,
            next_index: 0,
            total_pages: 1,
            max_pages: options.max_pages,
        }
    }

    /// A PDF, rendered page by page. `display_path` is what we report in
    /// errors, and `pdf_path` is the file we actually read.
    async fn from_pdf(
        display_path: PathBuf,
        pdf_path: PathBuf,
        tmpdir: Option<tempfile::TempDir>,
        options: &PageIterOptions,
    ) -> Result<Self> {
        if options.dpi == 0 {
            return Err(OcrError::Configuration("dpi must be greater than 0".to_owned()).into());
        }
        let total_pages = get_pdf_page_count(&pdf_path)
            .await
            .with_context(|| format!("failed to count pages in {:?}", display_path.display()))?;
        let tmpdir = match tmpdir {
            Some(tmpdir) => tmpdir,
            None => tempfile::TempDir::with_prefix("textmill-pages")
                .context("failed to create temporary directory")?,
        };
        debug!(total_pages, dpi = options.dpi, "Opened PDF");
        Ok(Self {
            path: display_path,
            source: PageSource::Pdf {
                path: pdf_path,
                dpi: options.dpi,
            },
            tmpdir: Some(tmpdir),
            next_index: 0,
            total_pages,
            max_pages: options.max_pages,
        })
    }

    /// Number of pages in the whole document.
    pub fn total_pages(&self) -> usize {
        self.total_pages
    }

    /// Number of pages this iterator will yield.
    fn page_limit(&self) -> usize {
        match self.max_pages {
            Some(max_pages) => self.total_pages.min(max_pages),
            None => self.total_pages,
        }
    }
}

impl Drop for PageIter {
    fn drop(&mut self) {
        if let Some(tmpdir) = self.tmpdir.take() {
            let tmpdir_path = tmpdir.path().to_owned();
            if let Err(err) = tmpdir.close() {
                error!(
                    directory = ?tmpdir_path.display(),
                    "failed to delete temporary directory: {}",
                    err
                );
            }
        }
    }
}

impl Iterator for PageIter {
    type Item = Result<PageImage>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next_index >= self.page_limit() {
            return None;
        }
        let index = self.next_index;
        self.next_index += 1;

        let image = match &mut self.source {
            PageSource::Image(image) => image
                .take()
                .ok_or_else(|| anyhow!("image page was already taken")),
            PageSource::Pdf { path, dpi } => match &self.tmpdir {
                Some(tmpdir) => render_pdf_page(path, *dpi, index, tmpdir.path())
                    .with_context(|| {
                        format!("failed to render page {} of {:?}", index, self.path.display())
                    }),
                None => Err(anyhow!("no scratch directory for rendering")),
            },
        };
        Some(image.map(|image| PageImage { index, image }))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.page_limit().saturating_sub(self.next_index);
        (remaining, Some(remaining))
    }
}

/// Decode an image file, sniffing the format from its contents.
fn decode_image_file(path: &Path) -> Result<DynamicImage> {
    let image = ImageReader::open(path)
        .map_err(|err| OcrError::document(path, format!("cannot open image: {err}")))?
        .with_guessed_format()
        .map_err(|err| OcrError::document(path, format!("cannot read image: {err}")))?
        .decode()
        .map_err(|err| OcrError::document(path, format!("cannot decode image: {err}")))?;
    Ok(image)
}

/// Render one page (0-based) of a PDF to an image.
///
/// The page is rendered to a PNG in `scratch_dir`, decoded, and deleted before
/// returning.
#[instrument(level = "debug", skip(path, scratch_dir))]
fn render_pdf_page(path: &Path, dpi: u32, index: usize, scratch_dir: &Path) -> Result<DynamicImage> {
    // Poppler page numbers are 1-based and inclusive.
    let page_number = (index + 1).to_string();
    let out_prefix = scratch_dir.join(format!("page-{page_number}"));
    trace!(zoom = f64::from(dpi) / PDF_BASE_DPI, "Rendering page");
    // pdftocairo wants a whole core, so it shares the engines' CPU limit.
    let output = with_cpu_semaphore_blocking(|| {
        StdCommand::new("pdftocairo")
            .arg("-png")
            .arg("-singlefile")
            .arg("-r")
            .arg(dpi.to_string())
            .arg("-f")
            .arg(&page_number)
            .arg("-l")
            .arg(&page_number)
            .arg(path)
            .arg(&out_prefix)
            .output()
            .map_err(|err| tool_error("pdftocairo", err))
    })?;
    check_for_command_failure("pdftocairo", &output, Some(&is_error_line))
        .map_err(|err| OcrError::document(path, format!("{err:#}")))?;

    let png_path = out_prefix.with_extension("png");
    let image = image::open(&png_path)
        .map_err(|err| OcrError::document(path, format!("cannot decode rendered page: {err}")))?;
    std::fs::remove_file(&png_path)
        .with_context(|| format!("failed to delete file {:?}", png_path.display()))?;
    Ok(image)
}

/// Map a failure to start a tool to the right error.
fn tool_error(tool: &str, err: io::Error) -> anyhow::Error {
    if err.kind() == io::ErrorKind::NotFound {
        OcrError::MissingDependency {
            tool: tool.to_owned(),
        }
        .into()
    } else {
        anyhow::Error::new(err).context(format!("failed to run {tool}"))
    }
}

/// Get the number of pages in a PDF file.
#[instrument(level = "debug", skip_all, fields(path = %path.display()))]
pub async fn get_pdf_page_count(path: &Path) -> Result<usize> {
    let output = Command::new("pdfinfo")
        .arg(path)
        .output()
        .await
        .map_err(|err| tool_error("pdfinfo", err))?;
    check_for_command_failure("pdfinfo", &output, None)
        .map_err(|err| OcrError::document(path, format!("{err:#}")))?;

    // Parse the output of pdfinfo into properties.
    let output = String::from_utf8_lossy(&output.stdout);
    let mut properties = BTreeMap::new();
    for line in output.lines() {
        if let Some((key, value)) = line.split_once(':') {
            properties.insert(key.trim(), value.trim());
        }
    }

    let page_count_str = properties
        .get("Pages")
        .ok_or_else(|| OcrError::document(path, "pdfinfo did not report a page count"))?;
    page_count_str.parse::<usize>().map_err(|_| {
        OcrError::document(path, format!("invalid page count {page_count_str:?}")).into()
    })
}
