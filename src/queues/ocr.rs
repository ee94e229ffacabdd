//! OCR orchestration: documents in, ordered page results out.
//!
//! Each page becomes a [`PageTask`], which is preprocessed and recognized on a
//! shared [`WorkQueue`]. Pages of one document are processed concurrently but
//! reassembled in page order. A document that fails produces a failed
//! [`DocumentOutput`] record instead of stopping the batch.

use std::sync::Arc;

use futures::{FutureExt as _, StreamExt as _, TryStreamExt as _};
use image::DynamicImage;
use tokio::io::AsyncReadExt as _;

use crate::{
    async_utils::{
        BoxedStream, JoinWorker,
        blocking_iter_streams::{BlockingIterStream, spawn_blocking_propagating_panics},
    },
    backends::{BackendKind, BackendOptions, RecognitionBackend, backend_for},
    collect::STDIN_PATH,
    errors::OcrError,
    model::{BatchResult, PageImage, PageResult, RecognitionOutput},
    page_iter::{PageIter, PageIterOptions},
    prelude::*,
    preprocess::{self, PreprocessOptions},
    queues::work::{DocumentOutput, WorkFn, WorkQueue, WorkQueueHandle},
    regions::{RegionDetector, crop},
};

/// One page of one document, waiting to be recognized.
pub struct PageTask {
    /// The document this page came from.
    pub source: PathBuf,

    /// 0-based page index within the document.
    pub page_index: usize,

    /// The page, before preprocessing.
    pub image: DynamicImage,
}

/// How to process pages, apart from the backend itself.
#[derive(Clone)]
pub struct OcrOptions {
    /// Preprocessing applied to every page.
    pub preprocess: PreprocessOptions,

    /// How to turn documents into pages.
    pub page_iter: PageIterOptions,

    /// If set, recognize each detected region separately.
    pub detector: Option<Arc<dyn RegionDetector>>,

    /// How many pages may be in flight at once.
    pub concurrency: usize,
}

/// Everything needed to OCR a batch of documents.
///
/// The backend is constructed once and shared by every page task.
pub struct OcrContext {
    engine: BackendKind,
    languages: Vec<String>,
    page_iter: PageIterOptions,
    concurrency: usize,
    pages: WorkQueueHandle<PageTask, PageResult>,
}

impl OcrContext {
    /// Wrap an existing backend. The returned worker finishes once the
    /// context has been dropped.
    pub fn new(backend: Arc<dyn RecognitionBackend>, options: OcrOptions) -> (Self, JoinWorker) {
        let engine = backend.kind();
        let languages = backend.languages().to_vec();
        let preprocess = options.preprocess;
        let detector = options.detector;
        let work_fn: WorkFn<PageTask, PageResult> = Arc::new(move |task| {
            let backend = backend.clone();
            let detector = detector.clone();
            async move { process_page(task, backend.as_ref(), &preprocess, detector.as_deref()).await }
                .boxed()
        });
        let (queue, worker) = WorkQueue::new(options.concurrency, work_fn);
        let context = Self {
            engine,
            languages,
            page_iter: options.page_iter,
            concurrency: options.concurrency.max(1),
            pages: queue.handle(),
        };
        (context, worker)
    }

    /// Look up a backend by name, check that it is available, and build a
    /// context around it.
    ///
    /// Unknown names and missing backends fail here, before any document is
    /// opened.
    #[instrument(level = "debug", skip(backend_options, options))]
    pub async fn connect(
        engine: &str,
        languages: Vec<String>,
        backend_options: &BackendOptions,
        options: OcrOptions,
    ) -> Result<(Self, JoinWorker)> {
        let kind = engine.parse::<BackendKind>()?;
        if options.page_iter.dpi == 0 {
            return Err(OcrError::Configuration("dpi must be greater than 0".to_owned()).into());
        }
        let backend = backend_for(kind, languages, backend_options).await?;
        Ok(Self::new(backend, options))
    }
}

/// Preprocess and recognize a single page.
///
/// With a region detector, the backend runs once per region and fragment
/// boxes are moved back into page coordinates. Otherwise it runs exactly once.
#[instrument(level = "debug", skip_all, fields(source = %task.source.display(), page = task.page_index))]
pub async fn process_page(
    task: PageTask,
    backend: &dyn RecognitionBackend,
    preprocess_options: &PreprocessOptions,
    detector: Option<&dyn RegionDetector>,
) -> Result<PageResult> {
    let PageTask {
        source,
        page_index,
        image,
    } = task;

    let options = *preprocess_options;
    let prepared =
        spawn_blocking_propagating_panics(move || preprocess::apply(&image, &options)).await;

    let output = match detector {
        Some(detector) => recognize_regions(&prepared, backend, detector).await,
        None => backend.recognize(&prepared).await,
    }
    .map_err(|err| OcrError::Recognition {
        page: page_index,
        message: format!("{err:#}"),
    })
    .with_context(|| format!("failed to OCR page {page_index} of {:?}", source.display()))?;

    trace!(chars = output.text.len(), fragments = output.fragments.len(), "Recognized page");
    Ok(PageResult::from_output(page_index, output))
}

/// Recognize each detected region separately, in region order.
async fn recognize_regions(
    page: &DynamicImage,
    backend: &dyn RecognitionBackend,
    detector: &dyn RegionDetector,
) -> Result<RecognitionOutput> {
    let (width, height) = (page.width(), page.height());
    let regions = detector
        .detect(page)
        .await?
        .into_iter()
        // Empty boxes, or boxes entirely off the page, would crop to nothing.
        .filter(|region| region.area() > 0 && region.x < width && region.y < height)
        .collect::<Vec<_>>();
    if regions.is_empty() {
        debug!(detector = detector.name(), "No regions found, recognizing whole page");
        return backend.recognize(page).await;
    }

    let mut texts = vec![];
    let mut fragments = vec![];
    for region in &regions {
        let output = backend.recognize(&crop(page, region)).await?;
        if !output.text.is_empty() {
            texts.push(output.text);
        }
        fragments.extend(output.fragments.into_iter().map(|mut fragment| {
            fragment.bbox = fragment.bbox.offset(region.x, region.y);
            fragment
        }));
    }
    Ok(RecognitionOutput::from_fragments(texts.join("\n"), fragments))
}

/// Open a document for OCR. [`STDIN_PATH`] reads the document from standard
/// input.
async fn open_document(source: &Path, ctx: &OcrContext) -> Result<PageIter> {
    if source == Path::new(STDIN_PATH) {
        let mut bytes = vec![];
        tokio::io::stdin()
            .read_to_end(&mut bytes)
            .await
            .context("failed to read document from standard input")?;
        return PageIter::from_bytes(bytes, "stdin", &ctx.page_iter).await;
    }
    PageIter::from_path(source, &ctx.page_iter)
        .await
        .with_context(|| format!("failed to open {:?}", source.display()))
}

/// OCR every page of one document, in page order.
///
/// Any failed page fails the whole document.
#[instrument(level = "debug", skip(ctx), fields(source = %source.display()))]
pub async fn ocr_document(source: &Path, ctx: &OcrContext) -> Result<BatchResult> {
    let pages = open_document(source, ctx).await?;
    let total_pages = pages.total_pages();
    ocr_pages(source.to_owned(), pages, total_pages, ctx).await
}

/// OCR a sequence of pages, reassembling the results in order.
async fn ocr_pages<I>(
    source: PathBuf,
    pages: I,
    total_pages: usize,
    ctx: &OcrContext,
) -> Result<BatchResult>
where
    I: Iterator<Item = Result<PageImage>> + Send + Unpin + 'static,
{
    // Rendering and decoding are blocking work, so they run off the executor.
    let page_stream = BlockingIterStream::new(pages);
    let results = page_stream
        .map(|page| {
            let handle = ctx.pages.clone();
            let source = source.clone();
            async move {
                let page = page?;
                handle
                    .process(PageTask {
                        source,
                        page_index: page.index,
                        image: page.image,
                    })
                    .await
            }
        })
        // `buffered` yields in submission order, whatever order pages finish.
        .buffered(ctx.concurrency)
        .try_collect::<Vec<_>>()
        .await?;

    Ok(BatchResult {
        source,
        engine: ctx.engine.name().to_owned(),
        languages: ctx.languages.clone(),
        total_pages,
        pages: results,
    })
}

/// OCR one document, turning any failure into a failed record.
async fn document_output(source: PathBuf, ctx: &OcrContext) -> DocumentOutput {
    match ocr_document(&source, ctx).await {
        Ok(batch) => match batch.check_complete() {
            Ok(()) => DocumentOutput::ok(batch),
            Err(warning) => {
                warn!(source = %source.display(), "{warning}");
                DocumentOutput::incomplete(batch, warning.to_string())
            }
        },
        Err(err) => {
            error!(source = %source.display(), "Document failed: {err:#}");
            DocumentOutput::failed(source, &err)
        }
    }
}

/// OCR a batch of documents, yielding one record per document in input
/// order.
pub fn ocr_documents(
    paths: Vec<PathBuf>,
    ctx: Arc<OcrContext>,
) -> BoxedStream<Result<DocumentOutput>> {
    let concurrency = ctx.concurrency;
    futures::stream::iter(paths)
        .map(move |path| {
            let ctx = ctx.clone();
            async move { Ok(document_output(path, &ctx).await) }
        })
        .buffered(concurrency)
        .boxed()
}

#[cfg(test)]
mod tests {
    use image::{GrayImage, Luma, RgbImage};

    use super::*;
    use crate::{
        errors::find_ocr_error,
        model::BoundingBox,
        queues::work::WorkStatus,
        regions::ContourRegionDetector,
        test_util::{FakeBackend, minimal_pdf},
    };

    fn options(concurrency: usize) -> OcrOptions {
        OcrOptions {
            preprocess: PreprocessOptions::none(),
            page_iter: PageIterOptions::default(),
            detector: None,
            concurrency,
        }
    }

    /// Pages whose widths are 10, 20, 30, ...
    fn pages_of_widths(count: usize) -> std::vec::IntoIter<Result<PageImage>> {
        (0..count)
            .map(|index| {
                Ok(PageImage {
                    index,
                    image: DynamicImage::ImageRgb8(RgbImage::new(10 * (index as u32 + 1), 8)),
                })
            })
            .collect::<Vec<_>>()
            .into_iter()
    }

    #[tokio::test]
    async fn pages_are_reassembled_in_order() -> Result<()> {
        let backend = Arc::new(FakeBackend {
            reverse_delay: true,
            ..FakeBackend::unshared()
        });
        let (ctx, _worker) = OcrContext::new(backend.clone(), options(4));
        let batch = ocr_pages(PathBuf::from("doc.pdf"), pages_of_widths(5), 5, &ctx).await?;

        let indices = batch.pages.iter().map(|p| p.page).collect::<Vec<_>>();
        assert_eq!(indices, vec![0, 1, 2, 3, 4]);
        let texts = batch.pages.iter().map(|p| p.text.as_str()).collect::<Vec<_>>();
        assert_eq!(texts, vec!["w10", "w20", "w30", "w40", "w50"]);
        assert_eq!(batch.engine, "tesseract");
        assert_eq!(backend.calls(), 5);
        Ok(())
    }

    #[tokio::test]
    async fn one_failed_page_fails_the_document() {
        let backend = Arc::new(FakeBackend {
            fail_on_width: Some(20),
            ..FakeBackend::unshared()
        });
        let (ctx, _worker) = OcrContext::new(backend, options(2));
        let err = ocr_pages(PathBuf::from("doc.pdf"), pages_of_widths(3), 3, &ctx)
            .await
            .unwrap_err();
        assert!(matches!(
            find_ocr_error(&err),
            Some(OcrError::Recognition { page: 1, .. })
        ));
        assert!(format!("{err:#}").contains("doc.pdf"));
    }

    #[tokio::test]
    async fn unknown_backend_fails_before_any_page_work() {
        let err = OcrContext::connect(
            "cuneiform",
            vec!["eng".to_owned()],
            &BackendOptions::default(),
            options(1),
        )
        .await
        .err()
        .unwrap();
        assert!(matches!(
            find_ocr_error(&err),
            Some(OcrError::UnsupportedBackend { name }) if name == "cuneiform"
        ));
    }

    #[tokio::test]
    async fn regions_are_recognized_separately_in_page_coordinates() -> Result<()> {
        let mut page = GrayImage::from_pixel(200, 120, Luma([255]));
        for (x0, y0, w, h) in [(100, 10, 60, 20), (20, 70, 80, 25)] {
            for y in y0..y0 + h {
                for x in x0..x0 + w {
                    page.put_pixel(x, y, Luma([0]));
                }
            }
        }
        let backend = FakeBackend::new();
        let task = PageTask {
            source: PathBuf::from("page.png"),
            page_index: 0,
            image: DynamicImage::ImageLuma8(page),
        };
        let detector = ContourRegionDetector::default();
        let result = process_page(
            task,
            backend.as_ref(),
            &PreprocessOptions::none(),
            Some(&detector),
        )
        .await?;

        assert_eq!(backend.calls(), 2);
        assert_eq!(result.text, "w68\nw88");
        let boxes = result.boxes.iter().map(|f| f.bbox).collect::<Vec<_>>();
        assert_eq!(
            boxes,
            vec![BoundingBox::new(96, 8, 68, 24), BoundingBox::new(16, 68, 88, 29)]
        );
        Ok(())
    }

    /// Always returns the same regions.
    struct FixedRegions(Vec<BoundingBox>);

    #[async_trait]
    impl RegionDetector for FixedRegions {
        fn name(&self) -> &'static str {
            "fixed"
        }

        async fn detect(&self, _image: &DynamicImage) -> Result<Vec<BoundingBox>> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn empty_and_off_page_regions_are_skipped() -> Result<()> {
        let page = DynamicImage::ImageRgb8(RgbImage::new(40, 30));
        let backend = FakeBackend::new();
        let detector = FixedRegions(vec![
            BoundingBox::default(),
            BoundingBox::new(500, 500, 10, 10),
            BoundingBox::new(4, 2, 20, 10),
        ]);
        let output = recognize_regions(&page, backend.as_ref(), &detector).await?;
        assert_eq!(backend.calls(), 1);
        assert_eq!(output.text, "w20");
        assert_eq!(output.fragments[0].bbox, BoundingBox::new(4, 2, 20, 10));

        let only_empty = FixedRegions(vec![BoundingBox::default()]);
        let output = recognize_regions(&page, backend.as_ref(), &only_empty).await?;
        assert_eq!(output.text, "w40");
        Ok(())
    }

    #[tokio::test]
    async fn failed_documents_do_not_stop_the_batch() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("ocr-batch")?;
        let good = dir.path().join("good.png");
        RgbImage::new(12, 6).save(&good)?;
        let broken = dir.path().join("broken.png");
        std::fs::write(&broken, b"this is not a png")?;

        let (ctx, worker) = OcrContext::new(FakeBackend::new(), options(2));
        let outputs = ocr_documents(vec![broken.clone(), good.clone()], Arc::new(ctx))
            .try_collect::<Vec<_>>()
            .await?;

        assert_eq!(outputs.len(), 2);
        assert_eq!(outputs[0].source, broken);
        assert_eq!(outputs[0].status, WorkStatus::Failed);
        assert!(!outputs[0].errors.is_empty());
        assert_eq!(outputs[1].status, WorkStatus::Ok);
        let pages = &outputs[1].result.as_ref().unwrap().pages;
        assert_eq!(pages.len(), 1);
        assert_eq!(pages[0].text, "w12");
        worker.join().await
    }

    #[tokio::test]
    #[ignore = "Requires poppler-utils to be installed"]
    async fn pdf_pages_come_back_in_order() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("ocr-pdf")?;
        let path = dir.path().join("three.pdf");
        std::fs::write(&path, minimal_pdf(3))?;

        let mut opts = options(3);
        opts.page_iter.dpi = 150;
        let (ctx, _worker) = OcrContext::new(FakeBackend::new(), opts);
        let batch = ocr_document(&path, &ctx).await?;
        let indices = batch.pages.iter().map(|p| p.page).collect::<Vec<_>>();
        assert_eq!(indices, vec![0, 1, 2]);
        Ok(())
    }

    #[tokio::test]
    #[ignore = "Requires poppler-utils to be installed"]
    async fn max_pages_marks_document_incomplete() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("ocr-pdf")?;
        let path = dir.path().join("three.pdf");
        std::fs::write(&path, minimal_pdf(3))?;

        let mut opts = options(2);
        opts.page_iter.max_pages = Some(2);
        let (ctx, _worker) = OcrContext::new(FakeBackend::new(), opts);
        let output = document_output(path, &ctx).await;
        assert_eq!(output.status, WorkStatus::Incomplete);
        assert_eq!(output.result.unwrap().pages.len(), 2);
        Ok(())
    }
}
