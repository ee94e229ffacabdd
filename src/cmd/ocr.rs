//! The `ocr` subcommand.

use std::sync::Arc;

use clap::{Args, ValueEnum};
use futures::{StreamExt as _, TryStreamExt as _, pin_mut};
use tokio::io::{AsyncWriteExt as _, BufWriter};

use super::StreamOpts;
use crate::{
    async_utils::{
        BoxedStream,
        io::{OutputFormat, create_writer, write_output},
    },
    backends::BackendKind,
    collect::{STDIN_PATH, gather_paths},
    config::Config,
    errors::OcrError,
    page_iter::PageIterOptions,
    prelude::*,
    preprocess::PreprocessOptions,
    queues::{
        ocr::{OcrContext, OcrOptions, ocr_documents},
        work::{DocumentCounterExt as _, DocumentCounters, DocumentOutput},
    },
    regions::detector_for,
    ui::{ProgressConfig, Ui},
};

/// Output formats for `ocr`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum OcrFormat {
    /// One JSON record per document, one per line.
    #[default]
    Jsonl,
    /// A single JSON array of document records.
    Json,
    /// Plain text only, documents separated by blank lines.
    Text,
}

/// Switch individual preprocessing steps on or off, overriding the config
/// file.
#[derive(Debug, Clone, Args)]
pub struct PreprocessFlags {
    /// Convert pages to grayscale.
    #[clap(long, overrides_with = "no_grayscale")]
    grayscale: bool,
    /// Skip grayscale conversion.
    #[clap(long, overrides_with = "grayscale")]
    no_grayscale: bool,

    /// Remove speckle noise with a median filter.
    #[clap(long, overrides_with = "no_denoise")]
    denoise: bool,
    /// Skip denoising.
    #[clap(long, overrides_with = "denoise")]
    no_denoise: bool,

    /// Binarize pages with Otsu's threshold.
    #[clap(long, overrides_with = "no_threshold")]
    threshold: bool,
    /// Skip binarization.
    #[clap(long, overrides_with = "threshold")]
    no_threshold: bool,

    /// Scale pages up by 1.5×.
    #[clap(long, overrides_with = "no_scale_up")]
    scale_up: bool,
    /// Keep pages at their original size.
    #[clap(long, overrides_with = "scale_up")]
    no_scale_up: bool,

    /// Straighten rotated text.
    #[clap(long, overrides_with = "no_deskew")]
    deskew: bool,
    /// Skip deskewing.
    #[clap(long, overrides_with = "deskew")]
    no_deskew: bool,

    /// Flatten uneven page backgrounds.
    #[clap(long, overrides_with = "no_remove_background")]
    remove_background: bool,
    /// Keep page backgrounds as they are.
    #[clap(long, overrides_with = "remove_background")]
    no_remove_background: bool,
}

impl PreprocessFlags {
    /// Apply our flags on top of `base`.
    pub fn apply_to(&self, base: PreprocessOptions) -> PreprocessOptions {
        let pick = |on: bool, off: bool, default: bool| {
            if on {
                true
            } else if off {
                false
            } else {
                default
            }
        };
        PreprocessOptions {
            grayscale: pick(self.grayscale, self.no_grayscale, base.grayscale),
            denoise: pick(self.denoise, self.no_denoise, base.denoise),
            threshold: pick(self.threshold, self.no_threshold, base.threshold),
            scale_up: pick(self.scale_up, self.no_scale_up, base.scale_up),
            deskew: pick(self.deskew, self.no_deskew, base.deskew),
            remove_background: pick(
                self.remove_background,
                self.no_remove_background,
                base.remove_background,
            ),
        }
    }
}

/// OCR command line arguments.
#[derive(Debug, Args)]
pub struct OcrOpts {
    /// Images, PDFs, or directories containing them. Use `-` to read one
    /// document from standard input.
    #[clap(required = true, value_name = "PATH")]
    pub paths: Vec<PathBuf>,

    /// Search directories recursively.
    #[clap(short = 'r', long)]
    pub recursive: bool,

    /// The recognition backend: tesseract, paddleocr or easyocr.
    #[clap(short = 'e', long)]
    pub engine: Option<String>,

    /// Languages to recognize, as Tesseract codes (`pol,eng`).
    #[clap(short = 'l', long, value_delimiter = ',', num_args = 1..)]
    pub languages: Option<Vec<String>>,

    /// Resolution for rendering PDF pages.
    #[clap(long)]
    pub dpi: Option<u32>,

    /// Only process the first N pages of each document.
    #[clap(long)]
    pub max_pages: Option<usize>,

    /// Detect text regions first, and recognize each one separately. The
    /// detector may be `easyocr` (falls back to `contours` when EasyOCR is
    /// not installed) or `contours`.
    #[clap(
        long,
        value_name = "DETECTOR",
        num_args = 0..=1,
        default_missing_value = "easyocr"
    )]
    pub detect_regions: Option<String>,

    /// Run backends on a GPU, where supported.
    #[clap(long)]
    pub gpu: bool,

    #[clap(flatten)]
    pub preprocess: PreprocessFlags,

    #[clap(flatten)]
    pub stream_opts: StreamOpts,

    /// Output format.
    #[clap(long, value_enum, default_value_t)]
    pub format: OcrFormat,

    /// Also write each document's text to `DIR/<name>.txt`.
    #[clap(long, value_name = "DIR")]
    pub text_dir: Option<PathBuf>,

    /// Configuration file (TOML or JSON).
    #[clap(long)]
    pub config: Option<PathBuf>,

    /// Output file. Defaults to standard output.
    #[clap(short = 'o', long = "out")]
    pub output_path: Option<PathBuf>,
}

/// The `ocr` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_ocr(ui: Ui, opts: &OcrOpts) -> Result<()> {
    let config = Config::load(opts.config.as_deref()).await?;

    // Command-line flags win over the config file.
    let engine = opts
        .engine
        .clone()
        .unwrap_or_else(|| config.ocr.default_engine.clone());
    let languages = opts
        .languages
        .clone()
        .unwrap_or_else(|| config.ocr.default_languages.clone());
    // Reject unknown engines before we look at any input.
    engine.parse::<BackendKind>()?;
    let job_count = opts.stream_opts.job_count.unwrap_or(config.ocr.max_workers);
    if job_count == 0 {
        return Err(OcrError::Configuration("--jobs must be greater than 0".to_owned()).into());
    }
    if opts.max_pages == Some(0) {
        return Err(
            OcrError::Configuration("--max-pages must be greater than 0".to_owned()).into(),
        );
    }
    let page_iter = PageIterOptions {
        dpi: opts.dpi.unwrap_or(config.ocr.pdf_dpi),
        max_pages: opts.max_pages,
    };
    let preprocess = opts.preprocess.apply_to(config.preprocess);
    let mut backend_options = config.models.clone();
    backend_options.use_gpu |= opts.gpu;

    let paths = gather_paths(&opts.paths, opts.recursive);
    if paths.is_empty() {
        return Err(anyhow!("no supported documents found"));
    }
    info!(
        documents = paths.len(),
        %engine,
        languages = %languages.join("+"),
        "Starting OCR"
    );

    let detector = match &opts.detect_regions {
        Some(name) => Some(detector_for(name, &languages, &backend_options).await?),
        None => None,
    };
    let (ctx, worker) = OcrContext::connect(
        &engine,
        languages,
        &backend_options,
        OcrOptions {
            preprocess,
            page_iter,
            detector,
            concurrency: job_count,
        },
    )
    .await?;

    if let Some(dir) = &opts.text_dir {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("cannot create {:?}", dir.display()))?;
    }

    let pb = ui.new_progress_bar(
        &ProgressConfig {
            emoji: "🔍",
            msg: "Recognizing documents",
            done_msg: "Recognized documents",
        },
        paths.len() as u64,
    );
    let stream = pb
        .wrap_stream(ocr_documents(paths, Arc::new(ctx)))
        .boxed();
    let stream = match opts.text_dir.clone() {
        Some(dir) => stream
            .and_then(move |record| {
                let dir = dir.clone();
                async move {
                    write_text_file(&dir, &record).await?;
                    Ok(record)
                }
            })
            .boxed(),
        None => stream,
    };

    let (stream, counters) = DocumentCounters::wrap_stream(stream);
    let output_path = opts.output_path.as_deref();
    match opts.format {
        OcrFormat::Jsonl => write_output(output_path, OutputFormat::Jsonl, stream).await?,
        OcrFormat::Json => write_output(output_path, OutputFormat::Json, stream).await?,
        OcrFormat::Text => write_text_output(output_path, stream).await?,
    }
    counters.finish(&ui, opts.stream_opts.allowed_failure_rate)?;

    worker.join().await
}

/// Write the text of a successful document to `dir/<stem>.txt`.
async fn write_text_file(dir: &Path, record: &DocumentOutput) -> Result<()> {
    let Some(result) = &record.result else {
        return Ok(());
    };
    let stem = if record.source == Path::new(STDIN_PATH) {
        "stdin".to_owned()
    } else {
        record
            .source
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| "document".to_owned())
    };
    let path = dir.join(format!("{stem}.txt"));
    tokio::fs::write(&path, result.full_text())
        .await
        .with_context(|| format!("cannot write {:?}", path.display()))?;
    debug!(path = %path.display(), "Wrote text file");
    Ok(())
}

/// Write only the recognized text. Failed documents are left out.
async fn write_text_output(
    path: Option<&Path>,
    stream: BoxedStream<Result<DocumentOutput>>,
) -> Result<()> {
    let mut writer = BufWriter::new(create_writer(path).await?);
    pin_mut!(stream);
    let mut first = true;
    while let Some(record) = stream.next().await {
        let Some(result) = record?.result else {
            continue;
        };
        if !first {
            writer
                .write_all(b"\n")
                .await
                .context("Failed to write separator to output")?;
        }
        first = false;
        let mut text = result.full_text();
        if !text.ends_with('\n') {
            text.push('\n');
        }
        writer
            .write_all(text.as_bytes())
            .await
            .context("Failed to write text to output")?;
    }
    writer.flush().await.context("Failed to flush output")?;
    Ok(())
}
