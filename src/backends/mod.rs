//! Recognition backends.
//!
//! Three engines with very different output formats sit behind one trait,
//! [`RecognitionBackend`]. Each one runs its engine's command-line tool once
//! per page and normalizes what comes back into a [`RecognitionOutput`]:
//!
//! - [`tesseract`]: word rows from Tesseract's TSV output, grouped into lines.
//! - [`paddleocr`]: parallel arrays of polygons, texts and scores.
//! - [`easyocr`]: one JSON object per detected line.
//!
//! Backends are chosen once per batch with [`backend_for`], which runs an
//! explicit availability [`probe`] first. We never silently fall back to a
//! different engine.

use std::{fmt, process::Output, str::FromStr, sync::Arc};

use image::DynamicImage;
use schemars::JsonSchema;
use tokio::process::Command;

use crate::{
    async_utils::{
        blocking_iter_streams::spawn_blocking_propagating_panics,
        check_for_command_failure,
    },
    cpu_limit::with_cpu_semaphore,
    errors::OcrError,
    model::RecognitionOutput,
    prelude::*,
};

pub mod easyocr;
pub mod paddleocr;
pub mod tesseract;

/// The recognition engines we support.
#[derive(
    Clone, Copy, Debug, Deserialize, Hash, JsonSchema, PartialEq, Eq, Serialize,
)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Tesseract,
    #[serde(rename = "paddleocr")]
    PaddleOcr,
    #[serde(rename = "easyocr")]
    EasyOcr,
}

impl BackendKind {
    /// Every backend, in the order we list them.
    pub const ALL: [BackendKind; 3] = [
        BackendKind::Tesseract,
        BackendKind::PaddleOcr,
        BackendKind::EasyOcr,
    ];

    /// The name used on the command line and in output.
    pub fn name(self) -> &'static str {
        match self {
            BackendKind::Tesseract => "tesseract",
            BackendKind::PaddleOcr => "paddleocr",
            BackendKind::EasyOcr => "easyocr",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for BackendKind {
    type Err = OcrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        BackendKind::ALL
            .into_iter()
            .find(|kind| kind.name() == wanted)
            .ok_or_else(|| OcrError::UnsupportedBackend { name: s.to_owned() })
    }
}

/// Where to find backend executables and models.
///
/// Every field is optional. Commands default to the name of the tool on
/// `PATH`, and model directories default to each tool's own cache.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackendOptions {
    /// Path to the `tesseract` executable.
    pub tesseract_cmd: Option<PathBuf>,

    /// Directory containing `*.traineddata` files.
    pub tessdata_dir: Option<PathBuf>,

    /// Path to the `paddleocr` executable.
    pub paddleocr_cmd: Option<PathBuf>,

    /// PaddleOCR text detection model directory.
    pub paddleocr_det_model_dir: Option<PathBuf>,

    /// PaddleOCR text recognition model directory.
    pub paddleocr_rec_model_dir: Option<PathBuf>,

    /// Path to the `easyocr` executable.
    pub easyocr_cmd: Option<PathBuf>,

    /// EasyOCR model storage directory.
    pub easyocr_model_dir: Option<PathBuf>,

    /// May backends download missing models on first use? When this is
    /// false, models must already be on disk.
    pub auto_download_missing: bool,

    /// Ask backends that support it to run on a GPU.
    pub use_gpu: bool,
}

/// Interface to a recognition engine.
///
/// One instance is shared by every page task in a batch, so implementations
/// must be safe to call concurrently. Ours keep no mutable state and start a
/// fresh process per call.
#[async_trait]
pub trait RecognitionBackend: Send + Sync + 'static {
    /// Which engine is this?
    fn kind(&self) -> BackendKind;

    /// The languages this backend was configured for (Tesseract codes).
    fn languages(&self) -> &[String];

    /// Recognize the text in a single image.
    async fn recognize(&self, image: &DynamicImage) -> Result<RecognitionOutput>;
}

/// What a successful [`probe`] found.
#[derive(Clone, Debug, JsonSchema, Serialize)]
pub struct BackendCapability {
    /// The backend that was probed.
    pub backend: BackendKind,

    /// The executable we will run.
    pub executable: PathBuf,

    /// Languages the backend can read, as far as we could tell. Empty if the
    /// backend cannot list them.
    pub languages: Vec<String>,

    /// Model directories that will be used, if any.
    pub model_dirs: Vec<PathBuf>,
}

/// Check that a backend can run with the requested languages, without
/// recognizing anything.
#[instrument(level = "debug", skip(options))]
pub async fn probe(
    kind: BackendKind,
    languages: &[String],
    options: &BackendOptions,
) -> Result<BackendCapability> {
    if languages.is_empty() {
        return Err(OcrError::Configuration("at least one language is required".to_owned()).into());
    }
    match kind {
        BackendKind::Tesseract => tesseract::probe(languages, options).await,
        BackendKind::PaddleOcr => paddleocr::probe(languages, options).await,
        BackendKind::EasyOcr => easyocr::probe(languages, options).await,
    }
}

/// Probe and construct a backend.
#[instrument(level = "debug", skip(options))]
pub async fn backend_for(
    kind: BackendKind,
    languages: Vec<String>,
    options: &BackendOptions,
) -> Result<Arc<dyn RecognitionBackend>> {
    let capability = probe(kind, &languages, options).await?;
    info!(
        backend = %kind,
        executable = %capability.executable.display(),
        "Using OCR backend"
    );
    let backend: Arc<dyn RecognitionBackend> = match kind {
        BackendKind::Tesseract => Arc::new(tesseract::TesseractBackend::new(
            capability, languages, options,
        )),
        BackendKind::PaddleOcr => Arc::new(paddleocr::PaddleOcrBackend::new(
            capability, languages, options,
        )),
        BackendKind::EasyOcr => Arc::new(easyocr::EasyOcrBackend::new(
            capability, languages, options,
        )),
    };
    Ok(backend)
}

/// Build a [`OcrError::BackendUnavailable`].
pub(crate) fn unavailable(kind: BackendKind, missing: impl Into<String>) -> anyhow::Error {
    OcrError::BackendUnavailable {
        backend: kind.name().to_owned(),
        missing: missing.into(),
    }
    .into()
}

/// Find a backend's executable, either as configured or on `PATH`.
pub(crate) fn resolve_executable(
    kind: BackendKind,
    configured: Option<&Path>,
) -> Result<PathBuf> {
    let wanted = configured.unwrap_or_else(|| Path::new(kind.name()));
    which::which(wanted)
        .map_err(|_| unavailable(kind, format!("executable {:?}", wanted.display())))
}

/// Check that a model directory exists and has at least one file in it.
pub(crate) fn model_dir_is_populated(dir: &Path) -> bool {
    std::fs::read_dir(dir)
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}

/// The user's home directory, where engines keep their model caches.
pub(crate) fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

/// Write a page to a PNG file so an external tool can read it.
pub(crate) async fn write_png(image: &DynamicImage, path: &Path) -> Result<()> {
    let image = image.clone();
    let path = path.to_owned();
    spawn_blocking_propagating_panics(move || {
        image
            .save_with_format(&path, image::ImageFormat::Png)
            .with_context(|| format!("cannot write {:?}", path.display()))
    })
    .await
}

/// Run a recognition command while holding a CPU permit, and check that it
/// succeeded.
pub(crate) async fn run_engine(kind: BackendKind, mut cmd: Command) -> Result<Output> {
    let output = with_cpu_semaphore(|| async {
        cmd.output()
            .await
            .with_context(|| format!("cannot run {kind}"))
    })
    .await?;
    check_for_command_failure(kind.name(), &output, None)?;
    Ok(output)
}

/// Convert a Tesseract language code to the two-letter code most other
/// engines use. Unknown codes are passed through.
pub fn iso639_1(code: &str) -> String {
    let mapped = match code {
        "eng" => "en",
        "pol" => "pl",
        "deu" => "de",
        "fra" => "fr",
        "spa" => "es",
        "ita" => "it",
        "por" => "pt",
        "nld" => "nl",
        "ces" => "cs",
        "slk" => "sk",
        "ukr" => "uk",
        "rus" => "ru",
        "jpn" => "ja",
        "kor" => "ko",
        "chi_sim" => "ch_sim",
        "chi_tra" => "ch_tra",
        other => other,
    };
    mapped.to_owned()
}

/// Scale a score in `[0, 1]` to a confidence in `[0, 100]`.
pub(crate) fn score_to_confidence(score: f64) -> Option<f64> {
    if score.is_finite() && score >= 0.0 {
        Some((score * 100.0).min(100.0))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::find_ocr_error;

    #[test]
    fn backend_names_parse_case_insensitively() -> Result<()> {
        assert_eq!("tesseract".parse::<BackendKind>()?, BackendKind::Tesseract);
        assert_eq!("PaddleOCR".parse::<BackendKind>()?, BackendKind::PaddleOcr);
        assert_eq!(" easyocr ".parse::<BackendKind>()?, BackendKind::EasyOcr);
        Ok(())
    }

    #[test]
    fn unknown_backend_name_is_rejected() {
        let err = "cuneiform".parse::<BackendKind>().unwrap_err();
        assert!(matches!(err, OcrError::UnsupportedBackend { name } if name == "cuneiform"));
    }

    #[test]
    fn backend_kind_round_trips_through_serde_names() -> Result<()> {
        for kind in BackendKind::ALL {
            let json = serde_json::to_value(kind)?;
            assert_eq!(json, serde_json::Value::String(kind.name().to_owned()));
        }
        Ok(())
    }

    #[test]
    fn language_codes_are_mapped_for_other_engines() {
        assert_eq!(iso639_1("pol"), "pl");
        assert_eq!(iso639_1("eng"), "en");
        assert_eq!(iso639_1("en"), "en");
        assert_eq!(iso639_1("xyz"), "xyz");
    }

    #[test]
    fn scores_become_percentages() {
        assert_eq!(score_to_confidence(0.5), Some(50.0));
        assert_eq!(score_to_confidence(1.0), Some(100.0));
        assert_eq!(score_to_confidence(-1.0), None);
        assert_eq!(score_to_confidence(f64::NAN), None);
    }

    #[tokio::test]
    async fn missing_executable_makes_backend_unavailable() {
        let options = BackendOptions {
            easyocr_cmd: Some(PathBuf::from("/nonexistent/bin/easyocr")),
            auto_download_missing: true,
            ..BackendOptions::default()
        };
        let err = probe(BackendKind::EasyOcr, &["eng".to_owned()], &options)
            .await
            .unwrap_err();
        assert!(matches!(
            find_ocr_error(&err),
            Some(OcrError::BackendUnavailable { backend, .. }) if backend == "easyocr"
        ));
    }

    #[tokio::test]
    async fn empty_language_list_is_a_configuration_error() {
        let err = probe(BackendKind::Tesseract, &[], &BackendOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(
            find_ocr_error(&err),
            Some(OcrError::Configuration(_))
        ));
    }
}
