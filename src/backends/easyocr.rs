//! EasyOCR, via the `easyocr` CLI tool.
//!
//! With `--detail 1 --output_format json` the tool prints one JSON object per
//! detected line of text, with a four-point box and a score in `[0, 1]`.

use image::DynamicImage;
use tokio::process::Command;

use super::{
    BackendCapability, BackendKind, BackendOptions, RecognitionBackend, home_dir, iso639_1,
    model_dir_is_populated, resolve_executable, run_engine, score_to_confidence, unavailable,
    write_png,
};
use crate::{
    model::{BoundingBox, RecognitionOutput, TextFragment},
    prelude::*,
};

/// Backend wrapping the `easyocr` CLI tool.
pub struct EasyOcrBackend {
    executable: PathBuf,
    languages: Vec<String>,
    model_dir: Option<PathBuf>,
    auto_download: bool,
    use_gpu: bool,
}

impl EasyOcrBackend {
    /// Create a backend from a successful probe.
    pub fn new(
        capability: BackendCapability,
        languages: Vec<String>,
        options: &BackendOptions,
    ) -> Self {
        Self {
            executable: capability.executable,
            languages,
            model_dir: options.easyocr_model_dir.clone(),
            auto_download: options.auto_download_missing,
            use_gpu: options.use_gpu,
        }
    }
}

/// The CLI parses its boolean flags with Python's `bool()`, so any non-empty
/// string is true. Only an empty argument turns a flag off.
fn python_bool(value: bool) -> &'static str {
    if value { "True" } else { "" }
}

#[async_trait]
impl RecognitionBackend for EasyOcrBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::EasyOcr
    }

    fn languages(&self) -> &[String] {
        &self.languages
    }

    #[instrument(level = "debug", skip_all)]
    async fn recognize(&self, image: &DynamicImage) -> Result<RecognitionOutput> {
        let tmpdir = tempfile::TempDir::with_prefix("easyocr")?;
        let input_path = tmpdir.path().join("page.png");
        write_png(image, &input_path).await?;

        let mut cmd = Command::new(&self.executable);
        cmd.arg("-l")
            .args(self.languages.iter().map(|lang| iso639_1(lang)))
            .arg("-f")
            .arg(&input_path)
            .args(["--detail", "1"])
            .args(["--output_format", "json"])
            .arg("--gpu")
            .arg(python_bool(self.use_gpu));
        if let Some(dir) = &self.model_dir {
            cmd.arg("--model_storage_directory").arg(dir);
        }
        if !self.auto_download {
            cmd.arg("--download_enabled").arg(python_bool(false));
        }
        let output = run_engine(BackendKind::EasyOcr, cmd).await?;
        Ok(parse_easyocr_output(&String::from_utf8_lossy(
            &output.stdout,
        )))
    }
}

/// Check that `easyocr` is installed and, unless downloads are allowed, that
/// its models are already on disk.
pub async fn probe(languages: &[String], options: &BackendOptions) -> Result<BackendCapability> {
    let kind = BackendKind::EasyOcr;
    let executable = resolve_executable(kind, options.easyocr_cmd.as_deref())?;

    let model_dir = options
        .easyocr_model_dir
        .clone()
        .or_else(|| home_dir().map(|home| home.join(".EasyOCR").join("model")));
    if !options.auto_download_missing {
        match &model_dir {
            Some(dir) if model_dir_is_populated(dir) => {}
            Some(dir) => {
                return Err(unavailable(kind, format!("models in {:?}", dir.display())));
            }
            None => return Err(unavailable(kind, "an EasyOCR model directory")),
        }
    }

    Ok(BackendCapability {
        backend: kind,
        executable,
        languages: languages.iter().map(|lang| iso639_1(lang)).collect(),
        model_dirs: model_dir.into_iter().collect(),
    })
}

/// One detected line, as printed by the CLI.
#[derive(Debug, Deserialize)]
struct EasyOcrLine {
    #[serde(default)]
    boxes: Vec<[f64; 2]>,
    text: String,
    #[serde(default)]
    confident: Option<f64>,
}

/// Normalize EasyOCR's JSON-lines output.
///
/// Lines that are not JSON objects (progress messages, warnings) are
/// skipped. Each detected line becomes a fragment, and the page text is the
/// fragment texts joined by `\n`.
pub fn parse_easyocr_output(stdout: &str) -> RecognitionOutput {
    let mut fragments = vec![];
    for line in stdout.lines().map(str::trim) {
        if !line.starts_with('{') {
            continue;
        }
        let parsed = match serde_json::from_str::<EasyOcrLine>(line) {
            Ok(parsed) => parsed,
            Err(err) => {
                debug!(%err, %line, "Skipping unparseable easyocr line");
                continue;
            }
        };
        let points = parsed
            .boxes
            .into_iter()
            .map(|[x, y]| (x, y))
            .collect::<Vec<_>>();
        fragments.push(TextFragment {
            text: parsed.text,
            bbox: BoundingBox::from_points(&points).unwrap_or_default(),
            confidence: parsed.confident.and_then(score_to_confidence),
        });
    }

    let text = fragments
        .iter()
        .map(|fragment| fragment.text.as_str())
        .collect::<Vec<_>>()
        .join("\n");
    RecognitionOutput::from_fragments(text, fragments)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_lines_are_normalized() {
        let output = parse_easyocr_output(concat!(
            "Using CPU. Note: This module is much faster with a GPU.\n",
            r#"{"boxes": [[10, 10], [50, 10], [50, 30], [10, 30]], "text": "Umowa", "confident": 0.95}"#,
            "\n",
            r#"{"boxes": [[10, 40], [90, 40], [90, 60], [10, 60]], "text": "nr 12/2024", "confident": 0.85}"#,
            "\n",
        ));
        assert_eq!(output.text, "Umowa\nnr 12/2024");
        assert_eq!(output.fragments[0].bbox, BoundingBox::new(10, 10, 40, 20));
        let confidence = output.confidence.unwrap();
        assert!((confidence - 90.0).abs() < 1e-9);
    }

    #[test]
    fn broken_lines_are_skipped_and_texts_kept_verbatim() {
        let output = parse_easyocr_output(concat!(
            "{not json}\n",
            r#"{"boxes": [], "text": "  ", "confident": 0.5}"#,
            "\n",
            r#"{"text": "ok"}"#,
            "\n",
        ));
        assert_eq!(output.text, "  \nok");
        assert_eq!(output.fragments.len(), 2);
        assert_eq!(output.fragments[0].bbox, BoundingBox::default());
        assert_eq!(output.confidence, Some(50.0));
    }

    #[test]
    fn no_output_is_empty() {
        let output = parse_easyocr_output("");
        assert_eq!(output.text, "");
        assert_eq!(output.confidence, None);
    }

    #[test]
    fn false_flags_are_empty_strings() {
        assert_eq!(python_bool(false), "");
        assert_eq!(python_bool(true), "True");
    }

    #[tokio::test]
    async fn empty_model_dir_is_unavailable_without_downloads() -> Result<()> {
        let Ok(executable) = which::which("sh") else {
            return Ok(());
        };
        let models = tempfile::TempDir::with_prefix("easyocr-models")?;
        let options = BackendOptions {
            easyocr_cmd: Some(executable),
            easyocr_model_dir: Some(models.path().to_owned()),
            auto_download_missing: false,
            ..BackendOptions::default()
        };
        assert!(probe(&["eng".to_owned()], &options).await.is_err());

        std::fs::write(models.path().join("craft_mlt_25k.pth"), b"")?;
        let capability = probe(&["eng".to_owned(), "pol".to_owned()], &options).await?;
        assert_eq!(capability.languages, vec!["en", "pl"]);
        Ok(())
    }
}
