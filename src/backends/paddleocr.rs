//! PaddleOCR, via the `paddleocr` CLI tool (PaddleOCR 3.x).
//!
//! The CLI writes a `<stem>_res.json` file per input image into a save
//! directory. That file holds parallel arrays of recognized texts, scores in
//! `[0, 1]` and detection polygons.

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

/// Backend wrapping the `paddleocr` CLI tool.
pub struct PaddleOcrBackend {
    executable: PathBuf,
    languages: Vec<String>,
    lang: String,
    det_model_dir: Option<PathBuf>,
    rec_model_dir: Option<PathBuf>,
    use_gpu: bool,
}

impl PaddleOcrBackend {
    /// Create a backend from a successful probe.
    pub fn new(
        capability: BackendCapability,
        languages: Vec<String>,
        options: &BackendOptions,
    ) -> Self {
        let lang = paddle_language(&languages);
        if languages.len() > 1 {
            warn!(
                %lang,
                ignored = ?&languages[1..],
                "PaddleOCR reads one language at a time; using the first"
            );
        }
        Self {
            executable: capability.executable,
            languages,
            lang,
            det_model_dir: options.paddleocr_det_model_dir.clone(),
            rec_model_dir: options.paddleocr_rec_model_dir.clone(),
            use_gpu: options.use_gpu,
        }
    }
}

#[async_trait]
impl RecognitionBackend for PaddleOcrBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::PaddleOcr
    }

    fn languages(&self) -> &[String] {
        &self.languages
    }

    #[instrument(level = "debug", skip_all)]
    async fn recognize(&self, image: &DynamicImage) -> Result<RecognitionOutput> {
        let tmpdir = tempfile::TempDir::with_prefix("paddleocr")?;
        let input_path = tmpdir.path().join("page.png");
        let save_dir = tmpdir.path().join("out");
        tokio::fs::create_dir(&save_dir).await?;
        write_png(image, &input_path).await?;

        let mut cmd = Command::new(&self.executable);
        cmd.arg("ocr")
            .arg("-i")
            .arg(&input_path)
            .arg("--save_path")
            .arg(&save_dir)
            .arg("--lang")
            .arg(&self.lang)
            .args(["--use_doc_orientation_classify", "False"])
            .args(["--use_doc_unwarping", "False"])
            .args(["--use_textline_orientation", "True"])
            .arg("--device")
            .arg(if self.use_gpu { "gpu" } else { "cpu" });
        if let Some(dir) = &self.det_model_dir {
            cmd.arg("--text_detection_model_dir").arg(dir);
        }
        if let Some(dir) = &self.rec_model_dir {
            cmd.arg("--text_recognition_model_dir").arg(dir);
        }
        run_engine(BackendKind::PaddleOcr, cmd).await?;

        let result_path = find_result_file(&save_dir, "page").await?;
        let json = tokio::fs::read_to_string(&result_path)
            .await
            .with_context(|| format!("cannot read {:?}", result_path.display()))?;
        parse_paddle_json(&json)
    }
}

/// Locate the result file PaddleOCR wrote for the input named `stem`.
async fn find_result_file(save_dir: &Path, stem: &str) -> Result<PathBuf> {
    let expected = save_dir.join(format!("{stem}_res.json"));
    if tokio::fs::try_exists(&expected).await? {
        return Ok(expected);
    }
    let mut entries = tokio::fs::read_dir(save_dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.ends_with("_res.json"))
        {
            return Ok(path);
        }
    }
    Err(anyhow!("paddleocr did not write a result file"))
}

/// Check that `paddleocr` is installed and, unless downloads are allowed,
/// that its models are already on disk.
pub async fn probe(languages: &[String], options: &BackendOptions) -> Result<BackendCapability> {
    let kind = BackendKind::PaddleOcr;
    let executable = resolve_executable(kind, options.paddleocr_cmd.as_deref())?;

    let configured = [
        options.paddleocr_det_model_dir.clone(),
        options.paddleocr_rec_model_dir.clone(),
    ]
    .into_iter()
    .flatten()
    .collect::<Vec<_>>();
    let model_dirs = if configured.is_empty() {
        home_dir()
            .map(|home| vec![home.join(".paddlex").join("official_models")])
            .unwrap_or_default()
    } else {
        configured
    };

    if !options.auto_download_missing {
        if model_dirs.is_empty() {
            return Err(unavailable(kind, "a PaddleOCR model directory"));
        }
        for dir in &model_dirs {
            if !model_dir_is_populated(dir) {
                return Err(unavailable(kind, format!("models in {:?}", dir.display())));
            }
        }
    }

    Ok(BackendCapability {
        backend: kind,
        executable,
        languages: vec![paddle_language(languages)],
        model_dirs,
    })
}

/// PaddleOCR's name for the first requested language.
fn paddle_language(languages: &[String]) -> String {
    let Some(first) = languages.first() else {
        return "en".to_owned();
    };
    match first.as_str() {
        "eng" => "en".to_owned(),
        "pol" => "pl".to_owned(),
        "deu" => "german".to_owned(),
        "fra" => "french".to_owned(),
        "jpn" => "japan".to_owned(),
        "kor" => "korean".to_owned(),
        "chi_sim" => "ch".to_owned(),
        "chi_tra" => "chinese_cht".to_owned(),
        other => iso639_1(other),
    }
}

/// The arrays we read from a `*_res.json` file.
#[derive(Debug, Default, Deserialize)]
struct PaddleArrays {
    #[serde(default)]
    rec_texts: Vec<String>,
    #[serde(default)]
    rec_scores: Vec<f64>,
    #[serde(default)]
    rec_polys: Vec<Vec<[f64; 2]>>,
}

/// Some versions wrap the arrays in a `res` object.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PaddleResult {
    Wrapped { res: PaddleArrays },
    Bare(PaddleArrays),
}

/// Normalize a PaddleOCR result file.
///
/// Each recognized text becomes one fragment, boxed by its polygon. The page
/// text is the fragment texts joined by `\n`, in the order PaddleOCR listed
/// them.
pub fn parse_paddle_json(json: &str) -> Result<RecognitionOutput> {
    let result: PaddleResult =
        serde_json::from_str(json).context("cannot parse paddleocr result")?;
    let arrays = match result {
        PaddleResult::Wrapped { res } => res,
        PaddleResult::Bare(arrays) => arrays,
    };

    let mut scores = arrays.rec_scores.into_iter();
    let mut polys = arrays.rec_polys.into_iter();
    let mut fragments = vec![];
    for text in arrays.rec_texts {
        let score = scores.next();
        let poly = polys.next();
        let points = poly
            .unwrap_or_default()
            .into_iter()
            .map(|[x, y]| (x, y))
            .collect::<Vec<_>>();
        fragments.push(TextFragment {
            text,
            bbox: BoundingBox::from_points(&points).unwrap_or_default(),
            confidence: score.and_then(score_to_confidence),
        });
    }

    let text = fragments
        .iter()
        .map(|fragment| fragment.text.as_str())
        .collect::<Vec<_>>()
        .join("\n");
    Ok(RecognitionOutput::from_fragments(text, fragments))
}
