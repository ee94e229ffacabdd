//! Configuration file support.
//!
//! A config file supplies defaults for the `ocr` and `backends` subcommands.
//! Command-line flags override anything set here. Files may be TOML or JSON:
//!
//! ```toml
//! [ocr]
//! default_engine = "tesseract"
//! default_languages = ["pol", "eng"]
//! pdf_dpi = 300
//! max_workers = 4
//!
//! [preprocess]
//! deskew = false
//!
//! [models]
//! tessdata_dir = "/usr/share/tesseract-ocr/5/tessdata"
//! auto_download_missing = false
//! ```

use schemars::JsonSchema;

use crate::{
    async_utils::io::read_json_or_toml,
    backends::{BackendKind, BackendOptions},
    errors::OcrError,
    prelude::*,
    preprocess::PreprocessOptions,
};

/// Top-level configuration.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// General OCR settings.
    pub ocr: OcrSettings,

    /// Default preprocessing steps.
    pub preprocess: PreprocessOptions,

    /// Where to find backend executables and models.
    pub models: BackendOptions,
}

/// General OCR settings.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct OcrSettings {
    /// The backend used when none is given on the command line.
    pub default_engine: String,

    /// Languages used when none are given on the command line, as Tesseract
    /// codes (`pol`, `eng`, ...).
    pub default_languages: Vec<String>,

    /// Resolution used to render PDF pages.
    pub pdf_dpi: u32,

    /// Number of pages processed at once.
    pub max_workers: usize,
}

impl Default for OcrSettings {
    fn default() -> Self {
        Self {
            default_engine: "tesseract".to_owned(),
            default_languages: vec!["pol".to_owned(), "eng".to_owned()],
            pdf_dpi: 300,
            max_workers: 4,
        }
    }
}

impl Config {
    /// Load a config file, or return the defaults when `path` is `None`.
    #[instrument(level = "debug", skip_all)]
    pub async fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => read_json_or_toml::<Config>(path)
                .await
                .with_context(|| format!("failed to load config {:?}", path.display()))?,
            None => Config::default(),
        };
        config.validate()?;
        debug!(?config, "Loaded configuration");
        Ok(config)
    }

    /// Check the config for problems, reporting all of them at once.
    pub fn validate(&self) -> Result<()> {
        let mut problems = vec![];
        if self.ocr.pdf_dpi == 0 {
            problems.push("ocr.pdf_dpi must be greater than 0".to_owned());
        }
        if self.ocr.max_workers == 0 {
            problems.push("ocr.max_workers must be greater than 0".to_owned());
        }
        if self.ocr.default_languages.is_empty() {
            problems.push("ocr.default_languages must not be empty".to_owned());
        }
        if self.ocr.default_engine.parse::<BackendKind>().is_err() {
            problems.push(format!(
                "ocr.default_engine {:?} is not a supported backend",
                self.ocr.default_engine
            ));
        }
        if !self.models.auto_download_missing {
            let dirs = [
                ("models.tessdata_dir", &self.models.tessdata_dir),
                (
                    "models.paddleocr_det_model_dir",
                    &self.models.paddleocr_det_model_dir,
                ),
                (
                    "models.paddleocr_rec_model_dir",
                    &self.models.paddleocr_rec_model_dir,
                ),
                ("models.easyocr_model_dir", &self.models.easyocr_model_dir),
            ];
            for (name, dir) in dirs {
                if let Some(dir) = dir
                    && !dir.is_dir()
                {
                    problems.push(format!(
                        "{name} {:?} does not exist and auto_download_missing is off",
                        dir.display()
                    ));
                }
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(OcrError::Configuration(problems.join("; ")).into())
        }
    }
}
