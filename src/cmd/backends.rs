//! The `backends` subcommand: which OCR engines can we run here?

use clap::Args;
use tokio::io::AsyncWriteExt as _;

use crate::{
    async_utils::io::create_writer,
    backends::{BackendCapability, BackendKind, probe},
    config::Config,
    prelude::*,
};

/// Backends command line arguments.
#[derive(Debug, Args)]
pub struct BackendsOpts {
    /// Languages to check for, as Tesseract codes. Defaults to the config
    /// file's languages.
    #[clap(short = 'l', long, value_delimiter = ',', num_args = 1..)]
    pub languages: Option<Vec<String>>,

    /// Print a JSON report instead of a table.
    #[clap(long)]
    pub json: bool,

    /// Configuration file (TOML or JSON).
    #[clap(long)]
    pub config: Option<PathBuf>,
}

/// The probe result for one backend.
#[derive(Debug, Serialize)]
pub struct BackendReport {
    /// The backend we probed.
    pub backend: BackendKind,

    /// Can we use it?
    pub available: bool,

    /// What we found, if it is available.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capability: Option<BackendCapability>,

    /// Why not, if it isn't.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BackendReport {
    fn from_probe(backend: BackendKind, result: Result<BackendCapability>) -> Self {
        match result {
            Ok(capability) => Self {
                backend,
                available: true,
                capability: Some(capability),
                error: None,
            },
            Err(err) => Self {
                backend,
                available: false,
                capability: None,
                error: Some(format!("{err:#}")),
            },
        }
    }

    /// One line of the human-readable table.
    fn to_line(&self) -> String {
        match (&self.capability, &self.error) {
            (Some(capability), _) => format!(
                "✅ {:<10} {}",
                self.backend.name(),
                capability.executable.display()
            ),
            (None, Some(error)) => format!("❌ {:<10} {error}", self.backend.name()),
            (None, None) => format!("❌ {:<10} unavailable", self.backend.name()),
        }
    }
}

/// The `backends` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_backends(opts: &BackendsOpts) -> Result<()> {
    let config = Config::load(opts.config.as_deref()).await?;
    let languages = opts
        .languages
        .clone()
        .unwrap_or_else(|| config.ocr.default_languages.clone());

    let mut reports = vec![];
    for kind in BackendKind::ALL {
        let result = probe(kind, &languages, &config.models).await;
        debug!(backend = %kind, ok = result.is_ok(), "Probed backend");
        reports.push(BackendReport::from_probe(kind, result));
    }

    let output = if opts.json {
        serde_json::to_string_pretty(&reports).context("failed to serialize report")? + "\n"
    } else {
        let mut table = format!("Languages: {}\n", languages.join(", "));
        for report in &reports {
            table.push_str(&report.to_line());
            table.push('\n');
        }
        table
    };
    let mut wtr = create_writer(None).await?;
    wtr.write_all(output.as_bytes())
        .await
        .context("failed to write report")?;
    wtr.flush().await.context("failed to flush report")?;
    Ok(())
}
