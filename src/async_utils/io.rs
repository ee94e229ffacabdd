//! I/O utilities.
//!
//! This module is responsible for reading configuration files and writing
//! output records. Output is written as records arrive, so a long batch can be
//! watched with `tail -f`.

use futures::{pin_mut, stream::StreamExt as _};
use tokio::{
    fs::File,
    io::{AsyncWrite, AsyncWriteExt as _, BufWriter},
};

use super::BoxedStream;
use crate::prelude::*;

/// Read TOML or JSON from a file, based on its extension.
pub async fn read_json_or_toml<T>(path: &Path) -> Result<T>
where
    T: serde::de::DeserializeOwned,
{
    let data = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read file at path: {:?}", path))?;
    let ext = path.extension().unwrap_or_default();
    if ext == "json" {
        serde_json::from_str(&data).with_context(|| {
            format!("Failed to parse JSON from file at path: {:?}", path)
        })
    } else {
        toml::from_str(&data).with_context(|| {
            format!("Failed to parse TOML from file at path: {:?}", path)
        })
    }
}

/// Create an [`AsyncWrite`] for a file or stdout.
pub async fn create_writer(
    path: Option<&Path>,
) -> Result<Box<dyn AsyncWrite + Unpin + Send + Sync + 'static>> {
    match path {
        Some(path) => {
            let file = File::create(path)
                .await
                .with_context(|| format!("Failed to create file at path: {:?}", path))?;
            Ok(Box::new(file))
        }
        None => Ok(Box::new(tokio::io::stdout())),
    }
}

/// How should we write output records?
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OutputFormat {
    /// One JSON object per line.
    #[default]
    Jsonl,
    /// A single pretty-printed JSON array.
    Json,
}

/// Write a stream of serializable records to either standard output or a
/// file.
pub async fn write_output<T>(
    path: Option<&Path>,
    format: OutputFormat,
    stream: BoxedStream<Result<T>>,
) -> Result<()>
where
    T: Serialize + std::fmt::Debug,
{
    let mut writer = BufWriter::new(create_writer(path).await?);
    pin_mut!(stream);
    let mut first = true;
    if format == OutputFormat::Json {
        writer
            .write_all(b"[\n")
            .await
            .context("Failed to write output")?;
    }
    while let Some(record) = stream.next().await {
        let record = record?;
        let json = match format {
            OutputFormat::Jsonl => serde_json::to_string(&record),
            OutputFormat::Json => serde_json::to_string_pretty(&record),
        }
        .with_context(|| format!("Failed to serialize JSON from record: {:?}", record))?;
        if format == OutputFormat::Json && !first {
            writer
                .write_all(b",\n")
                .await
                .context("Failed to write separator to output")?;
        }
        first = false;
        writer
            .write_all(json.as_bytes())
            .await
            .context("Failed to write JSON to output")?;
        if format == OutputFormat::Jsonl {
            writer
                .write_all(b"\n")
                .await
                .context("Failed to write newline to output")?;
        }
    }
    if format == OutputFormat::Json {
        writer
            .write_all(b"\n]\n")
            .await
            .context("Failed to write output")?;
    }
    writer.flush().await.context("Failed to flush output")?;
    Ok(())
}
