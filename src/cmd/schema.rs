//! The `schema` subcommand.

use clap::{Args, ValueEnum};
use schemars::schema_for;
use tokio::io::AsyncWriteExt as _;

use crate::{
    async_utils::io::create_writer, config::Config, model::BatchResult, prelude::*,
    queues::work::DocumentOutput,
};

/// The different schema types we support.
///
/// We parse these as PascalCase, because they represent type names.
#[derive(Debug, Clone, Copy, ValueEnum)]
#[clap(rename_all = "PascalCase")]
pub enum SchemaType {
    /// One output record of `ocr`.
    DocumentOutput,
    /// The recognized pages of one document.
    BatchResult,
    /// The configuration file.
    Config,
}

/// Schema command line arguments.
#[derive(Debug, Args)]
pub struct SchemaOpts {
    /// The schema type to generate.
    #[clap(value_enum, value_name = "TYPE", default_value = "DocumentOutput")]
    pub schema_type: SchemaType,

    /// The output path to write the schema to.
    #[clap(short = 'o', long = "out")]
    pub output_path: Option<PathBuf>,
}

/// The `schema` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_schema(schema_opts: &SchemaOpts) -> Result<()> {
    let schema = match schema_opts.schema_type {
        SchemaType::DocumentOutput => schema_for!(DocumentOutput),
        SchemaType::BatchResult => schema_for!(BatchResult),
        SchemaType::Config => schema_for!(Config),
    };

    let mut wtr = create_writer(schema_opts.output_path.as_deref()).await?;
    let schema_str =
        serde_json::to_string_pretty(&schema).context("failed to serialize schema")?;
    wtr.write_all(schema_str.as_bytes())
        .await
        .context("failed to write schema")?;
    wtr.write_all(b"\n").await.context("failed to write schema")?;
    wtr.flush().await.context("failed to flush schema")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn document_schema_describes_pages() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("schema")?;
        let path = dir.path().join("schema.json");
        cmd_schema(&SchemaOpts {
            schema_type: SchemaType::DocumentOutput,
            output_path: Some(path.clone()),
        })
        .await?;
        let schema = std::fs::read_to_string(&path)?;
        assert!(schema.contains("\"status\""));
        assert!(schema.contains("\"pages\""));
        assert!(schema.contains("\"confidence\""));
        Ok(())
    }
}
