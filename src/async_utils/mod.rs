//! Asynchronous utilities for use with Tokio.
//!
//! We keep the stream plumbing here so that the OCR code itself can read as a
//! straightforward pipeline: pages in, results out.

use std::pin::Pin;

use futures::Stream;
use tokio::task::JoinHandle;

use crate::prelude::*;

pub mod blocking_iter_streams;
pub mod io;

/// A type alias for a boxed future. This is used to make it easier to work with
/// with complex futures.
pub type BoxedFuture<Output> = Pin<Box<dyn Future<Output = Output> + Send>>;

/// A type alias for a boxed stream. This is used to make it easier to work
/// streams that return complex types.
pub type BoxedStream<Item> = Pin<Box<dyn Stream<Item = Item> + Send>>;

/// A handle for one or more background workers. This can be awaited
/// to wait for all workers to complete normally.
pub struct JoinWorker {
    /// The task handle.
    future: BoxedFuture<Result<()>>,
}

impl JoinWorker {
    /// Create a new worker handle from a [`JoinHandle`].
    pub fn from_handle(handle: JoinHandle<Result<()>>) -> Self {
        Self {
            future: Box::pin(async move { handle.await.context("could not join task")? }),
        }
    }

    /// Wait for the worker to complete.
    pub async fn join(self) -> Result<()> {
        self.future.await
    }
}

/// Report any command failures, and include any error output.
///
/// Standard output and standard error are logged at debug level. Standard
/// error may optionally be checked line by line with `is_error_line`, for
/// tools that print errors but still exit successfully.
pub fn check_for_command_failure(
    command_name: &str,
    output: &std::process::Output,
    is_error_line: Option<&dyn Fn(&str) -> bool>,
) -> Result<()> {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    trace!(
        command_name = command_name,
        output = %stdout,
        "Standard output from command"
    );
    if !stderr.trim().is_empty() {
        debug!(
            command_name = command_name,
            output = %stderr,
            "Standard error from command",
        );
    }

    if output.status.success() {
        if let Some(is_error_line) = is_error_line
            && stderr.lines().any(is_error_line)
        {
            return Err(anyhow!(
                "{} printed error output:\n{}",
                command_name,
                stderr,
            ));
        }
        Ok(())
    } else if let Some(exit_code) = output.status.code() {
        Err(anyhow!(
            "{} failed with exit code {} and error output:\n{}",
            command_name,
            exit_code,
            stderr,
        ))
    } else {
        Err(anyhow!(
            "{} failed with error output:\n{}",
            command_name,
            stderr,
        ))
    }
}

#[cfg(test)]
mod tests {
    use std::process::Command;

    use super::*;

    #[test]
    fn successful_command_passes() -> Result<()> {
        let output = Command::new("sh").args(["-c", "echo hello"]).output()?;
        check_for_command_failure("sh", &output, None)
    }

    #[test]
    fn failing_command_reports_exit_code_and_stderr() -> Result<()> {
        let output = Command::new("sh")
            .args(["-c", "echo broken >&2; exit 3"])
            .output()?;
        let err = check_for_command_failure("sh", &output, None).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("exit code 3"));
        assert!(message.contains("broken"));
        Ok(())
    }

    #[test]
    fn error_lines_fail_an_otherwise_successful_command() -> Result<()> {
        let output = Command::new("sh")
            .args(["-c", "echo 'Syntax Error: bad xref' >&2"])
            .output()?;
        let is_error = |line: &str| line.contains("Error");
        assert!(check_for_command_failure("sh", &output, Some(&is_error)).is_err());
        Ok(())
    }
}
