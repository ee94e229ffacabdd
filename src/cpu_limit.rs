//! Limits on concurrent CPU-heavy external processes.

use std::sync::LazyLock;

use tokio::sync::Semaphore;

use crate::prelude::*;

/// One permit per core, shared by every `pdftocairo`, `tesseract`,
/// `paddleocr` and `easyocr` process we start.
static CPU_SEMAPHORE: LazyLock<Semaphore> =
    LazyLock::new(|| Semaphore::new(num_cpus::get()));

/// Call an async function while holding a permit from the CPU semaphore.
///
/// Recognition engines each want a full core (or more). Without this, a high
/// `--jobs` value would start far more of them than the machine can run.
///
/// In-process work doesn't need this, as long as it runs through
/// [`crate::async_utils::blocking_iter_streams::spawn_blocking_propagating_panics`].
#[instrument(level = "trace", skip_all)]
pub async fn with_cpu_semaphore<Func, Fut, R>(f: Func) -> Result<R>
where
    Func: FnOnce() -> Fut,
    Fut: Future<Output = Result<R>>,
{
    let permit = CPU_SEMAPHORE
        .acquire()
        .await
        .context("Could not acquire CPU permit")?;
    let result = f().await;
    drop(permit);
    result
}

/// Call a blocking function while holding a permit from the CPU semaphore.
///
/// This blocks the calling thread while waiting, so only use it on the
/// blocking pool, for example inside an iterator driven by
/// [`crate::async_utils::blocking_iter_streams::BlockingIterStream`].
#[instrument(level = "trace", skip_all)]
pub fn with_cpu_semaphore_blocking<Func, R>(f: Func) -> Result<R>
where
    Func: FnOnce() -> Result<R>,
{
    let permit = futures::executor::block_on(CPU_SEMAPHORE.acquire())
        .context("Could not acquire CPU permit")?;
    let result = f();
    drop(permit);
    result
}
