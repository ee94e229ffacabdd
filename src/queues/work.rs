//! Async work processing with backpressure, plus per-document output records.
//!
//! The key concepts here are borrowed from ["Queues Don't Fix
//! Overload"](https://ferd.ca/queues-don-t-fix-overload.html). We limit the
//! number of work items that may be "in flight" at any one time, and once that
//! limit is reached, submitting more items blocks until one of the in-flight
//! items is completed.
//!
//! This is a strictly "in process" queue for closely-related subtasks of a
//! larger task, like the pages of a batch of documents. It does not handle
//! priorities or starvation.

use std::sync::{Arc, Mutex};

use futures::{
    SinkExt as _, StreamExt as _,
    channel::{mpsc, oneshot},
};
use schemars::JsonSchema;

use crate::{
    async_utils::{BoxedFuture, BoxedStream, JoinWorker},
    model::BatchResult,
    prelude::*,
    ui::Ui,
};

/// Status of one processed document.
#[derive(Clone, Copy, Debug, Deserialize, JsonSchema, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorkStatus {
    /// Every page was recognized.
    Ok,

    /// Some pages were deliberately skipped (see `--max-pages`).
    Incomplete,

    /// The document could not be processed.
    Failed,
}

/// Output record for one input document.
#[derive(Clone, Debug, Deserialize, JsonSchema, Serialize)]
pub struct DocumentOutput {
    /// The input document.
    pub source: PathBuf,

    /// What is the status of this document?
    pub status: WorkStatus,

    /// Any errors that occurred during processing, outermost context first.
    pub errors: Vec<String>,

    /// The recognized pages, unless the document failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<BatchResult>,
}

impl DocumentOutput {
    /// A fully processed document.
    pub fn ok(result: BatchResult) -> Self {
        Self {
            source: result.source.clone(),
            status: WorkStatus::Ok,
            errors: vec![],
            result: Some(result),
        }
    }

    /// A document where only some pages were processed.
    pub fn incomplete(result: BatchResult, warning: String) -> Self {
        Self {
            source: result.source.clone(),
            status: WorkStatus::Incomplete,
            errors: vec![warning],
            result: Some(result),
        }
    }

    /// A document that failed, with its whole error chain.
    pub fn failed(source: PathBuf, err: &anyhow::Error) -> Self {
        Self {
            source,
            status: WorkStatus::Failed,
            errors: err.chain().map(|cause| cause.to_string()).collect(),
            result: None,
        }
    }
}

/// Counters describing a stream of [`DocumentOutput`]s.
#[derive(Clone, Debug, Default)]
pub struct DocumentCounters {
    /// How many documents have we seen?
    pub total_count: usize,

    /// How many documents failed?
    pub failure_count: usize,

    /// How many documents were only partly processed?
    pub incomplete_count: usize,

    /// How many pages did we recognize?
    pub page_count: usize,
}

impl DocumentCounters {
    /// Wrap a stream with counters.
    pub fn wrap_stream(
        stream: BoxedStream<Result<DocumentOutput>>,
    ) -> (
        BoxedStream<Result<DocumentOutput>>,
        Arc<Mutex<DocumentCounters>>,
    ) {
        let counters = Arc::new(Mutex::new(Self::default()));
        let counters_clone = counters.clone();
        let stream = stream
            .map(move |value| {
                let value = value?;
                counters_clone.update(&value);
                Ok(value)
            })
            .boxed();
        (stream, counters)
    }

    /// What fraction of documents failed?
    pub fn failure_rate(&self) -> f32 {
        if self.total_count == 0 {
            0.0
        } else {
            self.failure_count as f32 / self.total_count as f32
        }
    }
}

/// We want methods on `Mutex<DocumentCounters>`, because that's the type we
/// actually share. To do that, we need an extension trait.
pub trait DocumentCounterExt {
    /// Update counters for a document.
    fn update(&self, item: &DocumentOutput);

    /// Report totals, and fail if too many documents failed.
    fn finish(self: Arc<Self>, ui: &Ui, allowed_failure_rate: f32) -> Result<()>;
}

impl DocumentCounterExt for Mutex<DocumentCounters> {
    fn update(&self, item: &DocumentOutput) {
        // Recover the counts even if another thread panicked mid-update.
        let mut counters = self.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        counters.total_count += 1;
        match item.status {
            WorkStatus::Ok => {}
            WorkStatus::Incomplete => counters.incomplete_count += 1,
            WorkStatus::Failed => counters.failure_count += 1,
        }
        if let Some(result) = &item.result {
            counters.page_count += result.pages.len();
        }
    }

    fn finish(self: Arc<Self>, ui: &Ui, allowed_failure_rate: f32) -> Result<()> {
        let counters = self
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .to_owned();
        ui.display_message(
            "📄",
            &format!(
                "{} pages recognized in {} documents",
                counters.page_count, counters.total_count
            ),
        );
        let failure_rate = counters.failure_rate();
        if failure_rate > allowed_failure_rate {
            return Err(anyhow!(
                "{}/{} ({:.2}%) of documents failed, but only {:.2}% were allowed",
                counters.failure_count,
                counters.total_count,
                failure_rate * 100.0,
                allowed_failure_rate * 100.0
            ));
        }
        if counters.incomplete_count > 0 {
            ui.display_message(
                "⚠️",
                &format!(
                    "{} documents were only partly processed",
                    counters.incomplete_count
                ),
            );
        }
        if counters.failure_count > 0 {
            ui.display_message(
                "❌",
                &format!("{} documents could not be processed", counters.failure_count),
            );
        }
        Ok(())
    }
}

/// An async work function.
pub type WorkFn<Input, Output> =
    Arc<dyn Fn(Input) -> BoxedFuture<Result<Output>> + Send + Sync + 'static>;

/// A work item: an input, and a one-shot channel on which to return the
/// result.
struct WorkItem<Input, Output> {
    input: Input,
    tx: oneshot::Sender<Result<Output>>,
}

/// A bounded pool of workers, fed through a channel.
///
/// Up to `concurrency_limit` items may be waiting at any one time, and
/// another `concurrency_limit` may be in progress.
pub struct WorkQueue<Input, Output>
where
    Input: 'static,
    Output: 'static,
{
    tx: mpsc::Sender<WorkItem<Input, Output>>,
}

impl<Input, Output> WorkQueue<Input, Output>
where
    Input: Send + 'static,
    Output: Send + 'static,
{
    /// Create a new work queue with the given concurrency limit.
    ///
    /// The worker exits once every [`WorkQueue`] and [`WorkQueueHandle`] has
    /// been dropped.
    pub fn new(concurrency_limit: usize, work_fn: WorkFn<Input, Output>) -> (Self, JoinWorker) {
        let concurrency_limit = concurrency_limit.max(1);
        let (tx, rx) = mpsc::channel(concurrency_limit);
        let worker = tokio::spawn(async move {
            rx.for_each_concurrent(concurrency_limit, |item: WorkItem<Input, Output>| {
                let work_fn = work_fn.clone();
                async move {
                    let result = work_fn(item.input).await;
                    if item.tx.send(result).is_err() {
                        debug!("failed to send work item result because receiver was dropped");
                    }
                }
            })
            .await;
            Ok(())
        });
        (Self { tx }, JoinWorker::from_handle(worker))
    }

    /// Get a handle for submitting items to the work queue.
    pub fn handle(&self) -> WorkQueueHandle<Input, Output> {
        WorkQueueHandle {
            tx: self.tx.clone(),
        }
    }
}

/// A handle to a [`WorkQueue`]. It can be cloned cheaply and passed around.
pub struct WorkQueueHandle<Input, Output>
where
    Input: 'static,
    Output: 'static,
{
    tx: mpsc::Sender<WorkItem<Input, Output>>,
}

// Override `Clone` so that `Input` and `Output` are not required to be `Clone`.
impl<Input, Output> Clone for WorkQueueHandle<Input, Output> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<Input, Output> WorkQueueHandle<Input, Output>
where
    Input: Send + 'static,
    Output: Send + 'static,
{
    /// Submit an input, and wait for its output.
    pub async fn process(&self, input: Input) -> Result<Output> {
        let (tx, rx) = oneshot::channel();
        // We need a mutable copy of `tx` to send the item.
        let mut sender = self.tx.clone();
        sender
            .send(WorkItem { input, tx })
            .await
            .context("failed to send work item")?;
        rx.await.context("failed to receive work item result")?
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use futures::FutureExt as _;

    use super::*;
    use crate::model::PageResult;

    fn batch(pages: usize) -> BatchResult {
        BatchResult {
            source: PathBuf::from("doc.pdf"),
            engine: "tesseract".to_owned(),
            languages: vec!["eng".to_owned()],
            total_pages: pages,
            pages: (0..pages)
                .map(|page| PageResult {
                    page,
                    text: String::new(),
                    confidence: None,
                    boxes: vec![],
                })
                .collect(),
        }
    }

    #[tokio::test]
    async fn queue_limits_concurrency() -> Result<()> {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let work_fn: WorkFn<usize, usize> = {
            let running = running.clone();
            let peak = peak.clone();
            Arc::new(move |n| {
                let running = running.clone();
                let peak = peak.clone();
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(n * 2)
                }
                .boxed()
            })
        };
        let (queue, worker) = WorkQueue::new(2, work_fn);
        let handle = queue.handle();
        let outputs = futures::future::try_join_all(
            (0..8).map(|n| {
                let handle = handle.clone();
                async move { handle.process(n).await }
            }),
        )
        .await?;
        assert_eq!(outputs, vec![0, 2, 4, 6, 8, 10, 12, 14]);
        assert!(peak.load(Ordering::SeqCst) <= 2);

        drop(handle);
        drop(queue);
        worker.join().await
    }

    #[tokio::test]
    async fn work_errors_are_returned_to_the_caller() {
        let work_fn: WorkFn<u32, u32> =
            Arc::new(|n| async move { Err(anyhow!("refused {n}")) }.boxed());
        let (queue, _worker) = WorkQueue::new(1, work_fn);
        let err = queue.handle().process(3).await.unwrap_err();
        assert!(err.to_string().contains("refused 3"));
    }

    #[test]
    fn failed_record_keeps_error_chain() {
        let err = anyhow!("pdftocairo exploded").context("failed to render page 2");
        let output = DocumentOutput::failed(PathBuf::from("x.pdf"), &err);
        assert_eq!(output.status, WorkStatus::Failed);
        assert_eq!(
            output.errors,
            vec!["failed to render page 2", "pdftocairo exploded"]
        );
        assert!(output.result.is_none());
        let json = serde_json::to_value(&output).unwrap();
        assert_eq!(json["status"], "failed");
        assert!(json.get("result").is_none());
    }

    #[tokio::test]
    async fn counters_enforce_failure_rate() -> Result<()> {
        let records = vec![
            Ok(DocumentOutput::ok(batch(3))),
            Ok(DocumentOutput::incomplete(batch(1), "skipped".to_owned())),
            Ok(DocumentOutput::failed(PathBuf::from("bad.png"), &anyhow!("nope"))),
        ];
        let (stream, counters) =
            DocumentCounters::wrap_stream(futures::stream::iter(records).boxed());
        let collected = stream.collect::<Vec<_>>().await;
        assert_eq!(collected.len(), 3);
        {
            let counters = counters.lock().unwrap();
            assert_eq!(counters.total_count, 3);
            assert_eq!(counters.failure_count, 1);
            assert_eq!(counters.incomplete_count, 1);
            assert_eq!(counters.page_count, 4);
        }

        let ui = Ui::init_for_tests();
        assert!(counters.clone().finish(&ui, 0.0).is_err());
        counters.finish(&ui, 0.5)?;
        Ok(())
    }
}
