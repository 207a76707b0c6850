use std::sync::Mutex;

use futures::future::BoxFuture;

use weft_core::error::Result;
use weft_core::traits::RunQueue;
use weft_core::types::RunId;

/// A `RunQueue` that only records submissions.
#[derive(Default)]
pub struct RecordingQueue {
    submitted: Mutex<Vec<(String, RunId)>>,
}

impl RecordingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn submitted(&self) -> Vec<(String, RunId)> {
        self.submitted.lock().unwrap().clone()
    }
}

impl RunQueue for RecordingQueue {
    fn enqueue_run(&self, graph_id: &str, run_id: &RunId) -> BoxFuture<'_, Result<()>> {
        self.submitted
            .lock()
            .unwrap()
            .push((graph_id.to_string(), run_id.clone()));
        Box::pin(async { Ok(()) })
    }
}
