use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use weft_core::error::{Result, WeftError};
use weft_core::traits::RunQueue;
use weft_core::types::RunId;

use crate::scheduler::Scheduler;

/// One delivery of a run to a worker.
#[derive(Debug, Clone, PartialEq)]
pub struct RunJob {
    pub graph_id: String,
    pub run_id: RunId,
}

/// In-process `RunQueue` backed by an unbounded mpsc channel.
#[derive(Clone)]
pub struct ChannelQueue {
    tx: mpsc::UnboundedSender<RunJob>,
}

impl ChannelQueue {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<RunJob>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl RunQueue for ChannelQueue {
    fn enqueue_run(&self, graph_id: &str, run_id: &RunId) -> BoxFuture<'_, Result<()>> {
        let job = RunJob {
            graph_id: graph_id.to_string(),
            run_id: run_id.clone(),
        };
        Box::pin(async move {
            self.tx
                .send(job)
                .map_err(|_| WeftError::TransientBackend("run queue is closed".into()))
        })
    }
}

/// Pulls run jobs off a channel and drives each one to completion.
pub struct Worker {
    scheduler: Arc<Scheduler>,
    jobs: mpsc::UnboundedReceiver<RunJob>,
    cancel: CancellationToken,
    limit: Option<usize>,
    exit_when_idle: bool,
}

impl Worker {
    pub fn new(
        scheduler: Arc<Scheduler>,
        jobs: mpsc::UnboundedReceiver<RunJob>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            scheduler,
            jobs,
            cancel,
            limit: None,
            exit_when_idle: false,
        }
    }

    /// Stop after `n` jobs.
    pub fn with_limit(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }

    /// Return as soon as no job is waiting instead of blocking for more.
    pub fn exit_when_idle(mut self) -> Self {
        self.exit_when_idle = true;
        self
    }

    /// Run until cancelled, the channel closes, or the job limit is hit.
    /// Returns the number of jobs handled.
    pub async fn run(mut self) -> usize {
        let mut handled = 0;
        loop {
            if self.limit.is_some_and(|n| handled >= n) {
                info!(handled, "Worker job limit reached");
                break;
            }
            if self.exit_when_idle {
                if self.cancel.is_cancelled() {
                    info!("Worker shutting down");
                    break;
                }
                match self.jobs.try_recv() {
                    Ok(job) => {
                        handled += 1;
                        self.handle(job).await;
                    }
                    Err(_) => {
                        info!(handled, "Run queue idle, worker exiting");
                        break;
                    }
                }
                continue;
            }
            tokio::select! {
                job = self.jobs.recv() => {
                    let Some(job) = job else {
                        info!("Run queue closed, worker exiting");
                        break;
                    };
                    handled += 1;
                    self.handle(job).await;
                }
                _ = self.cancel.cancelled() => {
                    info!("Worker shutting down");
                    break;
                }
            }
        }
        handled
    }

    async fn handle(&self, job: RunJob) {
        match self.scheduler.run_graph(&job.graph_id, &job.run_id).await {
            Ok(run) => info!(run_id = %run.id, status = %run.status, "Job done"),
            Err(e) => error!(run_id = %job.run_id, error = %e, "Job failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_queue_delivers_jobs() {
        let (queue, mut rx) = ChannelQueue::new();
        queue.enqueue_run("g", &RunId::from_str("r1")).await.unwrap();
        let job = rx.recv().await.unwrap();
        assert_eq!(
            job,
            RunJob {
                graph_id: "g".into(),
                run_id: RunId::from_str("r1")
            }
        );

        drop(rx);
        assert!(queue.enqueue_run("g", &RunId::from_str("r2")).await.is_err());
    }
}
