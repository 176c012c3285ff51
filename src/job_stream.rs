//! Bridge from the reindex run to the connection writer.
//!
//! The orchestrator sends [`JobEvent`]s through a [`JobEvents`] handle from
//! whatever task it runs on; the connection drains the paired
//! [`JobStream`] and writes one frame per event. The stream ends right
//! after the first [`JobEvent::Complete`], or when every sender is gone.

use rag_backend_core::models::IngestionJob;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    Progress(IngestionJob),
    Complete(IngestionJob),
}

impl JobEvent {
    pub fn job(&self) -> &IngestionJob {
        match self {
            JobEvent::Progress(job) | JobEvent::Complete(job) => job,
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self, JobEvent::Complete(_))
    }
}

/// Producer half. Cheap to clone; sending never blocks.
#[derive(Clone)]
pub struct JobEvents {
    tx: mpsc::UnboundedSender<JobEvent>,
}

impl JobEvents {
    /// A handle whose events go nowhere, for runs with no listener.
    pub fn detached() -> Self {
        let (tx, _rx) = mpsc::unbounded_channel();
        Self { tx }
    }

    pub fn progress(&self, job: &IngestionJob) {
        // A closed receiver means the client went away; the run carries on.
        let _ = self.tx.send(JobEvent::Progress(job.clone()));
    }

    pub fn complete(&self, job: &IngestionJob) {
        let _ = self.tx.send(JobEvent::Complete(job.clone()));
    }
}

/// Single-consumer, non-restartable sequence of job events.
pub struct JobStream {
    rx: mpsc::UnboundedReceiver<JobEvent>,
    finished: bool,
}

impl JobStream {
    pub async fn next(&mut self) -> Option<JobEvent> {
        if self.finished {
            return None;
        }
        let event = self.rx.recv().await;
        match &event {
            Some(JobEvent::Complete(_)) | None => {
                self.finished = true;
                self.rx.close();
            }
            Some(JobEvent::Progress(_)) => {}
        }
        event
    }
}

pub fn job_channel() -> (JobEvents, JobStream) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        JobEvents { tx },
        JobStream {
            rx,
            finished: false,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rag_backend_core::models::IngestionTrigger;

    fn job() -> IngestionJob {
        IngestionJob::started("reindex-s", IngestionTrigger::Manual, Utc::now())
    }

    #[tokio::test]
    async fn stream_ends_after_complete() {
        let (events, mut stream) = job_channel();
        let running = job();
        events.progress(&running);
        events.complete(&running.succeeded(Utc::now()));
        events.progress(&running);

        assert!(matches!(stream.next().await, Some(JobEvent::Progress(_))));
        let last = stream.next().await.unwrap();
        assert!(last.is_complete());
        assert_eq!(last.job().percent_complete, Some(100.0));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn stream_ends_when_producer_dropped() {
        let (events, mut stream) = job_channel();
        events.progress(&job());
        drop(events);
        assert!(stream.next().await.is_some());
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn events_cross_task_boundaries() {
        let (events, mut stream) = job_channel();
        let handle = tokio::spawn(async move {
            let running = job();
            for pct in [25.0, 50.0, 75.0] {
                events.progress(&running.with_progress("ingesting:x", 1, pct));
            }
            events.complete(&running.succeeded(Utc::now()));
        });

        let mut seen = Vec::new();
        while let Some(event) = stream.next().await {
            seen.push(event.job().percent_complete);
        }
        handle.await.unwrap();
        assert_eq!(seen, vec![Some(25.0), Some(50.0), Some(75.0), Some(100.0)]);
    }

    #[test]
    fn sending_after_consumer_drop_is_silent() {
        let (events, stream) = job_channel();
        drop(stream);
        events.progress(&job());
        events.complete(&job());
    }
}
