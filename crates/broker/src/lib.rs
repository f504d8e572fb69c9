//! Message broker shim
//!
//! Abstracts the transport between submission and workers. Single-node
//! deployments use [`InProcessBroker`], a bounded tokio channel; distributed
//! deployments plug an external broker adapter in behind the same [`Broker`]
//! trait. The bounded queue is the primary backpressure signal: a full queue
//! rejects the enqueue and no job record should be created.
//!
//! Redelivery is permitted; workers achieve idempotence by checking job
//! status on task entry, so a task whose job is already terminal is
//! acknowledged without work.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

/// A unit of work: process one submitted video end to end
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessTask {
    pub video_id: String,
}

impl ProcessTask {
    #[must_use]
    pub fn new(video_id: impl Into<String>) -> Self {
        Self {
            video_id: video_id.into(),
        }
    }
}

/// Broker errors
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Bounded queue is full; callers should surface a transient error
    #[error("task queue is full")]
    QueueFull,

    /// The consuming side is gone; no task can be delivered
    #[error("broker is closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, BrokerError>;

/// Producer half of the task transport
#[async_trait]
pub trait Broker: Send + Sync {
    /// Enqueue a task without blocking. Fails fast with [`BrokerError::QueueFull`]
    /// when the transport is saturated.
    async fn enqueue(&self, task: ProcessTask) -> Result<()>;
}

/// Consumer half of the task transport
#[async_trait]
pub trait TaskSource: Send + Sync {
    /// Wait for the next task; `None` means the transport shut down
    async fn next_task(&self) -> Option<ProcessTask>;
}

/// In-process bounded queue for single-node deployments
pub struct InProcessBroker {
    tx: mpsc::Sender<ProcessTask>,
}

/// Receiving end of [`InProcessBroker`]
pub struct InProcessTaskSource {
    rx: Mutex<mpsc::Receiver<ProcessTask>>,
}

impl InProcessBroker {
    /// Build the connected producer/consumer pair with the given queue bound
    #[must_use]
    pub fn channel(capacity: usize) -> (Self, InProcessTaskSource) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, InProcessTaskSource { rx: Mutex::new(rx) })
    }
}

#[async_trait]
impl Broker for InProcessBroker {
    async fn enqueue(&self, task: ProcessTask) -> Result<()> {
        debug!("Enqueueing task for job {}", task.video_id);
        match self.tx.try_send(task) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(BrokerError::QueueFull),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(BrokerError::Closed),
        }
    }
}

#[async_trait]
impl TaskSource for InProcessTaskSource {
    async fn next_task(&self) -> Option<ProcessTask> {
        self.rx.lock().await.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_enqueue_and_receive() {
        let (broker, source) = InProcessBroker::channel(4);
        broker.enqueue(ProcessTask::new("ab12cd34")).await.unwrap();
        broker.enqueue(ProcessTask::new("ef56ab78")).await.unwrap();

        assert_eq!(
            source.next_task().await,
            Some(ProcessTask::new("ab12cd34"))
        );
        assert_eq!(
            source.next_task().await,
            Some(ProcessTask::new("ef56ab78"))
        );
    }

    #[tokio::test]
    async fn test_backpressure_when_full() {
        let (broker, _source) = InProcessBroker::channel(1);
        broker.enqueue(ProcessTask::new("ab12cd34")).await.unwrap();

        let err = broker.enqueue(ProcessTask::new("ef56ab78")).await.unwrap_err();
        assert!(matches!(err, BrokerError::QueueFull));
    }

    #[tokio::test]
    async fn test_closed_when_consumer_dropped() {
        let (broker, source) = InProcessBroker::channel(1);
        drop(source);
        let err = broker.enqueue(ProcessTask::new("ab12cd34")).await.unwrap_err();
        assert!(matches!(err, BrokerError::Closed));
    }
}
