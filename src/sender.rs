use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    sync::{mpsc, oneshot, Mutex},
    task::JoinHandle,
    time,
};
use tracing::{debug, warn};

use crate::{
    error::{BrakeError, Result},
    protocol::Packet,
    radio::{RadioChannel, SendCondition},
};

/// How a queued send behaves while polling is paused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    /// Ordinary poll answer, dropped while paused
    Poll,
    /// Calibration or version traffic, always sent
    Control,
}

/// Attempt count and per-attempt timeout for a bounded send
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBudget {
    /// Number of attempts
    pub attempts: u32,
    /// Timeout of each attempt
    pub per_attempt: Duration,
}

impl RetryBudget {
    /// Split `remaining` over `attempts`
    ///
    /// If a slice would be shorter than `min_slice` the budget collapses to a
    /// single attempt bounded by `remaining` capped at `fallback_cap`.
    #[must_use]
    pub fn split(
        remaining: Duration,
        attempts: u32,
        min_slice: Duration,
        fallback_cap: Duration,
    ) -> Self {
        let attempts = attempts.max(1);
        let per_attempt = remaining / attempts;
        if per_attempt < min_slice {
            return Self::single(remaining.min(fallback_cap));
        }
        Self {
            attempts,
            per_attempt,
        }
    }

    /// One attempt bounded by `timeout`
    #[must_use]
    pub const fn single(timeout: Duration) -> Self {
        Self {
            attempts: 1,
            per_attempt: timeout,
        }
    }

    fn total_ms(&self) -> u64 {
        u64::try_from((self.per_attempt * self.attempts).as_millis()).unwrap_or(u64::MAX)
    }
}

/// Send `packet` up to `budget.attempts` times until `condition` is met
///
/// # Errors
///
/// Returns [`BrakeError::Timeout`] once every attempt failed, or the first
/// error that is not worth retrying.
pub async fn send_and_retry(
    channel: &dyn RadioChannel,
    packet: Packet,
    condition: SendCondition,
    budget: RetryBudget,
) -> Result<()> {
    for attempt in 1..=budget.attempts.max(1) {
        let outcome = time::timeout(
            budget.per_attempt,
            channel.send_and_wait(packet, condition, budget.per_attempt),
        )
        .await;

        match outcome {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(error)) if !error.is_retryable() => return Err(error),
            Ok(Err(error)) => {
                warn!(
                    "Send of {} failed (attempt {}/{}): {}",
                    packet, attempt, budget.attempts, error
                );
            }
            Err(_) => {
                warn!(
                    "Send of {} timed out after {:?} (attempt {}/{})",
                    packet, budget.per_attempt, attempt, budget.attempts
                );
            }
        }
    }

    Err(BrakeError::Timeout {
        timeout_ms: budget.total_ms(),
    })
}

struct SendJob {
    packet: Packet,
    condition: SendCondition,
    budget: RetryBudget,
    priority: Priority,
    done: oneshot::Sender<Result<()>>,
}

/// Keeps polling paused until dropped
#[derive(Debug)]
#[must_use = "polling resumes as soon as the guard is dropped"]
pub struct PauseGuard {
    paused: Arc<AtomicUsize>,
}

impl Drop for PauseGuard {
    fn drop(&mut self) {
        if self.paused.fetch_sub(1, Ordering::AcqRel) == 1 {
            debug!("Polling resumed");
        }
    }
}

/// Single writer serialising every outbound packet on one channel
pub struct MessageSender {
    queue: mpsc::UnboundedSender<SendJob>,
    paused: Arc<AtomicUsize>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MessageSender {
    /// Spawn the writer task for `channel`
    #[must_use]
    pub fn spawn(channel: Arc<dyn RadioChannel>) -> Self {
        let (queue, rx) = mpsc::unbounded_channel();
        let paused = Arc::new(AtomicUsize::new(0));
        let task = tokio::spawn(Self::run(channel, rx, Arc::clone(&paused)));

        Self {
            queue,
            paused,
            task: Mutex::new(Some(task)),
        }
    }

    async fn run(
        channel: Arc<dyn RadioChannel>,
        mut rx: mpsc::UnboundedReceiver<SendJob>,
        paused: Arc<AtomicUsize>,
    ) {
        while let Some(job) = rx.recv().await {
            if job.priority == Priority::Poll && paused.load(Ordering::Acquire) > 0 {
                debug!("Polling paused, dropping {}", job.packet);
                let _ = job.done.send(Err(BrakeError::Interrupted));
                continue;
            }

            let result =
                send_and_retry(channel.as_ref(), job.packet, job.condition, job.budget).await;
            // receiver may have given up
            let _ = job.done.send(result);
        }
        debug!("Writer queue closed");
    }

    /// Pause polling until the returned guard is dropped
    pub fn pause(&self) -> PauseGuard {
        if self.paused.fetch_add(1, Ordering::AcqRel) == 0 {
            debug!("Polling paused");
        }
        PauseGuard {
            paused: Arc::clone(&self.paused),
        }
    }

    /// Whether any pause guard is alive
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire) > 0
    }

    /// Queue a packet, the receiver resolves once the job is done
    pub fn submit(
        &self,
        packet: Packet,
        condition: SendCondition,
        budget: RetryBudget,
        priority: Priority,
    ) -> oneshot::Receiver<Result<()>> {
        let (done, rx) = oneshot::channel();
        let job = SendJob {
            packet,
            condition,
            budget,
            priority,
            done,
        };
        if let Err(mpsc::error::SendError(job)) = self.queue.send(job) {
            let _ = job.done.send(Err(BrakeError::Interrupted));
        }
        rx
    }

    /// Queue a packet and wait for it to be sent
    ///
    /// # Errors
    ///
    /// Returns the send error, or [`BrakeError::Interrupted`] if the writer
    /// shut down first or the job was dropped while paused.
    pub async fn send(
        &self,
        packet: Packet,
        condition: SendCondition,
        budget: RetryBudget,
        priority: Priority,
    ) -> Result<()> {
        self.submit(packet, condition, budget, priority)
            .await
            .unwrap_or(Err(BrakeError::Interrupted))
    }

    /// Abort the writer task and hand back its handle for joining
    pub async fn shutdown(&self) -> Option<JoinHandle<()>> {
        let task = self.task.lock().await.take();
        if let Some(task) = &task {
            task.abort();
        }
        task
    }
}

impl Drop for MessageSender {
    fn drop(&mut self) {
        if let Ok(mut task) = self.task.try_lock() {
            if let Some(task) = task.take() {
                task.abort();
            }
        }
    }
}
