//! Detached federation tasks
//!
//! Inbox handlers answer before their side effects finish. Work that must
//! wait (an Accept reply, a follow removal, an outbox import) is queued here
//! and run once after a settle delay. Tasks are at-most-once: nothing is
//! persisted, retried, or recovered after a restart.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::{Semaphore, mpsc};
use tokio::time::Instant;

use super::delivery::ActivityDelivery;
use super::directory::ActorDirectory;
use super::importer::PostImporter;
use crate::data::{Actor, Database};
use crate::error::AppError;
use crate::metrics::{FEDERATION_TASKS_IN_FLIGHT, FEDERATION_TASKS_TOTAL};

/// An outbound activity awaiting delivery
#[derive(Debug, Clone)]
pub struct PendingDelivery {
    pub payload: Value,
    pub inbox: String,
    /// Local actor whose key signs the request
    pub signer: String,
    pub scheduled_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum FederationTask {
    /// Record the follow edge, then send the Accept
    AcceptFollow {
        follower: Actor,
        followee: String,
        reply: PendingDelivery,
    },
    RemoveFollow {
        follower: String,
        followee: String,
    },
    ImportOutbox { owner: Actor },
}

impl FederationTask {
    pub fn name(&self) -> &'static str {
        match self {
            FederationTask::AcceptFollow { .. } => "accept_follow",
            FederationTask::RemoveFollow { .. } => "remove_follow",
            FederationTask::ImportOutbox { .. } => "import_outbox",
        }
    }

    /// Remote actor the task concerns, for logs
    pub fn subject(&self) -> &str {
        match self {
            FederationTask::AcceptFollow { follower, .. } => &follower.id,
            FederationTask::RemoveFollow { follower, .. } => follower,
            FederationTask::ImportOutbox { owner } => &owner.id,
        }
    }
}

struct QueuedTask {
    task: FederationTask,
    not_before: Instant,
}

#[derive(Default)]
struct TaskCounters {
    enqueued: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
}

/// Point-in-time task counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskStats {
    pub enqueued: u64,
    pub completed: u64,
    pub failed: u64,
    pub dropped: u64,
}

impl TaskStats {
    /// Tasks accepted but not yet finished
    pub fn pending(&self) -> u64 {
        self.enqueued
            .saturating_sub(self.completed)
            .saturating_sub(self.failed)
    }
}

/// Runs task bodies
pub struct TaskExecutor {
    db: Arc<Database>,
    directory: Arc<ActorDirectory>,
    delivery: ActivityDelivery,
    importer: Arc<PostImporter>,
}

impl TaskExecutor {
    pub fn new(
        db: Arc<Database>,
        directory: Arc<ActorDirectory>,
        delivery: ActivityDelivery,
        importer: Arc<PostImporter>,
    ) -> Self {
        Self {
            db,
            directory,
            delivery,
            importer,
        }
    }

    pub async fn run(&self, task: FederationTask) -> Result<(), AppError> {
        match task {
            FederationTask::AcceptFollow {
                follower,
                followee,
                reply,
            } => {
                // Inbox followers are already stored by signature verification;
                // a fetched, unstored actor is persisted here.
                if follower.row_id.is_none() {
                    match self.directory.persist(&follower).await {
                        Ok(_) | Err(AppError::Conflict(_)) => {}
                        Err(e) => return Err(e),
                    }
                }

                if self.db.add_follow(&follower.id, &followee).await? {
                    tracing::info!(follower = %follower.id, followee = %followee, "New follower");
                } else {
                    tracing::debug!(
                        follower = %follower.id,
                        followee = %followee,
                        "Follow already recorded"
                    );
                }

                self.deliver(reply).await
            }
            FederationTask::RemoveFollow { follower, followee } => {
                if self.db.remove_follow(&followee, &follower).await? {
                    tracing::info!(follower = %follower, followee = %followee, "Follower removed");
                } else {
                    tracing::debug!(
                        follower = %follower,
                        followee = %followee,
                        "No follow to remove"
                    );
                }
                Ok(())
            }
            FederationTask::ImportOutbox { owner } => {
                self.importer.import_actor(&owner).await.map(|_| ())
            }
        }
    }

    async fn deliver(&self, pending: PendingDelivery) -> Result<(), AppError> {
        let key = self
            .db
            .load_signing_key(&pending.signer)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("No signing key for {}", pending.signer)))?;

        let lag = Utc::now() - pending.scheduled_at;
        tracing::debug!(
            inbox = %pending.inbox,
            lag_ms = lag.num_milliseconds(),
            "Delivering scheduled activity"
        );

        let result = self.delivery.deliver(&key, &pending.inbox, &pending.payload).await;
        if result.success {
            Ok(())
        } else {
            Err(AppError::Transport(result.error.unwrap_or_else(|| {
                format!("Delivery to {} failed", pending.inbox)
            })))
        }
    }
}

/// Bounded queue of detached tasks
#[derive(Clone)]
pub struct TaskQueue {
    sender: mpsc::Sender<QueuedTask>,
    settle_delay: Duration,
    counters: Arc<TaskCounters>,
}

impl TaskQueue {
    /// Start the dispatch loop on the current runtime
    ///
    /// `max_concurrent` bounds tasks that are waiting out their delay or
    /// running; the rest stay in the channel.
    pub fn start(
        executor: TaskExecutor,
        capacity: usize,
        max_concurrent: usize,
        settle_delay: Duration,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(capacity);
        let counters = Arc::new(TaskCounters::default());

        tokio::spawn(dispatch_loop(
            receiver,
            Arc::new(executor),
            Arc::new(Semaphore::new(max_concurrent)),
            counters.clone(),
        ));

        Self {
            sender,
            settle_delay,
            counters,
        }
    }

    pub fn settle_delay(&self) -> Duration {
        self.settle_delay
    }

    /// Queue a task to run after the settle delay
    ///
    /// Returns `false` and drops the task if the queue is full or closed.
    pub fn submit(&self, task: FederationTask) -> bool {
        let name = task.name();
        let queued = QueuedTask {
            task,
            not_before: Instant::now() + self.settle_delay,
        };

        match self.sender.try_send(queued) {
            Ok(()) => {
                self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
                FEDERATION_TASKS_IN_FLIGHT.inc();
                tracing::debug!(task = name, "Queued detached task");
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                FEDERATION_TASKS_TOTAL.with_label_values(&[name, "dropped"]).inc();
                tracing::error!(task = name, "Task queue full; dropping task");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                FEDERATION_TASKS_TOTAL.with_label_values(&[name, "dropped"]).inc();
                tracing::error!(task = name, "Task queue closed; dropping task");
                false
            }
        }
    }

    pub fn stats(&self) -> TaskStats {
        TaskStats {
            enqueued: self.counters.enqueued.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
        }
    }

    /// Wait until every accepted task has finished or `timeout` elapses
    ///
    /// Returns whether the queue drained.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.stats().pending() > 0 {
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        true
    }
}

async fn dispatch_loop(
    mut receiver: mpsc::Receiver<QueuedTask>,
    executor: Arc<TaskExecutor>,
    semaphore: Arc<Semaphore>,
    counters: Arc<TaskCounters>,
) {
    while let Some(queued) = receiver.recv().await {
        let Ok(permit) = semaphore.clone().acquire_owned().await else {
            break;
        };
        let executor = executor.clone();
        let counters = counters.clone();

        tokio::spawn(async move {
            let _permit = permit;
            tokio::time::sleep_until(queued.not_before).await;

            let name = queued.task.name();
            let subject = queued.task.subject().to_string();
            match executor.run(queued.task).await {
                Ok(()) => {
                    counters.completed.fetch_add(1, Ordering::Relaxed);
                    FEDERATION_TASKS_TOTAL.with_label_values(&[name, "completed"]).inc();
                }
                Err(e) => {
                    counters.failed.fetch_add(1, Ordering::Relaxed);
                    FEDERATION_TASKS_TOTAL.with_label_values(&[name, "failed"]).inc();
                    tracing::error!(
                        task = name,
                        subject = %subject,
                        kind = e.kind().as_str(),
                        error = %e,
                        "Detached task failed"
                    );
                }
            }
            FEDERATION_TASKS_IN_FLIGHT.dec();
        });
    }

    tracing::debug!("Task queue closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::federation::FederationClient;

    const BOB: &str = "https://remote.example/users/bob";
    const ALICE: &str = "https://read.example/users/alice";

    async fn executor(dir: &tempfile::TempDir) -> (TaskExecutor, Arc<Database>) {
        let db = Arc::new(Database::connect(&dir.path().join("tasks.db")).await.unwrap());
        let client =
            Arc::new(FederationClient::new("rustread-test", Duration::from_secs(1)).unwrap());
        let server = crate::config::ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 8080,
            domain: "read.example".to_string(),
            protocol: "https".to_string(),
        };
        let directory = Arc::new(ActorDirectory::new(db.clone(), client.clone(), server, 1024));
        let importer = Arc::new(PostImporter::new(db.clone(), client.clone()));
        let executor =
            TaskExecutor::new(db.clone(), directory, ActivityDelivery::new(client), importer);
        (executor, db)
    }

    #[tokio::test]
    async fn remove_follow_runs_after_delay() {
        let dir = tempfile::tempdir().unwrap();
        let (executor, db) = executor(&dir).await;
        db.add_follow(BOB, ALICE).await.unwrap();

        let queue = TaskQueue::start(executor, 4, 2, Duration::from_millis(50));
        assert!(queue.submit(FederationTask::RemoveFollow {
            follower: "https://remote.example/users/bob".to_string(),
            followee: "https://read.example/users/alice".to_string(),
        }));

        // Still present before the delay elapses.
        assert!(db.follow_exists(BOB, ALICE).await.unwrap());

        assert!(queue.wait_idle(Duration::from_secs(5)).await);
        assert!(!db.follow_exists(BOB, ALICE).await.unwrap());
        assert_eq!(queue.stats().completed, 1);
    }

    #[tokio::test]
    async fn failed_task_is_counted_not_retried() {
        let dir = tempfile::tempdir().unwrap();
        let (executor, db) = executor(&dir).await;
        let queue = TaskQueue::start(executor, 4, 2, Duration::from_millis(10));

        // No such local actor, so there is no signing key.
        let reply = PendingDelivery {
            payload: serde_json::json!({"type": "Accept"}),
            inbox: "http://127.0.0.1:1/inbox".to_string(),
            signer: "https://read.example/users/nobody".to_string(),
            scheduled_at: Utc::now(),
        };
        let follower = crate::data::Actor::test_remote("https://remote.example/users/bob");
        queue.submit(FederationTask::AcceptFollow {
            follower,
            followee: "https://read.example/users/nobody".to_string(),
            reply,
        });

        assert!(queue.wait_idle(Duration::from_secs(5)).await);
        let stats = queue.stats();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.completed, 0);

        // The unstored follower and the edge were written before delivery failed
        assert!(db.get_actor("https://remote.example/users/bob").await.unwrap().is_some());
        assert!(
            db.follow_exists(
                "https://remote.example/users/bob",
                "https://read.example/users/nobody"
            )
            .await
            .unwrap()
        );
    }

    #[tokio::test]
    async fn full_queue_drops() {
        let dir = tempfile::tempdir().unwrap();
        let (executor, _db) = executor(&dir).await;
        // One permit held by a long-delayed task; capacity 1 fills the channel.
        let queue = TaskQueue::start(executor, 1, 1, Duration::from_secs(30));

        let remove = || FederationTask::RemoveFollow {
            follower: "https://remote.example/users/bob".to_string(),
            followee: "https://read.example/users/alice".to_string(),
        };

        let mut accepted = 0;
        for _ in 0..4 {
            if queue.submit(remove()) {
                accepted += 1;
            }
            tokio::task::yield_now().await;
        }

        assert!(accepted < 4);
        assert_eq!(queue.stats().dropped, 4 - accepted);
    }
}
