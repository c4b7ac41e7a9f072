//! Per-user message lanes
//!
//! Each user gets an unbounded FIFO lane drained by a single worker task, so
//! one user's messages are processed strictly in submission order while
//! different users run in parallel. `submit` enqueues synchronously, which
//! makes call order the processing order.
//!
//! A lane whose queue stays empty for the idle timeout is reaped; the next
//! submission for that user starts a fresh one. Every lane of a user runs its
//! jobs under the same gate, so a lane started after a disconnect waits for
//! the message still in flight on the old one.

use futures::future::BoxFuture;
use futures::FutureExt;
use sdk::errors::EngineError;
use sdk::types::{InboundMessage, UserId};
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

/// Work run for each queued message
pub type Processor<T> =
    Arc<dyn Fn(UserId, InboundMessage) -> BoxFuture<'static, Result<T, EngineError>> + Send + Sync>;

/// Held by a worker while it processes one of the user's messages
type Gate = Arc<tokio::sync::Mutex<()>>;

struct Job<T> {
    message: InboundMessage,
    reply: oneshot::Sender<Result<T, EngineError>>,
}

struct Lane<T> {
    tx: mpsc::UnboundedSender<Job<T>>,
    closed: Arc<AtomicBool>,
    generation: u64,
}

struct LaneTable<T> {
    lanes: HashMap<UserId, Lane<T>>,
    /// Outlives a disconnected lane until its worker exits
    gates: HashMap<UserId, Gate>,
}

type Lanes<T> = Arc<Mutex<LaneTable<T>>>;

/// Resolves to the result of a submitted message
///
/// Yields `EngineError::Cancelled` if the message was dropped before it ran.
pub struct PendingReply<T> {
    rx: oneshot::Receiver<Result<T, EngineError>>,
}

impl<T> Future for PendingReply<T> {
    type Output = Result<T, EngineError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.rx
            .poll_unpin(cx)
            .map(|result| result.unwrap_or(Err(EngineError::Cancelled)))
    }
}

/// Serializes work per user
pub struct Sequencer<T> {
    lanes: Lanes<T>,
    processor: Processor<T>,
    idle_timeout: Duration,
    generations: AtomicU64,
}

fn lock<T>(lanes: &Mutex<LaneTable<T>>) -> MutexGuard<'_, LaneTable<T>> {
    lanes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl<T: Send + 'static> Sequencer<T> {
    pub fn new(processor: Processor<T>, idle_timeout: Duration) -> Self {
        Self {
            lanes: Arc::new(Mutex::new(LaneTable {
                lanes: HashMap::new(),
                gates: HashMap::new(),
            })),
            processor,
            idle_timeout,
            generations: AtomicU64::new(0),
        }
    }

    /// Queue a message behind the user's earlier messages
    ///
    /// Must be called from within a Tokio runtime.
    pub fn submit(&self, user_id: UserId, message: InboundMessage) -> PendingReply<T> {
        let (reply, rx) = oneshot::channel();
        let mut job = Job { message, reply };

        let mut table = lock(&self.lanes);
        if let Some(lane) = table.lanes.get(&user_id) {
            match lane.tx.send(job) {
                Ok(()) => return PendingReply { rx },
                // The worker exited; start a new lane below
                Err(mpsc::error::SendError(returned)) => job = returned,
            }
        }

        let gate = Arc::clone(table.gates.entry(user_id.clone()).or_default());
        let lane = self.spawn_lane(user_id.clone(), gate);
        if lane.tx.send(job).is_err() {
            error!(user = %user_id, "New lane closed before first message");
        }
        table.lanes.insert(user_id, lane);

        PendingReply { rx }
    }

    fn spawn_lane(&self, user_id: UserId, gate: Gate) -> Lane<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));
        let generation = self.generations.fetch_add(1, Ordering::Relaxed);
        debug!(user = %user_id, generation, "Starting lane");

        tokio::spawn(run_lane(
            Worker {
                user_id,
                closed: Arc::clone(&closed),
                generation,
                gate,
                lanes: Arc::clone(&self.lanes),
                processor: Arc::clone(&self.processor),
                idle_timeout: self.idle_timeout,
            },
            rx,
        ));

        Lane {
            tx,
            closed,
            generation,
        }
    }

    /// Drop the user's queued messages
    ///
    /// The one in flight still finishes, and it finishes before any message
    /// submitted afterwards starts. Returns false if the user had no lane.
    pub fn disconnect(&self, user_id: &UserId) -> bool {
        match lock(&self.lanes).lanes.remove(user_id) {
            Some(lane) => {
                lane.closed.store(true, Ordering::SeqCst);
                debug!(user = %user_id, "Lane disconnected");
                true
            }
            None => false,
        }
    }

    /// Close every lane
    pub fn shutdown(&self) {
        for (_, lane) in lock(&self.lanes).lanes.drain() {
            lane.closed.store(true, Ordering::SeqCst);
        }
    }

    /// Number of live lanes
    pub fn active_lanes(&self) -> usize {
        lock(&self.lanes).lanes.len()
    }
}

struct Worker<T> {
    user_id: UserId,
    closed: Arc<AtomicBool>,
    generation: u64,
    gate: Gate,
    lanes: Lanes<T>,
    processor: Processor<T>,
    idle_timeout: Duration,
}

impl<T> Worker<T> {
    /// Reap the lane if it is still idle, or hand back a job that raced in.
    ///
    /// Submissions send while holding the table lock, so an empty queue
    /// observed under the lock stays empty until the lane is removed.
    fn reap_or_next(&self, rx: &mut mpsc::UnboundedReceiver<Job<T>>) -> Option<Job<T>> {
        let mut table = lock(&self.lanes);
        match rx.try_recv() {
            Ok(job) => Some(job),
            Err(_) => {
                if table
                    .lanes
                    .get(&self.user_id)
                    .is_some_and(|lane| lane.generation == self.generation)
                {
                    table.lanes.remove(&self.user_id);
                }
                None
            }
        }
    }

    /// Forget the user's gate once no lane and no other worker holds it
    fn release_gate(&self) {
        let mut table = lock(&self.lanes);
        // The table and this worker each hold one reference
        if !table.lanes.contains_key(&self.user_id) && Arc::strong_count(&self.gate) <= 2 {
            table.gates.remove(&self.user_id);
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

async fn run_lane<T: Send + 'static>(worker: Worker<T>, mut rx: mpsc::UnboundedReceiver<Job<T>>) {
    let user_id = &worker.user_id;
    loop {
        let job = match tokio::time::timeout(worker.idle_timeout, rx.recv()).await {
            Ok(Some(job)) => job,
            Ok(None) => break,
            Err(_) => match worker.reap_or_next(&mut rx) {
                Some(job) => job,
                None => {
                    debug!(user = %user_id, generation = worker.generation, "Reaped idle lane");
                    break;
                }
            },
        };

        if worker.is_closed() {
            let _ = job.reply.send(Err(EngineError::Cancelled));
            continue;
        }

        let turn = worker.gate.lock().await;
        // Disconnected while waiting for an older lane
        if worker.is_closed() {
            drop(turn);
            let _ = job.reply.send(Err(EngineError::Cancelled));
            continue;
        }

        let work = (worker.processor)(user_id.clone(), job.message);
        let result = match AssertUnwindSafe(work).catch_unwind().await {
            Ok(result) => result,
            Err(_) => {
                error!(user = %user_id, "Message processing panicked");
                Err(EngineError::Cancelled)
            }
        };
        drop(turn);
        // The submitter may have stopped waiting
        let _ = job.reply.send(result);
    }
    worker.release_gate();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    type Log = Arc<StdMutex<Vec<(String, String)>>>;

    fn recording(log: Log, delay: Duration) -> Processor<String> {
        Arc::new(move |user: UserId, message: InboundMessage| {
            let log = Arc::clone(&log);
            async move {
                tokio::time::sleep(delay).await;
                log.lock()
                    .unwrap()
                    .push((user.to_string(), message.text.clone()));
                Ok::<_, EngineError>(message.text)
            }
            .boxed()
        })
    }

    #[tokio::test]
    async fn test_per_user_order_is_submission_order() {
        let log: Log = Arc::default();
        let sequencer = Sequencer::new(
            recording(Arc::clone(&log), Duration::from_millis(2)),
            Duration::from_secs(5),
        );

        let pending: Vec<_> = (0..10)
            .map(|i| sequencer.submit(UserId::new("alice"), InboundMessage::new(i.to_string())))
            .collect();
        for (i, reply) in pending.into_iter().enumerate() {
            assert_eq!(reply.await.unwrap(), i.to_string());
        }

        let texts: Vec<String> = log.lock().unwrap().iter().map(|(_, t)| t.clone()).collect();
        let expected: Vec<String> = (0..10).map(|i| i.to_string()).collect();
        assert_eq!(texts, expected);
    }

    #[tokio::test]
    async fn test_users_run_in_parallel() {
        let log: Log = Arc::default();
        let sequencer = Sequencer::new(
            recording(Arc::clone(&log), Duration::from_millis(200)),
            Duration::from_secs(5),
        );

        let started = std::time::Instant::now();
        let a = sequencer.submit(UserId::new("a"), InboundMessage::new("x"));
        let b = sequencer.submit(UserId::new("b"), InboundMessage::new("y"));
        let (a, b) = tokio::join!(a, b);
        assert!(a.is_ok() && b.is_ok());
        assert!(started.elapsed() < Duration::from_millis(390));
        assert_eq!(sequencer.active_lanes(), 2);
    }

    #[tokio::test]
    async fn test_disconnect_cancels_queued_messages() {
        let log: Log = Arc::default();
        let sequencer = Sequencer::new(
            recording(Arc::clone(&log), Duration::from_millis(100)),
            Duration::from_secs(5),
        );
        let user = UserId::new("carol");

        let first = sequencer.submit(user.clone(), InboundMessage::new("first"));
        let second = sequencer.submit(user.clone(), InboundMessage::new("second"));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(sequencer.disconnect(&user));

        assert_eq!(first.await.unwrap(), "first");
        assert!(matches!(second.await, Err(EngineError::Cancelled)));

        // A new submission after disconnect starts a fresh lane
        let third = sequencer.submit(user.clone(), InboundMessage::new("third"));
        assert_eq!(third.await.unwrap(), "third");
    }

    #[tokio::test]
    async fn test_resubmit_after_disconnect_waits_for_in_flight() {
        let events: Arc<StdMutex<Vec<String>>> = Arc::default();
        let processor: Processor<String> = {
            let events = Arc::clone(&events);
            Arc::new(move |_user: UserId, message: InboundMessage| {
                let events = Arc::clone(&events);
                async move {
                    events.lock().unwrap().push(format!("start {}", message.text));
                    if message.text == "first" {
                        tokio::time::sleep(Duration::from_millis(200)).await;
                    }
                    events.lock().unwrap().push(format!("end {}", message.text));
                    Ok::<_, EngineError>(message.text)
                }
                .boxed()
            })
        };
        let sequencer = Sequencer::new(processor, Duration::from_secs(5));
        let user = UserId::new("frank");

        let first = sequencer.submit(user.clone(), InboundMessage::new("first"));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(sequencer.disconnect(&user));
        let second = sequencer.submit(user.clone(), InboundMessage::new("second"));

        assert_eq!(second.await.unwrap(), "second");
        assert_eq!(first.await.unwrap(), "first");
        assert_eq!(
            *events.lock().unwrap(),
            vec!["start first", "end first", "start second", "end second"]
        );
    }

    #[tokio::test]
    async fn test_gate_is_released_with_last_lane() {
        let log: Log = Arc::default();
        let sequencer = Sequencer::new(
            recording(Arc::clone(&log), Duration::ZERO),
            Duration::from_millis(20),
        );
        let user = UserId::new("gina");

        sequencer
            .submit(user.clone(), InboundMessage::new("hi"))
            .await
            .unwrap();
        assert_eq!(lock(&sequencer.lanes).gates.len(), 1);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(sequencer.active_lanes(), 0);
        assert!(lock(&sequencer.lanes).gates.is_empty());
    }

    #[tokio::test]
    async fn test_idle_lanes_are_reaped() {
        let log: Log = Arc::default();
        let sequencer = Sequencer::new(
            recording(Arc::clone(&log), Duration::ZERO),
            Duration::from_millis(30),
        );
        let user = UserId::new("dave");

        sequencer
            .submit(user.clone(), InboundMessage::new("hi"))
            .await
            .unwrap();
        assert_eq!(sequencer.active_lanes(), 1);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(sequencer.active_lanes(), 0);

        let again = sequencer.submit(user, InboundMessage::new("again"));
        assert_eq!(again.await.unwrap(), "again");
    }

    #[tokio::test]
    async fn test_panicking_job_does_not_kill_lane() {
        let processor: Processor<String> = Arc::new(|_user: UserId, message: InboundMessage| {
            async move {
                if message.text == "boom" {
                    panic!("processor exploded");
                }
                Ok::<_, EngineError>(message.text)
            }
            .boxed()
        });
        let sequencer = Sequencer::new(processor, Duration::from_secs(5));
        let user = UserId::new("erin");

        let boom = sequencer.submit(user.clone(), InboundMessage::new("boom"));
        let ok = sequencer.submit(user, InboundMessage::new("fine"));
        assert!(matches!(boom.await, Err(EngineError::Cancelled)));
        assert_eq!(ok.await.unwrap(), "fine");
    }
}
