//! Task contract and schedulers.
//!
//! Background work (warmup phases, checkpoint destruction, memory
//! recovery) is expressed as [`Task`] objects run by an injected
//! [`Scheduler`]. Tasks yield cooperatively: each `run` call does a
//! bounded slice of work and either finishes or asks to be re-driven.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::warn;

/// Identifier of a scheduled task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task:{}", self.0)
    }
}

/// Outcome of one `run` slice of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    /// The task completed and must not be run again
    Done,
    /// Re-run the task after (at least) the given delay
    Reschedule(Duration),
}

/// A unit of background work.
///
/// `run` must return within roughly `max_expected_duration`; the bound is
/// advisory, there is no preemption.
pub trait Task: Send {
    /// Perform one slice of work.
    fn run(&mut self) -> TaskOutcome;

    /// Human-readable description, used in logs.
    fn description(&self) -> String;

    /// Advisory upper bound on a single `run` call.
    fn max_expected_duration(&self) -> Duration {
        Duration::from_millis(50)
    }
}

/// Scheduler of tasks.
///
/// The engine never reaches for a global scheduler; every component that
/// needs one receives it at construction.
pub trait Scheduler: Send + Sync {
    /// Schedule a task, returning its id.
    fn schedule(&self, task: Box<dyn Task>) -> TaskId;

    /// Cancel a task. A task currently running finishes its slice; it is
    /// not re-run afterwards.
    fn cancel(&self, id: TaskId);
}

enum WorkItem {
    Run(TaskId, Box<dyn Task>),
    Stop,
}

struct PoolShared {
    sender: Sender<WorkItem>,
    cancelled: Mutex<HashSet<TaskId>>,
    next_id: AtomicU64,
    shutdown: AtomicBool,
}

/// A fixed-size worker pool driving tasks from a shared queue.
///
/// `Reschedule` outcomes are honoured by re-enqueueing the task after its
/// delay; cancellation is checked each time a task is picked up.
pub struct ThreadPoolExecutor {
    shared: Arc<PoolShared>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl ThreadPoolExecutor {
    /// Create a pool with `num_workers` worker threads.
    pub fn new(num_workers: usize) -> Arc<Self> {
        let (sender, receiver) = unbounded::<WorkItem>();
        let shared = Arc::new(PoolShared {
            sender,
            cancelled: Mutex::new(HashSet::new()),
            next_id: AtomicU64::new(1),
            shutdown: AtomicBool::new(false),
        });

        let mut workers = Vec::with_capacity(num_workers.max(1));
        for _ in 0..num_workers.max(1) {
            let receiver = receiver.clone();
            let shared = Arc::clone(&shared);
            workers.push(thread::spawn(move || worker_loop(&receiver, &shared)));
        }

        Arc::new(Self { shared, workers })
    }

    /// Stop accepting work and join all workers. Pending tasks are
    /// dropped.
    pub fn shutdown(&mut self) {
        if self.shared.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        for _ in &self.workers {
            let _ = self.shared.sender.send(WorkItem::Stop);
        }
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

impl Scheduler for ThreadPoolExecutor {
    fn schedule(&self, task: Box<dyn Task>) -> TaskId {
        let id = TaskId(self.shared.next_id.fetch_add(1, Ordering::AcqRel));
        if self.shared.shutdown.load(Ordering::Acquire) {
            return id;
        }
        if self.shared.sender.send(WorkItem::Run(id, task)).is_err() {
            warn!(%id, "scheduler queue closed, task dropped");
        }
        id
    }

    fn cancel(&self, id: TaskId) {
        self.shared.cancelled.lock().insert(id);
    }
}

impl Drop for ThreadPoolExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(receiver: &Receiver<WorkItem>, shared: &Arc<PoolShared>) {
    while let Ok(item) = receiver.recv() {
        match item {
            WorkItem::Stop => return,
            WorkItem::Run(id, mut task) => {
                if shared.cancelled.lock().remove(&id) {
                    continue;
                }
                match task.run() {
                    TaskOutcome::Done => {}
                    TaskOutcome::Reschedule(delay) => {
                        if shared.shutdown.load(Ordering::Acquire) {
                            continue;
                        }
                        // Park the work item on a short-lived timer thread
                        // and requeue; engine reschedule delays are small.
                        let sender = shared.sender.clone();
                        let shared = Arc::clone(shared);
                        thread::spawn(move || {
                            thread::sleep(delay);
                            if !shared.shutdown.load(Ordering::Acquire) {
                                let _ = sender.send(WorkItem::Run(id, task));
                            }
                        });
                    }
                }
            }
        }
    }
}

/// Scheduler that runs each task to completion on the calling thread.
///
/// `Reschedule` outcomes are honoured immediately (the delay is skipped),
/// which makes multi-slice tasks deterministic in tests.
#[derive(Default)]
pub struct DirectExecutor {
    next_id: AtomicU64,
    cancelled: Mutex<HashSet<TaskId>>,
}

impl DirectExecutor {
    /// Create a new direct executor.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl Scheduler for DirectExecutor {
    fn schedule(&self, mut task: Box<dyn Task>) -> TaskId {
        let id = TaskId(self.next_id.fetch_add(1, Ordering::AcqRel));
        loop {
            if self.cancelled.lock().remove(&id) {
                return id;
            }
            match task.run() {
                TaskOutcome::Done => return id,
                TaskOutcome::Reschedule(_) => continue,
            }
        }
    }

    fn cancel(&self, id: TaskId) {
        self.cancelled.lock().insert(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountTask {
        counter: Arc<AtomicUsize>,
        slices: usize,
    }

    impl Task for CountTask {
        fn run(&mut self) -> TaskOutcome {
            self.counter.fetch_add(1, Ordering::AcqRel);
            self.slices -= 1;
            if self.slices == 0 {
                TaskOutcome::Done
            } else {
                TaskOutcome::Reschedule(Duration::from_millis(1))
            }
        }

        fn description(&self) -> String {
            "count".to_string()
        }
    }

    #[test]
    fn test_direct_executor_runs_to_completion() {
        let executor = DirectExecutor::new();
        let counter = Arc::new(AtomicUsize::new(0));
        executor.schedule(Box::new(CountTask {
            counter: Arc::clone(&counter),
            slices: 3,
        }));
        assert_eq!(counter.load(Ordering::Acquire), 3);
    }

    #[test]
    fn test_thread_pool_runs_tasks() {
        let executor = ThreadPoolExecutor::new(2);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..4 {
            executor.schedule(Box::new(CountTask {
                counter: Arc::clone(&counter),
                slices: 2,
            }));
        }
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while counter.load(Ordering::Acquire) < 8 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(counter.load(Ordering::Acquire), 8);
    }

    #[test]
    fn test_cancel_before_run_direct() {
        // Cancelling an id that has not been handed out yet suppresses the
        // next scheduled task with that id.
        let executor = DirectExecutor::new();
        executor.cancel(TaskId(1));
        let counter = Arc::new(AtomicUsize::new(0));
        executor.schedule(Box::new(CountTask {
            counter: Arc::clone(&counter),
            slices: 1,
        }));
        assert_eq!(counter.load(Ordering::Acquire), 0);
    }
}
