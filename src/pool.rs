//! Bounded submission queue and its worker threads.
//!
//! Dispatch is an explicit non-blocking enqueue onto a bounded channel; a
//! fixed set of OS threads drains it. The pool owns concurrency limits so
//! nothing in the orchestrator ever spawns work ad hoc.

use std::sync::mpsc::{Receiver, SyncSender, TrySendError, sync_channel};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use tracing::{debug, warn};

use crate::worker::SubmissionWorker;

enum Job {
    Process(String),
    Shutdown,
}

pub struct SubmissionPool {
    sender: SyncSender<Job>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    threads: usize,
}

impl SubmissionPool {
    pub fn start(worker: Arc<SubmissionWorker>, threads: usize, capacity: usize) -> Self {
        let threads = threads.max(1);
        let (sender, receiver) = sync_channel::<Job>(capacity.max(1));
        let receiver = Arc::new(Mutex::new(receiver));

        let mut handles = Vec::with_capacity(threads);
        for index in 0..threads {
            let worker = Arc::clone(&worker);
            let receiver = Arc::clone(&receiver);
            handles.push(
                std::thread::Builder::new()
                    .name(format!("submission-{index}"))
                    .spawn(move || Self::run(worker, receiver))
                    .expect("failed to spawn submission worker thread"),
            );
        }

        Self {
            sender,
            handles: Mutex::new(handles),
            threads,
        }
    }

    fn run(worker: Arc<SubmissionWorker>, receiver: Arc<Mutex<Receiver<Job>>>) {
        loop {
            let job = {
                let guard = receiver.lock().expect("submission queue poisoned");
                guard.recv()
            };
            match job {
                Ok(Job::Process(filing_id)) => {
                    let outcome = worker.process_submission(&filing_id);
                    debug!(%filing_id, ?outcome, "submission job finished");
                }
                Ok(Job::Shutdown) | Err(_) => break,
            }
        }
    }

    /// Non-blocking enqueue. Returns whether the job was accepted; a full
    /// queue is logged and left for the recovery sweeper to pick up, since
    /// the filing is already committed as `ERI_IN_PROGRESS`.
    pub fn dispatch(&self, filing_id: &str) -> bool {
        match self.sender.try_send(Job::Process(filing_id.to_string())) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(%filing_id, "submission queue full, leaving filing for the sweeper");
                false
            }
            Err(TrySendError::Disconnected(_)) => {
                warn!(%filing_id, "submission pool is shut down");
                false
            }
        }
    }

    /// Drain every queued job, then stop and join all worker threads.
    /// Idempotent; later calls are no-ops.
    pub fn shutdown(&self) {
        let handles = std::mem::take(&mut *self.handles.lock().expect("pool handles poisoned"));
        if handles.is_empty() {
            return;
        }
        for _ in 0..self.threads {
            // Shutdown sentinels queue behind pending jobs, so each thread
            // finishes outstanding work before exiting.
            let _ = self.sender.send(Job::Shutdown);
        }
        for handle in handles {
            let _ = handle.join();
        }
    }
}
