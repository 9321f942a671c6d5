//! Fixed-size worker pool for named transform implementations
//!
//! CPU-heavy stages are registered by name and run on dedicated OS threads so
//! the control loop never blocks on them. Results come back over a oneshot
//! channel and are awaited like any other I/O.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use tokio::sync::oneshot;
use tracing::{debug, error};

use super::{Transform, TransformData};
use crate::error::{Error, Result};

struct Job {
    name: String,
    data: TransformData,
    reply: oneshot::Sender<Result<TransformData>>,
}

/// A pool of threads running registered transforms
pub struct WorkerPool {
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    workers: Vec<JoinHandle<()>>,
    transforms: Arc<HashMap<String, Arc<dyn Transform>>>,
    completed: Arc<AtomicU64>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.workers.len())
            .field("transforms", &self.transforms.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl WorkerPool {
    /// Start `size` worker threads able to run the given named transforms
    pub fn new(size: usize, transforms: HashMap<String, Arc<dyn Transform>>) -> Self {
        let size = size.max(1);
        let (sender, receiver) = mpsc::channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));
        let transforms = Arc::new(transforms);
        let completed = Arc::new(AtomicU64::new(0));

        let workers = (0..size)
            .map(|index| {
                let receiver = Arc::clone(&receiver);
                let transforms = Arc::clone(&transforms);
                let completed = Arc::clone(&completed);
                std::thread::Builder::new()
                    .name(format!("transform-worker-{}", index))
                    .spawn(move || worker_loop(receiver, transforms, completed))
                    .map_err(|e| error!(error = %e, "failed to spawn transform worker"))
                    .ok()
            })
            .flatten()
            .collect::<Vec<_>>();

        debug!(workers = workers.len(), "transform worker pool started");

        Self {
            sender: Mutex::new(Some(sender)),
            workers,
            transforms,
            completed,
        }
    }

    /// Whether a transform is registered under `name`
    pub fn has(&self, name: &str) -> bool {
        self.transforms.contains_key(name)
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Number of jobs finished since the pool started
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    /// Run the transform registered as `name` on a worker thread
    pub async fn run(&self, name: &str, data: TransformData) -> Result<TransformData> {
        if !self.has(name) {
            return Err(Error::internal(format!("no pooled transform named '{}'", name)));
        }

        let (reply, receiver) = oneshot::channel();
        {
            let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
            let sender = sender
                .as_ref()
                .ok_or_else(|| Error::internal("worker pool is shut down"))?;
            sender
                .send(Job {
                    name: name.to_string(),
                    data,
                    reply,
                })
                .map_err(|_| Error::internal("worker pool is shut down"))?;
        }

        receiver
            .await
            .map_err(|_| Error::internal(format!("transform worker for '{}' exited", name)))?
    }

    /// Stop accepting jobs and wait for the workers to drain
    pub fn shutdown(&mut self) {
        self.sender.lock().unwrap_or_else(PoisonError::into_inner).take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(
    receiver: Arc<Mutex<mpsc::Receiver<Job>>>,
    transforms: Arc<HashMap<String, Arc<dyn Transform>>>,
    completed: Arc<AtomicU64>,
) {
    loop {
        let job = {
            let receiver = receiver.lock().unwrap_or_else(PoisonError::into_inner);
            receiver.recv()
        };
        let Ok(job) = job else {
            return;
        };

        let result = match transforms.get(&job.name) {
            Some(transform) => {
                let transform = Arc::clone(transform);
                let data = job.data;
                catch_unwind(AssertUnwindSafe(move || transform.transform(data))).unwrap_or_else(|_| {
                    Err(Error::internal(format!("transform '{}' panicked", job.name)))
                })
            }
            None => Err(Error::internal(format!("no pooled transform named '{}'", job.name))),
        };

        completed.fetch_add(1, Ordering::Relaxed);
        let _ = job.reply.send(result);
    }
}
