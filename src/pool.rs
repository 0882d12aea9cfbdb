//! Bounded-parallel execution of opaque job payloads.
//!
//! The pool owns a fixed set of worker threads draining one FIFO queue. A
//! job payload names a [`Workload`] registered with the pool; the worker
//! looks the workload up and invokes it. Workloads run isolated: a panic
//! rejects only the job that panicked, the worker itself survives.
//!
//! One pool is shared process-wide across all nodes of a pipeline, so the
//! total per-item parallelism stays bounded no matter how many nodes run
//! concurrently.

use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;

use camino::Utf8PathBuf;
use crossbeam_channel::{Receiver, Sender, bounded, unbounded};
use tracing::debug;

use crate::error::PoolError;

/// A job payload: which workload to run, over which item, with which
/// parameters. Everything is plain data so payloads can cross threads.
#[derive(Debug, Clone)]
pub struct JobSpec {
    /// Key into the pool's workload registry.
    pub workload: String,
    /// The item being processed.
    pub item: Utf8PathBuf,
    /// Destination path, for workloads that write a primary output.
    pub dest: Option<Utf8PathBuf>,
    /// Free-form workload parameters.
    pub params: BTreeMap<String, String>,
}

impl JobSpec {
    pub fn new(workload: impl Into<String>, item: impl Into<Utf8PathBuf>) -> Self {
        Self {
            workload: workload.into(),
            item: item.into(),
            dest: None,
            params: BTreeMap::new(),
        }
    }

    pub fn dest(mut self, dest: impl Into<Utf8PathBuf>) -> Self {
        self.dest = Some(dest.into());
        self
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    fn label(&self) -> String {
        format!("{} {}", self.workload, self.item)
    }
}

/// What a workload hands back: emitted paths per output name, plus any
/// dependencies discovered while running (e.g. transitive imports).
#[derive(Debug, Default)]
pub struct JobOutput {
    pub outputs: BTreeMap<String, Vec<Utf8PathBuf>>,
    pub discovered_deps: Vec<Utf8PathBuf>,
}

/// An isolated unit of expensive work, invoked on worker threads.
pub trait Workload: Send + Sync {
    fn perform(&self, job: &JobSpec) -> anyhow::Result<JobOutput>;
}

/// Maps workload names to implementations. Shared by the pool's workers.
#[derive(Default)]
pub struct WorkloadRegistry {
    map: RwLock<BTreeMap<String, Arc<dyn Workload>>>,
}

impl WorkloadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: impl Into<String>, workload: impl Workload + 'static) {
        self.map
            .write()
            .unwrap()
            .insert(name.into(), Arc::new(workload));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Workload>> {
        self.map.read().unwrap().get(name).cloned()
    }
}

struct Job {
    spec: JobSpec,
    reply: Sender<Result<JobOutput, PoolError>>,
}

/// The pending result of [`WorkerPool::execute`].
pub struct JobHandle {
    rx: Receiver<Result<JobOutput, PoolError>>,
}

impl JobHandle {
    /// Blocks until the job finishes.
    pub fn wait(self) -> Result<JobOutput, PoolError> {
        self.rx.recv().unwrap_or(Err(PoolError::WorkerLost))
    }
}

/// A fixed-size pool of worker threads with a FIFO job queue.
pub struct WorkerPool {
    queue: Mutex<Option<Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    active: Arc<Mutex<BTreeMap<usize, Option<String>>>>,
    terminated: Arc<AtomicBool>,
    size: usize,
}

impl WorkerPool {
    pub fn new(size: usize, registry: Arc<WorkloadRegistry>) -> Self {
        let size = size.max(1);
        let (tx, rx) = unbounded::<Job>();
        let active = Arc::new(Mutex::new(BTreeMap::new()));
        let terminated = Arc::new(AtomicBool::new(false));

        let workers = (0..size)
            .map(|id| {
                let rx = rx.clone();
                let registry = registry.clone();
                let active = active.clone();
                let terminated = terminated.clone();

                std::thread::Builder::new()
                    .name(format!("kamado-worker-{id}"))
                    .spawn(move || worker_loop(id, rx, registry, active, terminated))
                    .expect("failed to spawn worker thread")
            })
            .collect();

        Self {
            queue: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
            active,
            terminated,
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Enqueues a job. An idle worker picks it up immediately; otherwise it
    /// waits its turn in FIFO order.
    pub fn execute(&self, spec: JobSpec) -> JobHandle {
        let (reply, rx) = bounded(1);

        let rejected = self.terminated.load(Ordering::SeqCst)
            || match &*self.queue.lock().unwrap() {
                Some(queue) => queue.send(Job { spec, reply: reply.clone() }).is_err(),
                None => true,
            };

        if rejected {
            // Receiver side survives in the handle, so this send succeeds.
            let _ = reply.send(Err(PoolError::Terminated));
        }

        JobHandle { rx }
    }

    /// The current worker-to-job mapping, for supervision. Idle workers are
    /// omitted.
    pub fn active_jobs(&self) -> Vec<(usize, String)> {
        self.active
            .lock()
            .unwrap()
            .iter()
            .filter_map(|(id, label)| label.as_ref().map(|label| (*id, label.clone())))
            .collect()
    }

    /// Stops the pool. In-flight jobs finish; queued jobs fail with
    /// [`PoolError::Terminated`]; workers are joined.
    pub fn terminate(&self) {
        self.terminated.store(true, Ordering::SeqCst);
        // Dropping the sender disconnects the queue once drained.
        self.queue.lock().unwrap().take();

        for worker in self.workers.lock().unwrap().drain(..) {
            let _ = worker.join();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.terminate();
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("size", &self.size)
            .field("active", &self.active_jobs())
            .finish()
    }
}

fn worker_loop(
    id: usize,
    rx: Receiver<Job>,
    registry: Arc<WorkloadRegistry>,
    active: Arc<Mutex<BTreeMap<usize, Option<String>>>>,
    terminated: Arc<AtomicBool>,
) {
    while let Ok(job) = rx.recv() {
        if terminated.load(Ordering::SeqCst) {
            let _ = job.reply.send(Err(PoolError::Terminated));
            continue;
        }

        active.lock().unwrap().insert(id, Some(job.spec.label()));

        let result = match registry.get(&job.spec.workload) {
            Some(workload) => {
                match catch_unwind(AssertUnwindSafe(|| workload.perform(&job.spec))) {
                    Ok(Ok(output)) => Ok(output),
                    Ok(Err(err)) => Err(PoolError::Workload(err)),
                    Err(panic) => {
                        let message = panic_message(&panic);
                        debug!("Worker {id} caught a panic: {message}");
                        Err(PoolError::Workload(anyhow::anyhow!(
                            "workload '{}' panicked: {message}",
                            job.spec.workload
                        )))
                    }
                }
            }
            None => Err(PoolError::UnknownWorkload(job.spec.workload.clone())),
        };

        active.lock().unwrap().insert(id, None);

        // The caller may have dropped the handle; that's fine.
        let _ = job.reply.send(result);
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
