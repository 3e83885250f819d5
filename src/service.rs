// =============================================================================
// Worker service — supervises the set of workers
// =============================================================================

use std::collections::HashMap;

use serde_json::Value;
use tracing::{info, warn};

use crate::error::EngineError;
use crate::worker::{Runner, Worker};

/// Owns the engine's workers: starts them, broadcasts commands and pings,
/// and tears them all down on terminate.
#[derive(Debug, Default)]
pub struct WorkerService {
    workers: HashMap<String, Worker>,
}

impl WorkerService {
    pub fn new() -> Self {
        Self {
            workers: HashMap::new(),
        }
    }

    /// Start a worker for `runner`. Refuses a duplicate name.
    pub fn start<R: Runner + 'static>(
        &mut self,
        runner: R,
        benchmark: bool,
    ) -> Result<(), EngineError> {
        let name = runner.name().to_string();
        if self.workers.contains_key(&name) {
            warn!(worker = %name, "worker already started");
            return Err(EngineError::AlreadyStarted(name));
        }

        let worker = Worker::start(runner, benchmark)?;
        self.workers.insert(name, worker);
        Ok(())
    }

    pub fn worker(&self, name: &str) -> Option<&Worker> {
        self.workers.get(name)
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Broadcast a liveness ping to every worker.
    pub fn ping(&self) {
        for worker in self.workers.values() {
            worker.ping();
        }
    }

    /// Broadcast a command to every worker.
    pub fn command(&self, kind: &str, payload: &Value) {
        for worker in self.workers.values() {
            worker.command(kind, payload.clone());
        }
    }

    /// Ask every worker to snapshot its state.
    pub fn dump(&self) {
        for worker in self.workers.values() {
            worker.dump();
        }
    }

    /// Stop every worker, then join them.
    pub fn terminate(&mut self) {
        for worker in self.workers.values() {
            worker.stop();
        }

        for (name, worker) in self.workers.drain() {
            info!(worker = %name, "joining worker");
            worker.join();
        }
    }
}

impl Drop for WorkerService {
    fn drop(&mut self) {
        self.terminate();
    }
}
