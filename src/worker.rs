// =============================================================================
// Worker runtime — one long-lived OS thread per strategy/watcher unit
// =============================================================================
//
// The loop executes `pre_update -> update -> post_update` while running and
// playing, idles with a bounded sleep when paused, and drains its command
// channel once per iteration (serialized command intake).
//
// Failure policy: an error in `pre_run` aborts startup and latches the last
// error; a panic inside the loop is caught, logged and the loop restarts;
// an error in `post_run` is logged and the worker terminates.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{error, info, warn};

use crate::error::EngineError;

/// Sleep applied when the worker is paused.
const PAUSE_SLEEP: Duration = Duration::from_millis(100);

/// Benchmarking keeps the most recent loop samples.
const MAX_BENCH_SAMPLES: usize = 30;

/// Commands accepted by a worker, drained once per loop iteration.
#[derive(Debug, Clone)]
pub enum WorkerCommand {
    /// Free-form command forwarded to the runner.
    Command { kind: String, payload: Value },
    /// Synchronize the runner with its collaborators.
    Sync,
    /// Snapshot the runner state to its persistence sink.
    Dump,
    /// Restore the runner state from a snapshot.
    Load(Value),
}

/// The unit of work a worker drives. All hooks run on the worker thread.
pub trait Runner: Send {
    fn name(&self) -> &str;

    /// One-time setup; an error aborts the worker.
    fn pre_run(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    /// One-time teardown, always attempted on the way out.
    fn post_run(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    fn pre_update(&mut self) {}

    fn update(&mut self) {}

    fn post_update(&mut self) {}

    fn command(&mut self, _kind: &str, _payload: &Value) {}

    fn sync(&mut self) {}

    fn dump(&mut self) {}

    fn load(&mut self, _data: &Value) {}

    /// Liveness answer; `message` is empty outside benchmarking mode.
    fn pong(&mut self, message: &str) {
        info!(worker = self.name(), message, "worker is alive");
    }
}

/// Flags shared between the worker thread and its handle.
#[derive(Debug)]
struct WorkerShared {
    running: AtomicBool,
    playing: AtomicBool,
    ping: AtomicBool,
    error: Mutex<Option<String>>,
}

/// Handle over a spawned worker thread.
#[derive(Debug)]
pub struct Worker {
    name: String,
    shared: Arc<WorkerShared>,
    commands: Sender<WorkerCommand>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    /// Spawn the worker thread and start playing.
    pub fn start<R: Runner + 'static>(
        runner: R,
        benchmark: bool,
    ) -> Result<Self, EngineError> {
        let name = runner.name().to_string();

        let shared = Arc::new(WorkerShared {
            running: AtomicBool::new(true),
            playing: AtomicBool::new(true),
            ping: AtomicBool::new(false),
            error: Mutex::new(None),
        });

        let (tx, rx) = crossbeam_channel::bounded(32);

        let thread_shared = Arc::clone(&shared);
        let thread_name = name.clone();
        let handle = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || run_loop(runner, thread_shared, rx, benchmark))
            .map_err(|e| EngineError::Startup(thread_name, e.to_string()))?;

        info!(worker = %name, benchmark, "worker started");

        Ok(Self {
            name,
            shared,
            commands: tx,
            handle: Some(handle),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    pub fn is_playing(&self) -> bool {
        self.shared.playing.load(Ordering::Acquire)
    }

    /// Resume the processing loop.
    pub fn play(&self) {
        if self.is_running() {
            self.shared.playing.store(true, Ordering::Release);
        }
    }

    /// Idle the processing loop without terminating the thread.
    pub fn pause(&self) {
        if self.is_running() {
            self.shared.playing.store(false, Ordering::Release);
        }
    }

    /// Cooperative stop: the loop exits at its next iteration.
    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::Release);
    }

    /// Request a liveness pong at the next loop iteration.
    pub fn ping(&self) {
        self.shared.ping.store(true, Ordering::Release);
    }

    pub fn command(&self, kind: &str, payload: Value) {
        self.send(WorkerCommand::Command {
            kind: kind.to_string(),
            payload,
        });
    }

    pub fn sync(&self) {
        self.send(WorkerCommand::Sync);
    }

    pub fn dump(&self) {
        self.send(WorkerCommand::Dump);
    }

    pub fn load(&self, data: Value) {
        self.send(WorkerCommand::Load(data));
    }

    fn send(&self, command: WorkerCommand) {
        if self.commands.try_send(command).is_err() {
            warn!(worker = %self.name, "worker command queue full or closed, command dropped");
        }
    }

    /// Last error latched by the loop, if any.
    pub fn last_error(&self) -> Option<String> {
        self.shared.error.lock().clone()
    }

    /// Stop and join the worker thread.
    pub fn join(mut self) {
        self.stop();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!(worker = %self.name, "worker thread terminated abnormally");
            }
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.stop();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

// ---------------------------------------------------------------------------
// Thread body
// ---------------------------------------------------------------------------

struct BenchState {
    samples: VecDeque<f64>,
    worst: f64,
    avg: f64,
}

fn run_loop<R: Runner>(
    mut runner: R,
    shared: Arc<WorkerShared>,
    commands: Receiver<WorkerCommand>,
    benchmark: bool,
) {
    let name = runner.name().to_string();

    if let Err(e) = runner.pre_run() {
        error!(worker = %name, error = %e, "worker startup failed");
        *shared.error.lock() = Some(e.to_string());
        shared.running.store(false, Ordering::Release);
        return;
    }

    let mut bench = BenchState {
        samples: VecDeque::with_capacity(MAX_BENCH_SAMPLES + 1),
        worst: 0.0,
        avg: 0.0,
    };

    // The loop restarts after a caught panic: workers are resilient to
    // transient logic errors.
    while shared.running.load(Ordering::Acquire) {
        let caught = panic::catch_unwind(AssertUnwindSafe(|| {
            while shared.running.load(Ordering::Acquire) {
                process_once(&mut runner, &shared, &commands, benchmark, &mut bench);
            }
        }));

        if let Err(payload) = caught {
            let message = panic_message(payload);
            error!(worker = %name, error = %message, "worker loop panicked, restarting");
            *shared.error.lock() = Some(message);
        }
    }

    if let Err(e) = runner.post_run() {
        error!(worker = %name, error = %e, "worker teardown failed");
        *shared.error.lock() = Some(e.to_string());
    }

    shared.running.store(false, Ordering::Release);
    info!(worker = %name, "worker terminated");
}

fn process_once<R: Runner>(
    runner: &mut R,
    shared: &WorkerShared,
    commands: &Receiver<WorkerCommand>,
    benchmark: bool,
    bench: &mut BenchState,
) {
    let begin = Instant::now();

    // Serialized command intake.
    for command in commands.try_iter() {
        match command {
            WorkerCommand::Command { kind, payload } => runner.command(&kind, &payload),
            WorkerCommand::Sync => runner.sync(),
            WorkerCommand::Dump => runner.dump(),
            WorkerCommand::Load(data) => runner.load(&data),
        }
    }

    if shared.playing.load(Ordering::Acquire) {
        runner.pre_update();
        runner.update();
        runner.post_update();
    } else {
        std::thread::sleep(PAUSE_SLEEP);
    }

    if benchmark {
        let elapsed = begin.elapsed().as_secs_f64();
        bench.samples.push_back(elapsed);
        bench.worst = bench.worst.max(elapsed);
        if bench.samples.len() > MAX_BENCH_SAMPLES {
            bench.samples.pop_front();
        }
        bench.avg = bench.samples.iter().sum::<f64>() / bench.samples.len() as f64;
    }

    if shared.ping.swap(false, Ordering::AcqRel) {
        let message = if benchmark {
            format!(
                "Last loop {:.3} ms / worst loop {:.3} ms / avg loop {:.3} ms",
                bench.samples.back().copied().unwrap_or(0.0) * 1000.0,
                bench.worst * 1000.0,
                bench.avg * 1000.0,
            )
        } else {
            String::new()
        };
        runner.pong(&message);
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    #[derive(Clone, Default)]
    struct Probe {
        updates: Arc<AtomicU64>,
        pongs: Arc<Mutex<Vec<String>>>,
        commands: Arc<Mutex<Vec<String>>>,
        fail_pre_run: bool,
        panic_once: Arc<AtomicBool>,
    }

    struct ProbeRunner {
        probe: Probe,
    }

    impl Runner for ProbeRunner {
        fn name(&self) -> &str {
            "probe"
        }

        fn pre_run(&mut self) -> anyhow::Result<()> {
            if self.probe.fail_pre_run {
                anyhow::bail!("boom at startup");
            }
            Ok(())
        }

        fn update(&mut self) {
            if self.probe.panic_once.swap(false, Ordering::SeqCst) {
                panic!("transient logic error");
            }
            self.probe.updates.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(1));
        }

        fn command(&mut self, kind: &str, _payload: &Value) {
            self.probe.commands.lock().push(kind.to_string());
        }

        fn pong(&mut self, message: &str) {
            self.probe.pongs.lock().push(message.to_string());
        }
    }

    fn wait_until(deadline_ms: u64, predicate: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_millis(deadline_ms);
        while Instant::now() < deadline {
            if predicate() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        predicate()
    }

    #[test]
    fn runs_and_stops_cooperatively() {
        let probe = Probe::default();
        let worker = Worker::start(
            ProbeRunner {
                probe: probe.clone(),
            },
            false,
        )
        .unwrap();

        assert!(wait_until(1_000, || probe.updates.load(Ordering::SeqCst) > 3));
        worker.join();
        assert!(probe.updates.load(Ordering::SeqCst) > 3);
    }

    #[test]
    fn pause_idles_the_loop() {
        let probe = Probe::default();
        let worker = Worker::start(
            ProbeRunner {
                probe: probe.clone(),
            },
            false,
        )
        .unwrap();

        assert!(wait_until(1_000, || probe.updates.load(Ordering::SeqCst) > 0));
        worker.pause();
        assert!(wait_until(500, || !worker.is_playing()));
        std::thread::sleep(Duration::from_millis(50));

        let frozen = probe.updates.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(150));
        // At most one in-flight update may land after the pause.
        assert!(probe.updates.load(Ordering::SeqCst) <= frozen + 1);

        worker.play();
        assert!(wait_until(1_000, || {
            probe.updates.load(Ordering::SeqCst) > frozen + 1
        }));
        worker.join();
    }

    #[test]
    fn ping_produces_benchmark_pong() {
        let probe = Probe::default();
        let worker = Worker::start(
            ProbeRunner {
                probe: probe.clone(),
            },
            true,
        )
        .unwrap();

        assert!(wait_until(1_000, || probe.updates.load(Ordering::SeqCst) > 0));
        worker.ping();
        assert!(wait_until(1_000, || !probe.pongs.lock().is_empty()));
        worker.join();

        let pongs = probe.pongs.lock();
        let message = &pongs[0];
        assert!(message.starts_with("Last loop "), "got: {message}");
        assert!(message.contains(" ms / worst loop "));
        assert!(message.contains(" ms / avg loop "));
    }

    #[test]
    fn pre_run_failure_latches_error() {
        let probe = Probe {
            fail_pre_run: true,
            ..Probe::default()
        };
        let worker = Worker::start(
            ProbeRunner {
                probe: probe.clone(),
            },
            false,
        )
        .unwrap();

        assert!(wait_until(1_000, || !worker.is_running()));
        assert_eq!(worker.last_error().as_deref(), Some("boom at startup"));
        assert_eq!(probe.updates.load(Ordering::SeqCst), 0);
        worker.join();
    }

    #[test]
    fn loop_panic_restarts_without_terminating() {
        let probe = Probe::default();
        probe.panic_once.store(true, Ordering::SeqCst);
        let worker = Worker::start(
            ProbeRunner {
                probe: probe.clone(),
            },
            false,
        )
        .unwrap();

        // Updates keep flowing after the panic was caught.
        assert!(wait_until(1_000, || probe.updates.load(Ordering::SeqCst) > 2));
        assert!(worker.is_running());
        assert_eq!(
            worker.last_error().as_deref(),
            Some("transient logic error")
        );
        worker.join();
    }

    #[test]
    fn commands_are_drained_in_order() {
        let probe = Probe::default();
        let worker = Worker::start(
            ProbeRunner {
                probe: probe.clone(),
            },
            false,
        )
        .unwrap();

        worker.command("first", Value::Null);
        worker.command("second", Value::Null);
        assert!(wait_until(1_000, || probe.commands.lock().len() == 2));
        assert_eq!(*probe.commands.lock(), vec!["first", "second"]);
        worker.join();
    }
}
