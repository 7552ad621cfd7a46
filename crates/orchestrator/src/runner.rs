//! Simulation runner with lifecycle management
//!
//! This module provides the `SimulationRunner` which steps a [`Simulation`]
//! on a background thread. Start, pause, resume and stop take effect at step
//! boundaries only; a step in flight always completes or fails as a whole.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{Error, Result};
use crate::simulation::Simulation;

/// Runner state enum
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    /// Simulation created but not yet started
    Created,
    /// Simulation actively running
    Running,
    /// Simulation paused
    Paused,
    /// Simulation finished (reached stopping condition or stopped)
    Finished,
    /// A step failed
    Error,
}

impl RunnerState {
    fn is_terminal(self) -> bool {
        matches!(self, RunnerState::Finished | RunnerState::Error)
    }
}

/// Shared state between the runner thread and control interface
struct SharedState {
    /// Current runner state
    state: RunnerState,
    /// Current simulation time
    sim_time: f64,
    /// Number of timesteps executed
    timestep_count: u64,
    /// Most recent error message (if state is Error)
    error_message: Option<String>,
}

struct Shared {
    state: Mutex<SharedState>,
    changed: Condvar,
}

impl Shared {
    fn transition(&self, from: &[RunnerState], to: RunnerState) {
        let mut guard = self.state.lock();
        if from.contains(&guard.state) {
            guard.state = to;
            self.changed.notify_all();
        }
    }
}

/// Handle for controlling and querying a running simulation
pub struct SimulationRunner {
    shared: Arc<Shared>,
    thread_handle: Option<thread::JoinHandle<Simulation>>,
}

impl SimulationRunner {
    /// Create a runner stepping `simulation` by `dt` until `max_steps` steps
    /// have run (or forever). The thread waits for [`start`](Self::start).
    pub fn new(simulation: Simulation, dt: f32, max_steps: Option<u64>) -> Result<Self> {
        let shared = Arc::new(Shared {
            state: Mutex::new(SharedState {
                state: RunnerState::Created,
                sim_time: simulation.sim_time(),
                timestep_count: simulation.steps(),
                error_message: None,
            }),
            changed: Condvar::new(),
        });

        let shared_clone = Arc::clone(&shared);
        let thread_handle = thread::Builder::new()
            .name("simulation-runner".into())
            .spawn(move || run_simulation_loop(simulation, &shared_clone, dt, max_steps))
            .map_err(Error::Thread)?;

        Ok(Self {
            shared,
            thread_handle: Some(thread_handle),
        })
    }

    /// Get current runner state
    pub fn state(&self) -> RunnerState {
        self.shared.state.lock().state
    }

    /// Get current simulation time
    pub fn sim_time(&self) -> f64 {
        self.shared.state.lock().sim_time
    }

    /// Get current timestep count
    pub fn timestep_count(&self) -> u64 {
        self.shared.state.lock().timestep_count
    }

    /// Get error message if state is Error
    pub fn error_message(&self) -> Option<String> {
        self.shared.state.lock().error_message.clone()
    }

    /// Start the simulation (transition from Created to Running)
    pub fn start(&self) {
        self.shared
            .transition(&[RunnerState::Created], RunnerState::Running);
    }

    /// Pause after the current step
    pub fn pause(&self) {
        self.shared
            .transition(&[RunnerState::Running], RunnerState::Paused);
    }

    /// Resume the simulation
    pub fn resume(&self) {
        self.shared
            .transition(&[RunnerState::Paused], RunnerState::Running);
    }

    /// Stop after the current step
    pub fn stop(&self) {
        self.shared.transition(
            &[RunnerState::Created, RunnerState::Running, RunnerState::Paused],
            RunnerState::Finished,
        );
    }

    /// Block until the runner is Finished or Error, or `timeout` passes.
    /// Returns the state at that point.
    pub fn wait(&self, timeout: Duration) -> RunnerState {
        let deadline = Instant::now() + timeout;
        let mut guard = self.shared.state.lock();
        while !guard.state.is_terminal() {
            if self.shared.changed.wait_until(&mut guard, deadline).timed_out() {
                break;
            }
        }
        guard.state
    }

    /// Wait for the simulation thread to exit and take the simulation back.
    /// Blocks until the runner finishes, fails or is stopped.
    pub fn join(mut self) -> Result<Simulation> {
        let handle = self.thread_handle.take().ok_or(Error::RunnerPanicked)?;
        handle.join().map_err(|_| Error::RunnerPanicked)
    }
}

impl Drop for SimulationRunner {
    fn drop(&mut self) {
        // Signal the thread to exit at the next step boundary
        self.stop();
    }
}

/// Main simulation loop executed in background thread
fn run_simulation_loop(
    mut sim: Simulation,
    shared: &Shared,
    dt: f32,
    max_steps: Option<u64>,
) -> Simulation {
    // Wait for start signal
    {
        let mut guard = shared.state.lock();
        while guard.state == RunnerState::Created {
            shared.changed.wait(&mut guard);
        }
        if guard.state != RunnerState::Running {
            return sim;
        }
    }

    let start_wall_time = Instant::now();
    tracing::info!(
        "Runner started: dt={}, max_steps={:?}, {} partitions",
        dt,
        max_steps,
        sim.partition_count()
    );

    loop {
        {
            let mut guard = shared.state.lock();
            while guard.state == RunnerState::Paused {
                shared.changed.wait(&mut guard);
            }
            if guard.state != RunnerState::Running {
                break;
            }
            if max_steps.is_some_and(|m| sim.steps() >= m) {
                tracing::info!("Simulation finished: reached max_steps = {}", sim.steps());
                guard.state = RunnerState::Finished;
                shared.changed.notify_all();
                break;
            }
        }

        match sim.step(dt) {
            Ok(report) => {
                let mut guard = shared.state.lock();
                guard.sim_time = sim.sim_time();
                guard.timestep_count = sim.steps();
                if sim.steps() % 100 == 0 {
                    tracing::debug!(
                        "Step {}: sim_time={:.4}, step_wall={:.2} ms, halo packs={}",
                        sim.steps(),
                        sim.sim_time(),
                        report.elapsed.as_secs_f64() * 1e3,
                        report.transfer.packs
                    );
                }
            }
            Err(e) => {
                tracing::error!("Step {} failed: {}", sim.steps(), e);
                let mut guard = shared.state.lock();
                guard.state = RunnerState::Error;
                guard.error_message = Some(e.to_string());
                shared.changed.notify_all();
                break;
            }
        }
    }

    tracing::info!(
        "Simulation thread exiting: {} timesteps, {:.4} simulated, {:.2}s wall",
        sim.steps(),
        sim.sim_time(),
        start_wall_time.elapsed().as_secs_f64()
    );
    sim
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulation::SimulationOptions;
    use grid_kernel::{BuiltinKernel, FieldDesc, HostBackend, KernelError, KernelHandle, SparseGrid};

    fn simulation() -> Simulation {
        let grid = SparseGrid::dense_blocks([[0, 0, 0], [1, 0, 0]]);
        let options = SimulationOptions {
            partitions: 2,
            ..SimulationOptions::default()
        };
        let mut sim = Simulation::new(grid, Arc::new(HostBackend::new(2)), options).unwrap();
        sim.add_field(FieldDesc::new("u", 1).with_halo()).unwrap();
        sim.add_field(FieldDesc::new("v", 1)).unwrap();
        sim.add_task("diffuse", ["u"], ["u"], BuiltinKernel::Laplacian { coefficient: 0.1 })
            .unwrap();
        sim.add_task("sample", ["u"], ["v"], BuiltinKernel::Copy).unwrap();
        sim
    }

    #[test]
    fn test_runner_lifecycle() {
        let runner = SimulationRunner::new(simulation(), 0.5, Some(10)).unwrap();

        // Initially Created
        assert_eq!(runner.state(), RunnerState::Created);
        runner.start();

        assert_eq!(runner.wait(Duration::from_secs(30)), RunnerState::Finished);
        assert_eq!(runner.timestep_count(), 10);
        assert!((runner.sim_time() - 5.0).abs() < 1e-9);

        let sim = runner.join().unwrap();
        assert_eq!(sim.steps(), 10);
    }

    #[test]
    fn test_runner_pause_resume() {
        let runner = SimulationRunner::new(simulation(), 0.1, None).unwrap();
        runner.start();
        thread::sleep(Duration::from_millis(50));

        runner.pause();
        assert_eq!(runner.state(), RunnerState::Paused);

        // At most the step in flight completes after pausing
        thread::sleep(Duration::from_millis(50));
        let steps_paused = runner.timestep_count();
        thread::sleep(Duration::from_millis(100));
        assert_eq!(runner.timestep_count(), steps_paused);

        runner.resume();
        assert_eq!(runner.state(), RunnerState::Running);
        runner.stop();
        assert_eq!(runner.state(), RunnerState::Finished);
        runner.join().unwrap();
    }

    #[test]
    fn test_stop_before_start() {
        let runner = SimulationRunner::new(simulation(), 0.1, None).unwrap();
        runner.stop();
        let sim = runner.join().unwrap();
        assert_eq!(sim.steps(), 0);
    }

    #[test]
    fn test_failed_step_sets_error() {
        let mut sim = simulation();
        sim.set_kernel(
            "sample",
            KernelHandle::host(|ctx, _| {
                Err(KernelError::Failed {
                    task: ctx.task.to_string(),
                    partition: ctx.partition,
                    reason: "diverged".into(),
                })
            }),
        )
        .unwrap();
        let runner = SimulationRunner::new(sim, 0.1, Some(5)).unwrap();
        runner.start();
        assert_eq!(runner.wait(Duration::from_secs(30)), RunnerState::Error);
        assert!(runner.error_message().unwrap().contains("step 0"));
        assert_eq!(runner.timestep_count(), 0);
    }
}
