//! Work-cell supervisor.
//!
//! Owns the two agent threads, the camera workers and the shared rendezvous
//! points (coordinate slot and capture flags). Operator commands go in
//! through [`WorkCell::send`]; agent state comes out through
//! [`WorkCell::status`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::Sender;
use parking_lot::RwLock;
use serde::Serialize;
use thiserror::Error;

use crate::agent::{
    link_pair, role_index, AgentLink, AgentLoop, AgentStatus, ArmRole, ArmSettings,
    ControlCommand, Inbound, Manipulator, TokenTap,
};
use crate::camera::{CameraError, CameraWorker, CaptureFlag, FrameProcessor, SourceOpener, WorkerFlags};
use crate::config::{ConfigError, ConfigStore};
use crate::mailbox::SharedCoordinateSlot;
use crate::motion::MotionController;

/// Pause between the stop command and raising the loop stop flags.
pub const STOP_SETTLE: Duration = Duration::from_millis(200);
/// How long a stopped agent thread gets to exit before it is abandoned.
pub const KILL_GRACE: Duration = Duration::from_secs(3);

#[derive(Debug, Error)]
pub enum CellError {
    #[error("failed to spawn thread for arm {role}: {source}")]
    Spawn {
        role: ArmRole,
        #[source]
        source: std::io::Error,
    },
    #[error("arm {0} is no longer running")]
    AgentGone(ArmRole),
    #[error(transparent)]
    Camera(#[from] CameraError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Outcome of [`WorkCell::stop`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    /// Agents whose threads exited within the grace period.
    pub joined: Vec<ArmRole>,
    /// Agents still running after the grace period; their threads were
    /// detached.
    pub killed: Vec<ArmRole>,
    pub cameras_stopped: usize,
}

struct AgentHandle {
    role: ArmRole,
    control: Sender<Inbound>,
    stop: Arc<AtomicBool>,
    status: Arc<RwLock<AgentStatus>>,
    thread: Option<JoinHandle<()>>,
}

struct CameraEntry {
    worker: CameraWorker<Box<dyn FrameProcessor>>,
    opener: SourceOpener,
}

pub struct WorkCell {
    config: Arc<ConfigStore>,
    slot: Arc<SharedCoordinateSlot>,
    captures: [CaptureFlag; 2],
    agents: Vec<AgentHandle>,
    cameras: Vec<CameraEntry>,
}

impl WorkCell {
    /// Start both agent threads and ask each to connect its arm.
    ///
    /// `controllers` is `[A, B]`. Every token either agent sends is copied to
    /// `tap` when given.
    pub fn launch(
        config: Arc<ConfigStore>,
        controllers: [Box<dyn MotionController>; 2],
        tap: Option<TokenTap>,
    ) -> Result<Self, CellError> {
        let slot = Arc::new(SharedCoordinateSlot::new());
        let captures = [CaptureFlag::new(), CaptureFlag::new()];
        let (links, senders) = link_pair();

        let mut cell = Self {
            config,
            slot,
            captures,
            agents: Vec::with_capacity(2),
            cameras: Vec::new(),
        };
        let roles = [ArmRole::A, ArmRole::B];
        for (((role, controller), link), control) in roles
            .into_iter()
            .zip(controllers)
            .zip(links)
            .zip(senders)
        {
            let handle = cell.spawn_agent(role, controller, link, control, tap.clone())?;
            cell.agents.push(handle);
        }
        for role in roles {
            cell.send(role, ControlCommand::Connect)?;
        }
        Ok(cell)
    }

    fn spawn_agent(
        &self,
        role: ArmRole,
        controller: Box<dyn MotionController>,
        link: AgentLink,
        control: Sender<Inbound>,
        tap: Option<TokenTap>,
    ) -> Result<AgentHandle, CellError> {
        let cfg = self.config.snapshot();
        let manipulator = Manipulator::new(role, controller, ArmSettings::from(cfg.arm(role)));
        let mut agent = AgentLoop::new(
            manipulator,
            link,
            Arc::clone(&self.slot),
            self.captures[role_index(role)].clone(),
            Arc::clone(&self.config),
        );
        if let Some(tap) = tap {
            agent = agent.with_tap(tap);
        }
        let status = agent.status_handle();
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let thread = thread::Builder::new()
            .name(format!("arm-{}", role.to_string().to_lowercase()))
            .spawn(move || agent.run(thread_stop))
            .map_err(|source| CellError::Spawn { role, source })?;
        Ok(AgentHandle {
            role,
            control,
            stop,
            status,
            thread: Some(thread),
        })
    }

    fn agent(&self, role: ArmRole) -> Result<&AgentHandle, CellError> {
        self.agents
            .iter()
            .find(|a| a.role == role)
            .ok_or(CellError::AgentGone(role))
    }

    pub fn send(&self, role: ArmRole, cmd: ControlCommand) -> Result<(), CellError> {
        self.agent(role)?
            .control
            .send(Inbound::Control(cmd))
            .map_err(|_| CellError::AgentGone(role))
    }

    /// Let arm A begin picking claimed objects.
    pub fn start(&self) -> Result<(), CellError> {
        self.send(ArmRole::A, ControlCommand::Start)
    }

    pub fn status(&self, role: ArmRole) -> Option<AgentStatus> {
        self.agent(role).ok().map(|a| a.status.read().clone())
    }

    pub fn slot(&self) -> &Arc<SharedCoordinateSlot> {
        &self.slot
    }

    /// Capture rendezvous of one arm; hand it to that arm's snapshot writer.
    pub fn capture_flag(&self, role: ArmRole) -> CaptureFlag {
        self.captures[role_index(role)].clone()
    }

    /// Re-read the configuration file and push it to both arms.
    pub fn reload_config(&self) -> Result<(), CellError> {
        self.config.reload()?;
        for a in &self.agents {
            self.send(a.role, ControlCommand::UpdateParameters)?;
        }
        Ok(())
    }

    pub fn attach_camera(
        &mut self,
        name: impl Into<String>,
        opener: SourceOpener,
        processor: Box<dyn FrameProcessor>,
    ) -> Result<(), CellError> {
        let worker = CameraWorker::spawn(name, &opener, processor)?;
        self.cameras.push(CameraEntry { worker, opener });
        Ok(())
    }

    pub fn cameras(&self) -> impl Iterator<Item = (&str, &WorkerFlags)> {
        self.cameras
            .iter()
            .map(|c| (c.worker.name(), c.worker.flags()))
    }

    /// Re-spawn every camera worker that exited asking for a restart.
    /// Returns how many were restarted.
    pub fn poll(&mut self) -> usize {
        let mut restarted = 0;
        for cam in &mut self.cameras {
            match cam.worker.restart_if_needed(&cam.opener) {
                Ok(Some(())) => restarted += 1,
                Ok(None) => {}
                Err(e) => tracing::warn!("{e}"),
            }
        }
        restarted
    }

    /// Stop with the default settle and grace periods.
    pub fn stop(&mut self) -> ShutdownReport {
        self.stop_with(STOP_SETTLE, KILL_GRACE)
    }

    /// Send `stop` to both arms, wait `settle`, end their loops and join
    /// each within `grace`. Camera workers are stopped last.
    pub fn stop_with(&mut self, settle: Duration, grace: Duration) -> ShutdownReport {
        let mut report = ShutdownReport::default();
        if self.agents.iter().all(|a| a.thread.is_none()) && self.cameras.is_empty() {
            return report;
        }
        for a in &self.agents {
            if a.control.send(Inbound::Control(ControlCommand::Stop)).is_err() {
                tracing::debug!("arm {} already gone", a.role);
            }
        }
        thread::sleep(settle);
        for a in &self.agents {
            a.stop.store(true, Ordering::Release);
        }

        let deadline = Instant::now() + grace;
        for a in &mut self.agents {
            let Some(handle) = a.thread.take() else {
                continue;
            };
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(10));
            }
            if handle.is_finished() {
                if handle.join().is_err() {
                    tracing::error!("arm {} thread panicked", a.role);
                }
                report.joined.push(a.role);
            } else {
                tracing::warn!("arm {} did not stop within {grace:?}, detaching", a.role);
                report.killed.push(a.role);
            }
        }

        for cam in self.cameras.drain(..) {
            cam.worker.stop();
            report.cameras_stopped += 1;
        }
        tracing::info!(
            "cell stopped: joined {:?}, killed {:?}",
            report.joined,
            report.killed
        );
        report
    }
}

impl Drop for WorkCell {
    fn drop(&mut self) {
        self.stop_with(Duration::ZERO, KILL_GRACE);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{FrameSource, ReplaySource};
    use crate::config::tests::sample;
    use crate::motion::SimulatedController;
    use image::RgbImage;
    use std::sync::atomic::{AtomicU64, AtomicUsize};

    fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let end = Instant::now() + timeout;
        while Instant::now() < end {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        cond()
    }

    fn launch() -> WorkCell {
        let cfg = sample();
        let controllers: [Box<dyn MotionController>; 2] = [
            Box::new(SimulatedController::new(cfg.arm_a.address.clone())),
            Box::new(SimulatedController::new(cfg.arm_b.address.clone())),
        ];
        let store = Arc::new(ConfigStore::from_config(cfg).unwrap());
        WorkCell::launch(store, controllers, None).unwrap()
    }

    #[test]
    fn launch_connects_both_arms_and_stop_joins() {
        let mut cell = launch();
        let ready = wait_until(Duration::from_secs(5), || {
            [ArmRole::A, ArmRole::B]
                .iter()
                .all(|r| cell.status(*r).is_some_and(|s| s.robot.enabled))
        });
        assert!(ready);
        cell.start().unwrap();
        assert!(wait_until(Duration::from_secs(2), || {
            cell.status(ArmRole::A).is_some_and(|s| s.active)
        }));

        let report = cell.stop_with(Duration::from_millis(20), KILL_GRACE);
        assert_eq!(report.joined, vec![ArmRole::A, ArmRole::B]);
        assert!(report.killed.is_empty());
        assert!(matches!(
            cell.send(ArmRole::A, ControlCommand::Home),
            Err(CellError::AgentGone(ArmRole::A))
        ));
        assert_eq!(cell.stop(), ShutdownReport::default());
    }

    struct Count(Arc<AtomicU64>);

    impl FrameProcessor for Count {
        fn on_frame(&mut self, _frame: &RgbImage) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn failed_camera_is_respawned_on_poll() {
        let mut cell = launch();
        let opens = Arc::new(AtomicUsize::new(0));
        let opens_in = Arc::clone(&opens);
        let opener: SourceOpener = Arc::new(move || {
            if opens_in.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(CameraError::Open {
                    name: "table".into(),
                    reason: "device busy".into(),
                });
            }
            let frames = vec![RgbImage::new(4, 4)];
            Ok(Box::new(ReplaySource::new(frames, Duration::from_millis(1))) as Box<dyn FrameSource>)
        });
        let seen = Arc::new(AtomicU64::new(0));
        cell.attach_camera("table", opener, Box::new(Count(Arc::clone(&seen))))
            .unwrap();

        assert!(wait_until(Duration::from_secs(2), || {
            cell.cameras().all(|(_, f)| f.needs_restart())
        }));
        let mut restarted = 0;
        assert!(wait_until(Duration::from_secs(2), || {
            restarted += cell.poll();
            restarted == 1
        }));
        assert!(wait_until(Duration::from_secs(2), || seen.load(Ordering::Relaxed) > 0));
        assert_eq!(opens.load(Ordering::SeqCst), 2);

        let report = cell.stop_with(Duration::ZERO, KILL_GRACE);
        assert_eq!(report.cameras_stopped, 1);
    }
}
