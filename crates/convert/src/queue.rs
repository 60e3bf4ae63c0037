//! The conversion queue state machine.
//!
//! One supervising loop owns the queue and the runner. It never blocks
//! indefinitely: the only wait is a bounded-timeout receive on the control
//! channel, so runner liveness and controller liveness are polled
//! cooperatively between messages.

use crate::power::PowerGuard;
use crate::protocol::{clear_window_sentinel, ControlMsg, StatusMsg};
use crate::unit::JobUnit;
use crate::watch::ControllerWatch;
use chrono::Local;
use command_runner::{CommandRunner, CommandSpec, OutputSink};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{info, warn};

/// The narrow supervision surface the state machine drives. Alternate
/// execution strategies (e.g. one that also parses encoder progress) can be
/// substituted without touching the queue logic.
pub trait ProcessRunner {
    /// Non-blocking start; any prior run must have already ended.
    fn start(&mut self, command: &CommandSpec, work_dir: &Path);
    fn is_alive(&self) -> bool;
    /// Meaningful once `is_alive` is false.
    fn error_detected(&self) -> bool;
    /// Safe to call when nothing is running.
    fn kill(&mut self);
}

impl ProcessRunner for command_runner::CommandRunner {
    fn start(&mut self, command: &CommandSpec, work_dir: &Path) {
        CommandRunner::start(self, command, work_dir);
    }

    fn is_alive(&self) -> bool {
        CommandRunner::is_alive(self)
    }

    fn error_detected(&self) -> bool {
        CommandRunner::error_detected(self)
    }

    fn kill(&mut self) {
        CommandRunner::kill(self);
    }
}

/// Where in the loop cycle the controller-liveness probe runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessCheck {
    AfterReceive,
    BeforeReceive,
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Bound on the control-channel receive; sets the polling cadence for
    /// runner and controller liveness.
    pub poll_timeout: Duration,
    pub liveness_check: LivenessCheck,
    /// Initial log directory; `AddItems` replaces it per batch.
    pub log_dir: PathBuf,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_millis(50),
            liveness_check: LivenessCheck::AfterReceive,
            log_dir: crate::default_log_dir(),
        }
    }
}

/// Drives queued [`JobUnit`]s through a [`ProcessRunner`] one at a time.
///
/// States are `Idle` and `Encoding`; the `encoding` flag plus the runner
/// reference are the whole run state. The queue is owned exclusively by
/// this loop.
pub struct QueueWorker<R, P, W> {
    runner: R,
    power: P,
    watch: W,
    control_rx: Receiver<ControlMsg>,
    status_tx: Sender<StatusMsg>,
    sink: OutputSink,
    config: WorkerConfig,
    shutdown: Arc<AtomicBool>,
    queue: VecDeque<JobUnit>,
    encoding: bool,
    controller_gone: bool,
    log_dir: PathBuf,
}

impl<R, P, W> QueueWorker<R, P, W>
where
    R: ProcessRunner,
    P: PowerGuard,
    W: ControllerWatch,
{
    pub fn new(
        runner: R,
        power: P,
        watch: W,
        control_rx: Receiver<ControlMsg>,
        status_tx: Sender<StatusMsg>,
        sink: OutputSink,
        config: WorkerConfig,
    ) -> Self {
        let log_dir = config.log_dir.clone();
        Self {
            runner,
            power,
            watch,
            control_rx,
            status_tx,
            sink,
            config,
            shutdown: Arc::new(AtomicBool::new(false)),
            queue: VecDeque::new(),
            encoding: false,
            controller_gone: false,
            log_dir,
        }
    }

    /// Latch this flag from a signal handler to make the loop emit `Exit`
    /// and terminate at the next cycle.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    /// Run until the queue settles with no controller left, or a shutdown
    /// is requested. Consumes the worker.
    pub fn run(mut self) {
        info!("conversion worker started");
        loop {
            if self.encoding && !self.runner.is_alive() {
                self.sink.detach_file();
                if self.runner.error_detected() {
                    self.on_unit_failed();
                } else {
                    self.on_unit_converted();
                }
            }

            if self.config.liveness_check == LivenessCheck::BeforeReceive {
                self.check_controller();
            }

            match self.control_rx.recv_timeout(self.config.poll_timeout) {
                Ok(ControlMsg::AddItems { log_dir, units }) => self.add_items(log_dir, units),
                Ok(ControlMsg::Cancel) => self.cancel(),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    self.controller_seen_dead("control channel disconnected");
                    // Disconnected receives return immediately; keep the
                    // polling cadence while in-flight work drains.
                    thread::sleep(self.config.poll_timeout);
                }
            }

            if self.shutdown.load(Ordering::SeqCst) {
                info!("shutdown requested, leaving remaining queue unfinished");
                let _ = self.status_tx.send(StatusMsg::Exit);
                self.power.release();
                return;
            }

            if self.config.liveness_check == LivenessCheck::AfterReceive {
                self.check_controller();
            }

            if self.controller_gone && !self.encoding && !self.runner.is_alive() {
                info!("controller is gone and the queue has settled, stopping");
                return;
            }
        }
    }

    fn check_controller(&mut self) {
        if !self.controller_gone && !self.watch.is_alive() {
            self.controller_seen_dead("controller process exited");
        }
    }

    fn controller_seen_dead(&mut self, reason: &str) {
        if self.controller_gone {
            return;
        }
        self.controller_gone = true;
        if self.runner.is_alive() || self.encoding {
            info!("{reason}, but I'm going to keep converting");
        } else {
            info!("{reason}");
        }
    }

    fn add_items(&mut self, log_dir: PathBuf, units: Vec<JobUnit>) {
        info!(count = units.len(), "commands queued");
        self.log_dir = log_dir;
        self.queue.extend(units);
        if !self.encoding {
            self.dispatch_front();
        }
    }

    fn cancel(&mut self) {
        self.runner.kill();
        self.power.release();
        self.sink.detach_file();
        if let Some(unit) = self.queue.front() {
            info!(video = %unit.video_id, "conversion cancelled");
            let _ = self.status_tx.send(StatusMsg::Cancelled {
                video_id: unit.video_id,
                command_id: unit.command_id,
            });
        }
        self.queue.clear();
        self.encoding = false;
    }

    fn on_unit_failed(&mut self) {
        warn!("error detected while converting");
        self.encoding = false;
        if let Some(unit) = self.queue.front() {
            let _ = self.status_tx.send(StatusMsg::Error {
                video_id: unit.video_id,
                command_id: unit.command_id,
            });
        }
        let abandoned = self.queue.len().saturating_sub(1);
        if abandoned > 0 {
            info!(abandoned, "dropping queued commands after failure");
        }
        self.queue.clear();
        self.power.release();
    }

    fn on_unit_converted(&mut self) {
        let Some(unit) = self.queue.pop_front() else {
            self.encoding = false;
            return;
        };
        info!(video = %unit.video_id, command = %unit.command_id, "command completed");
        let _ = self.status_tx.send(StatusMsg::Converted {
            video_id: unit.video_id,
            command_id: unit.command_id,
        });
        if self.queue.is_empty() {
            info!("all conversions complete");
            self.encoding = false;
            self.power.release();
            let _ = self.status_tx.send(StatusMsg::Complete);
        } else {
            info!("starting next command");
            self.dispatch_front();
        }
    }

    fn dispatch_front(&mut self) {
        let Some(unit) = self.queue.front().cloned() else {
            return;
        };
        self.sink
            .control(clear_window_sentinel(unit.video_id, unit.command_id));
        self.sink.detach_file();
        let stamp = Local::now().format("%Y-%m-%d_%H-%M-%S");
        let log_path = self.log_dir.join(format!("convert_{stamp}.log"));
        if let Err(e) = self.sink.attach_file(&log_path) {
            warn!("could not open log file {}: {e}", log_path.display());
        }
        self.power.inhibit();
        self.encoding = true;
        let _ = self.status_tx.send(StatusMsg::Running {
            video_id: unit.video_id,
            command_id: unit.command_id,
        });
        self.runner.start(&unit.command, &unit.work_dir);
    }
}
