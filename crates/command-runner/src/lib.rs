//! Subprocess supervision for encoder commands.
//!
//! [`CommandRunner`] executes one external command at a time, captures its
//! output on background threads, and exposes liveness and failure through
//! flags the owning loop can poll without blocking.

use crossbeam_channel::Sender;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

/// Output fragments that mark a run as failed even when the exit code is
/// zero (a shell wrapper can swallow the encoder's own status).
const FAILURE_MARKERS: &[&str] = &[
    "Conversion failed!",
    "Error opening",
    "Invalid data found when processing input",
];

const WAIT_POLL: Duration = Duration::from_millis(25);

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// One executable invocation: argv (program at index 0), an optional
/// executable override, and whether it must run through the platform shell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub args: Vec<String>,
    #[serde(default)]
    pub exe: Option<PathBuf>,
    #[serde(default)]
    pub shell: bool,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            args: vec![program.into()],
            exe: None,
            shell: false,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Replace the program (argv\[0\]) without touching the arguments.
    pub fn exe(mut self, exe: impl Into<PathBuf>) -> Self {
        self.exe = Some(exe.into());
        self
    }

    /// Request execution through `sh -c` / `cmd /C`.
    pub fn shell(mut self) -> Self {
        self.shell = true;
        self
    }

    /// The full command line as a single string, for shell execution and logs.
    pub fn display_line(&self) -> String {
        let mut parts = self.args.clone();
        if let Some(exe) = &self.exe {
            let exe = exe.to_string_lossy().into_owned();
            if parts.is_empty() {
                parts.push(exe);
            } else {
                parts[0] = exe;
            }
        }
        parts.join(" ")
    }

    fn program_and_args(&self) -> Option<(String, &[String])> {
        if let Some(exe) = &self.exe {
            let rest = if self.args.is_empty() {
                &[]
            } else {
                &self.args[1..]
            };
            return Some((exe.to_string_lossy().into_owned(), rest));
        }
        let (first, rest) = self.args.split_first()?;
        Some((first.clone(), rest))
    }
}

/// Fan-out for captured output: every line goes to the log channel, and to
/// the per-run log file while one is attached.
#[derive(Clone)]
pub struct OutputSink {
    tx: Sender<String>,
    file: Arc<Mutex<Option<File>>>,
}

impl OutputSink {
    pub fn new(tx: Sender<String>) -> Self {
        Self {
            tx,
            file: Arc::new(Mutex::new(None)),
        }
    }

    /// A free-text output line. Send errors are ignored; the worker must
    /// never stall on a slow log consumer.
    pub fn line(&self, line: &str) {
        let _ = self.tx.send(line.to_string());
        if let Some(file) = self.file.lock().as_mut() {
            let _ = writeln!(file, "{line}");
        }
    }

    /// A control sentinel for the log viewer; not persisted to the file.
    pub fn control(&self, msg: String) {
        let _ = self.tx.send(msg);
    }

    /// Open `path` (creating parent directories) and mirror subsequent
    /// lines into it until [`detach_file`](Self::detach_file).
    pub fn attach_file(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        *self.file.lock() = Some(File::create(path)?);
        Ok(())
    }

    pub fn detach_file(&self) {
        *self.file.lock() = None;
    }
}

/// Runs one external command at a time and watches it from capture threads.
///
/// `is_alive` stays true from `start` until the subprocess has exited and
/// both capture threads have drained. `error_detected` is meaningful once
/// `is_alive` returns false.
pub struct CommandRunner {
    sink: OutputSink,
    child: Arc<Mutex<Option<Child>>>,
    alive: Arc<AtomicBool>,
    error: Arc<AtomicBool>,
}

impl CommandRunner {
    pub fn new(sink: OutputSink) -> Self {
        Self {
            sink,
            child: Arc::new(Mutex::new(None)),
            alive: Arc::new(AtomicBool::new(false)),
            error: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Begin executing `spec` in `work_dir`. Non-blocking; the previous run
    /// must have already ended. Spawn failures latch the error flag instead
    /// of propagating.
    pub fn start(&mut self, spec: &CommandSpec, work_dir: &Path) {
        if self.is_alive() {
            warn!("refusing to start a command while another is running");
            return;
        }
        self.error.store(false, Ordering::SeqCst);
        self.alive.store(true, Ordering::SeqCst);

        let mut cmd = match build_command(spec) {
            Some(cmd) => cmd,
            None => {
                self.sink.line("cannot run an empty command");
                self.error.store(true, Ordering::SeqCst);
                self.alive.store(false, Ordering::SeqCst);
                return;
            }
        };
        cmd.current_dir(work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        debug!(command = %spec.display_line(), dir = %work_dir.display(), "starting command");
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!("failed to start command: {e}");
                self.sink.line(&format!("failed to start command: {e}"));
                self.error.store(true, Ordering::SeqCst);
                self.alive.store(false, Ordering::SeqCst);
                return;
            }
        };

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        *self.child.lock() = Some(child);

        let readers: Vec<_> = [
            stdout.map(|s| spawn_reader(s, self.sink.clone(), self.error.clone())),
            stderr.map(|s| spawn_reader(s, self.sink.clone(), self.error.clone())),
        ]
        .into_iter()
        .flatten()
        .collect();

        let child_slot = self.child.clone();
        let alive = self.alive.clone();
        let error = self.error.clone();
        thread::spawn(move || {
            for reader in readers {
                let _ = reader.join();
            }
            loop {
                let mut slot = child_slot.lock();
                let Some(child) = slot.as_mut() else { break };
                match child.try_wait() {
                    Ok(Some(status)) => {
                        if !status.success() {
                            debug!(?status, "command exited with failure status");
                            error.store(true, Ordering::SeqCst);
                        }
                        *slot = None;
                        break;
                    }
                    Ok(None) => {
                        drop(slot);
                        thread::sleep(WAIT_POLL);
                    }
                    Err(e) => {
                        warn!("could not reap command: {e}");
                        error.store(true, Ordering::SeqCst);
                        *slot = None;
                        break;
                    }
                }
            }
            alive.store(false, Ordering::SeqCst);
        });
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub fn error_detected(&self) -> bool {
        self.error.load(Ordering::SeqCst)
    }

    /// Forcibly terminate the current run. Safe to call when nothing runs.
    pub fn kill(&mut self) {
        if let Some(child) = self.child.lock().as_mut() {
            if let Err(e) = child.kill() {
                debug!("kill failed: {e}");
            }
        }
    }
}

fn build_command(spec: &CommandSpec) -> Option<Command> {
    if spec.shell {
        let line = spec.display_line();
        if line.is_empty() {
            return None;
        }
        let mut cmd = if cfg!(windows) {
            let mut cmd = Command::new("cmd");
            cmd.arg("/C").arg(line);
            cmd
        } else {
            let mut cmd = Command::new("sh");
            cmd.arg("-c").arg(line);
            cmd
        };
        no_window(&mut cmd);
        return Some(cmd);
    }
    let (program, args) = spec.program_and_args()?;
    let mut cmd = Command::new(program);
    cmd.args(args);
    no_window(&mut cmd);
    Some(cmd)
}

/// Keep child processes from opening a console window on Windows.
fn no_window(cmd: &mut Command) {
    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt;
        cmd.creation_flags(CREATE_NO_WINDOW);
    }
    #[cfg(not(windows))]
    {
        let _ = cmd;
    }
}

fn spawn_reader<R>(
    stream: R,
    sink: OutputSink,
    error: Arc<AtomicBool>,
) -> thread::JoinHandle<()>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line) {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    let text = line.trim_end();
                    if FAILURE_MARKERS.iter().any(|m| text.contains(m)) {
                        error.store(true, Ordering::SeqCst);
                    }
                    sink.line(text);
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;
    use std::time::Instant;

    fn test_sink() -> (OutputSink, crossbeam_channel::Receiver<String>) {
        let (tx, rx) = unbounded();
        (OutputSink::new(tx), rx)
    }

    fn wait_until_dead(runner: &CommandRunner) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while runner.is_alive() {
            assert!(Instant::now() < deadline, "command did not finish in time");
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn test_display_line_applies_exe_override() {
        let spec = CommandSpec::new("ffmpeg")
            .args(["-i", "in.mkv", "out.mkv"])
            .exe("/opt/ffmpeg/bin/ffmpeg");
        assert_eq!(spec.display_line(), "/opt/ffmpeg/bin/ffmpeg -i in.mkv out.mkv");
    }

    #[test]
    fn test_kill_without_run_is_noop() {
        let (sink, _rx) = test_sink();
        let mut runner = CommandRunner::new(sink);
        runner.kill();
        assert!(!runner.is_alive());
    }

    #[cfg(unix)]
    #[test]
    fn test_successful_command_streams_output() {
        let (sink, rx) = test_sink();
        let mut runner = CommandRunner::new(sink);
        let spec = CommandSpec::new("sh").args(["-c", "echo one; echo two"]);
        runner.start(&spec, Path::new("."));
        wait_until_dead(&runner);
        assert!(!runner.error_detected());
        let lines: Vec<String> = rx.try_iter().collect();
        assert!(lines.contains(&"one".to_string()));
        assert!(lines.contains(&"two".to_string()));
    }

    #[cfg(unix)]
    #[test]
    fn test_shell_spec_runs_whole_line() {
        let (sink, rx) = test_sink();
        let mut runner = CommandRunner::new(sink);
        let spec = CommandSpec::new("echo hello && echo goodbye").shell();
        runner.start(&spec, Path::new("."));
        wait_until_dead(&runner);
        assert!(!runner.error_detected());
        let lines: Vec<String> = rx.try_iter().collect();
        assert!(lines.contains(&"hello".to_string()));
        assert!(lines.contains(&"goodbye".to_string()));
    }

    #[cfg(unix)]
    #[test]
    fn test_nonzero_exit_sets_error() {
        let (sink, _rx) = test_sink();
        let mut runner = CommandRunner::new(sink);
        let spec = CommandSpec::new("sh").args(["-c", "exit 3"]);
        runner.start(&spec, Path::new("."));
        wait_until_dead(&runner);
        assert!(runner.error_detected());
    }

    #[cfg(unix)]
    #[test]
    fn test_failure_marker_sets_error_despite_clean_exit() {
        let (sink, _rx) = test_sink();
        let mut runner = CommandRunner::new(sink);
        let spec = CommandSpec::new("sh").args(["-c", "echo 'Conversion failed!'; exit 0"]);
        runner.start(&spec, Path::new("."));
        wait_until_dead(&runner);
        assert!(runner.error_detected());
    }

    #[cfg(unix)]
    #[test]
    fn test_kill_terminates_long_running_command() {
        let (sink, _rx) = test_sink();
        let mut runner = CommandRunner::new(sink);
        let spec = CommandSpec::new("sleep").arg("30");
        runner.start(&spec, Path::new("."));
        assert!(runner.is_alive());
        thread::sleep(Duration::from_millis(100));
        runner.kill();
        wait_until_dead(&runner);
        assert!(runner.error_detected());
    }

    #[test]
    fn test_missing_program_sets_error() {
        let (sink, rx) = test_sink();
        let mut runner = CommandRunner::new(sink);
        let spec = CommandSpec::new("vidforge-no-such-binary");
        runner.start(&spec, Path::new("."));
        wait_until_dead(&runner);
        assert!(runner.error_detected());
        assert!(rx.try_iter().any(|l| l.contains("failed to start command")));
    }

    #[test]
    fn test_attached_file_mirrors_lines() {
        let (sink, _rx) = test_sink();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("run.log");
        sink.attach_file(&path).unwrap();
        sink.line("first");
        sink.control("CLEAR_WINDOW:a:b".to_string());
        sink.line("second");
        sink.detach_file();
        sink.line("third");
        let contents = fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "first\nsecond\n");
    }
}
