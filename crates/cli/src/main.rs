use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use command_runner::{CommandRunner, OutputSink};
use convert::power::SystemPower;
use convert::protocol::is_clear_window_sentinel;
use convert::watch::{AlwaysAlive, ControllerWatch, PidWatch};
use convert::{ControlMsg, JobUnit, QueueWorker, StatusMsg, WorkerConfig};
use crossbeam_channel::{unbounded, Receiver};
use encoding::EncodeParams;
use std::fs::File;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::thread;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "vidforge-cli")]
#[command(about = "Vidforge - headless batch media conversion")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Convert media files through ffmpeg
    Convert {
        /// Source files, converted in the order given
        files: Vec<PathBuf>,

        /// Directory for converted files (defaults to each source's)
        #[arg(short, long)]
        output_dir: Option<PathBuf>,

        /// Output container extension
        #[arg(long, default_value = "mkv")]
        container: String,

        /// Video encoder passed to -c:v
        #[arg(long, default_value = "libx264")]
        encoder: String,

        #[arg(long, default_value = "yuv420p")]
        pix_fmt: String,

        /// Constant rate factor (ignored when --bitrate is set)
        #[arg(long, default_value_t = 28)]
        crf: u32,

        /// Target bitrate, e.g. 5000k
        #[arg(long)]
        bitrate: Option<String>,

        /// Encoder preset, e.g. medium
        #[arg(long)]
        preset: Option<String>,

        /// Two-pass encode (requires --bitrate)
        #[arg(long)]
        two_pass: bool,

        /// Start time in seconds
        #[arg(long)]
        start: Option<f64>,

        /// End time in seconds
        #[arg(long)]
        end: Option<f64>,

        /// Directory for per-run conversion logs
        #[arg(long)]
        log_dir: Option<PathBuf>,
    },

    /// Run a queue of prebuilt job units from a JSON file
    Run {
        /// JSON file holding an array of job units
        queue: PathBuf,

        #[arg(long)]
        log_dir: Option<PathBuf>,

        /// PID of the process that produced the queue; in-flight work still
        /// finishes after it exits, then the worker stops
        #[arg(long)]
        controller_pid: Option<u32>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    match cli.command {
        Commands::Convert {
            files,
            output_dir,
            container,
            encoder,
            pix_fmt,
            crf,
            bitrate,
            preset,
            two_pass,
            start,
            end,
            log_dir,
        } => {
            let opts = ConvertOpts {
                output_dir,
                container,
                encoder,
                pix_fmt,
                crf,
                bitrate,
                preset,
                two_pass,
                start,
                end,
            };
            let units = build_units(files, &opts)?;
            run_units(
                units,
                log_dir.unwrap_or_else(convert::default_log_dir),
                AlwaysAlive,
            )
        }
        Commands::Run {
            queue,
            log_dir,
            controller_pid,
        } => {
            let file = File::open(&queue)
                .with_context(|| format!("could not open queue file {}", queue.display()))?;
            let units: Vec<JobUnit> = serde_json::from_reader(file)
                .with_context(|| format!("could not parse queue file {}", queue.display()))?;
            let log_dir = log_dir.unwrap_or_else(convert::default_log_dir);
            match controller_pid {
                Some(pid) => run_units(units, log_dir, PidWatch::new(pid)),
                None => run_units(units, log_dir, AlwaysAlive),
            }
        }
    }
}

struct ConvertOpts {
    output_dir: Option<PathBuf>,
    container: String,
    encoder: String,
    pix_fmt: String,
    crf: u32,
    bitrate: Option<String>,
    preset: Option<String>,
    two_pass: bool,
    start: Option<f64>,
    end: Option<f64>,
}

fn build_units(files: Vec<PathBuf>, opts: &ConvertOpts) -> Result<Vec<JobUnit>> {
    let ffmpeg = which::which("ffmpeg")
        .context("ffmpeg not found on PATH; please install FFmpeg")?;

    let mut units = Vec::new();
    for file in files {
        if !file.exists() {
            warn!("file does not exist, skipping: {}", file.display());
            continue;
        }
        let stem = file
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("converted");
        let parent = opts
            .output_dir
            .clone()
            .or_else(|| file.parent().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("."));
        let output = parent.join(format!("{stem}_converted.{}", opts.container));

        let mut params = EncodeParams::new(&file, output, &ffmpeg);
        params.encoder = opts.encoder.clone();
        params.pix_fmt = opts.pix_fmt.clone();
        params.preset = opts.preset.clone();
        params.two_pass = opts.two_pass;
        params.start_time = opts.start;
        params.end_time = opts.end;
        if let Some(bitrate) = &opts.bitrate {
            params.bitrate = Some(bitrate.clone());
        } else {
            params.crf = Some(opts.crf);
        }

        let (specs, work_dir) = encoding::build_commands(&params)
            .with_context(|| format!("cannot build commands for {}", file.display()))?;
        let video_id = Uuid::new_v4();
        info!(video = %video_id, steps = specs.len(), "queueing {}", file.display());
        units.extend(
            specs
                .into_iter()
                .map(|spec| JobUnit::new(video_id, Uuid::new_v4(), spec, work_dir.clone())),
        );
    }
    Ok(units)
}

fn run_units<W>(units: Vec<JobUnit>, log_dir: PathBuf, watch: W) -> Result<()>
where
    W: ControllerWatch + Send + 'static,
{
    if units.is_empty() {
        bail!("nothing to convert");
    }

    let (control_tx, control_rx) = unbounded();
    let (status_tx, status_rx) = unbounded();
    let (log_tx, log_rx) = unbounded();
    let sink = OutputSink::new(log_tx);
    let runner = CommandRunner::new(sink.clone());
    let config = WorkerConfig {
        log_dir: log_dir.clone(),
        ..WorkerConfig::default()
    };
    let worker = QueueWorker::new(
        runner,
        SystemPower::new(),
        watch,
        control_rx,
        status_tx,
        sink,
        config,
    );

    let shutdown = worker.shutdown_flag();
    ctrlc::set_handler(move || shutdown.store(true, Ordering::SeqCst))
        .context("could not install interrupt handler")?;

    let handle = thread::spawn(move || worker.run());
    let _ = control_tx.send(ControlMsg::AddItems { log_dir, units });

    let outcome = drive(&status_rx, &log_rx);

    drop(control_tx);
    if handle.join().is_err() {
        bail!("conversion worker panicked");
    }

    match outcome {
        Outcome::Complete => {
            info!("all conversions complete");
            Ok(())
        }
        Outcome::Failed => bail!("conversion failed; see the conversion log for details"),
        Outcome::Interrupted => bail!("interrupted before the queue finished"),
    }
}

enum Outcome {
    Complete,
    Failed,
    Interrupted,
}

/// Pump status and log events until the queue resolves one way or another.
fn drive(status_rx: &Receiver<StatusMsg>, log_rx: &Receiver<String>) -> Outcome {
    loop {
        crossbeam_channel::select! {
            recv(status_rx) -> msg => match msg {
                Ok(StatusMsg::Running { video_id, command_id }) => {
                    info!(video = %video_id, step = %command_id, "converting");
                }
                Ok(StatusMsg::Converted { video_id, command_id }) => {
                    info!(video = %video_id, step = %command_id, "step finished");
                }
                Ok(StatusMsg::Error { video_id, .. }) => {
                    warn!(video = %video_id, "conversion failed");
                    return Outcome::Failed;
                }
                Ok(StatusMsg::Cancelled { video_id, .. }) => {
                    warn!(video = %video_id, "conversion cancelled");
                    return Outcome::Interrupted;
                }
                Ok(StatusMsg::Complete) => return Outcome::Complete,
                Ok(StatusMsg::Exit) => return Outcome::Interrupted,
                Err(_) => return Outcome::Interrupted,
            },
            recv(log_rx) -> line => {
                if let Ok(line) = line {
                    if is_clear_window_sentinel(&line) {
                        debug!("{line}");
                    } else {
                        println!("{line}");
                    }
                }
            },
        }
    }
}
