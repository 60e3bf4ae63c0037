//! ffmpeg command assembly.
//!
//! Purely functional: a parameter set goes in, an executable command (or
//! two, for two-pass encodes) and a working directory come out. No process
//! interaction happens here.

use command_runner::CommandSpec;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

#[cfg(windows)]
const NULL_SINK: &str = "NUL";
#[cfg(not(windows))]
const NULL_SINK: &str = "/dev/null";

const HDR_TONEMAP: &str = "zscale=t=linear:npl=100,format=gbrpf32le,zscale=p=bt709,\
tonemap=tonemap=hable:desat=0,zscale=t=bt709:m=bt709:r=tv,format=yuv420p";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EncodeError {
    #[error("either crf or bitrate must be set")]
    NoRateControl,
    #[error("two-pass encoding requires a target bitrate")]
    TwoPassWithoutBitrate,
}

/// Video filter selection, assembled into a `-filter_complex` chain.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilterParams {
    pub crop: Option<String>,
    pub scale: Option<String>,
    pub scale_width: Option<i32>,
    pub scale_height: Option<i32>,
    pub scale_filter: Option<String>,
    /// 0-2 map to single transpose values, 4 is a full 180 turn.
    pub rotate: Option<u8>,
    pub vertical_flip: bool,
    pub horizontal_flip: bool,
    pub remove_hdr: bool,
    pub custom: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncodeParams {
    pub source: PathBuf,
    pub output: PathBuf,
    pub ffmpeg: PathBuf,
    pub encoder: String,
    pub pix_fmt: String,
    pub selected_track: u32,
    pub start_time: Option<f64>,
    pub end_time: Option<f64>,
    /// Seek before the input (fast) or after it (frame-accurate).
    pub fast_seek: bool,
    pub crf: Option<u32>,
    pub bitrate: Option<String>,
    pub preset: Option<String>,
    pub two_pass: bool,
    pub copy_audio: bool,
    pub video_title: Option<String>,
    pub max_muxing_queue_size: Option<u32>,
    pub remove_metadata: bool,
    pub copy_chapters: bool,
    pub filters: FilterParams,
    pub extra: Vec<String>,
}

impl EncodeParams {
    pub fn new(
        source: impl Into<PathBuf>,
        output: impl Into<PathBuf>,
        ffmpeg: impl Into<PathBuf>,
    ) -> Self {
        Self {
            source: source.into(),
            output: output.into(),
            ffmpeg: ffmpeg.into(),
            encoder: "libx264".to_string(),
            pix_fmt: "yuv420p".to_string(),
            selected_track: 0,
            start_time: None,
            end_time: None,
            fast_seek: true,
            crf: None,
            bitrate: None,
            preset: None,
            two_pass: false,
            copy_audio: true,
            video_title: None,
            max_muxing_queue_size: None,
            remove_metadata: true,
            copy_chapters: true,
            filters: FilterParams::default(),
            extra: Vec::new(),
        }
    }
}

/// Join the selected filters into a `-filter_complex` expression for the
/// chosen video track, or `None` when no filtering applies.
pub fn filter_chain(track: u32, filters: &FilterParams) -> Option<String> {
    let mut list: Vec<String> = Vec::new();
    if let Some(crop) = &filters.crop {
        list.push(format!("crop={crop}"));
    }
    let scale_filter = filters.scale_filter.as_deref().unwrap_or("lanczos");
    if let Some(scale) = &filters.scale {
        list.push(format!("scale={scale}:flags={scale_filter}"));
    } else if let Some(width) = filters.scale_width {
        list.push(format!("scale={width}:-1:flags={scale_filter}"));
    } else if let Some(height) = filters.scale_height {
        list.push(format!("scale=-1:{height}:flags={scale_filter}"));
    }
    if let Some(rotate) = filters.rotate {
        if rotate < 3 {
            list.push(format!("transpose={rotate}"));
        } else if rotate == 4 {
            list.push("transpose=2,transpose=2".to_string());
        }
    }
    if filters.vertical_flip {
        list.push("vflip".to_string());
    }
    if filters.horizontal_flip {
        list.push("hflip".to_string());
    }
    if filters.remove_hdr {
        list.push(HDR_TONEMAP.to_string());
    }
    if let Some(custom) = &filters.custom {
        list.push(custom.clone());
    }
    if list.is_empty() {
        return None;
    }
    Some(format!("[0:{track}]{}[v]", list.join(",")))
}

/// Build the job command(s) for one source video, plus the directory they
/// should run in. Two-pass parameter sets yield two sequential commands
/// sharing an encoder pass log; pass 1 writes to the null sink.
pub fn build_commands(params: &EncodeParams) -> Result<(Vec<CommandSpec>, PathBuf), EncodeError> {
    if params.crf.is_none() && params.bitrate.is_none() {
        return Err(EncodeError::NoRateControl);
    }
    let work_dir = match params.output.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };

    if !params.two_pass {
        let mut spec = base_spec(params);
        spec = rate_control(spec, params)?;
        spec = audio_args(spec, params);
        spec = ending(spec, params, params.output.to_string_lossy().as_ref());
        return Ok((vec![spec], work_dir));
    }

    let Some(bitrate) = &params.bitrate else {
        return Err(EncodeError::TwoPassWithoutBitrate);
    };
    let first = base_spec(params)
        .args(["-b:v", bitrate.as_str()])
        .args(["-pass", "1", "-an", "-f", "null"])
        .arg(NULL_SINK);
    let mut second = base_spec(params)
        .args(["-b:v", bitrate.as_str()])
        .args(["-pass", "2"]);
    second = audio_args(second, params);
    second = ending(second, params, params.output.to_string_lossy().as_ref());
    Ok((vec![first, second], work_dir))
}

fn base_spec(params: &EncodeParams) -> CommandSpec {
    let mut spec = CommandSpec::new(params.ffmpeg.to_string_lossy()).arg("-y");
    if params.fast_seek {
        spec = seek_args(spec, params);
    }
    spec = spec.arg("-i").arg(params.source.to_string_lossy());
    if !params.fast_seek {
        spec = seek_args(spec, params);
    }
    if let Some(title) = &params.video_title {
        spec = spec.arg("-metadata").arg(format!("title={title}"));
    }
    if let Some(size) = params.max_muxing_queue_size {
        spec = spec.args(["-max_muxing_queue_size".to_string(), size.to_string()]);
    }
    match filter_chain(params.selected_track, &params.filters) {
        Some(chain) => {
            spec = spec
                .arg("-filter_complex")
                .arg(chain)
                .args(["-map", "[v]"]);
        }
        None => {
            spec = spec
                .arg("-map")
                .arg(format!("0:{}", params.selected_track));
        }
    }
    spec = spec.args(["-c:v".to_string(), params.encoder.clone()]);
    spec = spec.args(["-pix_fmt".to_string(), params.pix_fmt.clone()]);
    if let Some(preset) = &params.preset {
        spec = spec.args(["-preset".to_string(), preset.clone()]);
    }
    spec
}

fn seek_args(mut spec: CommandSpec, params: &EncodeParams) -> CommandSpec {
    if let Some(start) = params.start_time {
        spec = spec.arg("-ss").arg(format!("{start}"));
    }
    if let Some(end) = params.end_time {
        spec = spec.arg("-to").arg(format!("{end}"));
    }
    spec
}

fn rate_control(spec: CommandSpec, params: &EncodeParams) -> Result<CommandSpec, EncodeError> {
    if let Some(crf) = params.crf {
        return Ok(spec.args(["-crf".to_string(), crf.to_string()]));
    }
    if let Some(bitrate) = &params.bitrate {
        return Ok(spec.args(["-b:v", bitrate.as_str()]));
    }
    Err(EncodeError::NoRateControl)
}

fn audio_args(spec: CommandSpec, params: &EncodeParams) -> CommandSpec {
    if params.copy_audio {
        spec.args(["-c:a", "copy"])
    } else {
        spec.arg("-an")
    }
}

fn ending(mut spec: CommandSpec, params: &EncodeParams, output: &str) -> CommandSpec {
    if params.remove_metadata {
        spec = spec.args(["-map_metadata", "-1"]);
    }
    if params.copy_chapters {
        spec = spec.args(["-map_chapters", "0"]);
    }
    spec = spec.args(params.extra.clone());
    spec.arg(output)
}
