//! Encoder command construction
//!
//! The [`Transcoder`] trait turns a session layout into concrete encoder
//! invocations. [`FfmpegTranscoder`] is the production implementation; tests
//! substitute scripted processes.

use std::path::PathBuf;

use crate::config::Config;
use crate::encoder::ProcessSpec;
use crate::layout::SessionLayout;

/// Builds encoder invocations for a session
pub trait Transcoder: Send + Sync + 'static {
    /// Live encoder: tails the growing ingest file and writes the live
    /// playlist plus a rolling window of segments
    fn live(&self, layout: &SessionLayout) -> ProcessSpec;

    /// Accelerated rendition: reads the ingest file and writes the timelapse
    /// playlist to the staging path
    fn timelapse(&self, layout: &SessionLayout) -> ProcessSpec;
}

/// ffmpeg-backed transcoder
#[derive(Debug, Clone)]
pub struct FfmpegTranscoder {
    pub ffmpeg_path: PathBuf,
    pub segment_seconds: u32,
    pub window_segments: u32,
    pub input_idle_timeout_secs: u64,
    pub timelapse_factor: f64,
    pub max_tempo_ratio: f64,
}

impl FfmpegTranscoder {
    pub fn from_config(config: &Config) -> Self {
        Self {
            ffmpeg_path: PathBuf::from(&config.encoder.ffmpeg_path),
            segment_seconds: config.encoder.segment_seconds,
            window_segments: config.encoder.window_segments,
            input_idle_timeout_secs: config.encoder.input_idle_timeout_secs,
            timelapse_factor: config.timelapse.factor,
            max_tempo_ratio: config.timelapse.max_tempo_ratio,
        }
    }

    fn base(&self) -> ProcessSpec {
        ProcessSpec::new(&self.ffmpeg_path).args(["-hide_banner", "-nostdin", "-loglevel", "warning"])
    }
}

impl Transcoder for FfmpegTranscoder {
    fn live(&self, layout: &SessionLayout) -> ProcessSpec {
        // -follow makes the file protocol tail the ingest file like a pipe;
        // rw_timeout (microseconds) ends the encode once ingest goes quiet
        let idle_timeout_us = self.input_idle_timeout_secs * 1_000_000;

        self.base()
            .args(["-follow", "1", "-rw_timeout"])
            .arg(idle_timeout_us.to_string())
            .arg("-i")
            .arg(layout.ingest_path().display().to_string())
            .args([
                "-c:v",
                "libx264",
                "-preset",
                "veryfast",
                "-tune",
                "zerolatency",
                "-c:a",
                "aac",
                "-b:a",
                "128k",
                "-f",
                "hls",
                "-hls_time",
            ])
            .arg(self.segment_seconds.to_string())
            .arg("-hls_list_size")
            .arg(self.window_segments.to_string())
            .args(["-hls_flags", "delete_segments+independent_segments"])
            .arg("-hls_segment_filename")
            .arg(layout.live_segment_pattern().display().to_string())
            .arg(layout.live_playlist().display().to_string())
            .current_dir(layout.dir())
    }

    fn timelapse(&self, layout: &SessionLayout) -> ProcessSpec {
        let video_filter = format!("setpts=PTS/{}", self.timelapse_factor);
        let audio_filter = atempo_chain(self.timelapse_factor, self.max_tempo_ratio)
            .iter()
            .map(|ratio| format!("atempo={}", ratio))
            .collect::<Vec<_>>()
            .join(",");

        self.base()
            .arg("-y")
            .arg("-i")
            .arg(layout.ingest_path().display().to_string())
            .arg("-filter:v")
            .arg(video_filter)
            .arg("-filter:a")
            .arg(audio_filter)
            .args([
                "-c:v",
                "libx264",
                "-preset",
                "veryfast",
                "-c:a",
                "aac",
                "-f",
                "hls",
                "-hls_time",
            ])
            .arg(self.segment_seconds.to_string())
            .args(["-hls_list_size", "0", "-hls_playlist_type", "vod"])
            .arg("-hls_segment_filename")
            .arg(layout.timelapse_segment_pattern().display().to_string())
            .arg(layout.timelapse_staging_playlist().display().to_string())
            .current_dir(layout.dir())
    }
}

/// Split a tempo factor into stages no larger than `max_ratio` whose product
/// equals `factor`
///
/// A single tempo filter cannot span the whole range, so large factors are
/// chained: 60 with a 2.0 bound becomes `[2, 2, 2, 2, 2, 1.875]`.
pub fn atempo_chain(factor: f64, max_ratio: f64) -> Vec<f64> {
    if factor <= 1.0 || max_ratio <= 1.0 {
        return vec![factor];
    }

    let mut stages = Vec::new();
    let mut remaining = factor;
    while remaining > max_ratio {
        stages.push(max_ratio);
        remaining /= max_ratio;
    }
    stages.push(remaining);
    stages
}
