//! Still image extraction and HLS packaging.
//!
//! A [`Transcoder`] turns one committed source file into a JPEG still and an
//! HLS VOD rendition (`hls/index.m3u8` plus `hls/segNNNNN.ts`) inside the
//! asset's output directory. The server only talks to the trait, so tests can
//! swap in a fake.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rv_core::config::TranscodeConfig;
use tokio_util::sync::CancellationToken;

use crate::command::ToolCommand;
use crate::probe::probe_duration;
use crate::tools::ToolRegistry;

/// File name of the still image inside the output directory.
pub const STILL_FILE: &str = "still.jpg";
/// Directory holding the HLS rendition inside the output directory.
pub const HLS_DIR: &str = "hls";
/// Manifest file name inside [`HLS_DIR`].
pub const MANIFEST_FILE: &str = "index.m3u8";

/// Receives progress as a fraction in `0.0..=1.0`.
pub type ProgressSink = Box<dyn FnMut(f64) + Send>;

#[derive(Debug, Clone)]
pub struct TranscodeRequest {
    /// Committed source artifact.
    pub input: PathBuf,
    /// Directory that receives the still and the `hls/` tree.
    pub output_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct TranscodeOutput {
    pub still_path: PathBuf,
    pub manifest_path: PathBuf,
    /// Container duration, if ffprobe reported one.
    pub duration_secs: Option<f64>,
}

/// Produces derived playback artifacts for a source file.
#[async_trait]
pub trait Transcoder: Send + Sync {
    /// Run a full transcode. Must stop the external process promptly when
    /// `cancel` fires.
    async fn transcode(
        &self,
        request: &TranscodeRequest,
        progress: ProgressSink,
        cancel: CancellationToken,
    ) -> rv_core::Result<TranscodeOutput>;
}

/// [`Transcoder`] backed by the ffmpeg and ffprobe executables.
#[derive(Debug, Clone)]
pub struct FfmpegTranscoder {
    tools: Arc<ToolRegistry>,
    config: TranscodeConfig,
}

impl FfmpegTranscoder {
    pub fn new(tools: Arc<ToolRegistry>, config: TranscodeConfig) -> Self {
        Self { tools, config }
    }

    /// Seek position for the still: the configured offset, pulled back to
    /// the midpoint for sources shorter than twice the offset.
    fn still_offset(&self, duration: Option<f64>) -> f64 {
        let offset = self.config.still_offset_secs.max(0.0);
        match duration {
            Some(d) if d > 0.0 => offset.min(d / 2.0),
            _ => offset,
        }
    }

    fn still_args(&self, input: &Path, output: &Path, offset: f64) -> Vec<String> {
        vec![
            "-y".into(),
            "-v".into(),
            "error".into(),
            "-ss".into(),
            format!("{offset:.3}"),
            "-i".into(),
            input.to_string_lossy().into_owned(),
            "-frames:v".into(),
            "1".into(),
            "-q:v".into(),
            "2".into(),
            output.to_string_lossy().into_owned(),
        ]
    }

    fn hls_args(&self, input: &Path, hls_dir: &Path) -> Vec<String> {
        let segment = self.config.segment_duration_secs.max(1);
        let mut args: Vec<String> = vec![
            "-y".into(),
            "-progress".into(),
            "pipe:2".into(),
            "-nostats".into(),
            "-i".into(),
            input.to_string_lossy().into_owned(),
            "-map".into(),
            "0:v:0".into(),
            "-map".into(),
            "0:a:0?".into(),
            "-c:v".into(),
            "libx264".into(),
            "-crf".into(),
            self.config.video_crf.to_string(),
            "-preset".into(),
            self.config.video_preset.clone(),
            "-pix_fmt".into(),
            "yuv420p".into(),
            "-force_key_frames".into(),
            format!("expr:gte(t,n_forced*{segment})"),
            "-c:a".into(),
            "aac".into(),
            "-b:a".into(),
            self.config.audio_bitrate.clone(),
            "-ac".into(),
            "2".into(),
        ];
        args.extend([
            "-f".into(),
            "hls".into(),
            "-hls_time".into(),
            segment.to_string(),
            "-hls_playlist_type".into(),
            "vod".into(),
            "-hls_segment_filename".into(),
            hls_dir.join("seg%05d.ts").to_string_lossy().into_owned(),
            hls_dir.join(MANIFEST_FILE).to_string_lossy().into_owned(),
        ]);
        args
    }
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn transcode(
        &self,
        request: &TranscodeRequest,
        mut progress: ProgressSink,
        cancel: CancellationToken,
    ) -> rv_core::Result<TranscodeOutput> {
        let ffmpeg = self.tools.require("ffmpeg")?;

        let duration = probe_duration(&self.tools, &request.input).await?;
        if cancel.is_cancelled() {
            return Err(rv_core::Error::tool("ffmpeg", "cancelled"));
        }

        // A previous attempt may have left partial segments behind.
        let hls_dir = request.output_dir.join(HLS_DIR);
        match tokio::fs::remove_dir_all(&hls_dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        tokio::fs::create_dir_all(&hls_dir).await?;

        let still_path = request.output_dir.join(STILL_FILE);
        let offset = self.still_offset(duration);
        tracing::debug!(
            "Extracting still from {:?} at {offset:.3}s",
            request.input
        );
        ToolCommand::new(ffmpeg.path.clone())
            .timeout(Duration::from_secs(120))
            .args(self.still_args(&request.input, &still_path, offset))
            .execute_with_stderr_callback(|_| {}, Some(cancel.clone()))
            .await?;

        tracing::info!(
            "HLS transcode: {:?} -> {:?} (crf={}, preset={}, segment={}s)",
            request.input,
            hls_dir,
            self.config.video_crf,
            self.config.video_preset,
            self.config.segment_duration_secs,
        );

        let mut parser = ProgressParser::new(duration);
        ToolCommand::new(ffmpeg.path.clone())
            .timeout(Duration::from_secs(self.config.timeout_secs.max(1)))
            .args(self.hls_args(&request.input, &hls_dir))
            .execute_with_stderr_callback(
                |line| {
                    if let Some(fraction) = parser.feed(line) {
                        progress(fraction);
                    }
                },
                Some(cancel),
            )
            .await?;

        let manifest_path = hls_dir.join(MANIFEST_FILE);
        if !tokio::fs::try_exists(&manifest_path).await? {
            return Err(rv_core::Error::Transcode(format!(
                "ffmpeg exited successfully but wrote no manifest at {}",
                manifest_path.display()
            )));
        }

        Ok(TranscodeOutput {
            still_path,
            manifest_path,
            duration_secs: duration,
        })
    }
}

/// Incremental parser for ffmpeg `-progress` blocks.
///
/// Each block ends with a `progress=continue` or `progress=end` line; that is
/// where a fraction is emitted. Reported values never decrease.
#[derive(Debug, Clone)]
pub struct ProgressParser {
    duration_secs: Option<f64>,
    out_time_us: Option<i64>,
    last: f64,
}

impl ProgressParser {
    pub fn new(duration_secs: Option<f64>) -> Self {
        Self {
            duration_secs: duration_secs.filter(|d| *d > 0.0),
            out_time_us: None,
            last: 0.0,
        }
    }

    /// Feed one stderr line; returns a fraction at the end of each block.
    pub fn feed(&mut self, line: &str) -> Option<f64> {
        let line = line.trim();
        if let Some(val) = line.strip_prefix("out_time_us=") {
            self.out_time_us = val.parse::<i64>().ok();
            return None;
        }

        let state = line.strip_prefix("progress=")?;
        let fraction = if state == "end" {
            1.0
        } else {
            let (us, dur) = (self.out_time_us?, self.duration_secs?);
            (us.max(0) as f64 / 1_000_000.0 / dur).clamp(0.0, 1.0)
        };

        self.last = self.last.max(fraction);
        Some(self.last)
    }
}
