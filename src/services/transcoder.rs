//! ffmpeg wrapper for single-bitrate HLS transcodes.
//!
//! Each job spawns an isolated subprocess; progress is streamed from
//! `-progress pipe:1` and forwarded to the caller as coarse percentages.
//! The child is spawned with `kill_on_drop` so a timed-out or cancelled
//! job cannot leak an encoder process.

use std::path::Path;
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{AppError, Result};

#[derive(Clone)]
pub struct HlsTranscoder {
    ffmpeg_path: String,
    ffprobe_path: String,
}

impl HlsTranscoder {
    pub fn new(ffmpeg_path: String, ffprobe_path: String) -> Self {
        Self {
            ffmpeg_path,
            ffprobe_path,
        }
    }

    /// Source duration in milliseconds, or None when ffprobe is unavailable
    /// or the container is unreadable (progress reporting degrades, the
    /// transcode itself still runs).
    pub async fn probe_duration_ms(&self, input: &Path) -> Option<u64> {
        let output = Command::new(&self.ffprobe_path)
            .args([
                "-v",
                "error",
                "-show_entries",
                "format=duration",
                "-of",
                "default=nk=1:nw=1",
            ])
            .arg(input)
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .output()
            .await
            .ok()?;

        if !output.status.success() {
            return None;
        }

        let duration_secs = String::from_utf8_lossy(&output.stdout)
            .trim()
            .parse::<f64>()
            .ok()?;
        Some((duration_secs * 1000.0) as u64)
    }

    /// Segment and transcode `input` into `out_dir/playlist.m3u8` plus
    /// `segment_NNN.ts` files at the given bitrate. Percentages (0-99) are
    /// sent on `progress_tx` as the encoder advances.
    pub async fn transcode_to_hls(
        &self,
        input: &Path,
        out_dir: &Path,
        bitrate: u32,
        segment_duration: u32,
        total_duration_ms: Option<u64>,
        progress_tx: mpsc::UnboundedSender<u8>,
    ) -> Result<()> {
        tokio::fs::create_dir_all(out_dir)
            .await
            .map_err(|e| AppError::Storage(format!("create {:?}: {}", out_dir, e)))?;

        let args = hls_args(input, out_dir, bitrate, segment_duration);
        debug!("Spawning {} {}", self.ffmpeg_path, args.join(" "));

        let mut child = Command::new(&self.ffmpeg_path)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| AppError::Encoder(format!("spawn {}: {}", self.ffmpeg_path, e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AppError::Encoder("ffmpeg stdout unavailable".to_string()))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| AppError::Encoder("ffmpeg stderr unavailable".to_string()))?;

        // Drain stderr concurrently so a chatty encoder can't deadlock on a
        // full pipe; the tail doubles as the failure message.
        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            let _ = stderr.read_to_string(&mut buf).await;
            buf
        });

        let mut lines = BufReader::new(stdout).lines();
        let mut last_percent: u8 = 0;
        while let Some(line) = lines
            .next_line()
            .await
            .map_err(|e| AppError::Encoder(format!("read ffmpeg progress: {}", e)))?
        {
            if let Some(percent) = parse_progress_percent(&line, total_duration_ms) {
                if percent != last_percent {
                    last_percent = percent;
                    let _ = progress_tx.send(percent);
                }
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|e| AppError::Encoder(format!("wait for ffmpeg: {}", e)))?;
        let stderr_text = stderr_task.await.unwrap_or_default();

        if !status.success() {
            let detail = stderr_tail(&stderr_text);
            warn!("ffmpeg exited with {}: {}", status, detail);
            return Err(AppError::Encoder(format!(
                "ffmpeg exited with {}: {}",
                status, detail
            )));
        }

        Ok(())
    }
}

/// Argument list for an audio-only HLS transcode: AAC, stereo, 44100 Hz,
/// unbounded playlist with independent segments.
fn hls_args(input: &Path, out_dir: &Path, bitrate: u32, segment_duration: u32) -> Vec<String> {
    vec![
        "-hide_banner".to_string(),
        "-loglevel".to_string(),
        "error".to_string(),
        "-i".to_string(),
        input.to_string_lossy().into_owned(),
        "-vn".to_string(),
        "-c:a".to_string(),
        "aac".to_string(),
        "-b:a".to_string(),
        format!("{}k", bitrate),
        "-ac".to_string(),
        "2".to_string(),
        "-ar".to_string(),
        "44100".to_string(),
        "-f".to_string(),
        "hls".to_string(),
        "-hls_time".to_string(),
        segment_duration.to_string(),
        "-hls_list_size".to_string(),
        "0".to_string(),
        "-hls_segment_filename".to_string(),
        out_dir.join("segment_%03d.ts").to_string_lossy().into_owned(),
        "-hls_flags".to_string(),
        "independent_segments".to_string(),
        "-progress".to_string(),
        "pipe:1".to_string(),
        "-nostats".to_string(),
        "-y".to_string(),
        out_dir.join("playlist.m3u8").to_string_lossy().into_owned(),
    ]
}

/// Turn one `-progress` line into a percentage, capped at 99 so only a
/// clean exit reports completion.
fn parse_progress_percent(line: &str, total_duration_ms: Option<u64>) -> Option<u8> {
    let out_time_ms: u64 = line.strip_prefix("out_time_ms=")?.trim().parse().ok()?;
    let total = total_duration_ms.filter(|t| *t > 0)?;
    // out_time_ms is actually microseconds despite the name.
    let elapsed_ms = out_time_ms / 1000;
    Some((((elapsed_ms as f64 / total as f64) * 100.0).round() as u64).min(99) as u8)
}

fn stderr_tail(stderr: &str) -> String {
    const MAX: usize = 500;
    let trimmed = stderr.trim();
    if trimmed.len() <= MAX {
        trimmed.to_string()
    } else {
        trimmed[trimmed.len() - MAX..].to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn hls_args_carry_the_audio_profile() {
        let args = hls_args(
            &PathBuf::from("/tmp/in.mp3"),
            &PathBuf::from("/tmp/out"),
            128,
            10,
        );
        let joined = args.join(" ");
        assert!(joined.contains("-c:a aac"));
        assert!(joined.contains("-b:a 128k"));
        assert!(joined.contains("-ac 2"));
        assert!(joined.contains("-ar 44100"));
        assert!(joined.contains("-hls_time 10"));
        assert!(joined.contains("-hls_list_size 0"));
        assert!(joined.contains("-hls_flags independent_segments"));
        assert!(joined.contains("segment_%03d.ts"));
        assert!(args.last().unwrap().ends_with("playlist.m3u8"));
    }

    #[test]
    fn progress_is_scaled_against_total_duration() {
        // 30s of 60s, reported in microseconds.
        assert_eq!(
            parse_progress_percent("out_time_ms=30000000", Some(60_000)),
            Some(50)
        );
    }

    #[test]
    fn progress_caps_at_ninety_nine() {
        assert_eq!(
            parse_progress_percent("out_time_ms=999000000", Some(60_000)),
            Some(99)
        );
    }

    #[test]
    fn progress_ignores_unrelated_lines_and_unknown_duration() {
        assert_eq!(parse_progress_percent("frame=42", Some(60_000)), None);
        assert_eq!(parse_progress_percent("out_time_ms=1000000", None), None);
        assert_eq!(parse_progress_percent("out_time_ms=1000000", Some(0)), None);
    }
}
