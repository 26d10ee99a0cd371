//! ffmpeg encoder for VOB title sets
//!
//! Concatenates the segments of one title set through the concat demuxer,
//! deinterlaces, and encodes to H.264/AAC in an MP4 container. Progress is
//! read from ffmpeg's `-progress pipe:1` key/value output.

use super::{EncodeError, EncodeRequest, Encoder, EncoderEvent, ProgressReport};
use crate::probe::{probe_file, MediaInfo, ProbeError};
use std::collections::VecDeque;
use std::path::Path;
use std::process::{Command, ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::Child;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use vts_batch_config::EncoderConfig;

/// Deinterlace and restart timestamps at zero.
const VIDEO_FILTER: &str = "yadif=mode=send_frame:parity=auto,setpts=PTS-STARTPTS";

/// Resample audio against the video clock so A/V stays in sync across segments.
const AUDIO_FILTER: &str = "aresample=async=1:first_pts=0";

/// Number of stderr lines kept for failure messages.
const STDERR_TAIL_LINES: usize = 8;

/// Build the ffmpeg command for one title set
///
/// Creates a Command configured with:
/// - Concat demuxer over the request's manifest, tolerant of damaged streams
/// - Machine-readable progress on stdout
/// - Deinterlacing and timestamp reset
/// - libx264 with the request's preset and CRF
/// - AAC audio at the request's bitrate
/// - Fast-start MP4 output at constant frame rate
pub fn build_ffmpeg_command(ffmpeg: &str, request: &EncodeRequest) -> Command {
    let mut cmd = Command::new(ffmpeg);

    cmd.args(["-hide_banner", "-v", "error", "-nostats"]);
    cmd.args(["-progress", "pipe:1"]);
    cmd.arg("-y");

    // Input: concat manifest, ignore decode errors and regenerate timestamps
    cmd.args(["-f", "concat", "-safe", "0"]);
    cmd.args(["-err_detect", "ignore_err"]);
    cmd.args(["-fflags", "+genpts+igndts"]);
    cmd.arg("-i").arg(&request.manifest);

    // Video
    cmd.args(["-vf", VIDEO_FILTER]);
    cmd.args(["-c:v", "libx264"]);
    cmd.arg("-preset").arg(&request.params.preset);
    cmd.arg("-crf").arg(request.params.crf.to_string());

    // Audio
    cmd.args(["-c:a", "aac"]);
    cmd.arg("-b:a").arg(&request.params.audio_bitrate);
    cmd.args(["-af", AUDIO_FILTER]);

    // Container
    cmd.args(["-movflags", "+faststart"]);
    cmd.args(["-fps_mode", "cfr"]);
    cmd.args(["-max_muxing_queue_size", "9999"]);

    if request.threads > 0 {
        cmd.arg("-threads").arg(request.threads.to_string());
    }

    cmd.arg(&request.output);
    cmd
}

/// Parses a `HH:MM:SS.micros` timestamp into seconds.
pub fn parse_timestamp(s: &str) -> Option<f64> {
    let s = s.trim();
    if s.starts_with('-') {
        return None;
    }
    let mut parts = s.splitn(3, ':');
    let hours: f64 = parts.next()?.parse().ok()?;
    let minutes: f64 = parts.next()?.parse().ok()?;
    let seconds: f64 = parts.next()?.parse().ok()?;
    let total = hours * 3600.0 + minutes * 60.0 + seconds;
    (total.is_finite() && total >= 0.0).then_some(total)
}

/// Accumulates `-progress` key/value lines into reports.
///
/// ffmpeg writes a block of `key=value` lines terminated by
/// `progress=continue` or `progress=end`; one report is produced per block.
#[derive(Debug, Default)]
pub struct ProgressParser {
    current: ProgressReport,
}

impl ProgressParser {
    /// Feeds one line; returns a report when the line closes a block.
    pub fn feed(&mut self, line: &str) -> Option<ProgressReport> {
        let (key, value) = line.trim().split_once('=')?;
        let value = value.trim();

        match key {
            // out_time_ms is microseconds too, despite its name
            "out_time_us" | "out_time_ms" => {
                if let Ok(us) = value.parse::<i64>() {
                    if us >= 0 {
                        self.current.position_secs = Some(us as f64 / 1_000_000.0);
                    }
                }
            }
            "out_time" => {
                if self.current.position_secs.is_none() {
                    self.current.position_secs = parse_timestamp(value);
                }
            }
            "fps" => self.current.fps = value.parse().ok(),
            "bitrate" => {
                self.current.bitrate_kbps = value
                    .strip_suffix("kbits/s")
                    .and_then(|v| v.trim().parse().ok());
            }
            "progress" => return Some(std::mem::take(&mut self.current)),
            _ => {}
        }
        None
    }
}

/// ffmpeg/ffprobe backed [`Encoder`].
#[derive(Debug, Clone)]
pub struct FfmpegEncoder {
    ffmpeg: String,
    ffprobe: String,
    stop_grace: Duration,
}

impl FfmpegEncoder {
    pub fn new(
        ffmpeg: impl Into<String>,
        ffprobe: impl Into<String>,
        stop_grace: Duration,
    ) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            ffprobe: ffprobe.into(),
            stop_grace,
        }
    }

    pub fn from_config(cfg: &EncoderConfig) -> Self {
        Self::new(
            cfg.ffmpeg_path.clone(),
            cfg.ffprobe_path.clone(),
            Duration::from_secs(cfg.stop_grace_secs),
        )
    }
}

impl Encoder for FfmpegEncoder {
    fn probe(&self, path: &Path) -> Result<MediaInfo, ProbeError> {
        probe_file(&self.ffprobe, path)
    }

    fn run(
        &self,
        request: EncodeRequest,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<EncoderEvent>, EncodeError> {
        let mut cmd = tokio::process::Command::from(build_ffmpeg_command(&self.ffmpeg, &request));
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(
            output = %request.output.display(),
            segments = request.segments.len(),
            "spawning ffmpeg"
        );
        let mut child = cmd.spawn()?;

        let (tx, rx) = mpsc::channel(64);
        let grace = self.stop_grace;
        tokio::spawn(async move {
            let event = supervise(&mut child, &tx, &cancel, grace).await;
            let _ = tx.send(event).await;
        });

        Ok(rx)
    }
}

/// Forwards progress until ffmpeg exits or `cancel` fires; returns the final event.
async fn supervise(
    child: &mut Child,
    tx: &mpsc::Sender<EncoderEvent>,
    cancel: &CancellationToken,
    grace: Duration,
) -> EncoderEvent {
    let stderr_tail = child.stderr.take().map(|stderr| tokio::spawn(collect_tail(stderr)));

    if let Some(stdout) = child.stdout.take() {
        let mut lines = BufReader::new(stdout).lines();
        let mut parser = ProgressParser::default();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    terminate(child, grace).await;
                    return EncoderEvent::Cancelled;
                }
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        if let Some(report) = parser.feed(&line) {
                            let _ = tx.send(EncoderEvent::Progress(report)).await;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(error = %e, "failed to read ffmpeg progress");
                        break;
                    }
                }
            }
        }
    }

    let status = tokio::select! {
        _ = cancel.cancelled() => {
            terminate(child, grace).await;
            return EncoderEvent::Cancelled;
        }
        status = child.wait() => status,
    };

    let tail = match stderr_tail {
        Some(handle) => handle.await.unwrap_or_default(),
        None => String::new(),
    };

    match status {
        Ok(status) if status.success() => EncoderEvent::Done,
        Ok(status) => EncoderEvent::Failed(describe_exit(status, &tail)),
        Err(e) => EncoderEvent::Failed(format!("failed to wait for ffmpeg: {}", e)),
    }
}

/// Asks ffmpeg to quit, then kills it if it is still running after `grace`.
async fn terminate(child: &mut Child, grace: Duration) {
    if let Some(mut stdin) = child.stdin.take() {
        // 'q' is ffmpeg's interactive quit; it finalizes the container
        if let Err(e) = stdin.write_all(b"q").await {
            debug!(error = %e, "could not send quit to ffmpeg");
        }
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(_) => debug!("ffmpeg exited after quit request"),
        Err(_) => {
            warn!(
                grace_ms = grace.as_millis() as u64,
                "ffmpeg still running after grace period, killing"
            );
            if let Err(e) = child.kill().await {
                warn!(error = %e, "failed to kill ffmpeg");
            }
        }
    }
}

async fn collect_tail<R: AsyncRead + Unpin>(reader: R) -> String {
    let mut lines = BufReader::new(reader).lines();
    let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
    while let Ok(Some(line)) = lines.next_line().await {
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
    Vec::from(tail).join("\n")
}

fn describe_exit(status: ExitStatus, stderr_tail: &str) -> String {
    let head = match status.code() {
        Some(code) => format!("ffmpeg exited with code {}", code),
        None => "ffmpeg was terminated by a signal".to_string(),
    };
    let detail = stderr_tail.trim();
    if detail.is_empty() {
        head
    } else {
        format!("{}: {}", head, detail)
    }
}
