//! Automatic server-side recording.
//!
//! Trigger policy: a recording starts when a second peer begins producing
//! in a room that is not yet being recorded, and stops when the room falls
//! below two peers. Every producer present at start gets an RTP tap — a
//! plain transport looped back to a local UDP port — and an SDP file that
//! describes the stream to the muxer. The muxer is a supervised ffmpeg
//! child fed by those taps; producers that appear later are not added to
//! the ongoing mix.

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use mediasoup::plain_transport::{
    PlainTransport, PlainTransportOptions, PlainTransportRemoteParameters,
};
use mediasoup::prelude::*;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use rand::Rng;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::time::{timeout, Duration};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::models::NewRecording;
use crate::sfu::MediaRoom;
use crate::store::{self, DbPool};

const TAP_PORT_MIN: u16 = 20000;
const TAP_PORT_MAX: u16 = 29000;

/// Time given to the muxer to bind its UDP sockets before the taps are
/// resumed. Resuming earlier drops the initial packets.
const MUXER_BIND_DELAY: Duration = Duration::from_secs(1);
/// Time allowed for a graceful flush after writing `q`.
const MUXER_QUIT_TIMEOUT: Duration = Duration::from_secs(2);
/// Time allowed after SIGTERM before escalating to SIGKILL.
const MUXER_TERM_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum RecordingError {
    #[error("no taps could be created")]
    NoTaps,
    #[error("failed to spawn muxer: {0}")]
    Spawn(std::io::Error),
    #[error("media error: {0}")]
    Media(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// In-memory recording state
// ---------------------------------------------------------------------------

/// One producer's path into the muxer: a loopback plain transport, a paused
/// consumer, and the SDP file describing the stream.
pub struct RtpTap {
    pub transport: PlainTransport,
    pub consumer: Consumer,
    pub kind: MediaKind,
    pub peer_id: String,
    pub udp_port: u16,
    pub sdp_path: PathBuf,
}

/// The live recording of a media room. Held in the room's recording slot;
/// the recording is ongoing while the muxer child is alive.
pub struct Recording {
    pub id: String,
    pub room_id: String,
    pub started_at: DateTime<Utc>,
    pub start_instant: Instant,
    pub output_path: PathBuf,
    pub has_video: bool,
    pub muxer: Child,
    pub taps: Vec<RtpTap>,
}

// ---------------------------------------------------------------------------
// Policy (pure)
// ---------------------------------------------------------------------------

/// Start iff ≥2 peers are publishing and no recording exists.
pub fn should_start(peers_with_producers: usize, already_recording: bool) -> bool {
    !already_recording && peers_with_producers >= 2
}

/// Stop iff a recording exists and fewer than 2 peers remain.
pub fn should_stop(peer_count: usize, recording: bool) -> bool {
    recording && peer_count < 2
}

fn output_path(dir: &Path, id: &str, has_video: bool) -> PathBuf {
    let ext = if has_video { "mp4" } else { "mp3" };
    dir.join(format!("{id}.{ext}"))
}

/// Draw a tap port from the random window, resampling against ports already
/// allocated to this recording so no two live taps share one.
fn pick_tap_port(used: &[u16]) -> u16 {
    loop {
        let port = rand::thread_rng().gen_range(TAP_PORT_MIN..TAP_PORT_MAX);
        if !used.contains(&port) {
            return port;
        }
    }
}

// ---------------------------------------------------------------------------
// SDP + muxer command assembly (pure)
// ---------------------------------------------------------------------------

/// Render the single-stream SDP the muxer reads for one tap. The codec
/// description comes from the tap consumer's negotiated parameters.
fn build_sdp(
    kind: MediaKind,
    port: u16,
    encoding: &str,
    payload_type: u64,
    clock_rate: u64,
    channels: Option<u64>,
) -> String {
    let media = match kind {
        MediaKind::Audio => "audio",
        MediaKind::Video => "video",
    };
    let rtpmap = match channels {
        Some(channels) => format!("{encoding}/{clock_rate}/{channels}"),
        None => format!("{encoding}/{clock_rate}"),
    };
    format!(
        "v=0\r\n\
         o=- 0 0 IN IP4 127.0.0.1\r\n\
         s=mediasoup\r\n\
         c=IN IP4 127.0.0.1\r\n\
         t=0 0\r\n\
         m={media} {port} RTP/AVP {payload_type}\r\n\
         a=rtpmap:{payload_type} {rtpmap}\r\n\
         a=sendonly\r\n"
    )
}

/// The filter graph joining the taps: audio mixed (or copied) into `[aout]`,
/// video stacked (or copied) into `[vout]`. Audio inputs come first on the
/// muxer command line, so video input labels start at `n_audio`.
fn build_filter_graph(n_audio: usize, n_video: usize) -> String {
    let mut parts: Vec<String> = Vec::new();

    if n_audio > 1 {
        let inputs: String = (0..n_audio).map(|i| format!("[{i}:a]")).collect();
        parts.push(format!("{inputs}amix=inputs={n_audio}:duration=longest[aout]"));
    } else if n_audio == 1 {
        parts.push("[0:a]acopy[aout]".to_string());
    }

    if n_video >= 2 {
        parts.push(format!("[{}:v][{}:v]hstack=inputs=2[vout]", n_audio, n_audio + 1));
    } else if n_video == 1 {
        parts.push(format!("[{n_audio}:v]copy[vout]"));
    }

    parts.join(";")
}

/// Full muxer argument list: `-y`, protocol whitelist, probing flags, the
/// SDP inputs (audio first), the filter graph, encoders, output path.
fn build_muxer_args(
    audio_sdps: &[PathBuf],
    video_sdps: &[PathBuf],
    has_video: bool,
    output: &Path,
) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-y".into(),
        "-protocol_whitelist".into(),
        "file,udp,rtp".into(),
        "-analyzeduration".into(),
        "10M".into(),
        "-probesize".into(),
        "10M".into(),
        "-fflags".into(),
        "+genpts+discardcorrupt".into(),
    ];

    for sdp in audio_sdps {
        args.push("-i".into());
        args.push(sdp.to_string_lossy().into_owned());
    }
    if has_video {
        for sdp in video_sdps {
            args.push("-i".into());
            args.push(sdp.to_string_lossy().into_owned());
        }
    }

    let graph = build_filter_graph(audio_sdps.len(), if has_video { video_sdps.len() } else { 0 });
    if !graph.is_empty() {
        args.push("-filter_complex".into());
        args.push(graph);
    }

    if !audio_sdps.is_empty() {
        args.push("-map".into());
        args.push("[aout]".into());
        args.push("-c:a".into());
        args.push(if has_video { "aac".into() } else { "libmp3lame".into() });
        args.push("-b:a".into());
        args.push("192k".into());
    }

    if has_video && !video_sdps.is_empty() {
        args.push("-map".into());
        args.push("[vout]".into());
        args.push("-c:v".into());
        args.push("libx264".into());
        args.push("-preset".into());
        args.push("fast".into());
        args.push("-crf".into());
        args.push("23".into());
    }

    args.push(output.to_string_lossy().into_owned());
    args
}

// ---------------------------------------------------------------------------
// RecordingManager
// ---------------------------------------------------------------------------

pub struct RecordingManager {
    recordings_dir: PathBuf,
    ffmpeg_bin: String,
    db: DbPool,
}

impl RecordingManager {
    pub fn new(recordings_dir: impl Into<PathBuf>, ffmpeg_bin: impl Into<String>, db: DbPool) -> Self {
        Self {
            recordings_dir: recordings_dir.into(),
            ffmpeg_bin: ffmpeg_bin.into(),
            db,
        }
    }

    /// Trigger check, run after every producer creation. Holding the room's
    /// recording lock serializes this against concurrent stop checks.
    pub async fn maybe_start(&self, room: &Arc<MediaRoom>) {
        let mut slot = room.recording.lock().await;
        if !should_start(room.peers_with_producers(), slot.is_some()) {
            return;
        }
        match self.start(room).await {
            Ok(recording) => {
                info!(
                    room_id = %room.room_id,
                    recording_id = %recording.id,
                    output = %recording.output_path.display(),
                    taps = recording.taps.len(),
                    "recording started"
                );
                *slot = Some(recording);
            }
            Err(e) => {
                warn!(room_id = %room.room_id, error = %e, "failed to start recording");
            }
        }
    }

    /// Stop check, run after every peer removal.
    pub async fn maybe_stop(&self, room: &Arc<MediaRoom>) {
        let mut slot = room.recording.lock().await;
        if !should_stop(room.peer_count(), slot.is_some()) {
            return;
        }
        if let Some(recording) = slot.take() {
            self.finish(recording).await;
        }
    }

    /// Stop unconditionally (room teardown path).
    pub async fn stop_if_active(&self, room: &Arc<MediaRoom>) {
        let mut slot = room.recording.lock().await;
        if let Some(recording) = slot.take() {
            self.finish(recording).await;
        }
    }

    // ── Start ───────────────────────────────────────────────────────────

    async fn start(&self, room: &Arc<MediaRoom>) -> Result<Recording, RecordingError> {
        tokio::fs::create_dir_all(&self.recordings_dir).await?;

        let epoch_ms = Utc::now().timestamp_millis();
        let id = format!("{}_{epoch_ms}", room.room_id);

        // Snapshot taken atomically at start: producers appearing later are
        // not part of this mix.
        let sources = room.producer_snapshot();
        let has_video = sources.iter().any(|(p, _)| p.kind() == MediaKind::Video);
        let output = output_path(&self.recordings_dir, &id, has_video);

        let mut taps: Vec<RtpTap> = Vec::with_capacity(sources.len());
        let mut used_ports: Vec<u16> = Vec::with_capacity(sources.len());
        for (index, (producer, peer_id)) in sources.into_iter().enumerate() {
            let port = pick_tap_port(&used_ports);
            match self.create_tap(room, &producer, &peer_id, port, &id, index).await {
                Ok(tap) => {
                    debug!(
                        room_id = %room.room_id,
                        port = tap.udp_port,
                        kind = crate::sfu::kind_str(tap.kind),
                        "RTP tap ready"
                    );
                    used_ports.push(port);
                    taps.push(tap);
                }
                Err(e) => {
                    // One bad tap does not sink the recording.
                    warn!(
                        room_id = %room.room_id,
                        producer_id = %producer.id(),
                        error = %e,
                        "skipping RTP tap"
                    );
                }
            }
        }
        if taps.is_empty() {
            return Err(RecordingError::NoTaps);
        }

        let audio_sdps: Vec<PathBuf> = taps
            .iter()
            .filter(|t| t.kind == MediaKind::Audio)
            .map(|t| t.sdp_path.clone())
            .collect();
        let video_sdps: Vec<PathBuf> = taps
            .iter()
            .filter(|t| t.kind == MediaKind::Video)
            .map(|t| t.sdp_path.clone())
            .collect();

        let args = build_muxer_args(&audio_sdps, &video_sdps, has_video, &output);
        debug!(room_id = %room.room_id, ?args, "spawning muxer");

        let mut muxer = match Command::new(&self.ffmpeg_bin)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                self.discard_taps(taps).await;
                return Err(RecordingError::Spawn(e));
            }
        };

        if let Some(stderr) = muxer.stderr.take() {
            let id = id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(recording_id = %id, "muxer: {line}");
                }
            });
        }

        // Let the muxer bind its sockets, then open the taps in order.
        // Resuming before the bind drops the first packets of every stream.
        tokio::time::sleep(MUXER_BIND_DELAY).await;
        for tap in &taps {
            if let Err(e) = tap.consumer.resume().await {
                warn!(
                    recording_id = %id,
                    peer_id = %tap.peer_id,
                    error = %e,
                    "failed to resume tap consumer"
                );
            }
        }

        Ok(Recording {
            id,
            room_id: room.room_id.clone(),
            started_at: Utc::now(),
            start_instant: Instant::now(),
            output_path: output,
            has_video,
            muxer,
            taps,
        })
    }

    async fn create_tap(
        &self,
        room: &MediaRoom,
        producer: &Producer,
        peer_id: &str,
        port: u16,
        recording_id: &str,
        index: usize,
    ) -> Result<RtpTap, RecordingError> {
        let listen_info = ListenInfo {
            protocol: Protocol::Udp,
            ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            announced_address: None,
            port: None,
            port_range: None,
            flags: None,
            send_buffer_size: None,
            recv_buffer_size: None,
            expose_internal_ip: false,
        };
        let mut transport_options = PlainTransportOptions::new(listen_info);
        transport_options.rtcp_mux = true;
        transport_options.comedia = false;

        let transport = room
            .router
            .create_plain_transport(transport_options)
            .await
            .map_err(|e| RecordingError::Media(format!("plain transport: {e}")))?;

        transport
            .connect(PlainTransportRemoteParameters {
                ip: Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
                port: Some(port),
                rtcp_port: None,
                srtp_parameters: None,
            })
            .await
            .map_err(|e| RecordingError::Media(format!("plain transport connect: {e}")))?;

        // The router's own capabilities consume everything it can route.
        let rtp_capabilities: RtpCapabilities = serde_json::to_value(room.router.rtp_capabilities())
            .and_then(serde_json::from_value)
            .map_err(|e| RecordingError::Media(format!("capabilities: {e}")))?;

        let mut consumer_options = ConsumerOptions::new(producer.id(), rtp_capabilities);
        consumer_options.paused = true;
        let consumer = transport
            .consume(consumer_options)
            .await
            .map_err(|e| RecordingError::Media(format!("tap consumer: {e}")))?;

        let kind = consumer.kind();
        let codec = serde_json::to_value(consumer.rtp_parameters())
            .map_err(|e| RecordingError::Media(format!("rtp parameters: {e}")))?;
        let codec = codec
            .get("codecs")
            .and_then(|c| c.get(0))
            .cloned()
            .ok_or_else(|| RecordingError::Media("tap consumer has no codec".into()))?;

        let encoding = codec
            .get("mimeType")
            .and_then(|v| v.as_str())
            .and_then(|m| m.split('/').nth(1))
            .ok_or_else(|| RecordingError::Media("codec has no mime type".into()))?
            .to_string();
        let payload_type = codec
            .get("payloadType")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| RecordingError::Media("codec has no payload type".into()))?;
        let clock_rate = codec
            .get("clockRate")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| RecordingError::Media("codec has no clock rate".into()))?;
        let channels = codec.get("channels").and_then(|v| v.as_u64());

        let sdp = build_sdp(kind, port, &encoding, payload_type, clock_rate, channels);
        let sdp_path = self.recordings_dir.join(format!("{recording_id}_{index}.sdp"));
        tokio::fs::write(&sdp_path, sdp).await?;

        Ok(RtpTap {
            transport,
            consumer,
            kind,
            peer_id: peer_id.to_string(),
            udp_port: port,
            sdp_path,
        })
    }

    // ── Stop ────────────────────────────────────────────────────────────

    /// Shut the muxer down, tear down the taps, remove the SDP files and
    /// persist the artifact. Every exit path of a recording funnels here.
    async fn finish(&self, mut recording: Recording) {
        let duration_secs = recording.start_instant.elapsed().as_secs() as i64;

        shutdown_muxer(&mut recording.muxer, &recording.id).await;

        for tap in recording.taps.drain(..) {
            // Consumer before transport.
            drop(tap.consumer);
            drop(tap.transport);
            if let Err(e) = tokio::fs::remove_file(&tap.sdp_path).await {
                warn!(path = %tap.sdp_path.display(), error = %e, "failed to remove SDP file");
            }
        }

        info!(
            recording_id = %recording.id,
            output = %recording.output_path.display(),
            duration_secs,
            "recording stopped"
        );

        self.persist(&recording, duration_secs);
    }

    fn persist(&self, recording: &Recording, duration_secs: i64) {
        let Ok(mut conn) = self.db.get() else {
            warn!(recording_id = %recording.id, "no database connection to persist recording");
            return;
        };
        let call_id = Uuid::from_str(&recording.room_id)
            .ok()
            .and_then(|room_id| store::latest_call_for_room(&mut conn, room_id).ok().flatten())
            .map(|call| call.id);

        let room_id = match Uuid::from_str(&recording.room_id) {
            Ok(id) => id,
            Err(_) => {
                warn!(recording_id = %recording.id, "room id is not durable, skipping persistence");
                return;
            }
        };

        let row = NewRecording {
            id: recording.id.clone(),
            call_id,
            room_id,
            file_path: recording.output_path.to_string_lossy().into_owned(),
            has_video: recording.has_video,
            duration_secs,
            started_at: recording.started_at,
            ended_at: Utc::now(),
        };
        if let Err(e) = store::insert_recording(&mut conn, row) {
            warn!(recording_id = %recording.id, error = %e, "failed to persist recording");
        }
    }

    async fn discard_taps(&self, taps: Vec<RtpTap>) {
        for tap in taps {
            drop(tap.consumer);
            drop(tap.transport);
            let _ = tokio::fs::remove_file(&tap.sdp_path).await;
        }
    }
}

/// Graceful muxer shutdown: `q` on stdin for a clean flush, SIGTERM after a
/// grace period, SIGKILL as the last resort.
async fn shutdown_muxer(muxer: &mut Child, recording_id: &str) {
    if let Some(mut stdin) = muxer.stdin.take() {
        let _ = stdin.write_all(b"q").await;
        let _ = stdin.flush().await;
    }
    if timeout(MUXER_QUIT_TIMEOUT, muxer.wait()).await.is_ok() {
        return;
    }

    if let Some(pid) = muxer.id() {
        debug!(recording_id, "muxer ignored quit, sending SIGTERM");
        let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        if timeout(MUXER_TERM_TIMEOUT, muxer.wait()).await.is_ok() {
            return;
        }
    }

    warn!(recording_id, "muxer ignored SIGTERM, killing");
    let _ = muxer.kill().await;
    let _ = muxer.wait().await;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trigger_policy_truth_table() {
        // No recording yet: starts exactly at two publishing peers.
        assert!(!should_start(0, false));
        assert!(!should_start(1, false));
        assert!(should_start(2, false));
        assert!(should_start(3, false));
        // Already recording: late producers never restart.
        assert!(!should_start(2, true));
        assert!(!should_start(5, true));

        // Stop only fires while recording.
        assert!(should_stop(1, true));
        assert!(should_stop(0, true));
        assert!(!should_stop(2, true));
        assert!(!should_stop(1, false));
    }

    #[test]
    fn output_extension_tracks_video() {
        let dir = Path::new("/tmp/recordings");
        assert_eq!(
            output_path(dir, "r1_123", false),
            PathBuf::from("/tmp/recordings/r1_123.mp3")
        );
        assert_eq!(
            output_path(dir, "r1_123", true),
            PathBuf::from("/tmp/recordings/r1_123.mp4")
        );
    }

    #[test]
    fn tap_ports_stay_in_window_and_unique() {
        let mut used = Vec::new();
        for _ in 0..50 {
            let port = pick_tap_port(&used);
            assert!((TAP_PORT_MIN..TAP_PORT_MAX).contains(&port));
            assert!(!used.contains(&port));
            used.push(port);
        }
    }

    #[test]
    fn sdp_for_opus() {
        let sdp = build_sdp(MediaKind::Audio, 20100, "opus", 100, 48000, Some(2));
        assert!(sdp.contains("m=audio 20100 RTP/AVP 100"));
        assert!(sdp.contains("a=rtpmap:100 opus/48000/2"));
        assert!(sdp.contains("c=IN IP4 127.0.0.1"));
    }

    #[test]
    fn sdp_for_vp8_has_no_channels() {
        let sdp = build_sdp(MediaKind::Video, 20200, "VP8", 101, 90000, None);
        assert!(sdp.contains("m=video 20200 RTP/AVP 101"));
        assert!(sdp.contains("a=rtpmap:101 VP8/90000\r\n"));
    }

    #[test]
    fn filter_graph_two_peers_audio_only() {
        let graph = build_filter_graph(2, 0);
        assert_eq!(graph, "[0:a][1:a]amix=inputs=2:duration=longest[aout]");
    }

    #[test]
    fn filter_graph_single_audio_copies() {
        assert_eq!(build_filter_graph(1, 0), "[0:a]acopy[aout]");
    }

    #[test]
    fn filter_graph_two_videos_stacks() {
        let graph = build_filter_graph(2, 2);
        assert!(graph.contains("amix=inputs=2"));
        assert!(graph.contains("[2:v][3:v]hstack=inputs=2[vout]"));
    }

    #[test]
    fn filter_graph_single_video_copies() {
        let graph = build_filter_graph(1, 1);
        assert!(graph.contains("[1:v]copy[vout]"));
    }

    #[test]
    fn muxer_args_audio_only_mp3() {
        let audio = vec![PathBuf::from("/r/a0.sdp"), PathBuf::from("/r/a1.sdp")];
        let args = build_muxer_args(&audio, &[], false, Path::new("/r/out.mp3"));

        assert_eq!(args[0], "-y");
        assert!(args.windows(2).any(|w| w == ["-protocol_whitelist", "file,udp,rtp"]));
        assert!(args.windows(2).any(|w| w == ["-fflags", "+genpts+discardcorrupt"]));
        assert_eq!(args.iter().filter(|a| *a == "-i").count(), 2);
        assert!(args.windows(2).any(|w| w == ["-c:a", "libmp3lame"]));
        assert!(!args.iter().any(|a| a == "-c:v"));
        assert_eq!(args.last().map(String::as_str), Some("/r/out.mp3"));
    }

    #[test]
    fn muxer_args_audio_video_mp4() {
        let audio = vec![PathBuf::from("/r/a0.sdp"), PathBuf::from("/r/a1.sdp")];
        let video = vec![PathBuf::from("/r/v0.sdp"), PathBuf::from("/r/v1.sdp")];
        let args = build_muxer_args(&audio, &video, true, Path::new("/r/out.mp4"));

        assert_eq!(args.iter().filter(|a| *a == "-i").count(), 4);
        // Audio inputs precede video inputs.
        let first_video = args.iter().position(|a| a == "/r/v0.sdp").unwrap();
        let last_audio = args.iter().position(|a| a == "/r/a1.sdp").unwrap();
        assert!(last_audio < first_video);

        let graph_pos = args.iter().position(|a| a == "-filter_complex").unwrap();
        let graph = &args[graph_pos + 1];
        assert!(graph.contains("amix=inputs=2"));
        assert!(graph.contains("hstack=inputs=2[vout]"));

        assert!(args.windows(2).any(|w| w == ["-c:a", "aac"]));
        assert!(args.windows(2).any(|w| w == ["-c:v", "libx264"]));
        assert!(args.windows(2).any(|w| w == ["-preset", "fast"]));
        assert!(args.windows(2).any(|w| w == ["-crf", "23"]));
        assert_eq!(args.last().map(String::as_str), Some("/r/out.mp4"));
    }
}
