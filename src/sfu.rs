//! SFU orchestrator: media workers, per-room routers and the peer graph.
//!
//! The media library does the heavy lifting (ICE/DTLS, RTP forwarding);
//! this module owns the maps. Rooms hold id-keyed tables of peers, peers
//! hold id-keyed tables of producers and consumers, and every cross-link is
//! an id. Teardown drops consumer → producer → transport → peer → router;
//! the library handles closing objects server-side when the last handle
//! drops.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::num::NonZero;
use std::ops::RangeInclusive;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use mediasoup::prelude::*;
use mediasoup::webrtc_transport::{
    WebRtcTransportListenInfos, WebRtcTransportOptions, WebRtcTransportRemoteParameters,
};
use mediasoup::worker::WorkerSettings;
use mediasoup::worker_manager::WorkerManager;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::recording::Recording;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Orchestration failures surfaced to clients through socket acks.
/// The `Display` strings are the wire contract.
#[derive(Debug, Error)]
pub enum SfuError {
    #[error("Room not found")]
    RoomNotFound,
    #[error("Peer not found")]
    PeerNotFound,
    #[error("Peer already joined")]
    AlreadyJoined,
    #[error("Transport not found")]
    TransportNotFound,
    #[error("Producer not found")]
    ProducerNotFound,
    #[error("Consumer not found")]
    ConsumerNotFound,
    #[error("Send transport not created")]
    NoSendTransport,
    #[error("Recv transport not created")]
    NoRecvTransport,
    #[error("RTP capabilities not set")]
    NoRtpCapabilities,
    #[error("Cannot consume own producer")]
    OwnProducer,
    #[error("Cannot consume: incompatible capabilities")]
    CannotConsume,
    #[error("media error: {0}")]
    Media(String),
}

// ---------------------------------------------------------------------------
// Wire DTOs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportDirection {
    Send,
    Recv,
}

impl FromStr for TransportDirection {
    type Err = SfuError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "send" => Ok(Self::Send),
            "recv" => Ok(Self::Recv),
            _ => Err(SfuError::TransportNotFound),
        }
    }
}

/// Transport connection details sent to the client.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportOptions {
    pub id: String,
    pub ice_parameters: serde_json::Value,
    pub ice_candidates: serde_json::Value,
    pub dtls_parameters: serde_json::Value,
}

/// Consumer details sent to the client.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerInfo {
    pub id: String,
    pub producer_id: String,
    pub kind: String,
    pub rtp_parameters: serde_json::Value,
}

/// Producer annotation for discovery and `new_producer` broadcasts.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerInfo {
    pub producer_id: String,
    pub peer_id: String,
    pub username: String,
    pub kind: String,
}

/// Producer owner tag carried in `app_data` so consumers can attribute
/// streams without a second lookup.
#[derive(Debug, Clone)]
pub struct ProducerTag {
    pub peer_id: String,
}

// ---------------------------------------------------------------------------
// In-memory media graph
// ---------------------------------------------------------------------------

/// Media state for a single session in a room. Producers and consumers
/// belong to the peer's transports and close transitively with them.
pub struct Peer {
    pub session_id: String,
    pub username: String,
    pub send_transport: Option<WebRtcTransport>,
    pub recv_transport: Option<WebRtcTransport>,
    pub rtp_capabilities: Option<RtpCapabilities>,
    pub producers: HashMap<ProducerId, Producer>,
    pub consumers: HashMap<ConsumerId, Consumer>,
}

/// A media room backed by a router. The recording slot is written only by
/// the recording controller.
pub struct MediaRoom {
    pub room_id: String,
    pub router: Router,
    pub peers: DashMap<String, Peer>,
    pub recording: tokio::sync::Mutex<Option<Recording>>,
}

impl MediaRoom {
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Peers that currently publish at least one stream; the recording
    /// trigger policy counts these, not raw peers.
    pub fn peers_with_producers(&self) -> usize {
        self.peers
            .iter()
            .filter(|entry| !entry.value().producers.is_empty())
            .count()
    }

    /// Snapshot of all producers with their owning peer, audio first. The
    /// recording controller taps exactly this set when it starts.
    pub fn producer_snapshot(&self) -> Vec<(Producer, String)> {
        let mut all: Vec<(Producer, String)> = self
            .peers
            .iter()
            .flat_map(|entry| {
                entry
                    .value()
                    .producers
                    .values()
                    .cloned()
                    .map(|p| (p, entry.key().clone()))
                    .collect::<Vec<_>>()
            })
            .collect();
        all.sort_by_key(|(p, _)| match p.kind() {
            MediaKind::Audio => 0,
            MediaKind::Video => 1,
        });
        all
    }
}

// ---------------------------------------------------------------------------
// SfuServer
// ---------------------------------------------------------------------------

pub struct SfuServer {
    // Kept alive for the lifetime of the workers.
    _worker_manager: WorkerManager,
    workers: Vec<Worker>,
    next_worker: AtomicUsize,
    rooms: DashMap<String, Arc<MediaRoom>>,
    listen_ip: IpAddr,
    announced_ip: Option<String>,
    rtc_port_range: RangeInclusive<u16>,
}

impl SfuServer {
    /// Boot one media worker per CPU core. A dead worker invalidates its
    /// routers and transports, so worker death is fatal: the process exits
    /// after a short grace period.
    pub async fn new(config: &Config) -> anyhow::Result<Self> {
        let worker_manager = WorkerManager::new();
        let worker_count = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);

        let mut workers = Vec::with_capacity(worker_count);
        for index in 0..worker_count {
            let worker = worker_manager
                .create_worker(WorkerSettings::default())
                .await
                .map_err(|e| anyhow::anyhow!("failed to create media worker {index}: {e}"))?;

            worker
                .on_dead(move |reason| {
                    error!(worker = index, ?reason, "media worker died, exiting");
                    std::thread::spawn(|| {
                        std::thread::sleep(Duration::from_secs(2));
                        std::process::exit(1);
                    });
                })
                .detach();

            workers.push(worker);
        }
        info!(count = worker_count, "media workers started");

        Ok(Self {
            _worker_manager: worker_manager,
            workers,
            next_worker: AtomicUsize::new(0),
            rooms: DashMap::new(),
            listen_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            announced_ip: config.announced_ip.clone(),
            rtc_port_range: config.rtc_min_port..=config.rtc_max_port,
        })
    }

    /// Round-robin worker assignment for new rooms.
    fn pick_worker(&self) -> &Worker {
        let index = self.next_worker.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        &self.workers[index]
    }

    pub fn room(&self, room_id: &str) -> Result<Arc<MediaRoom>, SfuError> {
        self.rooms
            .get(room_id)
            .map(|entry| entry.value().clone())
            .ok_or(SfuError::RoomNotFound)
    }

    /// Number of live media rooms, for liveness reporting.
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Peers across all media rooms, for liveness reporting.
    pub fn total_peer_count(&self) -> usize {
        self.rooms
            .iter()
            .map(|entry| entry.value().peer_count())
            .sum()
    }

    /// Lazily allocate a router for the room on the next worker.
    pub async fn get_or_create_room(&self, room_id: &str) -> Result<Arc<MediaRoom>, SfuError> {
        if let Some(room) = self.rooms.get(room_id) {
            return Ok(room.value().clone());
        }

        let router = self
            .pick_worker()
            .create_router(RouterOptions::new(media_codecs()))
            .await
            .map_err(|e| SfuError::Media(format!("failed to create router: {e}")))?;

        let room = Arc::new(MediaRoom {
            room_id: room_id.to_string(),
            router,
            peers: DashMap::new(),
            recording: tokio::sync::Mutex::new(None),
        });

        // Lost race: keep the router that got inserted first.
        let entry = self.rooms.entry(room_id.to_string()).or_insert(room);
        info!(room_id, "media room ready");
        Ok(entry.value().clone())
    }

    /// Add a peer to the room and hand back the router RTP capabilities.
    /// The peer has no transports yet.
    pub async fn join(
        &self,
        room_id: &str,
        session_id: &str,
        username: &str,
    ) -> Result<serde_json::Value, SfuError> {
        let room = self.get_or_create_room(room_id).await?;
        if room.peers.contains_key(session_id) {
            return Err(SfuError::AlreadyJoined);
        }
        room.peers.insert(
            session_id.to_string(),
            Peer {
                session_id: session_id.to_string(),
                username: username.to_string(),
                send_transport: None,
                recv_transport: None,
                rtp_capabilities: None,
                producers: HashMap::new(),
                consumers: HashMap::new(),
            },
        );
        debug!(room_id, session_id, "peer joined media room");
        serde_json::to_value(room.router.rtp_capabilities())
            .map_err(|e| SfuError::Media(e.to_string()))
    }

    pub fn set_rtp_capabilities(
        &self,
        room_id: &str,
        session_id: &str,
        rtp_capabilities: RtpCapabilities,
    ) -> Result<(), SfuError> {
        let room = self.room(room_id)?;
        let mut peer = room.peers.get_mut(session_id).ok_or(SfuError::PeerNotFound)?;
        peer.rtp_capabilities = Some(rtp_capabilities);
        Ok(())
    }

    /// Create a WebRTC transport for one direction and store it on the peer.
    pub async fn create_transport(
        &self,
        room_id: &str,
        session_id: &str,
        direction: TransportDirection,
    ) -> Result<TransportOptions, SfuError> {
        let room = self.room(room_id)?;
        if !room.peers.contains_key(session_id) {
            return Err(SfuError::PeerNotFound);
        }

        let listen_info = ListenInfo {
            protocol: Protocol::Udp,
            ip: self.listen_ip,
            announced_address: self.announced_ip.clone(),
            port: None,
            port_range: Some(self.rtc_port_range.clone()),
            flags: None,
            send_buffer_size: None,
            recv_buffer_size: None,
            expose_internal_ip: false,
        };
        let mut transport_options =
            WebRtcTransportOptions::new(WebRtcTransportListenInfos::new(listen_info));
        transport_options.enable_udp = true;
        transport_options.prefer_udp = true;

        let transport = room
            .router
            .create_webrtc_transport(transport_options)
            .await
            .map_err(|e| SfuError::Media(format!("failed to create transport: {e}")))?;

        let transport_id = transport.id().to_string();
        transport
            .on_dtls_state_change({
                let room_id = room.room_id.clone();
                let transport_id = transport_id.clone();
                move |state| {
                    if matches!(state, DtlsState::Closed) {
                        debug!(%room_id, %transport_id, "transport DTLS closed");
                    }
                }
            })
            .detach();

        let options = TransportOptions {
            id: transport_id,
            ice_parameters: serde_json::to_value(transport.ice_parameters())
                .unwrap_or_default(),
            ice_candidates: serde_json::to_value(transport.ice_candidates())
                .unwrap_or_default(),
            dtls_parameters: serde_json::to_value(transport.dtls_parameters())
                .unwrap_or_default(),
        };

        let mut peer = room.peers.get_mut(session_id).ok_or(SfuError::PeerNotFound)?;
        match direction {
            TransportDirection::Send => peer.send_transport = Some(transport),
            TransportDirection::Recv => peer.recv_transport = Some(transport),
        }
        debug!(room_id, session_id, ?direction, "transport created");
        Ok(options)
    }

    /// Perform DTLS on the transport identified by id, wherever it lives in
    /// the room.
    pub async fn connect_transport(
        &self,
        room_id: &str,
        transport_id: &str,
        dtls_parameters: DtlsParameters,
    ) -> Result<(), SfuError> {
        let room = self.room(room_id)?;
        let wanted = TransportId::from_str(transport_id)
            .map_err(|_| SfuError::TransportNotFound)?;

        let transport = room
            .peers
            .iter()
            .find_map(|entry| {
                let peer = entry.value();
                [peer.send_transport.as_ref(), peer.recv_transport.as_ref()]
                    .into_iter()
                    .flatten()
                    .find(|t| t.id() == wanted)
                    .cloned()
            })
            .ok_or(SfuError::TransportNotFound)?;

        transport
            .connect(WebRtcTransportRemoteParameters { dtls_parameters })
            .await
            .map_err(|e| SfuError::Media(format!("failed to connect transport: {e}")))?;
        debug!(room_id, transport_id, "transport connected");
        Ok(())
    }

    /// Create a producer on the peer's send transport, tagged with the
    /// owning peer id.
    pub async fn produce(
        &self,
        room_id: &str,
        session_id: &str,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<ProducerInfo, SfuError> {
        let room = self.room(room_id)?;
        let (transport, username) = {
            let peer = room.peers.get(session_id).ok_or(SfuError::PeerNotFound)?;
            let transport = peer
                .send_transport
                .clone()
                .ok_or(SfuError::NoSendTransport)?;
            (transport, peer.username.clone())
        };

        let mut producer_options = ProducerOptions::new(kind, rtp_parameters);
        producer_options.app_data = AppData::new(ProducerTag {
            peer_id: session_id.to_string(),
        });

        let producer = transport
            .produce(producer_options)
            .await
            .map_err(|e| SfuError::Media(format!("failed to produce: {e}")))?;

        let info = ProducerInfo {
            producer_id: producer.id().to_string(),
            peer_id: session_id.to_string(),
            username,
            kind: kind_str(kind).to_string(),
        };

        let mut peer = room.peers.get_mut(session_id).ok_or(SfuError::PeerNotFound)?;
        peer.producers.insert(producer.id(), producer);
        debug!(room_id, session_id, producer_id = %info.producer_id, kind = %info.kind, "producer created");
        Ok(info)
    }

    /// Create a consumer for a producer on the requester's recv transport,
    /// paused. The client resumes it once ready to render, which avoids
    /// losing the initial keyframe.
    pub async fn consume(
        &self,
        room_id: &str,
        session_id: &str,
        producer_id: &str,
    ) -> Result<ConsumerInfo, SfuError> {
        let room = self.room(room_id)?;
        let wanted = ProducerId::from_str(producer_id)
            .map_err(|_| SfuError::ProducerNotFound)?;

        // The producer carries its owner in app_data; fall back to the map
        // key it was found under.
        let owner = room
            .peers
            .iter()
            .find_map(|entry| {
                entry.value().producers.get(&wanted).map(|producer| {
                    producer
                        .app_data()
                        .downcast_ref::<ProducerTag>()
                        .map(|tag| tag.peer_id.clone())
                        .unwrap_or_else(|| entry.key().clone())
                })
            })
            .ok_or(SfuError::ProducerNotFound)?;
        if owner == session_id {
            return Err(SfuError::OwnProducer);
        }

        let (transport, rtp_capabilities) = {
            let peer = room.peers.get(session_id).ok_or(SfuError::PeerNotFound)?;
            let transport = peer
                .recv_transport
                .clone()
                .ok_or(SfuError::NoRecvTransport)?;
            let caps = peer
                .rtp_capabilities
                .clone()
                .ok_or(SfuError::NoRtpCapabilities)?;
            (transport, caps)
        };

        if !room.router.can_consume(&wanted, &rtp_capabilities) {
            return Err(SfuError::CannotConsume);
        }

        let mut consumer_options = ConsumerOptions::new(wanted, rtp_capabilities);
        consumer_options.paused = true;

        let consumer = transport
            .consume(consumer_options)
            .await
            .map_err(|e| SfuError::Media(format!("failed to consume: {e}")))?;

        let info = ConsumerInfo {
            id: consumer.id().to_string(),
            producer_id: consumer.producer_id().to_string(),
            kind: kind_str(consumer.kind()).to_string(),
            rtp_parameters: serde_json::to_value(consumer.rtp_parameters())
                .unwrap_or_default(),
        };

        let mut peer = room.peers.get_mut(session_id).ok_or(SfuError::PeerNotFound)?;
        peer.consumers.insert(consumer.id(), consumer);
        debug!(room_id, session_id, consumer_id = %info.id, "consumer created (paused)");
        Ok(info)
    }

    pub async fn resume_consumer(
        &self,
        room_id: &str,
        session_id: &str,
        consumer_id: &str,
    ) -> Result<(), SfuError> {
        let room = self.room(room_id)?;
        let wanted = ConsumerId::from_str(consumer_id)
            .map_err(|_| SfuError::ConsumerNotFound)?;

        let consumer = {
            let peer = room.peers.get(session_id).ok_or(SfuError::PeerNotFound)?;
            peer.consumers
                .get(&wanted)
                .cloned()
                .ok_or(SfuError::ConsumerNotFound)?
        };
        consumer
            .resume()
            .await
            .map_err(|e| SfuError::Media(format!("failed to resume consumer: {e}")))?;
        debug!(room_id, session_id, consumer_id, "consumer resumed");
        Ok(())
    }

    /// All producers in the room except the requester's, annotated for late
    /// joiners.
    pub fn get_producers(&self, room_id: &str, exclude_session: &str) -> Vec<ProducerInfo> {
        let Ok(room) = self.room(room_id) else {
            return Vec::new();
        };
        room.peers
            .iter()
            .filter(|entry| entry.key() != exclude_session)
            .flat_map(|entry| {
                let peer = entry.value();
                peer.producers
                    .values()
                    .map(|producer| ProducerInfo {
                        producer_id: producer.id().to_string(),
                        peer_id: peer.session_id.clone(),
                        username: peer.username.clone(),
                        kind: kind_str(producer.kind()).to_string(),
                    })
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// Remove a peer and tear down its media graph. Returns the room handle
    /// so the caller can run the recording stop policy before the room is
    /// (possibly) destroyed.
    pub fn remove_peer(&self, room_id: &str, session_id: &str) -> Option<Arc<MediaRoom>> {
        let room = self.rooms.get(room_id)?.value().clone();
        let (_, mut peer) = room.peers.remove(session_id)?;

        // Close in dependency order; dropping the last handle closes the
        // server-side object.
        for (_, consumer) in peer.consumers.drain() {
            drop(consumer);
        }
        for (_, producer) in peer.producers.drain() {
            drop(producer);
        }
        peer.send_transport.take();
        peer.recv_transport.take();

        info!(room_id, session_id, remaining = room.peer_count(), "peer left media room");
        Some(room)
    }

    /// Drop the room entry (and with it the router) once the last peer left.
    pub fn remove_room_if_empty(&self, room_id: &str) {
        let empty = self
            .rooms
            .get(room_id)
            .map(|room| room.peers.is_empty())
            .unwrap_or(false);
        if empty {
            if self.rooms.remove(room_id).is_some() {
                info!(room_id, "media room destroyed");
            }
        }
    }

    /// Rooms this session is a peer of; used by the disconnect cascade.
    pub fn rooms_of_session(&self, session_id: &str) -> Vec<String> {
        self.rooms
            .iter()
            .filter(|entry| entry.value().peers.contains_key(session_id))
            .map(|entry| entry.key().clone())
            .collect()
    }
}

pub fn kind_str(kind: MediaKind) -> &'static str {
    match kind {
        MediaKind::Audio => "audio",
        MediaKind::Video => "video",
    }
}

// ---------------------------------------------------------------------------
// Codec set
// ---------------------------------------------------------------------------

/// Fixed room codec set: Opus 48 kHz stereo, VP8, H.264 constrained
/// baseline.
fn media_codecs() -> Vec<RtpCodecCapability> {
    vec![
        RtpCodecCapability::Audio {
            mime_type: MimeTypeAudio::Opus,
            preferred_payload_type: Some(111),
            clock_rate: NonZero::new(48000).expect("static clock rate"),
            channels: NonZero::new(2).expect("static channel count"),
            parameters: RtpCodecParametersParameters::from([("useinbandfec", 1_u32.into())]),
            rtcp_feedback: vec![RtcpFeedback::TransportCc],
        },
        RtpCodecCapability::Video {
            mime_type: MimeTypeVideo::Vp8,
            preferred_payload_type: Some(96),
            clock_rate: NonZero::new(90000).expect("static clock rate"),
            parameters: RtpCodecParametersParameters::default(),
            rtcp_feedback: vec![
                RtcpFeedback::Nack,
                RtcpFeedback::NackPli,
                RtcpFeedback::CcmFir,
                RtcpFeedback::GoogRemb,
                RtcpFeedback::TransportCc,
            ],
        },
        RtpCodecCapability::Video {
            mime_type: MimeTypeVideo::H264,
            preferred_payload_type: Some(125),
            clock_rate: NonZero::new(90000).expect("static clock rate"),
            parameters: RtpCodecParametersParameters::from([
                ("level-asymmetry-allowed", 1_u32.into()),
                ("packetization-mode", 1_u32.into()),
                ("profile-level-id", "42e01f".into()),
            ]),
            rtcp_feedback: vec![
                RtcpFeedback::Nack,
                RtcpFeedback::NackPli,
                RtcpFeedback::CcmFir,
                RtcpFeedback::GoogRemb,
                RtcpFeedback::TransportCc,
            ],
        },
    ]
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direction_parses() {
        assert_eq!("send".parse::<TransportDirection>().unwrap(), TransportDirection::Send);
        assert_eq!("recv".parse::<TransportDirection>().unwrap(), TransportDirection::Recv);
        assert!("both".parse::<TransportDirection>().is_err());
    }

    #[test]
    fn codec_set_is_opus_vp8_h264() {
        let codecs = media_codecs();
        assert_eq!(codecs.len(), 3);
        assert!(matches!(
            codecs[0],
            RtpCodecCapability::Audio { mime_type: MimeTypeAudio::Opus, .. }
        ));
        assert!(matches!(
            codecs[1],
            RtpCodecCapability::Video { mime_type: MimeTypeVideo::Vp8, .. }
        ));
        assert!(matches!(
            codecs[2],
            RtpCodecCapability::Video { mime_type: MimeTypeVideo::H264, .. }
        ));
    }

    #[test]
    fn own_producer_rejection_message() {
        // The exact string is part of the socket ack contract.
        assert_eq!(SfuError::OwnProducer.to_string(), "Cannot consume own producer");
    }
}
