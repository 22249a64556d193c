//! WebRTC peer transport
//!
//! [`PeerTransport`] implemented on webrtc-rs. One instance wraps one
//! `RTCPeerConnection` configured from the call's STUN/TURN servers, with
//! default codecs and interceptors. Connection state changes, trickled
//! local candidates, and incoming remote tracks are forwarded as
//! [`PeerEvent`]s; everything else is the trait's request/response surface.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::stats::StatsReportType;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use crate::config::CallConfig;
use crate::media::{LocalStream, RemoteStream, TrackKind};
use crate::signaling::message::{IceCandidate, SdpKind, SessionDescription};
use crate::stats::{ConnectionPath, ConnectionQuality};
use crate::transport::{PeerEvent, PeerTransport, PeerTransportFactory, TransportState};
use crate::{Error, Result};

/// WebRTC-backed peer connection attempt
pub struct WebRtcTransport {
    connection: Arc<RTCPeerConnection>,

    /// Stream id the local tracks are published under
    local_stream_id: String,

    /// RTP senders retained so webrtc-rs does not drop the tracks
    senders: Mutex<Vec<Arc<RTCRtpSender>>>,

    events_rx: Mutex<Option<mpsc::UnboundedReceiver<PeerEvent>>>,

    closed: AtomicBool,
}

impl WebRtcTransport {
    /// Create a peer connection from the configured ICE servers
    ///
    /// # Errors
    ///
    /// Returns an error when codec or interceptor registration fails or the
    /// peer connection cannot be constructed.
    pub async fn new(config: &CallConfig) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| Error::TransportError(format!("Failed to register codecs: {}", e)))?;

        let interceptor_registry = register_default_interceptors(Default::default(), &mut media_engine)
            .map_err(|e| Error::TransportError(format!("Failed to register interceptors: {}", e)))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(interceptor_registry)
            .build();

        let ice_servers: Vec<RTCIceServer> = config
            .stun_servers
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .chain(config.turn_servers.iter().map(|turn| {
                #[allow(clippy::needless_update)]
                RTCIceServer {
                    urls: vec![turn.url.clone()],
                    username: turn.username.clone(),
                    credential: turn.credential.clone(),
                    ..Default::default()
                }
            }))
            .collect();

        let rtc_config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        let connection = Arc::new(api.new_peer_connection(rtc_config).await.map_err(|e| {
            Error::TransportError(format!("Failed to create peer connection: {}", e))
        })?);

        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let state_tx = events_tx.clone();
        connection.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let state_tx = state_tx.clone();
            Box::pin(async move {
                let mapped = match state {
                    RTCPeerConnectionState::New => TransportState::New,
                    RTCPeerConnectionState::Connecting => TransportState::Connecting,
                    RTCPeerConnectionState::Connected => TransportState::Connected,
                    RTCPeerConnectionState::Disconnected => TransportState::Disconnected,
                    RTCPeerConnectionState::Failed => TransportState::Failed,
                    RTCPeerConnectionState::Closed => TransportState::Closed,
                    _ => return,
                };
                debug!(state = mapped.as_str(), "peer connection state changed");
                let _ = state_tx.send(PeerEvent::StateChanged(mapped));
            })
        }));

        let candidate_tx = events_tx.clone();
        connection.on_ice_candidate(Box::new(move |candidate| {
            let candidate_tx = candidate_tx.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    trace!("local candidate gathering finished");
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = candidate_tx.send(PeerEvent::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                        }));
                    }
                    Err(error) => {
                        warn!(%error, "discarding unserializable local candidate");
                    }
                }
            })
        }));

        let track_tx = events_tx;
        connection.on_track(Box::new(move |track, _receiver, _transceiver| {
            let track_tx = track_tx.clone();
            Box::pin(async move {
                let stream = RemoteStream::new(track.stream_id()).with_track(track.id());
                info!(
                    stream = %stream.stream_id,
                    kind = %track.kind(),
                    "remote track arrived"
                );
                let _ = track_tx.send(PeerEvent::RemoteStream(stream));
            })
        }));

        Ok(Self {
            connection,
            local_stream_id: format!("stream-{}", uuid::Uuid::new_v4()),
            senders: Mutex::new(Vec::new()),
            events_rx: Mutex::new(Some(events_rx)),
            closed: AtomicBool::new(false),
        })
    }

    /// Set the local description and read the installed form back
    async fn install_local_description(
        &self,
        description: RTCSessionDescription,
    ) -> Result<String> {
        self.connection
            .set_local_description(description)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set local description: {}", e)))?;

        let installed = self
            .connection
            .local_description()
            .await
            .ok_or_else(|| Error::SdpError("No local description after setting it".to_string()))?;

        Ok(installed.sdp)
    }
}

#[async_trait]
impl PeerTransport for WebRtcTransport {
    async fn publish_stream(&self, stream: &LocalStream) -> Result<()> {
        for local_track in stream.tracks() {
            let capability = match local_track.kind() {
                TrackKind::Audio => RTCRtpCodecCapability {
                    mime_type: "audio/opus".to_string(),
                    clock_rate: 48000,
                    channels: 2,
                    sdp_fmtp_line: String::new(),
                    rtcp_feedback: vec![],
                },
                TrackKind::Video => RTCRtpCodecCapability {
                    mime_type: "video/VP8".to_string(),
                    clock_rate: 90000,
                    channels: 0,
                    sdp_fmtp_line: String::new(),
                    rtcp_feedback: vec![],
                },
            };

            let track = Arc::new(TrackLocalStaticSample::new(
                capability,
                local_track.id().to_string(),
                self.local_stream_id.clone(),
            ));

            let sender = self
                .connection
                .add_track(track as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(|e| {
                    Error::TransportError(format!(
                        "Failed to add {} track: {}",
                        local_track.kind().as_str(),
                        e
                    ))
                })?;

            self.senders.lock().unwrap().push(sender);
            debug!(
                track = %local_track.id(),
                kind = local_track.kind().as_str(),
                "local track published"
            );
        }
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self
            .connection
            .create_offer(None)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to create offer: {}", e)))?;

        let sdp = self.install_local_description(offer).await?;
        debug!("created offer");
        Ok(SessionDescription::offer(sdp))
    }

    async fn create_restart_offer(&self) -> Result<SessionDescription> {
        let options = RTCOfferOptions {
            ice_restart: true,
            ..Default::default()
        };
        let offer = self
            .connection
            .create_offer(Some(options))
            .await
            .map_err(|e| Error::SdpError(format!("Failed to create restart offer: {}", e)))?;

        let sdp = self.install_local_description(offer).await?;
        info!("created offer with fresh candidates");
        Ok(SessionDescription::offer(sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self
            .connection
            .create_answer(None)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to create answer: {}", e)))?;

        let sdp = self.install_local_description(answer).await?;
        debug!("created answer");
        Ok(SessionDescription::answer(sdp))
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        let remote = match description.kind {
            SdpKind::Offer => RTCSessionDescription::offer(description.sdp),
            SdpKind::Answer => RTCSessionDescription::answer(description.sdp),
        }
        .map_err(|e| Error::SdpError(format!("Failed to parse remote description: {}", e)))?;

        self.connection
            .set_remote_description(remote)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set remote description: {}", e)))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        trace!(candidate = %candidate.candidate, "applying remote candidate");
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            ..Default::default()
        };

        self.connection
            .add_ice_candidate(init)
            .await
            .map_err(|e| Error::IceCandidateError(format!("Failed to add ICE candidate: {}", e)))
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<PeerEvent>> {
        self.events_rx.lock().unwrap().take()
    }

    async fn quality_snapshot(&self) -> Option<ConnectionQuality> {
        let report = self.connection.get_stats().await;

        let mut rtt_ms = None;
        let mut local_candidate_id = None;
        let mut remote_candidate_id = None;
        let mut candidate_types: HashMap<String, String> = HashMap::new();
        let mut packets_lost: u64 = 0;
        let mut packets_received: u64 = 0;

        for entry in report.reports.values() {
            match entry {
                StatsReportType::CandidatePair(pair) if pair.nominated => {
                    if pair.current_round_trip_time > 0.0 {
                        rtt_ms = Some(pair.current_round_trip_time * 1000.0);
                    }
                    local_candidate_id = Some(pair.local_candidate_id.clone());
                    remote_candidate_id = Some(pair.remote_candidate_id.clone());
                }
                StatsReportType::LocalCandidate(candidate)
                | StatsReportType::RemoteCandidate(candidate) => {
                    candidate_types
                        .insert(candidate.id.clone(), candidate.candidate_type.to_string());
                }
                StatsReportType::InboundRTP(inbound) => {
                    packets_received += inbound.packets_received;
                }
                // Loss counts come from the peer's receiver reports about
                // our outbound streams; the local inbound stats do not
                // carry a loss field yet.
                StatsReportType::RemoteInboundRTP(remote_inbound) => {
                    packets_lost += remote_inbound.packets_lost.max(0) as u64;
                }
                _ => {}
            }
        }

        let path = match (
            local_candidate_id.and_then(|id| candidate_types.get(&id).cloned()),
            remote_candidate_id.and_then(|id| candidate_types.get(&id).cloned()),
        ) {
            (Some(local), Some(remote)) => ConnectionPath::classify(&local, &remote),
            _ => ConnectionPath::Unknown,
        };

        Some(ConnectionQuality {
            path,
            round_trip_ms: rtt_ms,
            packets_lost,
            packets_received,
        })
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!("closing peer connection");
        self.connection
            .close()
            .await
            .map_err(|e| Error::TransportError(format!("Failed to close connection: {}", e)))
    }
}

/// Builds a [`WebRtcTransport`] per connection attempt
#[derive(Debug, Default)]
pub struct WebRtcTransportFactory;

impl WebRtcTransportFactory {
    /// Create the factory
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl PeerTransportFactory for WebRtcTransportFactory {
    async fn create(&self, config: &CallConfig) -> Result<Arc<dyn PeerTransport>> {
        let transport = WebRtcTransport::new(config).await?;
        Ok(Arc::new(transport))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::SyntheticCapture;
    use crate::media::MediaCapture;

    async fn transport() -> WebRtcTransport {
        WebRtcTransport::new(&CallConfig::default()).await.unwrap()
    }

    #[tokio::test]
    async fn test_offer_contains_published_media() {
        let transport = transport().await;
        let stream = SyntheticCapture
            .acquire(&CallConfig::default().media)
            .await
            .unwrap();
        transport.publish_stream(&stream).await.unwrap();

        let offer = transport.create_offer().await.unwrap();
        assert_eq!(offer.kind, SdpKind::Offer);
        assert!(offer.sdp.contains("m=audio"), "offer missing audio media");
        assert!(offer.sdp.contains("m=video"), "offer missing video media");

        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_events_can_be_taken_once() {
        let transport = transport().await;
        assert!(transport.take_events().is_some());
        assert!(transport.take_events().is_none());
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_candidate_rejected_without_remote_description() {
        let transport = transport().await;
        let result = transport
            .add_ice_candidate(IceCandidate {
                candidate: "candidate:1 1 udp 2130706431 192.0.2.1 54321 typ host".to_string(),
                sdp_mid: Some("0".to_string()),
                sdp_mline_index: Some(0),
            })
            .await;
        assert!(result.is_err(), "candidate must not apply before the remote description");
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_offer_answer_between_two_transports() {
        let offering = transport().await;
        let answering = transport().await;

        let stream = SyntheticCapture
            .acquire(&CallConfig::default().media)
            .await
            .unwrap();
        offering.publish_stream(&stream).await.unwrap();

        let offer = offering.create_offer().await.unwrap();
        answering.set_remote_description(offer).await.unwrap();
        let answer = answering.create_answer().await.unwrap();
        assert_eq!(answer.kind, SdpKind::Answer);
        offering.set_remote_description(answer).await.unwrap();

        offering.close().await.unwrap();
        answering.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let transport = transport().await;
        transport.close().await.unwrap();
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_quality_snapshot_before_connection_is_unknown() {
        let transport = transport().await;
        let quality = transport.quality_snapshot().await.unwrap();
        assert_eq!(quality.path, ConnectionPath::Unknown);
        assert_eq!(quality.packets_received, 0);
        transport.close().await.unwrap();
    }
}
