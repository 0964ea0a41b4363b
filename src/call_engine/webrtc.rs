//! WebRTC Plattform
//!
//! Peer Connections über `webrtc-rs` mit Opus Audio und optional VP8 Video.
//! Die lokalen Tracks werden hier nur angelegt; Capture und Wiedergabe
//! hängen am Host.

use super::platform::{CandidateSink, MediaPlatform, PlatformError};
use crate::config::CallConfig;
use crate::signaling::{CallKind, IceCandidate, SdpType, SessionDescription};
use async_trait::async_trait;
use std::sync::Arc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocal;

const OPUS_CLOCK_RATE: u32 = 48000;
const VIDEO_CLOCK_RATE: u32 = 90000;
const STREAM_ID: &str = "pulse-call";

fn webrtc_error(e: webrtc::Error) -> PlatformError {
    PlatformError::WebRTC(e.to_string())
}

/// Lokale Tracks eines Anrufs
pub struct WebRtcMedia {
    kind: CallKind,
    tracks: Vec<Arc<TrackLocalStaticRTP>>,
}

impl WebRtcMedia {
    pub fn kind(&self) -> CallKind {
        self.kind
    }

    pub fn track_count(&self) -> usize {
        self.tracks.len()
    }
}

impl std::fmt::Debug for WebRtcMedia {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebRtcMedia")
            .field("kind", &self.kind)
            .field("tracks", &self.tracks.len())
            .finish()
    }
}

/// Media-Plattform auf Basis von `webrtc-rs`
#[derive(Debug, Clone)]
pub struct WebRtcPlatform {
    ice_servers: Vec<RTCIceServer>,
}

impl WebRtcPlatform {
    pub fn new(config: &CallConfig) -> Self {
        let ice_servers = if config.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: config.ice_servers.clone(),
                ..Default::default()
            }]
        };
        Self { ice_servers }
    }

    /// Fügt einen TURN-Server mit Credentials hinzu
    pub fn with_turn_server(
        mut self,
        url: impl Into<String>,
        username: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        self.ice_servers.push(RTCIceServer {
            urls: vec![url.into()],
            username: username.into(),
            credential: credential.into(),
            ..Default::default()
        });
        self
    }

    pub fn ice_servers(&self) -> &[RTCIceServer] {
        &self.ice_servers
    }

    async fn new_peer_connection(&self) -> Result<Arc<RTCPeerConnection>, PlatformError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(webrtc_error)?;

        // Interceptors für RTCP, NACK etc.
        let mut registry = Registry::new();
        registry =
            register_default_interceptors(registry, &mut media_engine).map_err(webrtc_error)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };

        let pc = api
            .new_peer_connection(config)
            .await
            .map_err(webrtc_error)?;
        Ok(Arc::new(pc))
    }
}

impl Default for WebRtcPlatform {
    fn default() -> Self {
        Self::new(&CallConfig::default())
    }
}

fn to_rtc_description(
    description: SessionDescription,
) -> Result<RTCSessionDescription, PlatformError> {
    let result = match description.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(description.sdp),
        SdpType::Answer => RTCSessionDescription::answer(description.sdp),
    };
    result.map_err(|e| PlatformError::InvalidSdp(e.to_string()))
}

fn from_rtc_candidate(candidate: &RTCIceCandidate) -> Option<IceCandidate> {
    let init = candidate.to_json().ok()?;
    Some(IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    })
}

/// Hängt die lokalen Tracks an; schlägt das fehl, wird die Connection geschlossen
async fn attach_tracks(
    pc: &Arc<RTCPeerConnection>,
    tracks: &[Arc<TrackLocalStaticRTP>],
) -> Result<(), PlatformError> {
    for track in tracks {
        if let Err(e) = pc
            .add_track(Arc::clone(track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
        {
            if let Err(close_err) = pc.close().await {
                tracing::warn!("Failed to close peer connection: {}", close_err);
            }
            return Err(webrtc_error(e));
        }
    }
    Ok(())
}

#[async_trait]
impl MediaPlatform for WebRtcPlatform {
    type Media = WebRtcMedia;
    type Negotiation = Arc<RTCPeerConnection>;

    async fn acquire_media(&self, kind: CallKind) -> Result<WebRtcMedia, PlatformError> {
        let mut tracks = vec![Arc::new(TrackLocalStaticRTP::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                clock_rate: OPUS_CLOCK_RATE,
                channels: 1,
                ..Default::default()
            },
            "audio".to_string(),
            STREAM_ID.to_string(),
        ))];

        if kind.has_video() {
            tracks.push(Arc::new(TrackLocalStaticRTP::new(
                RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_VP8.to_string(),
                    clock_rate: VIDEO_CLOCK_RATE,
                    ..Default::default()
                },
                "video".to_string(),
                STREAM_ID.to_string(),
            )));
        }

        tracing::debug!("Prepared {} local track(s) for {} call", tracks.len(), kind);
        Ok(WebRtcMedia { kind, tracks })
    }

    async fn create_negotiation(
        &self,
        media: &WebRtcMedia,
        candidates: CandidateSink,
    ) -> Result<Arc<RTCPeerConnection>, PlatformError> {
        let pc = self.new_peer_connection().await?;
        attach_tracks(&pc, &media.tracks).await?;

        pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            tracing::info!("Peer connection state: {:?}", s);
            Box::pin(async {})
        }));

        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            if let Some(candidate) = candidate.as_ref().and_then(from_rtc_candidate) {
                candidates.push(candidate);
            }
            Box::pin(async {})
        }));

        pc.on_track(Box::new(move |track, _, _| {
            Box::pin(async move {
                tracing::info!("Received remote track: {:?}", track.codec());
            })
        }));

        Ok(pc)
    }

    async fn create_offer(
        &self,
        pc: &Arc<RTCPeerConnection>,
    ) -> Result<SessionDescription, PlatformError> {
        let offer = pc.create_offer(None).await.map_err(webrtc_error)?;
        pc.set_local_description(offer.clone())
            .await
            .map_err(webrtc_error)?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(
        &self,
        pc: &Arc<RTCPeerConnection>,
        offer: SessionDescription,
    ) -> Result<SessionDescription, PlatformError> {
        pc.set_remote_description(to_rtc_description(offer)?)
            .await
            .map_err(webrtc_error)?;

        let answer = pc.create_answer(None).await.map_err(webrtc_error)?;
        pc.set_local_description(answer.clone())
            .await
            .map_err(webrtc_error)?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn apply_answer(
        &self,
        pc: &Arc<RTCPeerConnection>,
        answer: SessionDescription,
    ) -> Result<(), PlatformError> {
        pc.set_remote_description(to_rtc_description(answer)?)
            .await
            .map_err(webrtc_error)
    }

    async fn add_candidate(
        &self,
        pc: &Arc<RTCPeerConnection>,
        candidate: IceCandidate,
    ) -> Result<(), PlatformError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        pc.add_ice_candidate(init)
            .await
            .map_err(|e| PlatformError::InvalidCandidate(e.to_string()))
    }

    async fn release_media(&self, media: WebRtcMedia) {
        tracing::debug!("Releasing {} local track(s)", media.tracks.len());
    }

    async fn close_negotiation(&self, pc: Arc<RTCPeerConnection>) {
        if let Err(e) = pc.close().await {
            tracing::warn!("Failed to close peer connection: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ice_servers_from_config() {
        let platform = WebRtcPlatform::default();
        assert_eq!(platform.ice_servers().len(), 1);
        assert_eq!(platform.ice_servers()[0].urls.len(), 3);

        let config = CallConfig {
            ice_servers: Vec::new(),
            ..CallConfig::default()
        };
        let platform = WebRtcPlatform::new(&config).with_turn_server(
            "turn:turn.example.com:3478",
            "user",
            "secret",
        );
        assert_eq!(platform.ice_servers().len(), 1);
        assert_eq!(platform.ice_servers()[0].username, "user");
    }

    #[tokio::test]
    async fn test_video_call_gets_two_tracks() {
        let platform = WebRtcPlatform::default();

        let audio = platform.acquire_media(CallKind::Audio).await.unwrap();
        assert_eq!(audio.track_count(), 1);

        let video = platform.acquire_media(CallKind::Video).await.unwrap();
        assert_eq!(video.track_count(), 2);
        assert_eq!(video.kind(), CallKind::Video);
    }

    #[tokio::test]
    async fn test_failed_track_leaves_connection_closed() {
        let platform = WebRtcPlatform::new(&CallConfig {
            ice_servers: Vec::new(),
            ..CallConfig::default()
        });
        let media = platform.acquire_media(CallKind::Video).await.unwrap();
        let pc = platform.new_peer_connection().await.unwrap();

        // Auf einer geschlossenen Connection schlägt add_track fehl
        pc.close().await.unwrap();
        let result = attach_tracks(&pc, &media.tracks).await;

        assert!(matches!(result, Err(PlatformError::WebRTC(_))));
        assert_eq!(pc.connection_state(), RTCPeerConnectionState::Closed);
    }

    #[test]
    fn test_description_type_is_preserved() {
        let sdp = "v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n";
        let rtc = to_rtc_description(SessionDescription::answer(sdp)).unwrap();
        assert_eq!(rtc.sdp, sdp);
        assert_eq!(
            rtc.sdp_type,
            webrtc::peer_connection::sdp::sdp_type::RTCSdpType::Answer
        );
    }

    #[test]
    fn test_garbage_sdp_is_rejected() {
        assert!(matches!(
            to_rtc_description(SessionDescription::offer("not an sdp")),
            Err(PlatformError::InvalidSdp(_))
        ));
    }
}
