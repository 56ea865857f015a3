use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use commlink_shared::constants::DEFAULT_STUN_SERVER;
use commlink_shared::error::MediaError;
use commlink_shared::protocol::IceCandidate;

use crate::peer::{
    LocalMedia, LocalMediaHandle, MediaRuntime, PeerEvent, PeerEventSink, PeerLink, PeerLinkHandle,
};

const STREAM_ID: &str = "commlink";

/// Outgoing audio (Opus) and video (VP8) tracks.
///
/// Capture and encoding happen outside this crate: the capture pipeline
/// writes encoded samples into [`WebRtcLocalMedia::audio_track`] and
/// [`WebRtcLocalMedia::video_track`] while the matching flag is enabled.
pub struct WebRtcLocalMedia {
    audio: Arc<TrackLocalStaticSample>,
    video: Arc<TrackLocalStaticSample>,
    audio_enabled: AtomicBool,
    video_enabled: AtomicBool,
    stopped: AtomicBool,
}

impl WebRtcLocalMedia {
    pub fn new() -> Self {
        let audio = TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                ..Default::default()
            },
            "audio".to_owned(),
            STREAM_ID.to_owned(),
        );
        let video = TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                ..Default::default()
            },
            "video".to_owned(),
            STREAM_ID.to_owned(),
        );

        Self {
            audio: Arc::new(audio),
            video: Arc::new(video),
            audio_enabled: AtomicBool::new(true),
            video_enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn audio_track(&self) -> Arc<TrackLocalStaticSample> {
        self.audio.clone()
    }

    pub fn video_track(&self) -> Arc<TrackLocalStaticSample> {
        self.video.clone()
    }

    pub fn is_audio_enabled(&self) -> bool {
        !self.is_stopped() && self.audio_enabled.load(Ordering::SeqCst)
    }

    pub fn is_video_enabled(&self) -> bool {
        !self.is_stopped() && self.video_enabled.load(Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl Default for WebRtcLocalMedia {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalMedia for WebRtcLocalMedia {
    fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            debug!("Local tracks stopped");
        }
    }

    fn set_audio_enabled(&self, enabled: bool) {
        self.audio_enabled.store(enabled, Ordering::SeqCst);
    }

    fn set_video_enabled(&self, enabled: bool) {
        self.video_enabled.store(enabled, Ordering::SeqCst);
    }

    fn tracks(&self) -> Vec<Arc<dyn TrackLocal + Send + Sync>> {
        vec![
            self.audio.clone() as Arc<dyn TrackLocal + Send + Sync>,
            self.video.clone() as Arc<dyn TrackLocal + Send + Sync>,
        ]
    }
}

/// [`MediaRuntime`] backed by the `webrtc` crate.
pub struct WebRtcRuntime {
    ice_servers: Vec<String>,
}

impl WebRtcRuntime {
    pub fn new(ice_servers: Vec<String>) -> Self {
        Self { ice_servers }
    }

    fn build_api(&self) -> Result<API, MediaError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| MediaError::PeerConnection(format!("codec registration: {e}")))?;

        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|e| MediaError::PeerConnection(format!("interceptor registration: {e}")))?;

        Ok(APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build())
    }

    fn configuration(&self) -> RTCConfiguration {
        let ice_servers = if self.ice_servers.is_empty() {
            vec![DEFAULT_STUN_SERVER.to_string()]
        } else {
            self.ice_servers.clone()
        };

        RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: ice_servers,
                ..Default::default()
            }],
            ..Default::default()
        }
    }
}

impl Default for WebRtcRuntime {
    fn default() -> Self {
        Self::new(vec![DEFAULT_STUN_SERVER.to_string()])
    }
}

#[async_trait]
impl MediaRuntime for WebRtcRuntime {
    async fn acquire_local_media(&self) -> Result<LocalMediaHandle, MediaError> {
        info!("Local tracks created");
        Ok(Arc::new(WebRtcLocalMedia::new()))
    }

    async fn open_peer(
        &self,
        media: LocalMediaHandle,
        events: PeerEventSink,
    ) -> Result<PeerLinkHandle, MediaError> {
        let epoch = events.epoch();
        let api = self.build_api()?;
        let pc = api
            .new_peer_connection(self.configuration())
            .await
            .map_err(|e| MediaError::PeerConnection(e.to_string()))?;
        let pc = Arc::new(pc);

        for track in media.tracks() {
            pc.add_track(track)
                .await
                .map_err(|e| MediaError::PeerConnection(format!("add track: {e}")))?;
        }

        let candidate_sink = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let sink = candidate_sink.clone();
            Box::pin(async move {
                let Some(c) = candidate else { return };
                match c.to_json() {
                    Ok(init) => {
                        sink.post(PeerEvent::LocalCandidate(from_init(init)));
                    }
                    Err(e) => warn!(error = %e, "Failed to serialize ICE candidate"),
                }
            })
        }));

        let state_sink = events;
        pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            let sink = state_sink.clone();
            Box::pin(async move {
                debug!(state = %s, "Peer connection state changed");
                match s {
                    RTCPeerConnectionState::Connected => {
                        sink.post(PeerEvent::Connected);
                    }
                    RTCPeerConnectionState::Failed => {
                        sink.post(PeerEvent::Failed("peer connection failed".into()));
                    }
                    _ => {}
                }
            })
        }));

        info!(epoch, "Peer connection created");
        Ok(Arc::new(WebRtcLink { pc }))
    }
}

struct WebRtcLink {
    pc: Arc<RTCPeerConnection>,
}

#[async_trait]
impl PeerLink for WebRtcLink {
    async fn create_offer(&self) -> Result<String, MediaError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| MediaError::PeerConnection(format!("create offer: {e}")))?;
        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(|e| MediaError::InvalidDescription(e.to_string()))?;
        Ok(offer.sdp)
    }

    async fn accept_offer(&self, offer: String) -> Result<String, MediaError> {
        let offer = RTCSessionDescription::offer(offer)
            .map_err(|e| MediaError::InvalidDescription(e.to_string()))?;
        self.pc
            .set_remote_description(offer)
            .await
            .map_err(|e| MediaError::InvalidDescription(e.to_string()))?;

        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| MediaError::PeerConnection(format!("create answer: {e}")))?;
        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(|e| MediaError::InvalidDescription(e.to_string()))?;
        Ok(answer.sdp)
    }

    async fn apply_answer(&self, answer: String) -> Result<(), MediaError> {
        let answer = RTCSessionDescription::answer(answer)
            .map_err(|e| MediaError::InvalidDescription(e.to_string()))?;
        self.pc
            .set_remote_description(answer)
            .await
            .map_err(|e| MediaError::InvalidDescription(e.to_string()))
    }

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), MediaError> {
        self.pc
            .add_ice_candidate(to_init(candidate))
            .await
            .map_err(|e| MediaError::InvalidCandidate(e.to_string()))
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            warn!(error = %e, "Error closing peer connection");
        }
    }
}

fn from_init(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_m_line_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}

fn to_init(candidate: IceCandidate) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: candidate.candidate,
        sdp_mid: candidate.sdp_mid,
        sdp_mline_index: candidate.sdp_m_line_index,
        username_fragment: candidate.username_fragment,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[test]
    fn test_candidate_conversion_keeps_fields() {
        let wire = IceCandidate {
            candidate: "candidate:1 1 udp 2122260223 10.0.0.2 5000 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_m_line_index: Some(0),
            username_fragment: Some("abcd".into()),
        };
        assert_eq!(from_init(to_init(wire.clone())), wire);
    }

    #[test]
    fn test_local_media_flags() {
        let media = WebRtcLocalMedia::new();
        assert_eq!(media.tracks().len(), 2);
        media.set_audio_enabled(false);
        assert!(!media.is_audio_enabled());
        assert!(media.is_video_enabled());
        media.stop();
        assert!(!media.is_video_enabled());
    }

    #[test]
    fn test_empty_ice_list_falls_back_to_stun() {
        let runtime = WebRtcRuntime::new(Vec::new());
        let config = runtime.configuration();
        assert_eq!(config.ice_servers[0].urls, vec![DEFAULT_STUN_SERVER.to_string()]);
    }

    #[tokio::test]
    async fn test_local_offer_answer_exchange() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let runtime = WebRtcRuntime::new(Vec::new());

        let caller_media = runtime.acquire_local_media().await.unwrap();
        let caller = runtime
            .open_peer(caller_media, PeerEventSink::new(1, tx.clone()))
            .await
            .unwrap();
        let callee_media = runtime.acquire_local_media().await.unwrap();
        let callee = runtime
            .open_peer(callee_media, PeerEventSink::new(1, tx))
            .await
            .unwrap();

        let offer = caller.create_offer().await.unwrap();
        assert!(offer.starts_with("v=0"));
        let answer = callee.accept_offer(offer).await.unwrap();
        assert!(answer.starts_with("v=0"));
        caller.apply_answer(answer).await.unwrap();

        caller.close().await;
        callee.close().await;
    }

    #[tokio::test]
    async fn test_garbage_offer_is_invalid_description() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let runtime = WebRtcRuntime::new(Vec::new());
        let media = runtime.acquire_local_media().await.unwrap();
        let link = runtime
            .open_peer(media, PeerEventSink::new(1, tx))
            .await
            .unwrap();

        let err = link.accept_offer("not sdp".into()).await.unwrap_err();
        assert!(matches!(err, MediaError::InvalidDescription(_)));
        link.close().await;
    }
}
