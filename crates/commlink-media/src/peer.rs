//! Seam between the call state machine and the media engine.
//!
//! The machine never touches capture devices or the peer connection
//! directly: it asks a [`MediaRuntime`] for them and drives the returned
//! handles. Anything the runtime reports later (trickled candidates,
//! connection state) comes back through a [`PeerEventSink`] tagged with the
//! call epoch it was opened for.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use webrtc::track::track_local::TrackLocal;

use commlink_shared::error::MediaError;
use commlink_shared::protocol::IceCandidate;

use crate::call::CallCompletion;

/// Local capture tracks (microphone, camera).
pub trait LocalMedia: Send + Sync {
    /// Stop every track. Idempotent.
    fn stop(&self);

    fn set_audio_enabled(&self, enabled: bool);

    fn set_video_enabled(&self, enabled: bool);

    /// Tracks to attach to a peer connection. Runtimes that do not carry
    /// real media return none.
    fn tracks(&self) -> Vec<Arc<dyn TrackLocal + Send + Sync>> {
        Vec::new()
    }
}

pub type LocalMediaHandle = Arc<dyn LocalMedia>;

/// One peer connection with local tracks attached.
#[async_trait]
pub trait PeerLink: Send + Sync {
    /// Create an offer and set it as the local description.
    async fn create_offer(&self) -> Result<String, MediaError>;

    /// Set `offer` as the remote description, then create an answer and set
    /// it locally. Returns the answer SDP.
    async fn accept_offer(&self, offer: String) -> Result<String, MediaError>;

    /// Set `answer` as the remote description.
    async fn apply_answer(&self, answer: String) -> Result<(), MediaError>;

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), MediaError>;

    async fn close(&self);
}

pub type PeerLinkHandle = Arc<dyn PeerLink>;

#[async_trait]
pub trait MediaRuntime: Send + Sync + 'static {
    async fn acquire_local_media(&self) -> Result<LocalMediaHandle, MediaError>;

    /// Build a peer connection carrying `media`. Events produced by the
    /// connection must be posted to `events`.
    async fn open_peer(
        &self,
        media: LocalMediaHandle,
        events: PeerEventSink,
    ) -> Result<PeerLinkHandle, MediaError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    /// A locally gathered ICE candidate to relay to the peer.
    LocalCandidate(IceCandidate),
    /// Media is flowing.
    Connected,
    /// The connection failed or was lost after being established.
    Failed(String),
}

/// Where a peer connection reports its events.
#[derive(Debug, Clone)]
pub struct PeerEventSink {
    epoch: u64,
    tx: mpsc::UnboundedSender<CallCompletion>,
}

impl PeerEventSink {
    pub fn new(epoch: u64, tx: mpsc::UnboundedSender<CallCompletion>) -> Self {
        Self { epoch, tx }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Returns `false` once the session loop is gone.
    pub fn post(&self, event: PeerEvent) -> bool {
        self.tx
            .send(CallCompletion::Peer {
                epoch: self.epoch,
                event,
            })
            .is_ok()
    }
}
