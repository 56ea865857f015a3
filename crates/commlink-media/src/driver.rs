use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::debug;

use crate::call::{CallCompletion, CallEffect, CallNotice};
use crate::peer::{MediaRuntime, PeerEventSink};

/// Runs [`CallEffect`]s against a [`MediaRuntime`].
///
/// Each asynchronous effect is spawned on the current tokio runtime and its
/// outcome is posted to `completions` for the session loop to feed back into
/// the machine.
#[derive(Clone)]
pub struct CallDriver {
    runtime: Arc<dyn MediaRuntime>,
    completions: mpsc::UnboundedSender<CallCompletion>,
}

impl CallDriver {
    pub fn new(
        runtime: Arc<dyn MediaRuntime>,
        completions: mpsc::UnboundedSender<CallCompletion>,
    ) -> Self {
        Self {
            runtime,
            completions,
        }
    }

    /// Start every effect; notices are handed back to the caller in order.
    pub fn run(&self, effects: Vec<CallEffect>) -> Vec<CallNotice> {
        let mut notices = Vec::new();
        for effect in effects {
            match effect {
                CallEffect::Notify(notice) => notices.push(notice),
                other => self.spawn(other),
            }
        }
        notices
    }

    fn spawn(&self, effect: CallEffect) {
        let runtime = self.runtime.clone();
        let tx = self.completions.clone();
        debug!(effect = ?effect, "Running call effect");

        match effect {
            CallEffect::AcquireMedia { epoch } => {
                tokio::spawn(async move {
                    let result = runtime.acquire_local_media().await;
                    let _ = tx.send(CallCompletion::MediaAcquired { epoch, result });
                });
            }
            CallEffect::OpenPeer { epoch, media } => {
                tokio::spawn(async move {
                    let events = PeerEventSink::new(epoch, tx.clone());
                    let result = runtime.open_peer(media, events).await;
                    let _ = tx.send(CallCompletion::PeerOpened { epoch, result });
                });
            }
            CallEffect::CreateOffer { epoch, link } => {
                tokio::spawn(async move {
                    let result = link.create_offer().await;
                    let _ = tx.send(CallCompletion::OfferCreated { epoch, result });
                });
            }
            CallEffect::AcceptOffer { epoch, link, sdp } => {
                tokio::spawn(async move {
                    let result = link.accept_offer(sdp).await;
                    let _ = tx.send(CallCompletion::OfferAccepted { epoch, result });
                });
            }
            CallEffect::ApplyAnswer { epoch, link, sdp } => {
                tokio::spawn(async move {
                    let result = link.apply_answer(sdp).await;
                    let _ = tx.send(CallCompletion::AnswerApplied { epoch, result });
                });
            }
            CallEffect::AddCandidate {
                epoch,
                link,
                candidate,
            } => {
                tokio::spawn(async move {
                    let result = link.add_remote_candidate(candidate).await;
                    let _ = tx.send(CallCompletion::CandidateApplied { epoch, result });
                });
            }
            CallEffect::ClosePeer { link } => {
                tokio::spawn(async move {
                    link.close().await;
                });
            }
            CallEffect::ArmSetupTimer { epoch, after } => {
                tokio::spawn(async move {
                    tokio::time::sleep(after).await;
                    let _ = tx.send(CallCompletion::SetupTimeout { epoch });
                });
            }
            CallEffect::Notify(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::{LocalMedia, LocalMediaHandle, PeerLink, PeerLinkHandle};
    use async_trait::async_trait;
    use commlink_shared::error::MediaError;
    use commlink_shared::protocol::IceCandidate;
    use std::time::Duration;

    struct NoMedia;

    impl LocalMedia for NoMedia {
        fn stop(&self) {}
        fn set_audio_enabled(&self, _enabled: bool) {}
        fn set_video_enabled(&self, _enabled: bool) {}
    }

    struct EchoLink;

    #[async_trait]
    impl PeerLink for EchoLink {
        async fn create_offer(&self) -> Result<String, MediaError> {
            Ok("offer".into())
        }

        async fn accept_offer(&self, offer: String) -> Result<String, MediaError> {
            Ok(format!("answer-to-{offer}"))
        }

        async fn apply_answer(&self, _answer: String) -> Result<(), MediaError> {
            Ok(())
        }

        async fn add_remote_candidate(&self, _candidate: IceCandidate) -> Result<(), MediaError> {
            Err(MediaError::InvalidCandidate("bad".into()))
        }

        async fn close(&self) {}
    }

    struct DeniedRuntime;

    #[async_trait]
    impl MediaRuntime for DeniedRuntime {
        async fn acquire_local_media(&self) -> Result<LocalMediaHandle, MediaError> {
            Err(MediaError::PermissionDenied)
        }

        async fn open_peer(
            &self,
            _media: LocalMediaHandle,
            events: PeerEventSink,
        ) -> Result<PeerLinkHandle, MediaError> {
            events.post(crate::peer::PeerEvent::Connected);
            Ok(Arc::new(EchoLink))
        }
    }

    #[tokio::test]
    async fn test_effects_post_completions() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let driver = CallDriver::new(Arc::new(DeniedRuntime), tx);

        let notices = driver.run(vec![
            CallEffect::Notify(CallNotice::IncomingCall {
                from: commlink_shared::types::UserId(4),
            }),
            CallEffect::AcquireMedia { epoch: 3 },
        ]);
        assert_eq!(notices.len(), 1);

        match rx.recv().await.unwrap() {
            CallCompletion::MediaAcquired { epoch, result } => {
                assert_eq!(epoch, 3);
                assert!(matches!(result, Err(MediaError::PermissionDenied)));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_open_peer_forwards_peer_events() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let driver = CallDriver::new(Arc::new(DeniedRuntime), tx);

        driver.run(vec![CallEffect::OpenPeer {
            epoch: 9,
            media: Arc::new(NoMedia),
        }]);

        let first = rx.recv().await.unwrap();
        assert!(matches!(
            first,
            CallCompletion::Peer {
                epoch: 9,
                event: crate::peer::PeerEvent::Connected
            }
        ));
        let second = rx.recv().await.unwrap();
        assert!(matches!(second, CallCompletion::PeerOpened { epoch: 9, result: Ok(_) }));
    }

    #[tokio::test]
    async fn test_accept_offer_and_timer() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let driver = CallDriver::new(Arc::new(DeniedRuntime), tx);

        driver.run(vec![CallEffect::AcceptOffer {
            epoch: 1,
            link: Arc::new(EchoLink),
            sdp: "o".into(),
        }]);
        match rx.recv().await.unwrap() {
            CallCompletion::OfferAccepted { result, .. } => assert_eq!(result.unwrap(), "answer-to-o"),
            other => panic!("unexpected {other:?}"),
        }

        driver.run(vec![CallEffect::ArmSetupTimer {
            epoch: 2,
            after: Duration::from_millis(10),
        }]);
        assert!(matches!(
            rx.recv().await.unwrap(),
            CallCompletion::SetupTimeout { epoch: 2 }
        ));
    }
}
