// Call session state machine and the media runtime it drives.

pub mod call;
pub mod driver;
pub mod peer;
pub mod webrtc_peer;

pub use call::{
    CallCompletion, CallEffect, CallError, CallMachine, CallNotice, CallPhaseKind, CallRole,
    EndReason,
};
pub use driver::CallDriver;
pub use peer::{
    LocalMedia, LocalMediaHandle, MediaRuntime, PeerEvent, PeerEventSink, PeerLink, PeerLinkHandle,
};
pub use webrtc_peer::{WebRtcLocalMedia, WebRtcRuntime};
