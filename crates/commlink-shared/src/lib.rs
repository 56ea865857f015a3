// Types, wire protocol and error taxonomy shared by every commlink crate.

pub mod constants;
pub mod error;
pub mod protocol;
pub mod types;

pub use error::{
    ApplicationError, AuthError, CommlinkError, ConnectError, MediaError, SignalingError,
    TransportError,
};
pub use protocol::{decode_inbound, FrameKind, FrameSink, IceCandidate, InboundFrame, OutboundFrame};
pub use types::{Credential, Message, PaymentEvent, PaymentUpdate, UserId, UserProfile};
