use thiserror::Error;

#[derive(Error, Debug)]
pub enum CommlinkError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Authentication error: {0}")]
    Auth(#[from] AuthError),

    #[error("Media error: {0}")]
    Media(#[from] MediaError),

    #[error("Signaling error: {0}")]
    Signaling(#[from] SignalingError),

    #[error("Application error: {0}")]
    Application(#[from] ApplicationError),
}

impl From<ConnectError> for CommlinkError {
    fn from(e: ConnectError) -> Self {
        match e {
            ConnectError::Transport(t) => Self::Transport(t),
            ConnectError::Auth(a) => Self::Auth(a),
        }
    }
}

/// The persistent connection failed or went away.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("No open connection")]
    NotConnected,

    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Connect timed out")]
    Timeout,

    #[error("Frame encoding failed: {0}")]
    Encode(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("Credential rejected (HTTP {status})")]
    Rejected { status: u16 },

    #[error("No credential available")]
    MissingCredential,

    #[error("Credential is not a valid header value")]
    InvalidCredential,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Auth(#[from] AuthError),
}

/// Capture or peer-connection failures reported by the media runtime.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("Media permission denied")]
    PermissionDenied,

    #[error("Capture device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Peer connection failed: {0}")]
    PeerConnection(String),

    #[error("Invalid session description: {0}")]
    InvalidDescription(String),

    #[error("Invalid ICE candidate: {0}")]
    InvalidCandidate(String),
}

/// Malformed or out-of-sequence signaling.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalingError {
    #[error("Malformed frame: {0}")]
    Malformed(String),

    #[error("Missing frame type")]
    MissingType,

    #[error("Unexpected {frame} while {phase}")]
    OutOfSequence { frame: String, phase: String },
}

/// Non-success responses (or unusable bodies) from collaborator endpoints.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApplicationError {
    #[error("HTTP {status}: {detail}")]
    Status { status: u16, detail: String },

    #[error("Request failed: {0}")]
    Request(String),

    #[error("Unexpected response body: {0}")]
    Decode(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}
