// Network layer: the persistent WebSocket connection and the HTTP collaborator client.

pub mod api;
pub mod connection;
pub mod transport;

pub use api::{
    ApiClient, ConversationSummary, HealthStatus, PaymentIntent, Registration, ServiceApi,
    UserSummary,
};
pub use connection::{
    connect, CloseReason, ConnectionConfig, ConnectionEvent, ConnectionHandle, ConnectionManager,
};
pub use transport::{endpoint_for, ws_base_from_api};
