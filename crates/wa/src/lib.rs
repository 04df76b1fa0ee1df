pub mod auth;
pub mod client;
pub mod stub;

pub use auth::AuthState;
pub use client::{
    DisconnectReason, GroupMetadata, GroupParticipant, InboundMessage, MessageBatchKind, WaClient,
    WaConnector, WaEvent,
};
