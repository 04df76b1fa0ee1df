pub mod reconnect;
pub mod registry;
pub mod supervisor;

pub use reconnect::{ReconnectConfig, ReconnectController};
pub use registry::{HandleSnapshot, SessionRegistry};
pub use supervisor::{InboundSink, Supervisor};
