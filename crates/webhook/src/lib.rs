pub mod dispatcher;
pub mod envelope;
pub mod sync;

pub use dispatcher::{WebhookConfig, WebhookDispatcher};
pub use sync::SyncJob;
