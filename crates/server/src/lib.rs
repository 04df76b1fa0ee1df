pub mod context;
pub mod gateway;

pub use context::AppContext;
pub use gateway::Gateway;
