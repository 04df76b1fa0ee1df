use std::sync::Arc;
use std::time::Instant;
use wabridge_core::bus::EventBus;
use wabridge_core::limits::LimitGuard;
use wabridge_core::store::SessionStore;
use wabridge_core::usage::UsageMeter;
use wabridge_outbound::OutboundQueue;
use wabridge_session::Supervisor;

/// Everything route handlers need, threaded explicitly instead of living in
/// process globals.
#[derive(Clone)]
pub struct AppContext {
    pub store: Arc<dyn SessionStore>,
    pub supervisor: Arc<Supervisor>,
    pub queue: Arc<OutboundQueue>,
    pub bus: Arc<EventBus>,
    pub guard: LimitGuard,
    pub meter: UsageMeter,
    pub started_at: Instant,
}

impl AppContext {
    pub fn new(
        store: Arc<dyn SessionStore>,
        supervisor: Arc<Supervisor>,
        queue: Arc<OutboundQueue>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            guard: LimitGuard::new(store.clone()),
            meter: UsageMeter::new(store.clone()),
            store,
            supervisor,
            queue,
            bus,
            started_at: Instant::now(),
        }
    }
}
