//! Application state shared by HTTP handlers and socket tasks

use std::sync::Arc;

use relaydesk_completion::Completer;

use crate::handoff::Handoff;
use crate::registry::ConnectionRegistry;
use crate::routing::ChatRouter;
use crate::store::Store;

pub struct AppState {
    pub handoff: Handoff,
    pub router: ChatRouter,
}

impl AppState {
    pub fn new(store: Store, completer: Arc<dyn Completer>) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let handoff = Handoff::new(store, registry);
        let router = ChatRouter::new(handoff.clone(), completer);
        Self { handoff, router }
    }
}
