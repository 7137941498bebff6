//! Application state shared across handlers.

use std::sync::Arc;

use crate::exec::ExecutionController;
use crate::languages::LanguageRegistry;
use crate::relay::RelayHub;
use crate::session::SessionManager;

/// Shared application state.
///
/// All services are constructed once at startup and injected here; handlers
/// never reach for globals.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<LanguageRegistry>,
    pub sessions: Arc<SessionManager>,
    pub controller: Arc<ExecutionController>,
    pub relay: Arc<RelayHub>,
}
