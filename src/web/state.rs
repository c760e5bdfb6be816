use crate::session::Session;
use std::sync::Arc;

/// Shared application state for the web server. All query logic lives in
/// the session; the handlers only translate HTTP to core calls.
pub struct AppState {
    pub session: Arc<Session>,
    pub startup_time: chrono::DateTime<chrono::Utc>,
}

impl AppState {
    pub fn new(session: Arc<Session>) -> Self {
        Self {
            session,
            startup_time: chrono::Utc::now(),
        }
    }
}
