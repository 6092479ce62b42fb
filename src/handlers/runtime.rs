//! Runtime control endpoints.
//!
//! `POST /runtime/housekeeper_execute` wakes the housekeeper and
//! `POST /runtime/config_cache_reload` wakes the configuration reloader.
//! A request for a task that is already running is refused, not queued.

use axum::{extract::State, http::StatusCode, response::IntoResponse};
use tracing::{info, instrument};

use crate::control::{TriggerOutcome, Wakeup};
use crate::state::SharedState;

fn respond(wakeup: &Wakeup) -> (StatusCode, String) {
    match wakeup.trigger() {
        TriggerOutcome::Scheduled => (
            StatusCode::ACCEPTED,
            format!("Forced execution of {}\n", wakeup.name()),
        ),
        TriggerOutcome::AlreadyRunning => (
            StatusCode::CONFLICT,
            format!("{} is already running\n", wakeup.name()),
        ),
    }
}

/// Handler for POST /runtime/housekeeper_execute.
#[instrument(skip(state))]
pub async fn housekeeper_execute_handler(State(state): State<SharedState>) -> impl IntoResponse {
    info!("Runtime control: housekeeper_execute");
    respond(&state.housekeeper_wakeup)
}

/// Handler for POST /runtime/config_cache_reload.
#[instrument(skip(state))]
pub async fn config_cache_reload_handler(State(state): State<SharedState>) -> impl IntoResponse {
    info!("Runtime control: config_cache_reload");
    respond(&state.reload_wakeup)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_busy_task_refuses_trigger() {
        let wakeup = Wakeup::new("housekeeper");
        assert_eq!(respond(&wakeup).0, StatusCode::ACCEPTED);
        let _busy = wakeup.busy();
        let (status, body) = respond(&wakeup);
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(body.contains("already running"));
    }
}
