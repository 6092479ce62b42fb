//! Integration tests for the admin HTTP handlers.
//!
//! The handlers are called directly with a state built the same way the
//! binary builds it, backed by an in-memory database.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;

use herakles_proxy::config::Config;
use herakles_proxy::handlers::{
    config_cache_reload_handler, housekeeper_execute_handler, metrics_handler, stats::collect_report,
};
use herakles_proxy::history::{HistoryValue, Timespec, Value};
use herakles_proxy::state::{AppState, SharedState};
use herakles_proxy::store::{Store, Stream};

fn state() -> SharedState {
    let config = Config {
        server: Some("127.0.0.1".into()),
        hostname: Some("proxy-test".into()),
        ..Config::default()
    };
    Arc::new(AppState::build(config, None, Store::open_in_memory().unwrap()).unwrap())
}

#[tokio::test]
async fn test_metrics_reflect_component_state() {
    let state = state();
    let values: Vec<HistoryValue> = (0..3)
        .map(|i| HistoryValue::new(1, Timespec::new(1000 + i, 0), Value::Uint(1)))
        .collect();
    state.store.insert_history(&values).unwrap();
    state.store.commit_delivery(&[(Stream::History, 2)], &[]).unwrap();

    let body = metrics_handler(State(state.clone())).await.unwrap();
    assert!(body.contains("herakles_proxy_checkpoint_lastid{stream=\"history\"} 2"));
    assert!(body.contains("herakles_proxy_server_link_up 1"));
    assert!(body.contains("herakles_proxy_write_buffer_queued_values 0"));
}

#[tokio::test]
async fn test_stats_report() {
    let state = state();
    state
        .store
        .insert_history(&[HistoryValue::new(5, Timespec::new(1000, 0), Value::Uint(1))])
        .unwrap();

    let report = collect_report(&state);
    assert_eq!(report.hostname, "proxy-test");
    assert_eq!(report.checkpoints["history"], 0);
    assert_eq!(report.pending_rows["history"], 1);
    assert!(!report.server_link.down);

    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["value_cache"]["mode"], "normal");
}

#[tokio::test]
async fn test_runtime_control_refuses_busy_task() {
    let state = state();

    let response = housekeeper_execute_handler(State(state.clone()))
        .await
        .into_response();
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let _busy = state.reload_wakeup.busy();
    let response = config_cache_reload_handler(State(state.clone()))
        .await
        .into_response();
    assert_eq!(response.status(), StatusCode::CONFLICT);
}
