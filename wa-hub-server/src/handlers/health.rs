//! `GET /health`: liveness probe. Exempt from bearer auth.

use axum::extract::State;
use axum::response::Json;
use serde_json::{json, Value};
use sysinfo::System;

use crate::infra::app_state::AppState;
use wa_hub_core::system_mode::SystemMode;

pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let mut sys = System::new();
    sys.refresh_cpu_usage();
    sys.refresh_memory();

    let cpu_percent = sys.global_cpu_usage();
    let memory_used_mb = sys.used_memory() / (1024 * 1024);
    let memory_total_mb = sys.total_memory() / (1024 * 1024);

    let system_mode = match state.system_mode.current() {
        SystemMode::Normal => "NORMAL",
        SystemMode::Syncing => "SYNCING",
    };

    Json(json!({
        "status": "ok",
        "uptimeSeconds": state.uptime().as_secs(),
        "cpuPercent": cpu_percent,
        "memoryUsedMb": memory_used_mb,
        "memoryTotalMb": memory_total_mb,
        "instanceCount": state.instances.list().await.len(),
        "systemMode": system_mode,
    }))
}
