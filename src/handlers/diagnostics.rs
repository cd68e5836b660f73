use axum::{extract::State, http::StatusCode, Json};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, OnceLock};
use sysinfo::System;
use tracing::info;

use crate::models::{DiagnosticsResponse, ErrorResponse};
use crate::state::AppState;

static SYSTEM_MONITOR: OnceLock<Mutex<System>> = OnceLock::new();

/// Relay and process diagnostics
pub async fn diagnostics(
    State(app_state): State<Arc<AppState>>,
) -> Result<(StatusCode, Json<DiagnosticsResponse>), (StatusCode, Json<ErrorResponse>)> {
    let n_channels = app_state.hub.channel_count().await as u32;
    let n_subscribers = app_state.hub.subscriber_count().await as u32;
    let n_relay_conn = app_state.relay_connections.load(Ordering::SeqCst);
    let n_cached_profiles = app_state.directory.cached_profiles() as u32;

    // System stats
    let (cpu_usage, memory_alloc, memory_free, memory_total) = {
        let sys_lock = SYSTEM_MONITOR.get_or_init(|| Mutex::new(System::new_all()));
        match sys_lock.lock() {
            Ok(mut sys) => {
                sys.refresh_cpu();
                sys.refresh_memory();
                (
                    sys.global_cpu_info().cpu_usage(),
                    sys.used_memory(),
                    sys.free_memory(),
                    sys.total_memory(),
                )
            }
            Err(_) => (0.0, 0, 0, 0),
        }
    };

    info!(
        "Diagnostics: CPU: {:.2}%, Mem: {}/{} MB (Free: {} MB), Conn: {}, Channels: {}",
        cpu_usage,
        memory_alloc / 1024 / 1024,
        memory_total / 1024 / 1024,
        memory_free / 1024 / 1024,
        n_relay_conn,
        n_channels
    );

    Ok((
        StatusCode::OK,
        Json(DiagnosticsResponse {
            n_channels,
            n_subscribers,
            n_relay_conn,
            n_cached_profiles,
            cpu_usage,
            memory_alloc,
            memory_total,
            memory_free,
        }),
    ))
}
