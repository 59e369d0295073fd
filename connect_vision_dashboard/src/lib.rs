// THEORY:
// The dashboard is the read side of the liveness protocol. It never caches: every
// request reads the machines' `last_seen` values from the store and classifies
// them with `LivenessPolicy` against the store's clock, the same clock that
// stamped them, so skew on the dashboard host never moves the threshold.
// A machine whose monitor stopped (crash, power loss, network cut, clean
// shutdown) simply ages past the threshold and shows OFFLINE; there is no
// separate error state.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use connect_vision::store::{LivenessRecord, bounded};
use connect_vision::{EventType, LivenessPolicy, MachineId, MonitorStore, VisionError};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Everything a request handler needs.
#[derive(Clone)]
pub struct DashboardState {
    pub store: Arc<dyn MonitorStore>,
    pub policy: LivenessPolicy,
    /// Upper bound on each store call made while serving a request.
    pub store_timeout: Duration,
}

impl DashboardState {
    pub fn new(store: Arc<dyn MonitorStore>, policy: LivenessPolicy) -> Self {
        Self {
            store,
            policy,
            store_timeout: Duration::from_secs(3),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
}

/// One row of the machine overview.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MachineView {
    pub machine_id: MachineId,
    pub name: Option<String>,
    pub last_seen: Option<DateTime<Utc>>,
    pub online: bool,
    pub last_event: Option<EventType>,
    pub last_event_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
pub enum ApiError {
    NotFound(MachineId),
    Store(VisionError),
}

impl From<VisionError> for ApiError {
    fn from(err: VisionError) -> Self {
        ApiError::Store(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(machine_id) => {
                (StatusCode::NOT_FOUND, format!("machine {machine_id} not found"))
            }
            ApiError::Store(err) => {
                warn!(error = %err, "dashboard query failed");
                (StatusCode::SERVICE_UNAVAILABLE, err.to_string())
            }
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

pub fn router(state: DashboardState) -> Router {
    Router::new()
        .route("/api/machines", get(list_machines))
        .route("/api/machines/:id", get(get_machine))
        .route("/healthz", get(|| async { "ok" }))
        .with_state(state)
}

pub async fn list_machines(State(state): State<DashboardState>) -> Result<Json<Vec<MachineView>>, ApiError> {
    let now = bounded(state.store_timeout, state.store.clock()).await?;
    Ok(Json(machine_views(&state, now).await?))
}

pub async fn get_machine(
    State(state): State<DashboardState>,
    Path(machine_id): Path<MachineId>,
) -> Result<Json<MachineView>, ApiError> {
    let record = bounded(state.store_timeout, state.store.liveness())
        .await?
        .into_iter()
        .find(|record| record.machine_id == machine_id)
        .ok_or(ApiError::NotFound(machine_id))?;
    let now = bounded(state.store_timeout, state.store.clock()).await?;
    Ok(Json(view(&state, record, now).await?))
}

/// The overview as of `now`, one entry per known machine.
pub async fn machine_views(state: &DashboardState, now: DateTime<Utc>) -> Result<Vec<MachineView>, VisionError> {
    let records = bounded(state.store_timeout, state.store.liveness()).await?;
    let mut views = Vec::with_capacity(records.len());
    for record in records {
        views.push(view(state, record, now).await?);
    }
    Ok(views)
}

async fn view(state: &DashboardState, record: LivenessRecord, now: DateTime<Utc>) -> Result<MachineView, VisionError> {
    let last_event = bounded(state.store_timeout, state.store.last_event(record.machine_id)).await?;
    let status = state.policy.status(record.machine_id, record.last_seen, now);
    Ok(MachineView {
        machine_id: record.machine_id,
        name: record.name,
        last_seen: status.last_seen,
        online: status.online,
        last_event: last_event.as_ref().map(|event| event.event_type),
        last_event_at: last_event.map(|event| event.timestamp),
    })
}

/// Binds and serves the dashboard in a background task.
pub async fn start_server(cfg: ServerConfig, state: DashboardState) -> anyhow::Result<tokio::task::JoinHandle<()>> {
    let listener = tokio::net::TcpListener::bind(&cfg.bind_addr).await?;
    let local_addr = listener.local_addr()?;
    let threshold = state.policy.online_threshold();
    let app = router(state);

    let server = tokio::spawn(async move {
        info!(addr = %local_addr, online_threshold = ?threshold, "dashboard listening");
        if let Err(err) = axum::serve(listener, app).await {
            warn!(error = %err, "dashboard server stopped");
        }
    });
    Ok(server)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;
    use connect_vision::store::ManualClock;
    use connect_vision::{Event, MemoryStore};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn start() -> DateTime<Utc> {
        DateTime::from_timestamp(1_717_000_000, 0).unwrap()
    }

    fn state(store: &MemoryStore) -> DashboardState {
        DashboardState::new(Arc::new(store.clone()), LivenessPolicy::default())
    }

    #[tokio::test]
    async fn overview_classifies_each_machine_fresh() {
        let clock = ManualClock::new(start());
        let store = MemoryStore::with_clock(clock.clone());
        store.insert_machine(14, "Trimmer 14", None);
        store.insert_machine(15, "Trimmer 15", None);
        store.record_heartbeat(14).await.unwrap();
        store
            .append_event(&Event {
                machine_id: 14,
                event_type: EventType::Place,
                timestamp: start(),
                cycle_id: Some(1),
                metadata: serde_json::json!({ "area": 900 }),
            })
            .await
            .unwrap();
        let state = state(&store);

        let views = machine_views(&state, start() + TimeDelta::seconds(3)).await.unwrap();
        assert_eq!(views.len(), 2);
        assert_eq!(views[0].machine_id, 14);
        assert!(views[0].online);
        assert_eq!(views[0].last_event, Some(EventType::Place));
        assert_eq!(views[0].last_event_at, Some(start()));
        assert_eq!(views[1].name.as_deref(), Some("Trimmer 15"));
        assert!(!views[1].online);
        assert_eq!(views[1].last_seen, None);

        let later = machine_views(&state, start() + TimeDelta::seconds(35)).await.unwrap();
        assert!(!later[0].online);
    }

    #[tokio::test]
    async fn handlers_classify_against_the_store_clock() {
        let clock = ManualClock::new(start());
        let store = MemoryStore::with_clock(clock.clone());
        store.insert_machine(14, "Trimmer 14", None);
        store.record_heartbeat(14).await.unwrap();

        // The host clock is years past `start()`; only the store clock counts.
        clock.advance(TimeDelta::seconds(3));
        let Json(views) = list_machines(State(state(&store))).await.unwrap();
        assert!(views[0].online);
        let Json(one) = get_machine(State(state(&store)), Path(14)).await.unwrap();
        assert!(one.online);

        clock.advance(TimeDelta::seconds(32));
        let Json(views) = list_machines(State(state(&store))).await.unwrap();
        assert!(!views[0].online);
        assert_eq!(views[0].last_seen, Some(start()));
    }

    #[tokio::test]
    async fn unknown_machine_is_not_found() {
        let store = MemoryStore::new();
        let err = get_machine(State(state(&store)), Path(99)).await.unwrap_err();
        assert!(matches!(err, ApiError::NotFound(99)));
        assert_eq!(err.into_response().status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn unreachable_store_is_service_unavailable() {
        let store = MemoryStore::new();
        store.set_available(false);
        let err = list_machines(State(state(&store))).await.unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    async fn http_get(addr: std::net::SocketAddr, path: &str) -> String {
        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn routes_answer_over_http() {
        let store = MemoryStore::new();
        store.insert_machine(14, "Trimmer 14", None);
        store.record_heartbeat(14).await.unwrap();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router(state(&store))).await.unwrap();
        });

        let health = http_get(addr, "/healthz").await;
        assert!(health.starts_with("HTTP/1.1 200"));
        assert!(health.ends_with("ok"));

        let machine = http_get(addr, "/api/machines/14").await;
        assert!(machine.starts_with("HTTP/1.1 200"));
        assert!(machine.contains("\"machine_id\":14"));
        assert!(machine.contains("\"online\":true"));

        let missing = http_get(addr, "/api/machines/99").await;
        assert!(missing.starts_with("HTTP/1.1 404"));
    }
}
