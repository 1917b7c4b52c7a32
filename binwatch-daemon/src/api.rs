//! Read-only HTTP query API over the change store.
//!
//! Every response wraps its payload with the current [`IngestionStatus`] so
//! callers can tell when the stored data may be behind the source:
//!
//! ```json
//! { "data": [...], "ingestion": { "state": "streaming", "lag_secs": 0, "stale": false, ... } }
//! ```
//!
//! Routes:
//!
//! | Route | Parameters |
//! |-------|------------|
//! | `GET /changes` | `database table from to operation pk limit offset` |
//! | `GET /changes/history` | `database table pk` |
//! | `GET /alerts` | `from to severity status rule_id limit` |
//! | `GET /alerts/:id/deliveries` | |
//! | `GET /stats` | |
//! | `GET /tables` | `database` |
//! | `GET /health` | |

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use binwatch_core::config::ApiConfig;
use binwatch_core::error::{BinwatchError, ConfigError, PipelineError};
use binwatch_core::event::MODULE_QUERY_API;
use binwatch_core::pipeline::HealthStatus;
use binwatch_core::plugin::{Plugin, PluginInfo, PluginState, PluginType};
use binwatch_core::types::{DeliveryStatus, Operation, Severity, parse_timestamp};
use binwatch_store::{AlertQuery, ChangeQuery, ChangeStore, StoreError};

use crate::health::{IngestionMonitor, IngestionStatus};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared handler state.
pub struct ApiState {
    store: Arc<ChangeStore>,
    monitor: IngestionMonitor,
    default_limit: usize,
    max_limit: usize,
    started_at: Instant,
}

impl ApiState {
    pub fn new(store: Arc<ChangeStore>, monitor: IngestionMonitor, config: &ApiConfig) -> Self {
        Self {
            store,
            monitor,
            default_limit: config.default_limit,
            max_limit: config.max_limit,
            started_at: Instant::now(),
        }
    }

    /// `limit` parameter, defaulted and capped.
    fn limit(&self, raw: Option<&str>) -> Result<usize, ApiError> {
        match raw {
            None => Ok(self.default_limit.min(self.max_limit)),
            Some(raw) => match raw.trim().parse::<usize>() {
                Ok(0) | Err(_) => Err(ApiError::bad_request(format!(
                    "limit must be a positive integer, got '{raw}'"
                ))),
                Ok(n) => Ok(n.min(self.max_limit)),
            },
        }
    }

    fn envelope<T: Serialize>(&self, data: T) -> Json<Envelope<T>> {
        Json(Envelope {
            data,
            ingestion: self.monitor.snapshot(),
        })
    }

    /// Run a store read on the blocking pool.
    async fn read<T, F>(&self, f: F) -> Result<T, ApiError>
    where
        T: Send + 'static,
        F: FnOnce(&ChangeStore) -> Result<T, StoreError> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || f(&store))
            .await
            .map_err(|e| ApiError::internal(format!("query task failed: {e}")))?
            .map_err(|e| {
                warn!(error = %e, "store query failed");
                ApiError::internal(e.to_string())
            })
    }
}

/// Response body: payload plus ingestion indicator.
#[derive(Debug, Serialize)]
pub struct Envelope<T> {
    pub data: T,
    pub ingestion: IngestionStatus,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

/// Handler error rendered as `{"error": "..."}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorBody {
                error: self.message,
            }),
        )
            .into_response()
    }
}

/// Build the router. Exposed for in-process tests.
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/changes", get(list_changes))
        .route("/changes/history", get(change_history))
        .route("/alerts", get(list_alerts))
        .route("/alerts/:id/deliveries", get(alert_deliveries))
        .route("/stats", get(get_stats))
        .route("/tables", get(list_tables))
        .route("/health", get(health))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

// --- parameters ---

#[derive(Debug, Default, Deserialize)]
struct ChangesParams {
    database: Option<String>,
    table: Option<String>,
    from: Option<String>,
    to: Option<String>,
    operation: Option<String>,
    pk: Option<String>,
    limit: Option<String>,
    offset: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct HistoryParams {
    database: Option<String>,
    table: Option<String>,
    pk: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct AlertsParams {
    from: Option<String>,
    to: Option<String>,
    severity: Option<String>,
    status: Option<String>,
    rule_id: Option<String>,
    limit: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct TablesParams {
    database: Option<String>,
}

fn time_param(name: &str, raw: Option<&str>) -> Result<Option<chrono::DateTime<chrono::Utc>>, ApiError> {
    raw.map(|raw| parse_timestamp(raw).map_err(|e| ApiError::bad_request(format!("{name}: {e}"))))
        .transpose()
}

/// Treat `?table=` and friends as absent.
fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

// --- handlers ---

async fn list_changes(
    State(state): State<Arc<ApiState>>,
    Query(params): Query<ChangesParams>,
) -> Result<impl IntoResponse, ApiError> {
    let operation = params
        .operation
        .as_deref()
        .map(|raw| {
            Operation::from_str_loose(raw)
                .ok_or_else(|| ApiError::bad_request(format!("unknown operation '{raw}'")))
        })
        .transpose()?;
    let offset = match params.offset.as_deref() {
        None => 0,
        Some(raw) => raw.trim().parse::<usize>().map_err(|_| {
            ApiError::bad_request(format!("offset must be a non-negative integer, got '{raw}'"))
        })?,
    };
    let query = ChangeQuery {
        database: non_empty(params.database),
        table: non_empty(params.table),
        from: time_param("from", params.from.as_deref())?,
        to: time_param("to", params.to.as_deref())?,
        operation,
        primary_key: non_empty(params.pk),
        limit: state.limit(params.limit.as_deref())?,
        offset,
    };

    let changes = state.read(move |store| store.query_changes(&query)).await?;
    Ok(state.envelope(changes))
}

async fn change_history(
    State(state): State<Arc<ApiState>>,
    Query(params): Query<HistoryParams>,
) -> Result<impl IntoResponse, ApiError> {
    let table = non_empty(params.table).ok_or_else(|| ApiError::bad_request("table is required"))?;
    let (database, table) = match non_empty(params.database) {
        Some(database) => (database, table),
        None => match table.split_once('.') {
            Some((db, table)) => (db.to_owned(), table.to_owned()),
            None => {
                return Err(ApiError::bad_request(
                    "database is required unless table is qualified as db.table",
                ));
            }
        },
    };
    let pk = non_empty(params.pk).ok_or_else(|| ApiError::bad_request("pk is required"))?;

    let history = state
        .read(move |store| store.record_history(&database, &table, &pk))
        .await?;
    Ok(state.envelope(history))
}

async fn list_alerts(
    State(state): State<Arc<ApiState>>,
    Query(params): Query<AlertsParams>,
) -> Result<impl IntoResponse, ApiError> {
    let severity = params
        .severity
        .as_deref()
        .map(|raw| {
            Severity::from_str_loose(raw)
                .ok_or_else(|| ApiError::bad_request(format!("unknown severity '{raw}'")))
        })
        .transpose()?;
    let status = params
        .status
        .as_deref()
        .map(|raw| {
            DeliveryStatus::from_str_loose(raw)
                .ok_or_else(|| ApiError::bad_request(format!("unknown delivery status '{raw}'")))
        })
        .transpose()?;
    let query = AlertQuery {
        from: time_param("from", params.from.as_deref())?,
        to: time_param("to", params.to.as_deref())?,
        severity,
        status,
        rule_id: non_empty(params.rule_id),
        limit: state.limit(params.limit.as_deref())?,
    };

    let alerts = state.read(move |store| store.query_alerts(&query)).await?;
    Ok(state.envelope(alerts))
}

async fn alert_deliveries(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let deliveries = state.read(move |store| store.deliveries(&id)).await?;
    Ok(state.envelope(deliveries))
}

async fn get_stats(State(state): State<Arc<ApiState>>) -> Result<impl IntoResponse, ApiError> {
    let stats = state.read(|store| store.stats()).await?;
    Ok(state.envelope(stats))
}

async fn list_tables(
    State(state): State<Arc<ApiState>>,
    Query(params): Query<TablesParams>,
) -> Result<impl IntoResponse, ApiError> {
    let database = non_empty(params.database);
    let tables = state
        .read(move |store| store.tables(database.as_deref()))
        .await?;
    Ok(state.envelope(tables))
}

#[derive(Debug, Serialize)]
struct HealthBody {
    status: HealthStatus,
    uptime_secs: u64,
}

async fn health(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    let status = state.monitor.health();
    let code = if status.is_unhealthy() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (
        code,
        state.envelope(HealthBody {
            status,
            uptime_secs: state.started_at.elapsed().as_secs(),
        }),
    )
}

// --- plugin ---

/// The query API as a daemon plugin.
pub struct QueryApi {
    info: PluginInfo,
    state: PluginState,
    addr: SocketAddr,
    api: Arc<ApiState>,
    shutdown: CancellationToken,
    task: Option<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

impl QueryApi {
    pub fn new(config: &ApiConfig, api: ApiState) -> Result<Self, BinwatchError> {
        let addr: SocketAddr = format!("{}:{}", config.listen_addr, config.port)
            .parse()
            .map_err(|e| ConfigError::InvalidValue {
                field: "api.listen_addr".to_owned(),
                reason: format!("{e}"),
            })?;
        Ok(Self {
            info: PluginInfo {
                name: MODULE_QUERY_API.to_owned(),
                version: env!("CARGO_PKG_VERSION").to_owned(),
                description: "read-only HTTP query API".to_owned(),
                plugin_type: PluginType::Api,
            },
            state: PluginState::Created,
            addr,
            api: Arc::new(api),
            shutdown: CancellationToken::new(),
            task: None,
            local_addr: None,
        })
    }

    /// Bound address once started. Differs from the configured one when
    /// the port is 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }
}

impl Plugin for QueryApi {
    fn info(&self) -> &PluginInfo {
        &self.info
    }

    fn state(&self) -> PluginState {
        self.state
    }

    async fn init(&mut self) -> Result<(), BinwatchError> {
        if self.addr.ip().is_unspecified() {
            warn!(listen_addr = %self.addr, "query API is exposed on all interfaces");
        }
        self.state = PluginState::Initialized;
        Ok(())
    }

    async fn start(&mut self) -> Result<(), BinwatchError> {
        if self.state == PluginState::Running {
            return Err(PipelineError::AlreadyRunning.into());
        }

        let listener = TcpListener::bind(self.addr).await?;
        let local_addr = listener.local_addr()?;
        let app = router(Arc::clone(&self.api));

        self.shutdown = CancellationToken::new();
        let shutdown = self.shutdown.clone();
        self.task = Some(tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown.cancelled_owned())
                .await
            {
                error!(error = %e, "query API server failed");
            }
        }));

        self.local_addr = Some(local_addr);
        self.state = PluginState::Running;
        info!(listen_addr = %local_addr, "query API listening");
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), BinwatchError> {
        if self.state != PluginState::Running {
            return Err(PipelineError::NotRunning.into());
        }

        self.shutdown.cancel();
        if let Some(mut task) = self.task.take() {
            if tokio::time::timeout(SHUTDOWN_TIMEOUT, &mut task).await.is_err() {
                warn!("query API did not shut down in time, aborting open connections");
                task.abort();
            }
        }

        self.state = PluginState::Stopped;
        info!("query API stopped");
        Ok(())
    }

    async fn health_check(&self) -> HealthStatus {
        match self.state {
            PluginState::Running => HealthStatus::Healthy,
            state => HealthStatus::Unhealthy(format!("query API {state}")),
        }
    }
}
