//! Health registry and the health-check protocol endpoints
//!
//! The registry maps fully-qualified service names to a serving status. It is
//! written by the health poller and by the shutdown sequence, and read by the
//! protocol endpoints:
//!
//! - `POST /grpc.health.v1.Health/Check` - point-in-time status of a service
//! - `POST /grpc.health.v1.Health/Watch` - Server-Sent Events stream of changes
//! - `GET /healthz` - Liveness: Is the process alive?
//! - `GET /readyz` - Readiness: Is the overall server SERVING?

use axum::{
    extract::State,
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info};

/// Namespace prepended to business service names in the registry
pub const HEALTH_SERVICE_PREFIX: &str = "grpc.health.v1";

/// Registry key for the server as a whole
pub const OVERALL_SERVICE: &str = "";

/// Route of the point-in-time check
pub const CHECK_PATH: &str = "/grpc.health.v1.Health/Check";

/// Route of the streaming watch
pub const WATCH_PATH: &str = "/grpc.health.v1.Health/Watch";

/// Registry key for a business service, e.g. `Example` -> `grpc.health.v1.Example`
pub fn qualified_service_name(service: &str) -> String {
    format!("{}.{}", HEALTH_SERVICE_PREFIX, service)
}

/// Serving status of one service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServingStatus {
    Unknown,
    Serving,
    NotServing,
    /// Only reported by `Watch` for names that were never registered;
    /// never accepted by `set_serving_status`
    ServiceUnknown,
}

#[derive(Debug, Error, PartialEq)]
pub enum HealthError {
    #[error("Unknown service: {0:?}")]
    ServiceNotFound(String),
}

impl IntoResponse for HealthError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "error": self.to_string() });
        (StatusCode::NOT_FOUND, Json(body)).into_response()
    }
}

struct RegistryInner {
    strict: bool,
    services: RwLock<HashMap<String, watch::Sender<ServingStatus>>>,
    shut_down: watch::Sender<bool>,
    /// Statuses captured by `shutdown`, restored by `resume`
    saved: Mutex<HashMap<String, ServingStatus>>,
}

/// Shared service-name -> status map
///
/// Cheap to clone; clones share the same map. Each entry is a watch channel,
/// so `Watch` subscribers are woken without holding the map lock.
#[derive(Clone)]
pub struct HealthRegistry {
    inner: Arc<RegistryInner>,
}

fn is_registered(status: ServingStatus) -> bool {
    status != ServingStatus::ServiceUnknown
}

fn update(sender: &watch::Sender<ServingStatus>, status: ServingStatus) {
    sender.send_if_modified(|current| {
        if *current == status {
            false
        } else {
            *current = status;
            true
        }
    });
}

impl HealthRegistry {
    /// Lenient registry: unknown names report UNKNOWN
    pub fn new() -> Self {
        Self::with_strict(false)
    }

    /// Registry that reports never-registered names as not found when `strict`
    ///
    /// The overall server entry starts SERVING.
    pub fn with_strict(strict: bool) -> Self {
        let mut services = HashMap::new();
        services.insert(
            OVERALL_SERVICE.to_string(),
            watch::channel(ServingStatus::Serving).0,
        );
        Self {
            inner: Arc::new(RegistryInner {
                strict,
                services: RwLock::new(services),
                shut_down: watch::channel(false).0,
                saved: Mutex::new(HashMap::new()),
            }),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, watch::Sender<ServingStatus>>> {
        self.inner
            .services
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, watch::Sender<ServingStatus>>> {
        self.inner
            .services
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Current status of `service`
    pub fn check(&self, service: &str) -> Result<ServingStatus, HealthError> {
        let status = self
            .read()
            .get(service)
            .map(|sender| *sender.borrow())
            .filter(|status| is_registered(*status));

        match status {
            Some(status) => Ok(status),
            None if self.inner.strict => Err(HealthError::ServiceNotFound(service.to_string())),
            None => Ok(ServingStatus::Unknown),
        }
    }

    /// Insert an UNKNOWN entry for `service` unless it already has one
    ///
    /// Entries registered after `shutdown` start NOT_SERVING.
    pub fn register(&self, service: &str) {
        let mut services = self.write();
        let initial = if *self.inner.shut_down.borrow() {
            ServingStatus::NotServing
        } else {
            ServingStatus::Unknown
        };
        match services.get(service) {
            Some(sender) if is_registered(*sender.borrow()) => {}
            Some(sender) => update(sender, initial),
            None => {
                services.insert(service.to_string(), watch::channel(initial).0);
            }
        }
    }

    /// Set the status of `service`
    ///
    /// Ignored once the registry has been shut down, so a late poller result
    /// cannot flip a draining server back to SERVING. Returns whether the
    /// update was applied. SERVICE_UNKNOWN is rejected.
    pub fn set_serving_status(&self, service: &str, status: ServingStatus) -> bool {
        if !is_registered(status) {
            debug!(service, "SERVICE_UNKNOWN is not a settable status");
            return false;
        }

        let mut services = self.write();
        if *self.inner.shut_down.borrow() {
            debug!(service, ?status, "Registry shut down, ignoring status update");
            return false;
        }

        match services.get(service) {
            Some(sender) => update(sender, status),
            None => {
                services.insert(service.to_string(), watch::channel(status).0);
            }
        }
        true
    }

    /// Mark every registered service NOT_SERVING and refuse further updates
    ///
    /// Returns `false` if the registry was already shut down.
    pub fn shutdown(&self) -> bool {
        let services = self.write();
        if *self.inner.shut_down.borrow() {
            return false;
        }

        let mut saved = self
            .inner
            .saved
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        saved.clear();
        for (name, sender) in services.iter() {
            let status = *sender.borrow();
            if is_registered(status) {
                saved.insert(name.clone(), status);
                update(sender, ServingStatus::NotServing);
            }
        }
        self.inner.shut_down.send_replace(true);
        info!(services = services.len(), "Health registry marked NOT_SERVING");
        true
    }

    /// Undo `shutdown`: accept updates again and restore the statuses held
    /// before it. Services registered while shut down go back to UNKNOWN.
    pub fn resume(&self) {
        let services = self.write();
        if !self.inner.shut_down.send_replace(false) {
            return;
        }

        let mut saved = self
            .inner
            .saved
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for (name, sender) in services.iter() {
            if !is_registered(*sender.borrow()) {
                continue;
            }
            let status = saved.remove(name).unwrap_or(ServingStatus::Unknown);
            update(sender, status);
        }
        saved.clear();
        info!("Health registry resumed");
    }

    pub fn is_shut_down(&self) -> bool {
        *self.inner.shut_down.borrow()
    }

    /// All registered services and their current status
    pub fn snapshot(&self) -> HashMap<String, ServingStatus> {
        self.read()
            .iter()
            .map(|(name, sender)| (name.clone(), *sender.borrow()))
            .filter(|(_, status)| is_registered(*status))
            .collect()
    }

    /// Subscribe to status changes of `service`
    ///
    /// Unregistered names get a SERVICE_UNKNOWN placeholder that lives only
    /// as long as someone is watching it.
    pub fn watch(&self, service: &str) -> StatusWatch {
        let status = self
            .write()
            .entry(service.to_string())
            .or_insert_with(|| watch::channel(ServingStatus::ServiceUnknown).0)
            .subscribe();

        StatusWatch {
            status,
            shut_down: self.inner.shut_down.subscribe(),
            last: None,
            finished: false,
            registry: self.clone(),
            service: service.to_string(),
        }
    }

    /// Drop the placeholder for `service` once its last watcher is going away
    fn release_watch(&self, service: &str) {
        let mut services = self.write();
        let unwatched = services.get(service).is_some_and(|sender| {
            !is_registered(*sender.borrow()) && sender.receiver_count() <= 1
        });
        if unwatched {
            services.remove(service);
        }
    }

    #[cfg(test)]
    pub(crate) fn entry_count(&self) -> usize {
        self.read().len()
    }
}

impl Default for HealthRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Stream of status values for one service
///
/// Yields the current status first, then every change. Ends after the
/// registry shuts down, once the final status has been yielded.
pub struct StatusWatch {
    status: watch::Receiver<ServingStatus>,
    shut_down: watch::Receiver<bool>,
    last: Option<ServingStatus>,
    finished: bool,
    registry: HealthRegistry,
    service: String,
}

impl Drop for StatusWatch {
    fn drop(&mut self) {
        // Our own receiver is still alive here, hence `<= 1` in release_watch
        self.registry.release_watch(&self.service);
    }
}

async fn wait_shut_down(receiver: &mut watch::Receiver<bool>) {
    while !*receiver.borrow_and_update() {
        if receiver.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

impl StatusWatch {
    /// Next status, or `None` once the stream has ended
    pub async fn next(&mut self) -> Option<ServingStatus> {
        loop {
            if self.finished {
                return None;
            }

            if self.last.is_some() {
                tokio::select! {
                    changed = self.status.changed() => {
                        if changed.is_err() {
                            self.finished = true;
                            return None;
                        }
                    }
                    _ = wait_shut_down(&mut self.shut_down) => {}
                }
            }

            let status = *self.status.borrow_and_update();
            if *self.shut_down.borrow() {
                self.finished = true;
            }
            if self.last == Some(status) {
                continue;
            }
            self.last = Some(status);
            return Some(status);
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = ServingStatus> + Send {
        futures::stream::unfold(self, |mut watch| async move {
            watch.next().await.map(|status| (status, watch))
        })
    }
}

/// Body of Check and Watch requests
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct HealthCheckRequest {
    #[serde(default)]
    pub service: String,
}

/// Body of Check responses and payload of Watch events
#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckResponse {
    pub status: ServingStatus,
}

async fn check(
    State(registry): State<HealthRegistry>,
    Json(request): Json<HealthCheckRequest>,
) -> Result<Json<HealthCheckResponse>, HealthError> {
    let status = registry.check(&request.service)?;
    Ok(Json(HealthCheckResponse { status }))
}

async fn watch_status(
    State(registry): State<HealthRegistry>,
    Json(request): Json<HealthCheckRequest>,
) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    debug!(service = %request.service, "Health watch opened");
    let stream = registry
        .watch(&request.service)
        .into_stream()
        .map(|status| {
            Event::default()
                .event("status")
                .json_data(HealthCheckResponse { status })
        });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

/// Liveness probe handler
///
/// Always returns 200 OK - if this responds, the process is alive.
async fn healthz() -> StatusCode {
    StatusCode::OK
}

/// Readiness probe handler
///
/// Returns 200 OK if the overall server is SERVING, 503 otherwise.
async fn readyz(State(registry): State<HealthRegistry>) -> StatusCode {
    match registry.check(OVERALL_SERVICE) {
        Ok(ServingStatus::Serving) => StatusCode::OK,
        _ => StatusCode::SERVICE_UNAVAILABLE,
    }
}

/// Build the router for the health protocol and probe endpoints
pub fn health_routes(registry: HealthRegistry) -> Router {
    Router::new()
        .route(CHECK_PATH, post(check))
        .route(WATCH_PATH, post(watch_status))
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .with_state(registry)
}
