use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
};
use hive_process::{InstanceId, InstanceSnapshot, Status};

use crate::error_payload::ApiError;
use crate::logs::{DEFAULT_PAGE_SIZE, LogPage, PageOrder, PageRequest};
use crate::process_handle::ProcessHandle;
use crate::query::HealthProber;
use crate::scheduler::Scheduler;
use crate::supervisor::{NewInstance, Supervisor};

type ApiResult<T> = Result<T, ApiError>;

/// Status carried in response bodies as an HTTP-style code.
pub fn status_code(status: Status) -> u16 {
    match status {
        Status::Running => 200,
        Status::Installing => 202,
        Status::Stopped | Status::Found => 204,
        Status::NotFound => 404,
        Status::Error => 500,
        Status::Unavailable => 503,
    }
}

pub struct ApiState<H, P> {
    pub supervisor: Arc<Supervisor<H, P>>,
    pub scheduler: Arc<Scheduler>,
}

impl<H, P> Clone for ApiState<H, P> {
    fn clone(&self) -> Self {
        Self {
            supervisor: self.supervisor.clone(),
            scheduler: self.scheduler.clone(),
        }
    }
}

impl<H: ProcessHandle, P: HealthProber> ApiState<H, P> {
    pub fn new(supervisor: Arc<Supervisor<H, P>>, scheduler: Arc<Scheduler>) -> Self {
        Self {
            supervisor,
            scheduler,
        }
    }

    /// Queues the install job for `id`. `false` if one is already pending.
    pub fn schedule_install(&self, id: &InstanceId, delay: std::time::Duration) -> bool {
        let supervisor = self.supervisor.clone();
        let job_id = id.clone();
        self.scheduler
            .schedule_once(delay, format!("install:{id}"), move || async move {
                if let Err(e) = supervisor.install(&job_id).await {
                    tracing::error!(instance_id = %job_id, error = %e, "scheduled install failed");
                }
            })
    }
}

#[derive(Debug, serde::Serialize)]
struct HealthzResponse {
    status: &'static str,
    version: &'static str,
    instances: usize,
    free_ports: usize,
}

#[derive(Debug, serde::Serialize)]
pub struct StatusBody {
    pub id: InstanceId,
    pub status: Status,
    pub status_code: u16,
}

impl StatusBody {
    fn new(id: InstanceId, status: Status) -> Self {
        Self {
            id,
            status,
            status_code: status_code(status),
        }
    }
}

#[derive(Debug, serde::Serialize)]
pub struct InstanceView {
    #[serde(flatten)]
    pub snapshot: InstanceSnapshot,
    pub status_code: u16,
}

impl From<InstanceSnapshot> for InstanceView {
    fn from(snapshot: InstanceSnapshot) -> Self {
        Self {
            status_code: status_code(snapshot.status),
            snapshot,
        }
    }
}

#[derive(Debug, serde::Serialize)]
struct CreatedResponse {
    #[serde(flatten)]
    instance: InstanceView,
    install_scheduled: bool,
}

#[derive(Debug, Default, serde::Deserialize)]
struct LogsQuery {
    page: Option<i64>,
    page_size: Option<u32>,
    page_order: Option<PageOrder>,
}

fn parse_id(raw: &str) -> ApiResult<InstanceId> {
    InstanceId::parse(raw).map_err(|e| ApiError(e.into()))
}

async fn healthz<H: ProcessHandle, P: HealthProber>(
    State(state): State<ApiState<H, P>>,
) -> ApiResult<Json<HealthzResponse>> {
    let instances = state.supervisor.list()?.len();
    let free_ports = state.supervisor.allocator().available_ports().await?.len();
    Ok(Json(HealthzResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        instances,
        free_ports,
    }))
}

async fn list_instances<H: ProcessHandle, P: HealthProber>(
    State(state): State<ApiState<H, P>>,
) -> ApiResult<Json<Vec<InstanceView>>> {
    let mut out = Vec::new();
    for id in state.supervisor.list()? {
        out.push(state.supervisor.snapshot(&id).await?.into());
    }
    Ok(Json(out))
}

async fn create_instance<H: ProcessHandle, P: HealthProber>(
    State(state): State<ApiState<H, P>>,
    Json(req): Json<NewInstance>,
) -> ApiResult<(StatusCode, Json<CreatedResponse>)> {
    let record = state.supervisor.create(req)?;
    let delay = state.supervisor.config().installer_delay();
    let install_scheduled = state.schedule_install(&record.id, delay);
    let snapshot = state.supervisor.snapshot(&record.id).await?;
    Ok((
        StatusCode::CREATED,
        Json(CreatedResponse {
            instance: snapshot.into(),
            install_scheduled,
        }),
    ))
}

async fn get_instance<H: ProcessHandle, P: HealthProber>(
    State(state): State<ApiState<H, P>>,
    Path(id): Path<String>,
) -> ApiResult<Json<InstanceView>> {
    let id = parse_id(&id)?;
    Ok(Json(state.supervisor.snapshot(&id).await?.into()))
}

async fn instance_logs<H: ProcessHandle, P: HealthProber>(
    State(state): State<ApiState<H, P>>,
    Path(id): Path<String>,
    Query(q): Query<LogsQuery>,
) -> ApiResult<Json<LogPage>> {
    let id = parse_id(&id)?;
    let req = PageRequest {
        page_size: q.page_size.unwrap_or(DEFAULT_PAGE_SIZE),
        page_index: q.page.unwrap_or(0),
        order: q.page_order.unwrap_or_default(),
    };
    Ok(Json(state.supervisor.log_page(&id, req).await?))
}

async fn start_instance<H: ProcessHandle, P: HealthProber>(
    State(state): State<ApiState<H, P>>,
    Path(id): Path<String>,
) -> ApiResult<Json<StatusBody>> {
    let id = parse_id(&id)?;
    let status = state.supervisor.start(&id).await?;
    Ok(Json(StatusBody::new(id, status)))
}

async fn stop_instance<H: ProcessHandle, P: HealthProber>(
    State(state): State<ApiState<H, P>>,
    Path(id): Path<String>,
) -> ApiResult<Json<StatusBody>> {
    let id = parse_id(&id)?;
    let status = state.supervisor.stop(&id).await?;
    Ok(Json(StatusBody::new(id, status)))
}

async fn restart_instance<H: ProcessHandle, P: HealthProber>(
    State(state): State<ApiState<H, P>>,
    Path(id): Path<String>,
) -> ApiResult<Json<StatusBody>> {
    let id = parse_id(&id)?;
    let status = state.supervisor.restart(&id).await?;
    Ok(Json(StatusBody::new(id, status)))
}

async fn install_instance<H: ProcessHandle, P: HealthProber>(
    State(state): State<ApiState<H, P>>,
    Path(id): Path<String>,
) -> ApiResult<(StatusCode, Json<StatusBody>)> {
    let id = parse_id(&id)?;
    // Surfaces NotFound before queueing anything.
    let status = state.supervisor.snapshot(&id).await?.status;
    let queued = state.schedule_install(&id, std::time::Duration::ZERO);
    tracing::info!(instance_id = %id, queued, "install requested");
    Ok((StatusCode::ACCEPTED, Json(StatusBody::new(id, status))))
}

pub fn router<H: ProcessHandle, P: HealthProber>(state: ApiState<H, P>) -> Router {
    Router::new()
        .route("/healthz", get(healthz::<H, P>))
        .route(
            "/instances",
            get(list_instances::<H, P>).post(create_instance::<H, P>),
        )
        .route("/instances/:id", get(get_instance::<H, P>))
        .route("/instances/:id/logs", get(instance_logs::<H, P>))
        .route("/instances/:id/start", post(start_instance::<H, P>))
        .route("/instances/:id/stop", post(stop_instance::<H, P>))
        .route("/instances/:id/restart", post(restart_instance::<H, P>))
        .route("/instances/:id/install", post(install_instance::<H, P>))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use axum::body::Body;
    use axum::http::{Method, Request};
    use tower::util::ServiceExt;

    use super::*;
    use crate::supervisor::testing::{Harness, harness, harness_with};

    fn app(h: &Harness) -> Router {
        router(ApiState::new(h.sup.clone(), Arc::new(Scheduler::new())))
    }

    async fn call(
        app: Router,
        method: Method,
        uri: &str,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        let mut req = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(v) => {
                req = req.header("content-type", "application/json");
                Body::from(v.to_string())
            }
            None => Body::empty(),
        };
        let resp = app.oneshot(req.body(body).unwrap()).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    #[test]
    fn status_codes() {
        assert_eq!(status_code(Status::Running), 200);
        assert_eq!(status_code(Status::Stopped), 204);
        assert_eq!(status_code(Status::Found), 204);
        assert_eq!(status_code(Status::NotFound), 404);
        assert_eq!(status_code(Status::Unavailable), 503);
        assert_eq!(status_code(Status::Installing), 202);
        assert_eq!(status_code(Status::Error), 500);
    }

    #[tokio::test]
    async fn healthz_reports_pool() {
        let h = harness();
        let (code, body) = call(app(&h), Method::GET, "/healthz", None).await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["free_ports"], 10);
    }

    #[tokio::test]
    async fn start_stop_round() {
        let h = harness();
        h.installed("lobby", false);

        let (code, body) = call(app(&h), Method::GET, "/instances/lobby", None).await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["status"], "STOPPED");
        assert_eq!(body["status_code"], 204);

        let (_, body) = call(app(&h), Method::POST, "/instances/lobby/start", None).await;
        assert_eq!(body["status"], "RUNNING");
        assert_eq!(body["status_code"], 200);

        let (_, body) = call(app(&h), Method::POST, "/instances/lobby/stop", None).await;
        assert_eq!(body["status"], "STOPPED");
        assert_eq!(h.state().stops.load(Ordering::SeqCst), 1);

        let (_, body) = call(app(&h), Method::GET, "/instances", None).await;
        assert_eq!(body.as_array().unwrap().len(), 1);
        assert_eq!(body[0]["id"], "lobby");
    }

    #[tokio::test]
    async fn errors_carry_code_and_http_status() {
        let h = harness();
        let (code, body) = call(app(&h), Method::GET, "/instances/ghost", None).await;
        assert_eq!(code, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "not_found");

        let (code, body) = call(app(&h), Method::POST, "/instances/a%20b/start", None).await;
        assert_eq!(code, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "invalid_param");
    }

    #[tokio::test]
    async fn create_schedules_install_once() {
        // Keep the install job pending for the whole test.
        let h = harness_with(|cfg, _| cfg.installer_delay_secs = 3600);
        let state = ApiState::new(h.sup.clone(), Arc::new(Scheduler::new()));
        let app = router(state.clone());

        let (code, body) = call(
            app.clone(),
            Method::POST,
            "/instances",
            Some(serde_json::json!({ "id": "lobby", "title": "Lobby" })),
        )
        .await;
        assert_eq!(code, StatusCode::CREATED);
        assert_eq!(body["slug"], "lobby");
        assert_eq!(body["status"], "FOUND");
        assert_eq!(body["install_scheduled"], true);

        let (code, body) = call(
            app,
            Method::POST,
            "/instances",
            Some(serde_json::json!({ "id": "lobby" })),
        )
        .await;
        assert_eq!(code, StatusCode::CONFLICT);
        assert_eq!(body["code"], "already_exists");

        assert!(state.scheduler.has_scheduled("install:lobby"));
        state.scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn logs_are_paged() {
        let h = harness();
        let id = h.installed("lobby", false);
        let dir = h.sup.instance_dir(&h.record(&id));
        std::fs::create_dir_all(&dir).unwrap();
        let text: String = (1..=250).map(|i| format!("line {i}\n")).collect();
        std::fs::write(dir.join("server.log"), text).unwrap();

        let (code, body) = call(
            app(&h),
            Method::GET,
            "/instances/lobby/logs?page=10&page_size=100&page_order=asc",
            None,
        )
        .await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["page_index"], 2);
        assert_eq!(body["total_pages"], 3);
        assert_eq!(body["lines"][0], "line 1");
        assert_eq!(body["lines"][49], "line 50");
    }
}
