use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State as AxumState, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get},
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{info, warn};
use uuid::Uuid;

use super::types::{Stats, TaskServer, Worker};
use crate::tasks::types::{State, Task, TaskEvent};

/// Error body returned by the API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ErrResponse {
    pub http_status_code: u16,
    pub message: String,
}

impl ErrResponse {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        ErrResponse {
            http_status_code: status.as_u16(),
            message: message.into(),
        }
    }
}

impl IntoResponse for ErrResponse {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.http_status_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self)).into_response()
    }
}

impl TaskServer {
    pub fn new(worker: Arc<Worker>, address: &str, port: u16) -> Self {
        Self {
            worker,
            address: address.to_string(),
            port,
        }
    }

    async fn get_tasks(AxumState(server): AxumState<Arc<TaskServer>>) -> Json<Vec<Task>> {
        Json(server.worker.get_tasks().await)
    }

    async fn get_task(
        AxumState(server): AxumState<Arc<TaskServer>>,
        Path(id): Path<String>,
    ) -> Result<Json<Task>, ErrResponse> {
        let id = parse_task_id(&id)?;
        match server.worker.get_task(&id).await {
            Some(task) => Ok(Json(task)),
            None => Err(ErrResponse::new(
                StatusCode::NOT_FOUND,
                format!("No task with ID {} found", id),
            )),
        }
    }

    async fn start_task(
        AxumState(server): AxumState<Arc<TaskServer>>,
        payload: Result<Json<TaskEvent>, JsonRejection>,
    ) -> Result<(StatusCode, Json<Task>), ErrResponse> {
        let Json(task_event) = payload.map_err(|rejection| {
            let message = format!("Error unmarshalling body: {}", rejection.body_text());
            warn!("{}", message);
            ErrResponse::new(StatusCode::BAD_REQUEST, message)
        })?;

        // Container and timing fields are only ever set by the worker.
        let mut task = task_event.task;
        task.container_id = None;
        task.start_time = None;
        task.finish_time = None;

        server.worker.add_task(task.clone()).await;
        info!(task_id = %task.id, event_id = %task_event.id, "added task");
        Ok((StatusCode::CREATED, Json(task)))
    }

    async fn stop_task(
        AxumState(server): AxumState<Arc<TaskServer>>,
        Path(id): Path<String>,
    ) -> Result<StatusCode, ErrResponse> {
        let id = parse_task_id(&id)?;

        let Some(mut task_copy) = server.worker.get_task(&id).await else {
            warn!(task_id = %id, "no task with this id");
            return Err(ErrResponse::new(
                StatusCode::NOT_FOUND,
                format!("No task with ID {} found", id),
            ));
        };

        task_copy.state = State::Completed;
        let container_id = task_copy.container_id.clone();
        server.worker.add_task(task_copy).await;

        info!(task_id = %id, container_id = ?container_id, "added task to stop container");
        Ok(StatusCode::NO_CONTENT)
    }

    async fn missing_task_id() -> ErrResponse {
        warn!("no taskId in the request");
        ErrResponse::new(StatusCode::BAD_REQUEST, "No taskId in the request")
    }

    async fn get_stats(AxumState(server): AxumState<Arc<TaskServer>>) -> Json<Stats> {
        let stats = server.worker.stats();
        Json(stats.as_ref().clone())
    }

    pub fn router(self: Arc<Self>) -> Router {
        Router::new()
            .route(
                "/tasks",
                get(TaskServer::get_tasks)
                    .post(TaskServer::start_task)
                    .delete(TaskServer::missing_task_id),
            )
            .route("/tasks/", delete(TaskServer::missing_task_id))
            .route(
                "/tasks/{id}",
                get(TaskServer::get_task).delete(TaskServer::stop_task),
            )
            .route("/stats", get(TaskServer::get_stats))
            .with_state(self)
    }

    /// Serves the API until Ctrl-C is received.
    pub async fn start_server(self) -> std::io::Result<()> {
        let address = format!("{}:{}", self.address, self.port);
        let app = Arc::new(self).router();

        let listener = TcpListener::bind(&address).await?;
        info!(%address, "listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = tokio::signal::ctrl_c().await;
                info!("shutting down");
            })
            .await
    }
}

fn parse_task_id(raw: &str) -> Result<Uuid, ErrResponse> {
    if raw.is_empty() {
        return Err(ErrResponse::new(StatusCode::BAD_REQUEST, "No taskId in the request"));
    }
    Uuid::parse_str(raw).map_err(|e| {
        ErrResponse::new(
            StatusCode::BAD_REQUEST,
            format!("Invalid taskId {:?}: {}", raw, e),
        )
    })
}
