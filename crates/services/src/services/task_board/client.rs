use async_trait::async_trait;
use reqwest::{Client as HttpClient, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{
    config::BoardConfig,
    model::{NewTask, TaskPatch, TaskRecord, de_tasks},
};

#[derive(Debug, Error)]
pub enum TaskServiceError {
    #[error(transparent)]
    Transport(#[from] reqwest::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error(transparent)]
    Url(#[from] url::ParseError),
    #[error("task service rejected credentials")]
    Unauthorized,
    #[error("task service responded with status {0}")]
    Status(u16),
    #[error("task service error: {0}")]
    Other(String),
}

/// Server-side pre-filter applied to retrieval requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskScope {
    All,
    Assignee(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeleteScope {
    /// Remove this task (or this occurrence of a repeating task).
    ThisInstance,
    /// Remove the task and cancel every future repeat.
    StopRepeating,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskListResponse {
    #[serde(default, deserialize_with = "de_tasks")]
    pub tasks: Vec<TaskRecord>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskPageResponse {
    #[serde(default, deserialize_with = "de_tasks")]
    pub tasks: Vec<TaskRecord>,
    #[serde(default)]
    pub has_more: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteTaskRequest {
    pub scope: DeleteScope,
    pub stop_repeating: bool,
}

impl From<DeleteScope> for DeleteTaskRequest {
    fn from(scope: DeleteScope) -> Self {
        Self {
            scope,
            stop_repeating: scope == DeleteScope::StopRepeating,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum TaskEnvelope {
    Wrapped { task: TaskRecord },
    Bare(TaskRecord),
}

impl TaskEnvelope {
    fn into_task(self) -> TaskRecord {
        match self {
            TaskEnvelope::Wrapped { task } | TaskEnvelope::Bare(task) => task,
        }
    }
}

/// Remote collaborator owning the authoritative task collection.
#[async_trait]
pub trait TaskService: Send + Sync + 'static {
    async fn list_all(&self, scope: &TaskScope) -> Result<TaskListResponse, TaskServiceError>;

    async fn list_page(
        &self,
        page: u32,
        page_size: u32,
        scope: &TaskScope,
    ) -> Result<TaskPageResponse, TaskServiceError>;

    async fn update(&self, id: &str, patch: &TaskPatch) -> Result<TaskRecord, TaskServiceError>;

    async fn delete(&self, id: &str, scope: DeleteScope) -> Result<(), TaskServiceError>;

    async fn create(&self, task: &NewTask) -> Result<TaskRecord, TaskServiceError>;
}

#[derive(Clone)]
pub struct HttpTaskService {
    config: BoardConfig,
    client: HttpClient,
}

impl HttpTaskService {
    pub fn new(config: BoardConfig) -> Self {
        Self {
            config,
            client: HttpClient::new(),
        }
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.config.bearer_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, TaskServiceError> {
        let resp = self
            .authorize(request)
            .send()
            .await
            .map_err(TaskServiceError::Transport)?;

        if resp.status() == StatusCode::UNAUTHORIZED {
            return Err(TaskServiceError::Unauthorized);
        }
        if !resp.status().is_success() {
            return Err(TaskServiceError::Status(resp.status().as_u16()));
        }
        Ok(resp)
    }
}

fn append_scope(url: &mut url::Url, scope: &TaskScope) {
    if let TaskScope::Assignee(who) = scope {
        url.query_pairs_mut().append_pair("assignee", who);
    }
}

#[async_trait]
impl TaskService for HttpTaskService {
    async fn list_all(&self, scope: &TaskScope) -> Result<TaskListResponse, TaskServiceError> {
        let mut url = self.config.list_all_endpoint()?;
        append_scope(&mut url, scope);

        let resp = self.send(self.client.get(url)).await?;
        let bytes = resp.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn list_page(
        &self,
        page: u32,
        page_size: u32,
        scope: &TaskScope,
    ) -> Result<TaskPageResponse, TaskServiceError> {
        let mut url = self.config.list_page_endpoint()?;
        {
            let mut qp = url.query_pairs_mut();
            qp.append_pair("page", &page.to_string());
            qp.append_pair("pageSize", &page_size.to_string());
            qp.append_pair("sort", "dueDate");
        }
        append_scope(&mut url, scope);

        let resp = self.send(self.client.get(url)).await?;
        let bytes = resp.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn update(&self, id: &str, patch: &TaskPatch) -> Result<TaskRecord, TaskServiceError> {
        let url = self.config.task_endpoint(id)?;
        let resp = self.send(self.client.patch(url).json(patch)).await?;
        let bytes = resp.bytes().await?;
        let envelope: TaskEnvelope = serde_json::from_slice(&bytes)?;
        Ok(envelope.into_task())
    }

    async fn delete(&self, id: &str, scope: DeleteScope) -> Result<(), TaskServiceError> {
        let url = self.config.task_endpoint(id)?;
        let body = DeleteTaskRequest::from(scope);
        self.send(self.client.delete(url).json(&body)).await?;
        Ok(())
    }

    async fn create(&self, task: &NewTask) -> Result<TaskRecord, TaskServiceError> {
        let url = self.config.create_task_endpoint()?;
        let resp = self.send(self.client.post(url).json(task)).await?;
        let bytes = resp.bytes().await?;
        let envelope: TaskEnvelope = serde_json::from_slice(&bytes)?;
        Ok(envelope.into_task())
    }
}
