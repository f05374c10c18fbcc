//! Rendering service client
//!
//! Thin JSON-over-HTTP wrapper around the remote image-generation service.
//! Every call carries the shared secret header when one is configured.

use async_trait::async_trait;
use reqwest::Client as HttpClient;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument};

/// Header carrying the shared secret
pub const SECRET_HEADER: &str = "mj-api-secret";

/// Submission accepted, `result` holds the job id
pub const CODE_SUCCESS: i64 = 1;
/// Action needs a follow-up `/submit/modal` call, `result` holds the task id
pub const CODE_MODAL_REQUIRED: i64 = 21;
/// Submission accepted into the service's queue
pub const CODE_QUEUED: i64 = 22;

/// Errors that can occur while talking to the rendering service
#[derive(Debug, Error)]
pub enum RenderError {
    /// Connection, timeout or transport failure
    #[error("Network error: {0}")]
    Network(String),
    /// Non-success HTTP status
    #[error("API error: {0}")]
    Api(String),
    /// Response body could not be decoded
    #[error("JSON error: {0}")]
    Json(String),
}

/// `{code, description, result}` envelope returned by submissions
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubmitResponse {
    /// Service status code
    #[serde(default)]
    pub code: i64,
    /// Human-readable status
    #[serde(default)]
    pub description: String,
    /// Job id, seed or task id depending on the call
    #[serde(default)]
    pub result: Option<Value>,
}

impl SubmitResponse {
    /// Whether the job was accepted (immediately or queued)
    #[must_use]
    pub const fn is_accepted(&self) -> bool {
        matches!(self.code, CODE_SUCCESS | CODE_QUEUED)
    }

    /// `result` as a string, whether the service sent a string or a number
    #[must_use]
    pub fn result_str(&self) -> Option<String> {
        match self.result.as_ref()? {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}

/// Follow-up action offered on a finished job
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskButton {
    /// Opaque action id passed back to `/submit/action`
    #[serde(default)]
    pub custom_id: String,
    /// Emoji shown on the button
    #[serde(default)]
    pub emoji: String,
    /// Raw label
    #[serde(default)]
    pub label: String,
}

/// Extra job properties
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskProperties {
    /// Prompt produced by describe/shorten jobs
    #[serde(default)]
    pub final_prompt: Option<String>,
}

/// Job as reported by `/task/{id}/fetch` and `/task/list-by-condition`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDetail {
    /// Job id
    pub id: String,
    /// Action kind (`IMAGINE`, `UPSCALE`, `DESCRIBE`, ...)
    #[serde(default)]
    pub action: String,
    /// `SUCCESS`, `FAILURE` or an in-progress status
    #[serde(default)]
    pub status: String,
    /// Prompt or action description
    #[serde(default)]
    pub description: String,
    /// Result image
    #[serde(default)]
    pub image_url: Option<String>,
    /// Follow-up actions
    #[serde(default)]
    pub buttons: Vec<TaskButton>,
    /// Failure reason reported by the service
    #[serde(default)]
    pub fail_reason: Option<String>,
    /// State string the job was submitted with
    #[serde(default)]
    pub state: String,
    /// Extra properties
    #[serde(default)]
    pub properties: TaskProperties,
}

/// Remote status of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    /// Finished with a result
    Succeeded,
    /// Finished without a result
    Failed,
    /// Not finished yet
    Pending,
}

impl TaskDetail {
    /// Parsed status
    #[must_use]
    pub fn status(&self) -> TaskStatus {
        match self.status.as_str() {
            "SUCCESS" => TaskStatus::Succeeded,
            "FAILURE" => TaskStatus::Failed,
            _ => TaskStatus::Pending,
        }
    }

    /// Metadata-only jobs return text and never consume quota
    #[must_use]
    pub fn is_metadata_only(&self) -> bool {
        matches!(self.action.as_str(), "DESCRIBE" | "SHORTEN")
    }
}

/// Operations offered by the rendering service
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RenderClient: Send + Sync {
    /// `POST /submit/imagine`, optionally with a reference image
    async fn submit_imagine(
        &self,
        prompt: &str,
        image_base64: Option<String>,
        state: &str,
    ) -> Result<SubmitResponse, RenderError>;
    /// `POST /submit/describe`
    async fn submit_describe(
        &self,
        image_base64: &str,
        state: &str,
    ) -> Result<SubmitResponse, RenderError>;
    /// `POST /submit/shorten`
    async fn submit_shorten(&self, prompt: &str, state: &str)
        -> Result<SubmitResponse, RenderError>;
    /// `POST /submit/action`
    async fn submit_action(
        &self,
        custom_id: &str,
        task_id: &str,
        state: &str,
    ) -> Result<SubmitResponse, RenderError>;
    /// `POST /submit/modal`
    async fn submit_modal(&self, task_id: &str, state: &str)
        -> Result<SubmitResponse, RenderError>;
    /// `GET /task/{id}/fetch`; `None` when the service does not know the id
    async fn fetch_task(&self, task_id: &str) -> Result<Option<TaskDetail>, RenderError>;
    /// `GET /task/{id}/image-seed`
    async fn image_seed(&self, task_id: &str) -> Result<SubmitResponse, RenderError>;
    /// `POST /task/list-by-condition`
    async fn list_by_condition(&self, ids: &[String]) -> Result<Vec<TaskDetail>, RenderError>;
}

/// `reqwest`-backed client
pub struct HttpRenderClient {
    http: HttpClient,
    base_url: String,
    secret: Option<String>,
}

impl HttpRenderClient {
    /// Creates a client for `base_url` (trailing slashes are ignored)
    #[must_use]
    pub fn new(base_url: &str, secret: Option<String>, timeout: Duration) -> Self {
        let http = HttpClient::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| HttpClient::new());
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            secret,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn with_secret(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.secret {
            Some(secret) => request.header(SECRET_HEADER, secret),
            None => request,
        }
    }

    async fn post<T: DeserializeOwned>(&self, path: &str, body: &Value) -> Result<T, RenderError> {
        debug!(path, "POST to rendering service");
        let request = self.with_secret(self.http.post(self.url(path)).json(body));
        read_json(request.send().await).await
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, RenderError> {
        debug!(path, "GET from rendering service");
        let request = self.with_secret(self.http.get(self.url(path)));
        read_json(request.send().await).await
    }
}

/// Maps transport failures, non-2xx statuses and undecodable bodies onto
/// [`RenderError`]
async fn read_json<T: DeserializeOwned>(
    sent: Result<reqwest::Response, reqwest::Error>,
) -> Result<T, RenderError> {
    let response = sent.map_err(|e| RenderError::Network(e.to_string()))?;

    if !response.status().is_success() {
        let status = response.status();
        let error_text = response.text().await.unwrap_or_default();
        let trimmed = error_text.trim_start();
        let is_html = trimmed.starts_with("<!DOCTYPE")
            || trimmed.starts_with("<html")
            || trimmed.starts_with("<HTML");
        let message = if is_html {
            format!("{status} (Server returned HTML error page)")
        } else {
            format!("{status} - {}", crate::utils::truncate_str(&error_text, 500))
        };
        return Err(RenderError::Api(message));
    }

    response
        .json()
        .await
        .map_err(|e| RenderError::Json(e.to_string()))
}

#[async_trait]
impl RenderClient for HttpRenderClient {
    #[instrument(skip(self, image_base64))]
    async fn submit_imagine(
        &self,
        prompt: &str,
        image_base64: Option<String>,
        state: &str,
    ) -> Result<SubmitResponse, RenderError> {
        let mut body = json!({ "prompt": prompt, "state": state });
        if let Some(image) = image_base64 {
            body["base64"] = Value::String(image);
        }
        self.post("/submit/imagine", &body).await
    }

    #[instrument(skip(self, image_base64))]
    async fn submit_describe(
        &self,
        image_base64: &str,
        state: &str,
    ) -> Result<SubmitResponse, RenderError> {
        self.post(
            "/submit/describe",
            &json!({ "base64": image_base64, "state": state }),
        )
        .await
    }

    #[instrument(skip(self))]
    async fn submit_shorten(
        &self,
        prompt: &str,
        state: &str,
    ) -> Result<SubmitResponse, RenderError> {
        self.post("/submit/shorten", &json!({ "prompt": prompt, "state": state }))
            .await
    }

    #[instrument(skip(self))]
    async fn submit_action(
        &self,
        custom_id: &str,
        task_id: &str,
        state: &str,
    ) -> Result<SubmitResponse, RenderError> {
        self.post(
            "/submit/action",
            &json!({ "customId": custom_id, "taskId": task_id, "state": state }),
        )
        .await
    }

    #[instrument(skip(self))]
    async fn submit_modal(
        &self,
        task_id: &str,
        state: &str,
    ) -> Result<SubmitResponse, RenderError> {
        self.post("/submit/modal", &json!({ "taskId": task_id, "state": state }))
            .await
    }

    #[instrument(skip(self))]
    async fn fetch_task(&self, task_id: &str) -> Result<Option<TaskDetail>, RenderError> {
        // Unknown ids come back as `null`
        let value: Value = self.get(&format!("/task/{task_id}/fetch")).await?;
        match value {
            Value::Null => Ok(None),
            v => serde_json::from_value(v)
                .map(Some)
                .map_err(|e| RenderError::Json(e.to_string())),
        }
    }

    #[instrument(skip(self))]
    async fn image_seed(&self, task_id: &str) -> Result<SubmitResponse, RenderError> {
        self.get(&format!("/task/{task_id}/image-seed")).await
    }

    #[instrument(skip(self), fields(count = ids.len()))]
    async fn list_by_condition(&self, ids: &[String]) -> Result<Vec<TaskDetail>, RenderError> {
        self.post("/task/list-by-condition", &json!({ "ids": ids }))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_detail_decodes_service_payload() {
        let payload = json!({
            "id": "1700000000001",
            "action": "IMAGINE",
            "status": "SUCCESS",
            "description": "/imagine a cat",
            "imageUrl": "https://cdn.example/1.png",
            "failReason": null,
            "state": "r:-100:alice",
            "progress": "100%",
            "buttons": [
                {"customId": "MJ::JOB::upsample::1::abc", "emoji": "", "label": "U1", "type": 2, "style": 2}
            ],
            "properties": {"finalPrompt": "a cat --v 6"}
        });
        let task: TaskDetail = serde_json::from_value(payload).expect("decode");
        assert_eq!(task.status(), TaskStatus::Succeeded);
        assert_eq!(task.buttons[0].label, "U1");
        assert_eq!(task.properties.final_prompt.as_deref(), Some("a cat --v 6"));
        assert!(!task.is_metadata_only());
    }

    #[test]
    fn test_statuses_and_metadata_actions() {
        let mut task = TaskDetail {
            action: "DESCRIBE".into(),
            status: "IN_PROGRESS".into(),
            ..TaskDetail::default()
        };
        assert_eq!(task.status(), TaskStatus::Pending);
        assert!(task.is_metadata_only());
        task.status = "FAILURE".into();
        assert_eq!(task.status(), TaskStatus::Failed);
    }

    #[test]
    fn test_submit_response_result_forms() {
        let queued: SubmitResponse = serde_json::from_value(json!({
            "code": 22, "description": "In queue, 2 ahead", "result": "123"
        }))
        .expect("decode");
        assert!(queued.is_accepted());
        assert_eq!(queued.result_str().as_deref(), Some("123"));

        let numeric: SubmitResponse =
            serde_json::from_value(json!({"code": 1, "result": 456})).expect("decode");
        assert_eq!(numeric.result_str().as_deref(), Some("456"));

        let rejected: SubmitResponse =
            serde_json::from_value(json!({"code": 4, "description": "banned prompt"}))
                .expect("decode");
        assert!(!rejected.is_accepted());
        assert_eq!(rejected.result_str(), None);
    }

    #[test]
    fn test_base_url_is_normalised() {
        let client = HttpRenderClient::new("http://localhost:8080/mj/", None, Duration::from_secs(1));
        assert_eq!(
            client.url("/submit/imagine"),
            "http://localhost:8080/mj/submit/imagine"
        );
    }
}
