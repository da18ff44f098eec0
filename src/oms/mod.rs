use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use thiserror::Error;
use tracing::{debug, warn};

use crate::oms::model::{
    ApiReturnResult, CreateDataSourceRequest, CreateProjectRequest, FullVerifyResult,
    ListFullVerifyResultRequest, ProjectControlRequest, ProjectProgress, ProjectStep,
    UpdateProjectConfigRequest,
};

pub mod model;

#[derive(Debug, Error)]
pub enum OmsError {
    #[error("failed to reach migration service: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("migration service returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("migration service rejected {action} [{code}]: {message} (request id {request_id})")]
    Api {
        action: &'static str,
        code: String,
        message: String,
        request_id: String,
    },
    #[error("invalid response for {action}: {source}")]
    Decode {
        action: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("{0} returned no data")]
    EmptyData(&'static str),
    #[error("invalid migration service URL: {0}")]
    Url(String),
}

impl OmsError {
    /// Error code reported by the service, when the call reached it.
    pub fn code(&self) -> Option<&str> {
        match self {
            OmsError::Api { code, .. } => Some(code.as_str()),
            _ => None,
        }
    }
}

/// Operations of the external migration service used by the orchestrator.
#[async_trait]
pub trait MigrationApi: Send + Sync {
    async fn create_data_source(&self, request: &CreateDataSourceRequest)
        -> Result<String, OmsError>;

    async fn create_project(&self, request: &CreateProjectRequest) -> Result<String, OmsError>;

    async fn start_project(&self, request: &ProjectControlRequest) -> Result<(), OmsError>;

    async fn stop_project(&self, request: &ProjectControlRequest) -> Result<(), OmsError>;

    async fn resume_project(&self, request: &ProjectControlRequest) -> Result<(), OmsError>;

    /// Frees the project's resources on the service. The project must be
    /// stopped first.
    async fn release_project(&self, request: &ProjectControlRequest) -> Result<(), OmsError>;

    async fn update_project_config(
        &self,
        request: &UpdateProjectConfigRequest,
    ) -> Result<(), OmsError>;

    async fn describe_project_steps(
        &self,
        request: &ProjectControlRequest,
    ) -> Result<Vec<ProjectStep>, OmsError>;

    async fn describe_project_progress(
        &self,
        request: &ProjectControlRequest,
    ) -> Result<ProjectProgress, OmsError>;

    async fn list_full_verify_result(
        &self,
        request: &ListFullVerifyResultRequest,
    ) -> Result<FullVerifyResult, OmsError>;
}

/// HTTP client for the migration service open API.
#[derive(Clone)]
pub struct OmsClient {
    http: Client,
    base_url: Url,
    authorization: Option<String>,
}

impl fmt::Debug for OmsClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OmsClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl OmsClient {
    pub fn new(base_url: &str, authorization: Option<String>) -> Result<Self, OmsError> {
        let http = Client::builder()
            .user_agent(concat!("osc-cutover/", env!("CARGO_PKG_VERSION")))
            .no_proxy()
            .build()?;
        let base_url = Url::parse(base_url).map_err(|e| OmsError::Url(e.to_string()))?;
        Ok(Self::with_http(http, base_url, authorization))
    }

    pub fn with_http(http: Client, base_url: Url, authorization: Option<String>) -> Self {
        Self {
            http,
            base_url,
            authorization,
        }
    }

    pub fn build_request<B: Serialize>(
        &self,
        action: &'static str,
        body: &B,
    ) -> Result<reqwest::Request, OmsError> {
        let mut endpoint = self
            .base_url
            .join("api/v2/")
            .map_err(|e| OmsError::Url(e.to_string()))?;
        endpoint.query_pairs_mut().append_pair("Action", action);
        let mut builder = self
            .http
            .post(endpoint)
            .header("Content-Type", "application/json")
            .json(body);
        if let Some(auth) = &self.authorization {
            builder = builder.header("Authorization", auth);
        }
        Ok(builder.build()?)
    }

    async fn call<B, T>(&self, action: &'static str, body: &B) -> Result<Option<T>, OmsError>
    where
        B: Serialize + Sync,
        T: DeserializeOwned,
    {
        let request = self.build_request(action, body)?;
        debug!(action, url = %request.url(), "migration service request");

        let res = self.http.execute(request).await?;
        let status = res.status();
        let text = res.text().await?;
        if !status.is_success() {
            warn!(action, %status, body = %text, "migration service HTTP error");
            return Err(OmsError::Status {
                status: status.as_u16(),
                body: text,
            });
        }
        debug!(action, body = %text, "migration service response");
        parse_envelope(action, &text)
    }

    async fn call_required<B, T>(&self, action: &'static str, body: &B) -> Result<T, OmsError>
    where
        B: Serialize + Sync,
        T: DeserializeOwned,
    {
        self.call(action, body)
            .await?
            .ok_or(OmsError::EmptyData(action))
    }
}

/// Decode the service envelope, turning `success=false` into `OmsError::Api`.
pub fn parse_envelope<T: DeserializeOwned>(
    action: &'static str,
    text: &str,
) -> Result<Option<T>, OmsError> {
    let envelope: ApiReturnResult<T> =
        serde_json::from_str(text).map_err(|source| OmsError::Decode { action, source })?;
    if !envelope.success {
        let detail = envelope.error_detail.unwrap_or_default();
        let err = OmsError::Api {
            action,
            code: detail.code.or(envelope.code).unwrap_or_default(),
            message: detail.message.or(envelope.message).unwrap_or_default(),
            request_id: envelope.request_id.unwrap_or_default(),
        };
        warn!(%err, "migration service call failed");
        return Err(err);
    }
    Ok(envelope.data)
}

#[async_trait]
impl MigrationApi for OmsClient {
    async fn create_data_source(
        &self,
        request: &CreateDataSourceRequest,
    ) -> Result<String, OmsError> {
        self.call_required("CreateOceanBaseDataSource", request).await
    }

    async fn create_project(&self, request: &CreateProjectRequest) -> Result<String, OmsError> {
        self.call_required("CreateProject", request).await
    }

    async fn start_project(&self, request: &ProjectControlRequest) -> Result<(), OmsError> {
        self.call::<_, serde_json::Value>("StartProject", request)
            .await
            .map(|_| ())
    }

    async fn stop_project(&self, request: &ProjectControlRequest) -> Result<(), OmsError> {
        self.call::<_, serde_json::Value>("StopProject", request)
            .await
            .map(|_| ())
    }

    async fn resume_project(&self, request: &ProjectControlRequest) -> Result<(), OmsError> {
        self.call::<_, serde_json::Value>("ResumeProject", request)
            .await
            .map(|_| ())
    }

    async fn release_project(&self, request: &ProjectControlRequest) -> Result<(), OmsError> {
        self.call::<_, serde_json::Value>("ReleaseProject", request)
            .await
            .map(|_| ())
    }

    async fn update_project_config(
        &self,
        request: &UpdateProjectConfigRequest,
    ) -> Result<(), OmsError> {
        self.call::<_, serde_json::Value>("UpdateProjectConfig", request)
            .await
            .map(|_| ())
    }

    async fn describe_project_steps(
        &self,
        request: &ProjectControlRequest,
    ) -> Result<Vec<ProjectStep>, OmsError> {
        Ok(self
            .call("DescribeProjectSteps", request)
            .await?
            .unwrap_or_default())
    }

    async fn describe_project_progress(
        &self,
        request: &ProjectControlRequest,
    ) -> Result<ProjectProgress, OmsError> {
        self.call_required("DescribeProjectProgress", request).await
    }

    async fn list_full_verify_result(
        &self,
        request: &ListFullVerifyResultRequest,
    ) -> Result<FullVerifyResult, OmsError> {
        Ok(self
            .call("ListProjectFullVerifyResult", request)
            .await?
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oms::model::ProjectStatus;

    #[test]
    fn build_request_sets_action_and_headers() {
        let client =
            OmsClient::new("http://127.0.0.1:8089/", Some("Basic abc".into())).unwrap();
        let body = ProjectControlRequest {
            id: "p-1".into(),
            uid: Some("u".into()),
        };
        let request = client.build_request("StartProject", &body).unwrap();
        assert_eq!(request.method(), reqwest::Method::POST);
        assert_eq!(request.url().path(), "/api/v2/");
        assert_eq!(request.url().query(), Some("Action=StartProject"));
        let headers = request.headers();
        assert_eq!(
            headers
                .get("Authorization")
                .and_then(|h| h.to_str().ok())
                .unwrap(),
            "Basic abc"
        );
        assert_eq!(
            headers
                .get("Content-Type")
                .and_then(|h| h.to_str().ok())
                .unwrap(),
            "application/json"
        );
    }

    #[test]
    fn build_request_without_authorization() {
        let client = OmsClient::new("http://127.0.0.1:8089", None).unwrap();
        let request = client
            .build_request("StopProject", &ProjectControlRequest::default())
            .unwrap();
        assert!(request.headers().get("Authorization").is_none());
    }

    #[test]
    fn parse_envelope_success_and_failure() {
        let ok = r#"{"success": true, "data": {"status": "RUNNING", "currentStep": "FULL_TRANSFER"}}"#;
        let progress: ProjectProgress = parse_envelope("DescribeProjectProgress", ok)
            .unwrap()
            .unwrap();
        assert_eq!(progress.status, ProjectStatus::Running);
        assert_eq!(progress.current_step.as_deref(), Some("FULL_TRANSFER"));
        assert_eq!(progress.incr_sync_checkpoint, None);

        let bad = r#"{"success": false, "code": "X-1", "message": "boom", "requestId": "r"}"#;
        let err = parse_envelope::<String>("CreateProject", bad).unwrap_err();
        assert_eq!(err.code(), Some("X-1"));
        assert!(err.to_string().contains("boom"));

        let garbage = parse_envelope::<String>("CreateProject", "<html>").unwrap_err();
        assert!(matches!(garbage, OmsError::Decode { .. }));
    }
}
