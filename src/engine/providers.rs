//! HTTP-backed stage implementations.
//!
//! Each stage is a JSON endpoint: the request struct is POSTed as-is and
//! the response body is the stage's result type. Status codes map onto
//! `StageError`: 5xx and transport failures are transient, 4xx are fatal,
//! and a 422 from the generation endpoint is a contract violation.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::models::SandboxInfo;
use super::stages::*;
use crate::config::ProviderConfig;
use crate::errors::StageError;

/// Response bodies are cut to this many characters inside error messages.
const ERROR_BODY_LIMIT: usize = 500;

#[derive(Clone)]
struct JsonEndpoint {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
}

impl JsonEndpoint {
    fn new(client: reqwest::Client, url: &str, api_key: Option<String>) -> Self {
        Self {
            client,
            url: url.trim_end_matches('/').to_string(),
            api_key,
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let url = if path.is_empty() {
            self.url.clone()
        } else {
            format!("{}/{}", self.url, path)
        };
        let builder = self
            .client
            .request(method, url)
            .header("Accept", "application/json")
            .header("User-Agent", "g3-engine");
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    async fn send<T: DeserializeOwned>(
        &self,
        builder: reqwest::RequestBuilder,
        violation_on_422: bool,
    ) -> Result<T, StageError> {
        let resp = builder.send().await.map_err(transport_error)?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_status(status, &body, violation_on_422));
        }
        resp.json::<T>()
            .await
            .map_err(|e| StageError::Fatal(format!("malformed response from {}: {}", self.url, e)))
    }

    async fn post<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
        violation_on_422: bool,
    ) -> Result<T, StageError> {
        self.send(self.request(reqwest::Method::POST, path).json(body), violation_on_422)
            .await
    }
}

fn transport_error(err: reqwest::Error) -> StageError {
    if err.is_timeout() {
        StageError::Transient(format!("request timed out: {}", err))
    } else {
        StageError::Transient(format!("transport error: {}", err))
    }
}

/// Map a non-success HTTP status onto the stage error taxonomy.
pub fn classify_status(status: StatusCode, body: &str, violation_on_422: bool) -> StageError {
    let body: String = body.chars().take(ERROR_BODY_LIMIT).collect();
    let message = format!("HTTP {}: {}", status.as_u16(), body.trim());
    if status == StatusCode::UNPROCESSABLE_ENTITY && violation_on_422 {
        StageError::ContractViolation(message)
    } else if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        StageError::Transient(message)
    } else {
        StageError::Fatal(message)
    }
}

// ── Stages ────────────────────────────────────────────────────────────

pub struct HttpContractStage {
    endpoint: JsonEndpoint,
}

#[async_trait]
impl ContractStage for HttpContractStage {
    async fn design(&self, request: &ContractRequest) -> Result<ContractDraft, StageError> {
        self.endpoint.post("", request, true).await
    }
}

#[derive(Debug, Deserialize)]
struct GenerationResponse {
    files: Vec<GeneratedFile>,
}

pub struct HttpGenerationStage {
    endpoint: JsonEndpoint,
}

#[async_trait]
impl GenerationStage for HttpGenerationStage {
    async fn generate(&self, request: &GenerationRequest) -> Result<Vec<GeneratedFile>, StageError> {
        let resp: GenerationResponse = self.endpoint.post("", request, true).await?;
        Ok(resp.files)
    }
}

pub struct HttpRepairStage {
    endpoint: JsonEndpoint,
}

#[async_trait]
impl RepairStage for HttpRepairStage {
    async fn repair(&self, request: &RepairRequest) -> Result<GeneratedFile, StageError> {
        self.endpoint.post("", request, false).await
    }
}

#[derive(Debug, Serialize)]
struct ProvisionRequest {
    job_id: Uuid,
}

/// Sandbox service: `POST /sandboxes`, `POST /validate`,
/// `DELETE /sandboxes/{id}`.
pub struct HttpSandbox {
    endpoint: JsonEndpoint,
}

#[async_trait]
impl Sandbox for HttpSandbox {
    async fn provision(&self, job_id: Uuid) -> Result<SandboxInfo, StageError> {
        self.endpoint
            .post("sandboxes", &ProvisionRequest { job_id }, false)
            .await
    }

    async fn validate(&self, request: &SandboxRequest) -> Result<SandboxReport, StageError> {
        self.endpoint.post("validate", request, false).await
    }

    async fn release(&self, sandbox: &SandboxInfo) -> Result<(), StageError> {
        let builder = self
            .endpoint
            .request(reqwest::Method::DELETE, &format!("sandboxes/{}", sandbox.id));
        let resp = builder.send().await.map_err(transport_error)?;
        let status = resp.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            return Ok(());
        }
        let body = resp.text().await.unwrap_or_default();
        Err(classify_status(status, &body, false))
    }
}

/// Build the HTTP stages from configured endpoints. Every endpoint must be
/// set.
pub fn http_stages(config: &ProviderConfig, request_timeout: Duration) -> anyhow::Result<Stages> {
    let mut missing = Vec::new();
    for (name, value) in [
        ("contract_url", &config.contract_url),
        ("generation_url", &config.generation_url),
        ("repair_url", &config.repair_url),
        ("sandbox_url", &config.sandbox_url),
    ] {
        if value.as_deref().is_none_or(|v| v.trim().is_empty()) {
            missing.push(name);
        }
    }
    if !missing.is_empty() {
        bail!(
            "Missing provider endpoints in [providers]: {}",
            missing.join(", ")
        );
    }

    let client = reqwest::Client::builder()
        .timeout(request_timeout)
        .build()
        .context("Failed to build HTTP client")?;
    let endpoint = |url: &Option<String>| JsonEndpoint::new(client.clone(), url.as_deref().unwrap_or_default(), config.api_key.clone());

    Ok(Stages {
        contract: Arc::new(HttpContractStage {
            endpoint: endpoint(&config.contract_url),
        }),
        generation: Arc::new(HttpGenerationStage {
            endpoint: endpoint(&config.generation_url),
        }),
        repair: Arc::new(HttpRepairStage {
            endpoint: endpoint(&config.repair_url),
        }),
        sandbox: Arc::new(HttpSandbox {
            endpoint: endpoint(&config.sandbox_url),
        }),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::models::Contract;
    use axum::Router;
    use axum::http::StatusCode as AxumStatus;
    use axum::routing::{delete, post};

    #[test]
    fn test_classify_status() {
        assert!(matches!(
            classify_status(StatusCode::SERVICE_UNAVAILABLE, "busy", false),
            StageError::Transient(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, "", false),
            StageError::Transient(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_REQUEST, "nope", false),
            StageError::Fatal(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::UNPROCESSABLE_ENTITY, "missing unit", true),
            StageError::ContractViolation(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::UNPROCESSABLE_ENTITY, "bad", false),
            StageError::Fatal(_)
        ));
    }

    #[test]
    fn test_error_body_is_truncated() {
        let body = "x".repeat(5000);
        let msg = classify_status(StatusCode::INTERNAL_SERVER_ERROR, &body, false).to_string();
        assert!(msg.len() < 600);
    }

    #[test]
    fn test_http_stages_requires_every_endpoint() {
        let partial = ProviderConfig {
            contract_url: Some("http://localhost:1/contract".into()),
            sandbox_url: Some("  ".into()),
            ..ProviderConfig::default()
        };
        let err = http_stages(&partial, Duration::from_secs(1)).err().unwrap().to_string();
        assert!(err.contains("generation_url"));
        assert!(err.contains("repair_url"));
        assert!(err.contains("sandbox_url"));
        assert!(!err.contains("contract_url"));
    }

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn config(base: &str) -> ProviderConfig {
        ProviderConfig {
            contract_url: Some(format!("{}/contract", base)),
            generation_url: Some(format!("{}/generate", base)),
            repair_url: Some(format!("{}/repair", base)),
            sandbox_url: Some(format!("{}/sandbox/", base)),
            api_key: Some("secret".into()),
        }
    }

    #[tokio::test]
    async fn test_stages_round_trip_over_http() {
        let router = Router::new()
            .route(
                "/generate",
                post(|| async {
                    axum::Json(serde_json::json!({
                        "files": [{"file_path": "src/A.java", "content": "class A {}"}]
                    }))
                }),
            )
            .route(
                "/sandbox/sandboxes",
                post(|| async { axum::Json(serde_json::json!({"id": "sb-1", "url": "http://sb-1"})) }),
            )
            .route("/sandbox/sandboxes/{id}", delete(|| async { AxumStatus::NO_CONTENT }))
            .route("/contract", post(|| async { (AxumStatus::UNPROCESSABLE_ENTITY, "no units") }))
            .route("/repair", post(|| async { (AxumStatus::BAD_GATEWAY, "upstream down") }));
        let base = serve(router).await;
        let stages = http_stages(&config(&base), Duration::from_secs(5)).unwrap();

        let job_id = Uuid::new_v4();
        let files = stages
            .generation
            .generate(&GenerationRequest {
                job_id,
                requirement: "x".into(),
                contract: Contract {
                    schema: "s".into(),
                    db_schema: String::new(),
                    units: vec![],
                    locked: true,
                    locked_at: None,
                },
                context: String::new(),
            })
            .await
            .unwrap();
        assert_eq!(files[0].file_path, "src/A.java");

        let sandbox = stages.sandbox.provision(job_id).await.unwrap();
        assert_eq!(sandbox.id, "sb-1");
        stages.sandbox.release(&sandbox).await.unwrap();

        let contract = stages
            .contract
            .design(&ContractRequest {
                job_id,
                requirement: "x".into(),
                app_spec_id: None,
                template_id: None,
                context: String::new(),
            })
            .await;
        assert!(matches!(contract, Err(StageError::ContractViolation(_))));

        let repair = stages
            .repair
            .repair(&RepairRequest {
                job_id,
                round: 1,
                file_path: "src/A.java".into(),
                content: "class A {".into(),
                compiler_output: "error".into(),
                history: vec![],
                contract: Contract {
                    schema: "s".into(),
                    db_schema: String::new(),
                    units: vec![],
                    locked: true,
                    locked_at: None,
                },
                context: String::new(),
            })
            .await;
        assert!(matches!(repair, Err(StageError::Transient(_))));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_transient() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        drop(listener);
        let stages = http_stages(&config(&base), Duration::from_secs(2)).unwrap();
        let err = stages.sandbox.provision(Uuid::new_v4()).await.unwrap_err();
        assert!(err.is_retryable());
    }
}
