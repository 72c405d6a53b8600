use fleetlease_application::{AccountLease, ProxyLease};
use fleetlease_core::{AppError, AppResult};
use fleetlease_domain::{LeaseOutcome, ProxyIdentity};
use reqwest::header;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::WorkerConfig;

#[derive(Debug, Serialize)]
struct TaskRequest<'a> {
    worker_id: &'a str,
    role: &'a str,
    account: TaskAccount<'a>,
    proxy: &'a ProxyIdentity,
}

#[derive(Debug, Serialize)]
struct TaskAccount<'a> {
    id: String,
    username: &'a str,
    profile_id: &'a str,
    stage: Option<&'static str>,
}

#[derive(Debug, Default, Deserialize)]
struct TaskResponse {
    #[serde(default)]
    success: Option<bool>,
    #[serde(default)]
    message: Option<String>,
}

/// Hands one leased account and proxy to the task endpoint and reports
/// whether the task succeeded.
pub(crate) async fn dispatch(
    http_client: &reqwest::Client,
    config: &WorkerConfig,
    account: &AccountLease,
    proxy: &ProxyLease,
) -> AppResult<LeaseOutcome> {
    let request = TaskRequest {
        worker_id: config.worker_id.as_str(),
        role: config.role.as_str(),
        account: TaskAccount {
            id: account.resource.id.to_string(),
            username: account.resource.username.as_str(),
            profile_id: account.resource.profile_id.as_str(),
            stage: account.resource.stage.map(|stage| stage.as_str()),
        },
        proxy: &proxy.identity,
    };

    let response = http_client
        .post(config.task_url.as_str())
        .header(header::ACCEPT, "application/json")
        .header("x-fleetlease-worker-id", config.worker_id.as_str())
        .json(&request)
        .send()
        .await
        .map_err(|error| AppError::Internal(format!("failed to call task endpoint: {error}")))?;

    if !response.status().is_success() {
        return Ok(LeaseOutcome::Failure);
    }

    // Endpoints that return no body report success through the status code.
    let body = response.bytes().await.map_err(|error| {
        AppError::Internal(format!("failed to read task endpoint response: {error}"))
    })?;
    if body.is_empty() {
        return Ok(LeaseOutcome::Success);
    }

    let report = serde_json::from_slice::<TaskResponse>(&body).unwrap_or_default();
    if let Some(message) = report.message.as_deref() {
        debug!(message, "task endpoint replied");
    }

    Ok(task_outcome(&report))
}

fn task_outcome(report: &TaskResponse) -> LeaseOutcome {
    LeaseOutcome::from_success(report.success.unwrap_or(true))
}
