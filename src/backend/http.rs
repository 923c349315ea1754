/// HTTP plumbing shared by the remote adapters: client construction and
/// mapping transport errors and status codes onto [`FailureKind`].
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::{RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;

use crate::error::{BackendFailure, FailureKind};

/// Longest error body kept in a failure message.
const MAX_ERROR_BODY: usize = 300;

pub fn client(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .connect_timeout(timeout.min(Duration::from_secs(10)))
        .user_agent(concat!("graphlens/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("failed to build HTTP client")
}

pub fn classify_status(status: StatusCode) -> FailureKind {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => FailureKind::AuthFailed,
        StatusCode::TOO_MANY_REQUESTS => FailureKind::RateLimited,
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => FailureKind::Timeout,
        s if s.is_server_error() => FailureKind::BackendUnavailable,
        _ => FailureKind::InvalidResponse,
    }
}

pub fn classify_error(err: &reqwest::Error) -> FailureKind {
    if err.is_timeout() {
        FailureKind::Timeout
    } else if err.is_connect() || err.is_request() {
        FailureKind::BackendUnavailable
    } else if let Some(status) = err.status() {
        classify_status(status)
    } else {
        FailureKind::InvalidResponse
    }
}

/// Send a prepared request and decode a JSON body, classifying every way
/// it can go wrong.
pub async fn send_json<R: DeserializeOwned>(
    backend_id: &str,
    request: RequestBuilder,
) -> Result<R, BackendFailure> {
    let resp = request
        .send()
        .await
        .map_err(|e| BackendFailure::new(backend_id, classify_error(&e), e.to_string()))?;

    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(BackendFailure::new(
            backend_id,
            classify_status(status),
            format!("HTTP {status}: {}", truncate(&body, MAX_ERROR_BODY)),
        ));
    }

    resp.json::<R>().await.map_err(|e| {
        let kind = if e.is_timeout() {
            FailureKind::Timeout
        } else {
            FailureKind::InvalidResponse
        };
        BackendFailure::new(backend_id, kind, e.to_string())
    })
}

/// Join a base URL and a path without doubling the slash.
pub fn endpoint(base_url: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
