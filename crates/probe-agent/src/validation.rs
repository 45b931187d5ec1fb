//! Request validation for agent RPCs.
//!
//! Requests are checked before they leave the orchestrator so that a broken
//! pipeline definition fails fast with a readable error instead of an agent
//! side 4xx.

use std::collections::BTreeMap;

use url::Url;

use crate::error::AgentError;
use crate::protocol::{CurlRequest, NetCatRequest, PageSpeedRequest, PingRequest, TraceRouteRequest};

const MIN_TIMEOUT_MS: u64 = 100;
const MAX_TIMEOUT_MS: u64 = 300_000; // 5 minutes
const MAX_HEADERS: usize = 20;
const MAX_HEADER_SIZE: usize = 8192;
const MAX_BODY_SIZE: usize = 1024 * 1024; // 1MB
const MAX_PING_COUNT: u32 = 20;
const MAX_HOPS: u8 = 64;

fn invalid(message: impl Into<String>) -> AgentError {
    AgentError::InvalidRequest(message.into())
}

/// Validate an HTTP call request
pub fn validate_curl_request(request: &CurlRequest) -> Result<(), AgentError> {
    validate_http_url(&request.url)?;
    validate_http_method(&request.method)?;
    validate_timeout(request.timeout_ms)?;
    validate_headers(&request.headers)?;

    if let Some(body) = &request.body {
        validate_body_size(body)?;
    }

    Ok(())
}

pub fn validate_netcat_request(request: &NetCatRequest) -> Result<(), AgentError> {
    validate_address(&request.address)?;
    if request.port == 0 {
        return Err(invalid("port must be between 1 and 65535"));
    }
    validate_timeout(request.timeout_ms)
}

pub fn validate_ping_request(request: &PingRequest) -> Result<(), AgentError> {
    validate_address(&request.address)?;
    if request.count == 0 || request.count > MAX_PING_COUNT {
        return Err(invalid(format!(
            "ping count must be between 1 and {MAX_PING_COUNT}, got {}",
            request.count
        )));
    }
    validate_timeout(request.timeout_ms)
}

pub fn validate_trace_route_request(request: &TraceRouteRequest) -> Result<(), AgentError> {
    validate_address(&request.address)?;
    if request.max_hops == 0 || request.max_hops > MAX_HOPS {
        return Err(invalid(format!(
            "max hops must be between 1 and {MAX_HOPS}, got {}",
            request.max_hops
        )));
    }
    validate_timeout(request.timeout_ms)
}

pub fn validate_page_speed_request(request: &PageSpeedRequest) -> Result<(), AgentError> {
    validate_http_url(&request.url)?;
    validate_timeout(request.timeout_ms)
}

/// Validate URL format and scheme
fn validate_http_url(url: &str) -> Result<(), AgentError> {
    let parsed = Url::parse(url).map_err(|e| invalid(format!("invalid url {url:?}: {e}")))?;

    match parsed.scheme() {
        "http" | "https" => Ok(()),
        other => Err(invalid(format!("unsupported url scheme: {other}"))),
    }
}

fn validate_address(address: &str) -> Result<(), AgentError> {
    let trimmed = address.trim();
    if trimmed.is_empty() {
        return Err(invalid("address must not be empty"));
    }
    if trimmed.contains(char::is_whitespace) {
        return Err(invalid(format!("address contains whitespace: {address:?}")));
    }
    Ok(())
}

fn validate_http_method(method: &str) -> Result<(), AgentError> {
    match method.to_uppercase().as_str() {
        "GET" | "POST" | "PUT" | "DELETE" | "HEAD" | "OPTIONS" | "PATCH" => Ok(()),
        _ => Err(invalid(format!("unsupported http method: {method}"))),
    }
}

fn validate_timeout(timeout_ms: u64) -> Result<(), AgentError> {
    if timeout_ms < MIN_TIMEOUT_MS {
        return Err(invalid(format!(
            "timeout too small: {timeout_ms} ms (min: {MIN_TIMEOUT_MS} ms)"
        )));
    }

    if timeout_ms > MAX_TIMEOUT_MS {
        return Err(invalid(format!(
            "timeout too large: {timeout_ms} ms (max: {MAX_TIMEOUT_MS} ms)"
        )));
    }

    Ok(())
}

fn validate_headers(headers: &BTreeMap<String, String>) -> Result<(), AgentError> {
    if headers.len() > MAX_HEADERS {
        return Err(invalid(format!("too many headers: {} (max: {MAX_HEADERS})", headers.len())));
    }

    for (key, value) in headers {
        if key.len() + value.len() > MAX_HEADER_SIZE {
            return Err(invalid(format!(
                "header {key} too large: {} bytes (max: {MAX_HEADER_SIZE} bytes)",
                key.len() + value.len()
            )));
        }
    }

    Ok(())
}

fn validate_body_size(body: &str) -> Result<(), AgentError> {
    if body.len() > MAX_BODY_SIZE {
        return Err(invalid(format!(
            "body too large: {} bytes (max: {MAX_BODY_SIZE} bytes)",
            body.len()
        )));
    }

    Ok(())
}
