//! Agent RPC client.

use std::time::Duration;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use tracing::debug;
use url::Url;

use crate::error::AgentError;
use crate::protocol::{
    CurlRequest, CurlResponse, NetCatRequest, NetCatResponse, PageSpeedRequest, PageSpeedResponse,
    PingRequest, PingResponse, ProbeKind, TraceRouteRequest, TraceRouteResponse,
};
use crate::validation;
use crate::PROBE_PATH_PREFIX;

/// Client side of the agent RPC
///
/// `base_url` is the datacenter's agent address as known to the registry.
#[async_trait]
pub trait AgentClient: Send + Sync {
    async fn send_curl(&self, base_url: &str, request: &CurlRequest)
        -> Result<CurlResponse, AgentError>;

    async fn send_netcat(
        &self,
        base_url: &str,
        request: &NetCatRequest,
    ) -> Result<NetCatResponse, AgentError>;

    async fn send_ping(&self, base_url: &str, request: &PingRequest)
        -> Result<PingResponse, AgentError>;

    async fn send_trace_route(
        &self,
        base_url: &str,
        request: &TraceRouteRequest,
    ) -> Result<TraceRouteResponse, AgentError>;

    async fn send_page_speed(
        &self,
        base_url: &str,
        request: &PageSpeedRequest,
    ) -> Result<PageSpeedResponse, AgentError>;
}

/// Build the endpoint URL of a probe family on an agent
///
/// A missing trailing slash on the base path is tolerated so that
/// `http://dc/agent` and `http://dc/agent/` address the same endpoints.
pub fn endpoint_url(base_url: &str, kind: ProbeKind) -> Result<Url, AgentError> {
    let mut base = Url::parse(base_url)?;
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }
    Ok(base.join(&format!("{PROBE_PATH_PREFIX}/{kind}"))?)
}

/// JSON-over-HTTP agent client
pub struct HttpAgentClient {
    client: reqwest::Client,
}

impl HttpAgentClient {
    /// `timeout` bounds the whole RPC, including the agent's own probe time.
    pub fn new(timeout: Duration) -> Result<Self, AgentError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("uppe-orchestrator/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self { client })
    }

    async fn post<Req, Resp>(
        &self,
        base_url: &str,
        kind: ProbeKind,
        request: &Req,
    ) -> Result<Resp, AgentError>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let url = endpoint_url(base_url, kind)?;
        debug!(%url, %kind, "Sending probe request to agent");

        let response = self.client.post(url).json(request).send().await?;
        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AgentError::Status { status: status.as_u16(), body });
        }

        response.json::<Resp>().await.map_err(|e| AgentError::Decode(e.to_string()))
    }
}

#[async_trait]
impl AgentClient for HttpAgentClient {
    async fn send_curl(
        &self,
        base_url: &str,
        request: &CurlRequest,
    ) -> Result<CurlResponse, AgentError> {
        validation::validate_curl_request(request)?;
        self.post(base_url, ProbeKind::Curl, request).await
    }

    async fn send_netcat(
        &self,
        base_url: &str,
        request: &NetCatRequest,
    ) -> Result<NetCatResponse, AgentError> {
        validation::validate_netcat_request(request)?;
        self.post(base_url, ProbeKind::NetCat, request).await
    }

    async fn send_ping(
        &self,
        base_url: &str,
        request: &PingRequest,
    ) -> Result<PingResponse, AgentError> {
        validation::validate_ping_request(request)?;
        self.post(base_url, ProbeKind::Ping, request).await
    }

    async fn send_trace_route(
        &self,
        base_url: &str,
        request: &TraceRouteRequest,
    ) -> Result<TraceRouteResponse, AgentError> {
        validation::validate_trace_route_request(request)?;
        self.post(base_url, ProbeKind::TraceRoute, request).await
    }

    async fn send_page_speed(
        &self,
        base_url: &str,
        request: &PageSpeedRequest,
    ) -> Result<PageSpeedResponse, AgentError> {
        validation::validate_page_speed_request(request)?;
        self.post(base_url, ProbeKind::PageSpeed, request).await
    }
}
