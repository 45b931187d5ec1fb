//! Probe families.
//!
//! Everything family-specific sits behind [`ProbeFamily`]: how a step becomes
//! an agent request and what the agent's answer must look like for the step
//! to pass. The executor, coordinator and diff engine are family-agnostic.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use probe_agent::{
    AgentClient, AgentError, CurlRequest, NetCatRequest, PageSpeedRequest, PingRequest, ProbeKind,
    TraceRouteRequest,
};
use serde_json::Value;

use super::body::decode_body;
use crate::models::Step;

const DEFAULT_PING_COUNT: u32 = 4;
const DEFAULT_MAX_HOPS: u8 = 30;

/// Family-neutral view of one step's agent response
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepExecution {
    pub status: u16,
    pub headers: BTreeMap<String, Vec<String>>,
    /// Full decoded body; capped later when recorded
    pub body: String,
    pub time_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acceptance {
    Passed,
    Failed(String),
}

impl Acceptance {
    pub fn is_passed(&self) -> bool {
        matches!(self, Acceptance::Passed)
    }
}

#[async_trait]
pub trait ProbeFamily: Send + Sync {
    fn kind(&self) -> ProbeKind;

    /// Run one (already rendered) step on the agent at `base_url`
    async fn execute_step(
        &self,
        client: &dyn AgentClient,
        base_url: &str,
        step: &Step,
    ) -> Result<StepExecution, AgentError>;

    fn evaluate_acceptance(&self, step: &Step, execution: &StepExecution) -> Acceptance;
}

pub fn family_for(kind: ProbeKind) -> Arc<dyn ProbeFamily> {
    match kind {
        ProbeKind::Curl => Arc::new(CurlFamily),
        ProbeKind::NetCat => Arc::new(NetCatFamily),
        ProbeKind::Ping => Arc::new(PingFamily),
        ProbeKind::TraceRoute => Arc::new(TraceRouteFamily),
        ProbeKind::PageSpeed => Arc::new(PageSpeedFamily),
    }
}

/// Non-HTTP families report reachability through a pseudo status.
const REACHABLE: u16 = 1;
const UNREACHABLE: u16 = 0;

fn reachability(reachable: bool) -> u16 {
    if reachable { REACHABLE } else { UNREACHABLE }
}

fn reachability_acceptance(execution: &StepExecution, what: &str) -> Acceptance {
    if execution.status == REACHABLE {
        Acceptance::Passed
    } else {
        Acceptance::Failed(format!("{what} failed"))
    }
}

pub struct CurlFamily;

#[async_trait]
impl ProbeFamily for CurlFamily {
    fn kind(&self) -> ProbeKind {
        ProbeKind::Curl
    }

    async fn execute_step(
        &self,
        client: &dyn AgentClient,
        base_url: &str,
        step: &Step,
    ) -> Result<StepExecution, AgentError> {
        let request = CurlRequest {
            url: step.address.clone(),
            method: step.method.to_uppercase(),
            headers: step.headers.clone(),
            body: step.body.clone(),
            timeout_ms: step.timeout_ms(),
        };

        let response = client.send_curl(base_url, &request).await?;
        Ok(StepExecution {
            status: response.status,
            body: decode_body(&response.body, response.body_encoding),
            headers: response.headers,
            time_ms: response.time_ms,
        })
    }

    fn evaluate_acceptance(&self, step: &Step, execution: &StepExecution) -> Acceptance {
        let criteria = &step.acceptance;
        if !criteria.accepts_status(execution.status) {
            return Acceptance::Failed(format!("unexpected status code {}", execution.status));
        }

        if criteria.required_response_body_keys.is_empty() {
            return Acceptance::Passed;
        }

        let Ok(Value::Object(body)) = serde_json::from_str::<Value>(&execution.body) else {
            return Acceptance::Failed("response body is not a JSON object".to_string());
        };

        let missing: Vec<&str> = criteria
            .required_response_body_keys
            .iter()
            .filter(|key| !body.contains_key(key.as_str()))
            .map(String::as_str)
            .collect();

        if missing.is_empty() {
            Acceptance::Passed
        } else {
            Acceptance::Failed(format!("response body lacks keys: {}", missing.join(", ")))
        }
    }
}

pub struct NetCatFamily;

/// `step.port` wins; otherwise the address must be `host:port`
fn netcat_target(step: &Step) -> Result<(String, u16), AgentError> {
    if let Some(port) = step.port {
        return Ok((step.address.clone(), port));
    }
    let (host, port) = step.address.rsplit_once(':').ok_or_else(|| {
        AgentError::InvalidRequest(format!("netcat target {:?} has no port", step.address))
    })?;
    let port = port
        .parse()
        .map_err(|_| AgentError::InvalidRequest(format!("invalid port in {:?}", step.address)))?;
    Ok((host.to_string(), port))
}

#[async_trait]
impl ProbeFamily for NetCatFamily {
    fn kind(&self) -> ProbeKind {
        ProbeKind::NetCat
    }

    async fn execute_step(
        &self,
        client: &dyn AgentClient,
        base_url: &str,
        step: &Step,
    ) -> Result<StepExecution, AgentError> {
        let (address, port) = netcat_target(step)?;
        let request = NetCatRequest { address, port, timeout_ms: step.timeout_ms() };
        let response = client.send_netcat(base_url, &request).await?;

        Ok(StepExecution {
            status: reachability(response.connected),
            headers: BTreeMap::new(),
            body: serde_json::to_string(&response).unwrap_or_default(),
            time_ms: response.time_ms,
        })
    }

    fn evaluate_acceptance(&self, _step: &Step, execution: &StepExecution) -> Acceptance {
        reachability_acceptance(execution, "tcp connect")
    }
}

pub struct PingFamily;

#[async_trait]
impl ProbeFamily for PingFamily {
    fn kind(&self) -> ProbeKind {
        ProbeKind::Ping
    }

    async fn execute_step(
        &self,
        client: &dyn AgentClient,
        base_url: &str,
        step: &Step,
    ) -> Result<StepExecution, AgentError> {
        let request = PingRequest {
            address: step.address.clone(),
            count: step.count.unwrap_or(DEFAULT_PING_COUNT),
            timeout_ms: step.timeout_ms(),
        };
        let response = client.send_ping(base_url, &request).await?;

        Ok(StepExecution {
            status: reachability(response.packets_received > 0),
            headers: BTreeMap::new(),
            body: serde_json::to_string(&response).unwrap_or_default(),
            time_ms: response.avg_rtt_ms.round().max(0.0) as u64,
        })
    }

    fn evaluate_acceptance(&self, _step: &Step, execution: &StepExecution) -> Acceptance {
        reachability_acceptance(execution, "ping")
    }
}

pub struct TraceRouteFamily;

#[async_trait]
impl ProbeFamily for TraceRouteFamily {
    fn kind(&self) -> ProbeKind {
        ProbeKind::TraceRoute
    }

    async fn execute_step(
        &self,
        client: &dyn AgentClient,
        base_url: &str,
        step: &Step,
    ) -> Result<StepExecution, AgentError> {
        let request = TraceRouteRequest {
            address: step.address.clone(),
            max_hops: step.max_hops.unwrap_or(DEFAULT_MAX_HOPS),
            timeout_ms: step.timeout_ms(),
        };
        let response = client.send_trace_route(base_url, &request).await?;

        Ok(StepExecution {
            status: reachability(response.reached),
            headers: BTreeMap::new(),
            body: serde_json::to_string(&response).unwrap_or_default(),
            time_ms: response.time_ms,
        })
    }

    fn evaluate_acceptance(&self, _step: &Step, execution: &StepExecution) -> Acceptance {
        reachability_acceptance(execution, "traceroute to destination")
    }
}

pub struct PageSpeedFamily;

#[async_trait]
impl ProbeFamily for PageSpeedFamily {
    fn kind(&self) -> ProbeKind {
        ProbeKind::PageSpeed
    }

    async fn execute_step(
        &self,
        client: &dyn AgentClient,
        base_url: &str,
        step: &Step,
    ) -> Result<StepExecution, AgentError> {
        let request = PageSpeedRequest { url: step.address.clone(), timeout_ms: step.timeout_ms() };
        let response = client.send_page_speed(base_url, &request).await?;

        Ok(StepExecution {
            status: response.status,
            headers: BTreeMap::new(),
            body: serde_json::to_string(&response).unwrap_or_default(),
            time_ms: response.load_time_ms,
        })
    }

    fn evaluate_acceptance(&self, step: &Step, execution: &StepExecution) -> Acceptance {
        let loaded = if step.acceptance.accepted_status_codes.is_empty() {
            (200..400).contains(&execution.status)
        } else {
            step.acceptance.accepts_status(execution.status)
        };

        if loaded {
            Acceptance::Passed
        } else {
            Acceptance::Failed(format!("page answered with status {}", execution.status))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AcceptanceCriteria;

    fn json_execution(status: u16, body: &str) -> StepExecution {
        StepExecution { status, body: body.to_string(), ..Default::default() }
    }

    fn curl_step(codes: &[u16], keys: &[&str]) -> Step {
        let mut step = Step::new("a", "https://api.example.com");
        step.acceptance = AcceptanceCriteria {
            accepted_status_codes: codes.to_vec(),
            required_response_body_keys: keys.iter().map(|k| k.to_string()).collect(),
        };
        step
    }

    #[test]
    fn test_curl_requires_listed_status() {
        let step = curl_step(&[200, 201], &[]);
        assert!(CurlFamily.evaluate_acceptance(&step, &json_execution(201, "")).is_passed());
        assert!(!CurlFamily.evaluate_acceptance(&step, &json_execution(204, "")).is_passed());
    }

    #[test]
    fn test_curl_requires_every_body_key() {
        let step = curl_step(&[200], &["id", "token"]);
        let ok = json_execution(200, r#"{"id":1,"token":"t","extra":true}"#);
        assert!(CurlFamily.evaluate_acceptance(&step, &ok).is_passed());

        let missing = json_execution(200, r#"{"id":1}"#);
        assert_eq!(
            CurlFamily.evaluate_acceptance(&step, &missing),
            Acceptance::Failed("response body lacks keys: token".to_string())
        );

        let not_json = json_execution(200, "<html>");
        assert!(!CurlFamily.evaluate_acceptance(&step, &not_json).is_passed());
    }

    #[test]
    fn test_netcat_target_parsing() {
        let mut step = Step::new("db", "db.example.com:5432");
        assert_eq!(netcat_target(&step).unwrap(), ("db.example.com".to_string(), 5432));

        step.port = Some(6379);
        step.address = "cache.example.com".into();
        assert_eq!(netcat_target(&step).unwrap(), ("cache.example.com".to_string(), 6379));

        step.port = None;
        assert!(netcat_target(&step).is_err());
    }

    #[test]
    fn test_reachability_families() {
        let step = Step::new("p", "example.com");
        let up = StepExecution { status: REACHABLE, ..Default::default() };
        let down = StepExecution { status: UNREACHABLE, ..Default::default() };
        assert!(PingFamily.evaluate_acceptance(&step, &up).is_passed());
        assert!(!PingFamily.evaluate_acceptance(&step, &down).is_passed());
        assert!(!TraceRouteFamily.evaluate_acceptance(&step, &down).is_passed());
    }

    #[test]
    fn test_page_speed_accepts_redirects_by_default() {
        let step = Step::new("home", "https://example.com");
        assert!(PageSpeedFamily.evaluate_acceptance(&step, &json_execution(301, "")).is_passed());
        assert!(!PageSpeedFamily.evaluate_acceptance(&step, &json_execution(503, "")).is_passed());
    }
}
