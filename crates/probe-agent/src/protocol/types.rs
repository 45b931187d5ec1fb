//! Protocol type definitions for the probe agent.
//!
//! One request/response pair per probe family. Field names are the agent's
//! JSON wire names.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Probe family a pipeline belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeKind {
    Curl,
    NetCat,
    Ping,
    TraceRoute,
    PageSpeed,
}

impl ProbeKind {
    pub const ALL: [ProbeKind; 5] = [
        ProbeKind::Curl,
        ProbeKind::NetCat,
        ProbeKind::Ping,
        ProbeKind::TraceRoute,
        ProbeKind::PageSpeed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProbeKind::Curl => "curl",
            ProbeKind::NetCat => "netcat",
            ProbeKind::Ping => "ping",
            ProbeKind::TraceRoute => "traceroute",
            ProbeKind::PageSpeed => "pagespeed",
        }
    }
}

impl fmt::Display for ProbeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProbeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "curl" | "endpoint" | "http" => Ok(ProbeKind::Curl),
            "netcat" | "tcp" => Ok(ProbeKind::NetCat),
            "ping" | "icmp" => Ok(ProbeKind::Ping),
            "traceroute" => Ok(ProbeKind::TraceRoute),
            "pagespeed" => Ok(ProbeKind::PageSpeed),
            other => Err(format!("unknown probe kind: {other}")),
        }
    }
}

/// How the agent encoded a response body
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BodyEncoding {
    #[default]
    Plain,
    Base64,
}

/// An HTTP call performed by the agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurlRequest {
    /// The URL to call
    pub url: String,

    /// The HTTP method to use (GET, POST, etc.)
    pub method: String,

    /// Request headers
    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    /// Optional request body
    #[serde(default)]
    pub body: Option<String>,

    /// Timeout in milliseconds
    pub timeout_ms: u64,
}

/// Result of an HTTP call performed by the agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurlResponse {
    /// HTTP status code
    pub status: u16,

    /// Response headers, multi-valued
    #[serde(default)]
    pub headers: BTreeMap<String, Vec<String>>,

    /// Response body, possibly base64 encoded
    #[serde(default)]
    pub body: String,

    #[serde(default)]
    pub body_encoding: BodyEncoding,

    /// Total request time in milliseconds
    pub time_ms: u64,
}

/// A TCP connect check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetCatRequest {
    pub address: String,
    pub port: u16,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetCatResponse {
    pub connected: bool,
    pub time_ms: u64,
    #[serde(default)]
    pub error: Option<String>,
}

/// An ICMP echo run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PingRequest {
    pub address: String,
    /// Number of echo requests to send
    pub count: u32,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PingResponse {
    pub packets_sent: u32,
    pub packets_received: u32,
    /// Average round trip over the received replies
    pub avg_rtt_ms: f64,
    #[serde(default)]
    pub min_rtt_ms: f64,
    #[serde(default)]
    pub max_rtt_ms: f64,
}

impl PingResponse {
    pub fn loss_percent(&self) -> f64 {
        if self.packets_sent == 0 {
            return 100.0;
        }
        let lost = self.packets_sent.saturating_sub(self.packets_received);
        f64::from(lost) * 100.0 / f64::from(self.packets_sent)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceRouteRequest {
    pub address: String,
    pub max_hops: u8,
    pub timeout_ms: u64,
}

/// One hop on a traced route; silent hops carry no address
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceRouteHop {
    pub ttl: u8,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub rtt_ms: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceRouteResponse {
    pub hops: Vec<TraceRouteHop>,
    /// Whether the destination answered before `max_hops`
    pub reached: bool,
    pub time_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageSpeedRequest {
    pub url: String,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageSpeedResponse {
    /// Status code of the main document
    pub status: u16,
    pub load_time_ms: u64,
    #[serde(default)]
    pub page_size_bytes: u64,
    /// Browser timing metrics (first paint, dom content loaded, ...)
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
}
