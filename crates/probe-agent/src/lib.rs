//! Probe agent protocol for Uppe
//!
//! Every datacenter runs a probing agent reachable over HTTP. This crate
//! defines the typed request/response pairs for each probe family, the
//! validation applied before a request leaves the orchestrator, and the
//! [`AgentClient`] seam the orchestrator drives.

pub mod client;
pub mod error;
pub mod protocol;
pub mod validation;

// Re-export main types
pub use client::{endpoint_url, AgentClient, HttpAgentClient};
pub use error::AgentError;
pub use protocol::{
    BodyEncoding, CurlRequest, CurlResponse, NetCatRequest, NetCatResponse, PageSpeedRequest,
    PageSpeedResponse, PingRequest, PingResponse, ProbeKind, TraceRouteHop, TraceRouteRequest,
    TraceRouteResponse,
};

/// The version of the agent protocol spoken by this crate
pub const PROTOCOL_VERSION: &str = "1.0";

/// Path prefix of the agent probe endpoints, relative to a datacenter base URL
pub const PROBE_PATH_PREFIX: &str = "probe";
