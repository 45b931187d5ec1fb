//! Protocol module for the probe agent.
//!
//! This module contains all request/response types exchanged with agents.

pub mod types;

pub use types::{
    BodyEncoding, CurlRequest, CurlResponse, NetCatRequest, NetCatResponse, PageSpeedRequest,
    PageSpeedResponse, PingRequest, PingResponse, ProbeKind, TraceRouteHop, TraceRouteRequest,
    TraceRouteResponse,
};
