//! Tests for protocol types and endpoint addressing

use probe_agent::{endpoint_url, BodyEncoding, CurlResponse, PingResponse, ProbeKind};

#[test]
fn test_probe_kind_wire_names() {
    let names: Vec<String> =
        ProbeKind::ALL.iter().map(|kind| serde_json::to_string(kind).unwrap()).collect();
    assert_eq!(
        names,
        vec!["\"curl\"", "\"netcat\"", "\"ping\"", "\"traceroute\"", "\"pagespeed\""]
    );
}

#[test]
fn test_probe_kind_parses_legacy_aliases() {
    assert_eq!("endpoint".parse::<ProbeKind>().unwrap(), ProbeKind::Curl);
    assert_eq!("TCP".parse::<ProbeKind>().unwrap(), ProbeKind::NetCat);
    assert!("smtp".parse::<ProbeKind>().is_err());
}

#[test]
fn test_curl_response_defaults_missing_fields() {
    let response: CurlResponse = serde_json::from_str(r#"{"status":204,"time_ms":12}"#).unwrap();
    assert_eq!(response.status, 204);
    assert!(response.body.is_empty());
    assert!(response.headers.is_empty());
    assert_eq!(response.body_encoding, BodyEncoding::Plain);
}

#[test]
fn test_curl_response_base64_marker() {
    let response: CurlResponse = serde_json::from_str(
        r#"{"status":200,"time_ms":3,"body":"e30=","body_encoding":"base64"}"#,
    )
    .unwrap();
    assert_eq!(response.body_encoding, BodyEncoding::Base64);
}

#[test]
fn test_ping_loss_percent() {
    let response = PingResponse {
        packets_sent: 4,
        packets_received: 3,
        avg_rtt_ms: 12.5,
        min_rtt_ms: 10.0,
        max_rtt_ms: 15.0,
    };
    assert_eq!(response.loss_percent(), 25.0);

    let silent = PingResponse { packets_sent: 0, packets_received: 0, ..response };
    assert_eq!(silent.loss_percent(), 100.0);
}

#[test]
fn test_endpoint_url_with_and_without_trailing_slash() {
    let a = endpoint_url("http://dc1.example.com:8080/agent", ProbeKind::Ping).unwrap();
    let b = endpoint_url("http://dc1.example.com:8080/agent/", ProbeKind::Ping).unwrap();
    assert_eq!(a, b);
    assert_eq!(a.as_str(), "http://dc1.example.com:8080/agent/probe/ping");
}

#[test]
fn test_endpoint_url_rejects_garbage() {
    assert!(endpoint_url("not a url", ProbeKind::Curl).is_err());
}
