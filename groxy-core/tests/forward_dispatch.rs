//! End-to-end forwarding scenarios: a reverse-proxied unary call with
//! metadata fidelity, and bidirectional streaming fidelity over a forwarded
//! call.

mod common;

use std::collections::BTreeMap;

use tokio_stream::StreamExt;

use groxy_core::rules::{Action, Forward, RequestMatcher, Rule, Upstream};

use common::{dial, EchoUpstream, GroxyProxy};

/// Scenario 4: a single `(.*)` rule forwards every method to one upstream.
/// An echoed unary call round-trips its payload, and a header the upstream
/// is told to reply with survives the forward in both directions.
#[tokio::test]
async fn reverse_proxy_unary_preserves_payload_and_headers() {
    let echo = EchoUpstream::start().await;
    let upstream = Upstream {
        name: "echo".into(),
        address: echo.addr.to_string(),
        tls: false,
        serve_reflection: false,
        channel: dial(echo.addr).await,
    };
    let rule = Rule {
        matcher: RequestMatcher { uri: Some(regex::Regex::new("(.*)").unwrap()), header: BTreeMap::new(), body: None },
        action: Action::Forward(Forward { upstream: "echo".into(), header: vec![], rewrite: None }),
        source_index: 0,
    };

    let proxy = GroxyProxy::start(vec![upstream], vec![rule]).await;
    let channel = dial(proxy.addr).await;

    let mut client = echoupstream::pb::test_service_client::TestServiceClient::new(channel);
    let mut request = tonic::Request::new(echoupstream::pb::SimpleRequest {
        response_type: 0,
        response_size: 0,
        payload: Some(echoupstream::pb::Payload { r#type: 0, body: b"hello through groxy".to_vec() }),
        response_status: None,
    });
    request.metadata_mut().insert("reply-with-headers", "x-request-id: abc-123".parse().unwrap());

    let response = client.unary_call(request).await.expect("forwarded call succeeds");
    assert_eq!(
        response.metadata().get("x-request-id").and_then(|v| v.to_str().ok()),
        Some("abc-123"),
        "the upstream's reply header must survive the forward unmodified"
    );
    let payload = response.into_inner().payload.expect("payload echoed back");
    assert_eq!(payload.body, b"hello through groxy");
}

/// Scenario 6: a bidirectional streaming call is forwarded message-for-
/// message; five requests yield five responses and the call still ends
/// cleanly once the client half-closes.
#[tokio::test]
async fn bidirectional_stream_forwards_every_message_and_closes_cleanly() {
    let echo = EchoUpstream::start().await;
    let upstream = Upstream {
        name: "echo".into(),
        address: echo.addr.to_string(),
        tls: false,
        serve_reflection: false,
        channel: dial(echo.addr).await,
    };
    let rule = Rule {
        matcher: RequestMatcher { uri: Some(regex::Regex::new("(.*)").unwrap()), header: BTreeMap::new(), body: None },
        action: Action::Forward(Forward { upstream: "echo".into(), header: vec![], rewrite: None }),
        source_index: 0,
    };

    let proxy = GroxyProxy::start(vec![upstream], vec![rule]).await;
    let channel = dial(proxy.addr).await;

    let mut client = echoupstream::pb::test_service_client::TestServiceClient::new(channel);

    let outbound = tokio_stream::iter((0..5).map(|i| echoupstream::pb::StreamingOutputCallRequest {
        response_type: 0,
        response_parameters: vec![echoupstream::pb::ResponseParameters { size: 4, interval_us: 0 }],
        payload: Some(echoupstream::pb::Payload { r#type: 0, body: format!("ping{i}").into_bytes() }),
    }));

    let response = client.full_duplex_call(outbound).await.expect("forwarded bidi call succeeds");
    let mut inbound = response.into_inner();

    let mut received = 0;
    while let Some(msg) = inbound.next().await {
        msg.expect("forwarded response frame decodes cleanly");
        received += 1;
    }
    assert_eq!(received, 5, "one pong per ping, forwarded through the proxy untouched");
}
