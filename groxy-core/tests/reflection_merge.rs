//! Scenario 5: reflection fanned out across two reflection-enabled
//! upstreams and merged into one `ListServices`/`FileContainingSymbol`
//! answer, queried over the wire through a real `groxy_core::Server`.

mod common;

use tokio_stream::StreamExt;
use tonic_reflection::pb::v1 as rv1;

use groxy_core::rules::Upstream;

use common::{dial, EchoUpstream, GroxyProxy};

async fn reflect_one(channel: tonic::transport::Channel, req: rv1::ServerReflectionRequest) -> rv1::ServerReflectionResponse {
    let mut client = rv1::server_reflection_client::ServerReflectionClient::new(channel);
    let response = client
        .server_reflection_info(tokio_stream::iter(vec![req]))
        .await
        .expect("reflection call succeeds");
    response
        .into_inner()
        .next()
        .await
        .expect("one response per request")
        .expect("no mid-stream error")
}

#[tokio::test]
async fn list_services_unions_and_sorts_across_upstreams() {
    let first = EchoUpstream::start().await;
    let second = EchoUpstream::start().await;

    let upstreams = vec![
        Upstream { name: "a".into(), address: first.addr.to_string(), tls: false, serve_reflection: true, channel: dial(first.addr).await },
        Upstream { name: "b".into(), address: second.addr.to_string(), tls: false, serve_reflection: true, channel: dial(second.addr).await },
    ];
    // No forwarding/mock rules are needed: the reflection services are
    // routed directly by the server shell, ahead of the dispatcher.
    let proxy = GroxyProxy::start(upstreams, vec![]).await;
    let channel = dial(proxy.addr).await;

    let resp = reflect_one(
        channel.clone(),
        rv1::ServerReflectionRequest { host: String::new(), message_request: Some(rv1::server_reflection_request::MessageRequest::ListServices(String::new())) },
    )
    .await;

    let Some(rv1::server_reflection_response::MessageResponse::ListServicesResponse(list)) = resp.message_response else {
        panic!("expected a ListServicesResponse, got {:?}", resp.message_response);
    };
    let mut names: Vec<String> = list.service.into_iter().map(|s| s.name).collect();
    names.sort();
    let mut deduped = names.clone();
    deduped.dedup();
    assert_eq!(names, deduped, "no duplicates even though both upstreams expose the same services");
    assert!(names.contains(&"testing.TestService".to_string()));
    assert!(names.contains(&"testing.ComplexService".to_string()));
    assert!(names.windows(2).all(|w| w[0] <= w[1]), "lexicographically sorted");

    let symbol = reflect_one(
        channel,
        rv1::ServerReflectionRequest {
            host: String::new(),
            message_request: Some(rv1::server_reflection_request::MessageRequest::FileContainingSymbol("testing.TestService".into())),
        },
    )
    .await;
    assert!(matches!(
        symbol.message_response,
        Some(rv1::server_reflection_response::MessageResponse::FileDescriptorResponse(_))
    ));
}
