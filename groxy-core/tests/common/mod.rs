// Shared harness for groxy-core's integration tests: an in-process
// echoupstream backend, an in-process groxy proxy in front of it, and the
// raw-bytes client helper the proxy's own opaque codec needs on the way in.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use prost::Message as _;
use prost_reflect::{DynamicMessage, MessageDescriptor, Value};
use tokio::net::TcpListener;
use tokio::sync::{oneshot, Mutex};
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::metadata::MetadataMap;
use tonic::transport::{Channel, Endpoint};
use tonic::Status;

use groxy_core::discovery::{Discovery, Provider, ProviderSnapshot};
use groxy_core::error::Error;
use groxy_core::middleware::Config as MiddlewareConfig;
use groxy_core::rules::{Rule, Upstream};
use groxy_core::server::Server;

/// An in-process instance of `echoupstream`'s `TestService`/`ComplexService`,
/// reflection included, bound to an ephemeral port. Dropping it stops the
/// listener.
pub struct EchoUpstream {
    pub addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
}

impl EchoUpstream {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind ephemeral port");
        let addr = listener.local_addr().expect("local addr");

        let test_service = echoupstream::pb::test_service_server::TestServiceServer::new(echoupstream::service::TestServiceImpl);
        let complex_service =
            echoupstream::pb::complex_service_server::ComplexServiceServer::new(echoupstream::service::ComplexServiceImpl);
        let reflection = tonic_reflection::server::Builder::configure()
            .register_encoded_file_descriptor_set(echoupstream::pb::FILE_DESCRIPTOR_SET)
            .build_v1()
            .expect("reflection service builds");

        let (tx, rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            let _ = tonic::transport::Server::builder()
                .add_service(reflection)
                .add_service(test_service)
                .add_service(complex_service)
                .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async {
                    let _ = rx.await;
                })
                .await;
        });

        EchoUpstream { addr, shutdown: Some(tx) }
    }
}

impl Drop for EchoUpstream {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

/// Dial a plaintext channel to a loopback address, the way `groxy`'s own
/// `config::dial` does for an untrusted-upstream (non-TLS) address.
pub async fn dial(addr: SocketAddr) -> Channel {
    Endpoint::from_shared(format!("http://{addr}"))
        .expect("valid endpoint uri")
        .connect()
        .await
        .expect("connect to loopback upstream")
}

/// A fixed, in-memory set of upstreams and rules, handed to `Discovery` once
/// and never refreshed — just enough of a [`Provider`] for a test to wire up
/// a [`groxy_core::rules::Rule`] list built directly in Rust, bypassing the
/// `groxy` binary's YAML config layer entirely.
struct StaticProvider {
    data: Mutex<Option<(Vec<Upstream>, Vec<Rule>)>>,
}

impl StaticProvider {
    fn new(upstreams: Vec<Upstream>, rules: Vec<Rule>) -> Self {
        StaticProvider { data: Mutex::new(Some((upstreams, rules))) }
    }
}

#[async_trait]
impl Provider for StaticProvider {
    fn name(&self) -> &str {
        "static"
    }

    async fn snapshot(&self) -> Result<ProviderSnapshot, Error> {
        let mut guard = self.data.lock().await;
        let (upstreams, rules) = guard.take().unwrap_or_default();
        Ok(ProviderSnapshot { upstreams, rules })
    }

    async fn changed(&self) {
        std::future::pending::<()>().await;
    }
}

/// An in-process groxy proxy serving a fixed rule/upstream set, bound to an
/// ephemeral port. Dropping it cancels the server's accept loop.
pub struct GroxyProxy {
    pub addr: SocketAddr,
    shutdown: CancellationToken,
}

impl GroxyProxy {
    pub async fn start(upstreams: Vec<Upstream>, rules: Vec<Rule>) -> Self {
        let provider: Arc<dyn Provider> = Arc::new(StaticProvider::new(upstreams, rules));
        let discovery = Discovery::new(vec![provider]).await.expect("discovery merges");
        let middleware = MiddlewareConfig {
            app: "groxy".into(),
            author: "groxy-core tests".into(),
            version: "0.0.0-test".into(),
            recoverer_message: "internal error".into(),
            debug: false,
        };
        let server = Server::new(Arc::new(discovery), middleware).await;

        let addr = free_port();
        let shutdown = CancellationToken::new();
        let serve_shutdown = shutdown.clone();
        let serve_addr = addr;
        tokio::spawn(async move {
            server.serve(serve_addr, serve_shutdown).await.expect("server shell runs");
        });
        wait_for_port(addr).await;

        GroxyProxy { addr, shutdown }
    }
}

impl Drop for GroxyProxy {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn free_port() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind ephemeral port");
    listener.local_addr().expect("local addr")
}

async fn wait_for_port(addr: SocketAddr) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if tokio::net::TcpStream::connect(addr).await.is_ok() {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {addr} to accept connections");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// What a raw opaque-codec call came back with.
pub struct RawCallResult {
    pub headers: MetadataMap,
    pub messages: Vec<Bytes>,
    pub trailers: MetadataMap,
}

/// Drive one call against `channel` through the same opaque codec the proxy
/// itself speaks, the way `dispatch_forward` drives its own upstream calls.
/// `payload` is sent as the call's one inbound message.
pub async fn call_raw(channel: Channel, path: &str, metadata: &[(&str, &str)], payload: Bytes) -> Result<RawCallResult, Status> {
    let mut client = tonic::client::Grpc::new(channel);
    client.ready().await.map_err(|e| Status::unavailable(format!("not ready: {e}")))?;

    let path: http::uri::PathAndQuery = path.parse().expect("valid method path");
    let mut request = tonic::Request::new(tokio_stream::iter(vec![payload]));
    for (key, value) in metadata {
        if let (Ok(key), Ok(value)) = (key.parse(), value.parse()) {
            request.metadata_mut().insert(key, value);
        }
    }

    let response = client.streaming(request, path, groxy_core::codec::RawBytesCodec::default()).await?;
    let (headers, mut body, _extensions) = response.into_parts();

    let mut messages = Vec::new();
    loop {
        match body.message().await {
            Ok(Some(bytes)) => messages.push(bytes),
            Ok(None) => break,
            Err(status) => return Err(status),
        }
    }
    let trailers = body.trailers().await.ok().flatten().unwrap_or_default();
    Ok(RawCallResult { headers, messages, trailers })
}

/// Encode a `DynamicMessage` built from `(field name, value)` pairs against
/// `descriptor` — the same machinery `protodef::compile` hands back, reused
/// here just to hand-assemble a request the compiled matcher can decode.
pub fn encode_message(descriptor: &MessageDescriptor, fields: &[(&str, Value)]) -> Bytes {
    let mut msg = DynamicMessage::new(descriptor.clone());
    for (name, value) in fields {
        let field = descriptor.get_field_by_name(name).unwrap_or_else(|| panic!("no field {name:?} on {}", descriptor.full_name()));
        msg.set_field(&field, value.clone());
    }
    Bytes::from(msg.encode_to_vec())
}
