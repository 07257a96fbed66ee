//! The server shell (§4.I): accepts HTTP/2 connections, installs the opaque
//! codec, and routes every inbound call to the health responder, the
//! reflection merger, or the dispatcher, wrapped by the middleware chain
//! from §4.H in left-to-right order (Recoverer, AppInfo, Log; `Health` and
//! `Maybe` are the path-routing and conditional-registration decisions
//! below, and `MetadataPassthrough` already lives in
//! [`crate::dispatch::Dispatcher`]).
//!
//! There is no fixed set of method names this server answers: a `Forward`
//! rule can route any path to any upstream, and a `Mock` rule can invent
//! one. `tonic::transport::Server`'s `Router` only dispatches to services
//! registered by name, so it has no way to express that. This shell instead
//! hand-rolls the HTTP/2 listener with `hyper`, matching the three
//! well-known prefixes (health, reflection v1, reflection v1alpha) before
//! falling through to [`tonic::server::Grpc`] driving the dispatcher
//! directly against the raw byte codec.

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use http::{Request, Response};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::server::conn::http2;
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tonic::body::Body as TonicBody;
use tonic::server::{Grpc, StreamingService};
use tonic::{Status, Streaming};
use tonic_health::pb::health_server::HealthServer;
use tonic_health::server::HealthService;
use tonic_health::ServingStatus;
use tonic_reflection::pb::v1 as rv1;
use tonic_reflection::pb::v1alpha as rv1alpha;
use tower::Service as TowerService;
use tracing::{info, warn};

use crate::codec::RawBytesCodec;
use crate::discovery::Discovery;
use crate::dispatch::{BoxMessageStream, DispatchResponse, Dispatcher};
use crate::error::Error;
use crate::middleware::{self, CallLog, Config as MiddlewareConfig};
use crate::protodef::InvocationContext;
use crate::reflection::ReflectionMerger;

const HEALTH_PREFIX: &str = "/grpc.health.v1.Health/";
const REFLECTION_V1_PREFIX: &str = "/grpc.reflection.v1.ServerReflection/";
const REFLECTION_V1ALPHA_PREFIX: &str = "/grpc.reflection.v1alpha.ServerReflection/";

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Ties the dispatch engine, reflection merger, and health responder
/// together behind one HTTP/2 listener.
#[derive(Clone)]
pub struct Server {
    inner: Arc<Inner>,
}

struct Inner {
    dispatcher: Arc<Dispatcher>,
    health: HealthServer<HealthService>,
    reflection_v1: rv1::server_reflection_server::ServerReflectionServer<ReflectionMerger>,
    reflection_v1alpha: rv1alpha::server_reflection_server::ServerReflectionServer<ReflectionMerger>,
    middleware: MiddlewareConfig,
}

impl Server {
    /// Builds the server shell, marking the overall process as `Serving`
    /// for the embedded health responder (spec §4.H's `Health` element —
    /// the proxy doesn't answer on behalf of any one named service, only
    /// the empty-string "whole server" service health convention).
    pub async fn new(discovery: Arc<Discovery>, middleware: MiddlewareConfig) -> Self {
        let (reporter, health_service) = tonic_health::server::health_reporter();
        reporter.set_service_status("", ServingStatus::Serving).await;

        let reflection = ReflectionMerger::new(discovery.clone());
        Server {
            inner: Arc::new(Inner {
                dispatcher: Arc::new(Dispatcher::new(discovery)),
                health: HealthServer::new(health_service),
                reflection_v1: rv1::server_reflection_server::ServerReflectionServer::new(reflection.clone()),
                reflection_v1alpha: rv1alpha::server_reflection_server::ServerReflectionServer::new(reflection),
                middleware,
            }),
        }
    }

    /// Accepts connections on `addr` until `shutdown` fires, then stops
    /// accepting new connections and waits for in-flight ones to finish
    /// their current request before returning.
    pub async fn serve(&self, addr: SocketAddr, shutdown: CancellationToken) -> Result<(), Error> {
        let listener = TcpListener::bind(addr).await?;
        info!(%addr, "server listening");

        let mut connections = tokio::task::JoinSet::new();
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(err) => {
                            warn!(error = %err, "failed to accept connection");
                            continue;
                        }
                    };
                    let inner = self.inner.clone();
                    let conn_shutdown = shutdown.clone();
                    connections.spawn(async move {
                        serve_connection(inner, stream, peer, conn_shutdown).await;
                    });
                }
            }
        }

        drop(listener);
        while connections.join_next().await.is_some() {}
        Ok(())
    }
}

async fn serve_connection(inner: Arc<Inner>, stream: tokio::net::TcpStream, peer: SocketAddr, shutdown: CancellationToken) {
    let io = TokioIo::new(stream);
    let call_cancel = shutdown.clone();
    let service = service_fn(move |req: Request<Incoming>| {
        let inner = inner.clone();
        handle(inner, req, peer, call_cancel.clone())
    });

    let conn = http2::Builder::new(TokioExecutor::new()).serve_connection(io, service);
    tokio::select! {
        biased;
        _ = shutdown.cancelled() => {}
        result = conn => {
            if let Err(err) = result {
                warn!(%peer, error = %err, "connection ended with error");
            }
        }
    }
}

async fn handle(
    inner: Arc<Inner>,
    req: Request<Incoming>,
    peer: SocketAddr,
    cancelled: CancellationToken,
) -> Result<Response<TonicBody>, Infallible> {
    let method = req.uri().path().to_string();
    let debug = inner.middleware.debug;
    let log = CallLog::start(method.clone(), Some(peer), debug);

    let response = guarded(&method, Some(peer), &inner.middleware, route(inner.clone(), req, method.clone(), cancelled)).await;

    let outcome = outcome_of(&response);
    log.finish(None, None, None, &outcome);
    Ok(response)
}

/// Dispatches a request to whichever of the three fixed services or the
/// dynamic dispatcher its path belongs to (the `Health`/routing element of
/// §4.H), applying `AppInfo` to the response headers on the way out.
async fn route(inner: Arc<Inner>, req: Request<Incoming>, method: String, cancelled: CancellationToken) -> Response<TonicBody> {
    let mut response = if method.starts_with(HEALTH_PREFIX) {
        inner.health.clone().call(req).await.unwrap_or_else(|e: Infallible| match e {})
    } else if method.starts_with(REFLECTION_V1_PREFIX) {
        inner.reflection_v1.clone().call(req).await.unwrap_or_else(|e: Infallible| match e {})
    } else if method.starts_with(REFLECTION_V1ALPHA_PREFIX) {
        inner.reflection_v1alpha.clone().call(req).await.unwrap_or_else(|e: Infallible| match e {})
    } else {
        dispatch_dynamic(inner.dispatcher.clone(), req, method, cancelled).await
    };

    middleware::apply_app_info(response.headers_mut(), &inner.middleware);
    response
}

/// Runs `fut` under the Recoverer (panic → `ResourceExhausted`), converting
/// a caught panic into a trailers-only error response since this layer's
/// callers, unlike `middleware::recover`'s usual caller, can't propagate a
/// bare `Status`.
async fn guarded<F>(method: &str, peer: Option<SocketAddr>, cfg: &MiddlewareConfig, fut: F) -> Response<TonicBody>
where
    F: Future<Output = Response<TonicBody>>,
{
    let wrapped = async move { Ok::<_, Status>(fut.await) };
    match middleware::recover(method, peer, &cfg.recoverer_message, wrapped).await {
        Ok(response) => response,
        Err(status) => status_response(&status),
    }
}

/// Drives the dispatcher through the opaque codec via `tonic::server::Grpc`
/// directly, since the dispatcher answers method paths that are only known
/// at rule-match time, not at compile time.
async fn dispatch_dynamic(
    dispatcher: Arc<Dispatcher>,
    req: Request<Incoming>,
    method: String,
    cancelled: CancellationToken,
) -> Response<TonicBody> {
    let service = DispatchService { dispatcher, method, cancelled };
    let mut grpc = Grpc::new(RawBytesCodec::default());
    grpc.streaming(service, req).await
}

#[derive(Clone)]
struct DispatchService {
    dispatcher: Arc<Dispatcher>,
    method: String,
    cancelled: CancellationToken,
}

impl StreamingService<Bytes> for DispatchService {
    type Response = Bytes;
    type ResponseStream = BoxMessageStream;
    type Future = BoxFuture<Result<tonic::Response<Self::ResponseStream>, Status>>;

    fn call(&mut self, request: tonic::Request<Streaming<Bytes>>) -> Self::Future {
        let dispatcher = self.dispatcher.clone();
        let method = self.method.clone();
        let cancelled = self.cancelled.clone();
        Box::pin(async move {
            let metadata = collect_metadata(request.metadata());
            let ctx = InvocationContext { method, metadata, cancelled: Some(cancelled) };
            let downstream: BoxMessageStream = Box::pin(request.into_inner());
            let DispatchResponse { headers, body, stats: _ } = dispatcher.dispatch(ctx, downstream).await?;
            let mut response = tonic::Response::new(body);
            *response.metadata_mut() = headers;
            Ok(response)
        })
    }
}

fn collect_metadata(md: &tonic::metadata::MetadataMap) -> std::collections::BTreeMap<String, Vec<String>> {
    let mut out: std::collections::BTreeMap<String, Vec<String>> = std::collections::BTreeMap::new();
    for kv in md.iter() {
        if let tonic::metadata::KeyAndValueRef::Ascii(key, value) = kv {
            if let Ok(value) = value.to_str() {
                out.entry(key.as_str().to_string()).or_default().push(value.to_string());
            }
        }
    }
    out
}

fn status_response(status: &Status) -> Response<TonicBody> {
    status.to_http()
}

fn outcome_of(response: &Response<TonicBody>) -> Result<(), Status> {
    match response.headers().get("grpc-status").and_then(|v| v.to_str().ok()).and_then(|v| v.parse::<i32>().ok()) {
        Some(0) | None => Ok(()),
        Some(code) => Err(Status::new(tonic::Code::from_i32(code), "")),
    }
}
