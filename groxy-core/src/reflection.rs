//! Fans a reflection call out across every reflection-enabled upstream and
//! merges their answers into one response, translating between the `v1` and
//! `v1alpha` reflection wire protocols at the edges.
//!
//! Upstreams are always queried over the `v1` protocol regardless of which
//! variant the downstream caller used; a `v1alpha` caller's requests and
//! responses are converted to and from `v1` only at this module's boundary.

use std::collections::BTreeSet;
use std::pin::Pin;
use std::sync::Arc;

use futures_util::future::try_join_all;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream, StreamExt};
use tonic::{Request, Response, Status, Streaming};
use tracing::warn;

use tonic_reflection::pb::v1 as rv1;
use tonic_reflection::pb::v1alpha as rv1a;

use crate::discovery::Discovery;
use crate::rules::Upstream;

type V1Stream = Pin<Box<dyn Stream<Item = Result<rv1::ServerReflectionResponse, Status>> + Send + 'static>>;
type V1AlphaStream = Pin<Box<dyn Stream<Item = Result<rv1a::ServerReflectionResponse, Status>> + Send + 'static>>;

/// The merged reflection service: one instance serves both the `v1` and
/// `v1alpha` generated server traits, each registered under its own path by
/// the server shell.
#[derive(Clone)]
pub struct ReflectionMerger {
    discovery: Arc<Discovery>,
}

impl ReflectionMerger {
    pub fn new(discovery: Arc<Discovery>) -> Self {
        ReflectionMerger { discovery }
    }

    fn reflecting_upstreams(&self) -> Vec<Arc<Upstream>> {
        self.discovery
            .snapshot()
            .upstreams
            .values()
            .filter(|u| u.serve_reflection)
            .cloned()
            .collect()
    }

    /// Drive one merged bidirectional reflection call: open a persistent `v1`
    /// stream to every reflection-enabled upstream, then for every inbound
    /// request fan it out, merge the per-upstream responses, and emit one
    /// merged reply — exactly mirroring the inbound/outbound cardinality.
    async fn run<S>(&self, mut inbound: S) -> Result<Response<V1Stream>, Status>
    where
        S: Stream<Item = Result<rv1::ServerReflectionRequest, Status>> + Send + Unpin + 'static,
    {
        let upstreams = self.reflecting_upstreams();
        let mut clients = Vec::with_capacity(upstreams.len());
        for upstream in &upstreams {
            let mut client = rv1::server_reflection_client::ServerReflectionClient::new(upstream.channel.clone());
            let (tx, rx) = mpsc::channel::<rv1::ServerReflectionRequest>(4);
            match client.server_reflection_info(ReceiverStream::new(rx)).await {
                Ok(resp) => clients.push((upstream.name.clone(), tx, resp.into_inner())),
                Err(status) => {
                    warn!(upstream = %upstream.name, error = %status, "failed to open reflection stream to upstream");
                    return Err(Status::internal(format!(
                        "{} can't make a new stream to upstream {:?}: {status}",
                        crate::error::MARKER,
                        upstream.name
                    )));
                }
            }
        }

        let (out_tx, out_rx) = mpsc::channel(4);
        tokio::spawn(async move {
            loop {
                let req = match inbound.next().await {
                    Some(Ok(req)) => req,
                    Some(Err(status)) => {
                        let _ = out_tx.send(Err(status)).await;
                        break;
                    }
                    None => break,
                };
                match reflect(&req, &mut clients).await {
                    Ok(resp) => {
                        if out_tx.send(Ok(resp)).await.is_err() {
                            break;
                        }
                    }
                    Err(status) => {
                        let _ = out_tx.send(Err(status)).await;
                        break;
                    }
                }
            }
            // Dropping `clients` here drops every `tx`, half-closing each
            // upstream stream (spec: "all upstream streams are half-closed
            // when the downstream call ends").
        });

        Ok(Response::new(Box::pin(ReceiverStream::new(out_rx))))
    }
}

#[tonic::async_trait]
impl rv1::server_reflection_server::ServerReflection for ReflectionMerger {
    type ServerReflectionInfoStream = V1Stream;

    async fn server_reflection_info(
        &self,
        request: Request<Streaming<rv1::ServerReflectionRequest>>,
    ) -> Result<Response<Self::ServerReflectionInfoStream>, Status> {
        self.run(request.into_inner()).await
    }
}

#[tonic::async_trait]
impl rv1a::server_reflection_server::ServerReflection for ReflectionMerger {
    type ServerReflectionInfoStream = V1AlphaStream;

    async fn server_reflection_info(
        &self,
        request: Request<Streaming<rv1a::ServerReflectionRequest>>,
    ) -> Result<Response<Self::ServerReflectionInfoStream>, Status> {
        let inbound = request.into_inner().map(|item| item.map(convert::request_to_v1));
        let Response { metadata, message, extensions } = self.run(Box::pin(inbound)).await?;
        let alpha_stream: V1AlphaStream = Box::pin(message.map(|item| item.map(convert::response_to_v1alpha)));
        let mut response = Response::new(alpha_stream);
        *response.metadata_mut() = metadata;
        *response.extensions_mut() = extensions;
        Ok(response)
    }
}

/// Send `req` to every upstream client, await one response from each, and
/// merge them. A non-`NotFound` error response from any single upstream
/// aborts the whole request (spec §4.G.3).
async fn reflect(
    req: &rv1::ServerReflectionRequest,
    clients: &mut [(String, mpsc::Sender<rv1::ServerReflectionRequest>, Streaming<rv1::ServerReflectionResponse>)],
) -> Result<rv1::ServerReflectionResponse, Status> {
    let futures = clients.iter_mut().map(|(name, tx, rx)| {
        let req = req.clone();
        async move {
            tx.send(req)
                .await
                .map_err(|_| Status::unavailable(format!("upstream {name:?} reflection stream closed")))?;
            let resp = rx
                .message()
                .await?
                .ok_or_else(|| Status::unavailable(format!("upstream {name:?} closed without a response")))?;
            if let Some(rv1::server_reflection_response::MessageResponse::ErrorResponse(err)) = &resp.message_response {
                let code = tonic::Code::from_i32(err.error_code);
                if code != tonic::Code::NotFound {
                    let message = if crate::pipe::is_client_code(code) {
                        format!("{}: upstream {name:?}: {}", crate::error::MARKER, err.error_message)
                    } else {
                        err.error_message.clone()
                    };
                    return Err(Status::new(code, message));
                }
            }
            Ok::<_, Status>(resp)
        }
    });

    let responses = try_join_all(futures).await?;
    Ok(merge_responses(req, responses))
}

fn merge_responses(req: &rv1::ServerReflectionRequest, resps: Vec<rv1::ServerReflectionResponse>) -> rv1::ServerReflectionResponse {
    use rv1::server_reflection_request::MessageRequest as Req;

    let merged = match &req.message_request {
        Some(Req::FileByFilename(_)) | Some(Req::FileContainingSymbol(_)) | Some(Req::FileContainingExtension(_)) => {
            merge_descriptor_responses(&resps)
        }
        Some(Req::ListServices(_)) => merge_service_responses(&resps),
        Some(Req::AllExtensionNumbersOfType(_)) => resps.into_iter().next().and_then(|r| r.message_response),
        None => None,
    };

    let message_response = merged.unwrap_or_else(|| {
        rv1::server_reflection_response::MessageResponse::ErrorResponse(rv1::ErrorResponse {
            error_code: tonic::Code::NotFound as i32,
            error_message: format!("{} didn't find any response among the upstreams", crate::error::MARKER),
        })
    });

    rv1::ServerReflectionResponse {
        valid_host: String::new(),
        original_request: Some(req.clone()),
        message_response: Some(message_response),
    }
}

fn merge_descriptor_responses(resps: &[rv1::ServerReflectionResponse]) -> Option<rv1::server_reflection_response::MessageResponse> {
    let mut all = Vec::new();
    for resp in resps {
        if let Some(rv1::server_reflection_response::MessageResponse::FileDescriptorResponse(fd)) = &resp.message_response {
            all.extend(fd.file_descriptor_proto.iter().cloned());
        }
    }
    if all.is_empty() {
        return None;
    }
    Some(rv1::server_reflection_response::MessageResponse::FileDescriptorResponse(
        rv1::FileDescriptorResponse { file_descriptor_proto: all },
    ))
}

/// Union by service name, sorted lexicographically with no duplicates —
/// a deliberate improvement over the original's unsorted union (spec §8's
/// testable property requires lexicographic order).
fn merge_service_responses(resps: &[rv1::ServerReflectionResponse]) -> Option<rv1::server_reflection_response::MessageResponse> {
    let mut names: BTreeSet<String> = BTreeSet::new();
    for resp in resps {
        if let Some(rv1::server_reflection_response::MessageResponse::ListServicesResponse(list)) = &resp.message_response {
            for service in &list.service {
                names.insert(service.name.clone());
            }
        }
    }
    if names.is_empty() {
        return None;
    }
    Some(rv1::server_reflection_response::MessageResponse::ListServicesResponse(
        rv1::ListServiceResponse { service: names.into_iter().map(|name| rv1::ServiceResponse { name }).collect() },
    ))
}

/// `v1` ↔ `v1alpha` message conversion. The two protocols are structurally
/// identical field-for-field; only the generated Rust types differ.
mod convert {
    use super::{rv1, rv1a};

    pub fn request_to_v1(req: rv1a::ServerReflectionRequest) -> rv1::ServerReflectionRequest {
        use rv1::server_reflection_request::MessageRequest as V;
        use rv1a::server_reflection_request::MessageRequest as A;
        let message_request = req.message_request.map(|m| match m {
            A::FileByFilename(v) => V::FileByFilename(v),
            A::FileContainingSymbol(v) => V::FileContainingSymbol(v),
            A::FileContainingExtension(v) => V::FileContainingExtension(rv1::ExtensionRequest {
                containing_type: v.containing_type,
                extension_number: v.extension_number,
            }),
            A::AllExtensionNumbersOfType(v) => V::AllExtensionNumbersOfType(v),
            A::ListServices(v) => V::ListServices(v),
        });
        rv1::ServerReflectionRequest { host: req.host, message_request }
    }

    pub fn request_to_v1alpha(req: rv1::ServerReflectionRequest) -> rv1a::ServerReflectionRequest {
        use rv1::server_reflection_request::MessageRequest as V;
        use rv1a::server_reflection_request::MessageRequest as A;
        let message_request = req.message_request.map(|m| match m {
            V::FileByFilename(v) => A::FileByFilename(v),
            V::FileContainingSymbol(v) => A::FileContainingSymbol(v),
            V::FileContainingExtension(v) => A::FileContainingExtension(rv1a::ExtensionRequest {
                containing_type: v.containing_type,
                extension_number: v.extension_number,
            }),
            V::AllExtensionNumbersOfType(v) => A::AllExtensionNumbersOfType(v),
            V::ListServices(v) => A::ListServices(v),
        });
        rv1a::ServerReflectionRequest { host: req.host, message_request }
    }

    pub fn response_to_v1alpha(resp: rv1::ServerReflectionResponse) -> rv1a::ServerReflectionResponse {
        use rv1::server_reflection_response::MessageResponse as V;
        use rv1a::server_reflection_response::MessageResponse as A;
        let message_response = resp.message_response.map(|m| match m {
            V::FileDescriptorResponse(fd) => {
                A::FileDescriptorResponse(rv1a::FileDescriptorResponse { file_descriptor_proto: fd.file_descriptor_proto })
            }
            V::AllExtensionNumbersResponse(r) => A::AllExtensionNumbersResponse(rv1a::ExtensionNumberResponse {
                base_type_name: r.base_type_name,
                extension_number: r.extension_number,
            }),
            V::ListServicesResponse(list) => A::ListServicesResponse(rv1a::ListServiceResponse {
                service: list.service.into_iter().map(|s| rv1a::ServiceResponse { name: s.name }).collect(),
            }),
            V::ErrorResponse(err) => {
                A::ErrorResponse(rv1a::ErrorResponse { error_code: err.error_code, error_message: err.error_message })
            }
        });
        rv1a::ServerReflectionResponse {
            valid_host: resp.valid_host,
            original_request: resp.original_request.map(request_to_v1alpha),
            message_response,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list_services_resp(names: &[&str]) -> rv1::ServerReflectionResponse {
        rv1::ServerReflectionResponse {
            valid_host: String::new(),
            original_request: None,
            message_response: Some(rv1::server_reflection_response::MessageResponse::ListServicesResponse(
                rv1::ListServiceResponse {
                    service: names.iter().map(|n| rv1::ServiceResponse { name: n.to_string() }).collect(),
                },
            )),
        }
    }

    #[test]
    fn service_union_is_sorted_and_deduplicated() {
        let resps = vec![list_services_resp(&["b.Svc", "a.Svc"]), list_services_resp(&["a.Svc", "c.Svc"])];
        let merged = merge_service_responses(&resps).expect("non-empty union");
        let rv1::server_reflection_response::MessageResponse::ListServicesResponse(list) = merged else {
            panic!("wrong variant");
        };
        let names: Vec<&str> = list.service.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["a.Svc", "b.Svc", "c.Svc"]);
    }

    #[test]
    fn empty_union_yields_none() {
        assert!(merge_service_responses(&[]).is_none());
    }

    #[test]
    fn descriptor_concatenation_drops_errors() {
        let error = rv1::ServerReflectionResponse {
            valid_host: String::new(),
            original_request: None,
            message_response: Some(rv1::server_reflection_response::MessageResponse::ErrorResponse(rv1::ErrorResponse {
                error_code: tonic::Code::NotFound as i32,
                error_message: "nope".into(),
            })),
        };
        let ok = rv1::ServerReflectionResponse {
            valid_host: String::new(),
            original_request: None,
            message_response: Some(rv1::server_reflection_response::MessageResponse::FileDescriptorResponse(
                rv1::FileDescriptorResponse { file_descriptor_proto: vec![vec![1, 2, 3]] },
            )),
        };
        let merged = merge_descriptor_responses(&[error, ok]).expect("non-empty");
        let rv1::server_reflection_response::MessageResponse::FileDescriptorResponse(fd) = merged else {
            panic!("wrong variant");
        };
        assert_eq!(fd.file_descriptor_proto, vec![vec![1, 2, 3]]);
    }
}
