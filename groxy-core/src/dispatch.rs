//! The two-phase request dispatcher: decide which rule answers a call, then
//! either synthesize a response from a template (mock) or relay the call to
//! a dialled backend (forward).

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream, StreamExt};
use tonic::metadata::MetadataMap;
use tonic::{Code, Status};

use crate::codec::RawBytesCodec;
use crate::discovery::{Discovery, Snapshot};
use crate::error::Error;
use crate::pipe::{pipe, PipeStats};
use crate::protodef::{decode_data_map, DataMap, InvocationContext, ProtodefError};
use crate::rules::{Action, Forward, Mock, RequestMatcher, Rule};

/// A boxed, owned stream of message bodies or mid-stream errors; what both
/// the inbound call and an outbound forwarded call look like to this
/// module.
pub type BoxMessageStream = std::pin::Pin<Box<dyn Stream<Item = Result<Bytes, Status>> + Send>>;

/// What dispatch decided to answer the call with.
pub struct DispatchResponse {
    pub headers: MetadataMap,
    pub body: BoxMessageStream,
    /// Resolves once a forwarded call's pipe has fully drained; `None` for
    /// a mock, which never runs one.
    pub stats: Option<oneshot::Receiver<PipeStats>>,
}

/// Owns a [`Discovery`] handle and turns inbound calls into responses.
pub struct Dispatcher {
    discovery: Arc<Discovery>,
}

impl Dispatcher {
    pub fn new(discovery: Arc<Discovery>) -> Self {
        Dispatcher { discovery }
    }

    pub async fn dispatch(&self, ctx: InvocationContext, downstream: BoxMessageStream) -> Result<DispatchResponse, Status> {
        // Pin the current snapshot for the whole request: if the aggregator
        // swaps in a new one mid-dispatch, this call keeps using the
        // upstream connections it started with (spec §5's atomicity
        // guarantee); the old snapshot's upstreams are only dropped once
        // every borrower, including this one, releases its Arc.
        let snapshot = self.discovery.snapshot();

        let matched: Vec<&Rule> = snapshot
            .rules
            .iter()
            .filter(|r| r.matcher.matches_phase1(&ctx.method, &ctx.metadata))
            .collect();

        if matched.is_empty() {
            return Err(Status::from(Error::NoMatch));
        }

        // Phase 2 is only worth the cost of consuming the first inbound
        // message if at least one candidate carries a body matcher.
        let needs_phase2 = matched.iter().any(|r| r.matcher.has_body_matcher());

        let (chosen, peeked, downstream) = if needs_phase2 {
            let (first, replay) = peek_first(downstream).await?;
            let first_bytes = first.clone().unwrap_or_default();
            let mut chosen = None;
            for rule in &matched {
                let wins = match &rule.matcher.body {
                    Some(body) => body.matches(&first_bytes, &ctx).map_err(protodef_status)?,
                    None => true,
                };
                if wins {
                    chosen = Some(*rule);
                    break;
                }
            }
            let chosen = chosen.ok_or_else(|| Status::from(Error::NoMatch))?;
            (chosen, first, replay)
        } else {
            (matched[0], None, downstream)
        };

        match &chosen.action {
            Action::Mock(mock) => self.dispatch_mock(mock, &chosen.matcher, &ctx, peeked, downstream).await,
            Action::Forward(forward) => {
                self.dispatch_forward(forward, &chosen.matcher, &snapshot, &ctx, peeked, downstream).await
            }
        }
    }

    async fn dispatch_mock(
        &self,
        mock: &Mock,
        matcher: &RequestMatcher,
        ctx: &InvocationContext,
        peeked: Option<Bytes>,
        downstream: BoxMessageStream,
    ) -> Result<DispatchResponse, Status> {
        if mock.is_empty() {
            return Err(Status::from(Error::EmptyMock));
        }

        if let Some(delay) = mock.delay {
            if delay > std::time::Duration::ZERO {
                let cancellation = async {
                    match &ctx.cancelled {
                        Some(token) => token.cancelled().await,
                        None => std::future::pending().await,
                    }
                };
                tokio::select! {
                    biased;
                    _ = cancellation => {
                        return Err(Status::cancelled("request cancelled during mock delay"));
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }

        let mut headers = MetadataMap::new();
        for (key, value) in &mock.headers {
            insert_ascii(&mut headers, key, value);
        }

        let mut trailers = MetadataMap::new();
        for (key, value) in &mock.trailers {
            insert_ascii(&mut trailers, key, value);
        }

        if mock.code != Code::Ok {
            // End the stream with the configured status; headers still need
            // to reach the caller, so they ride along on the same response.
            drain_in_background(downstream);
            let mut status = Status::new(mock.code, mock.status_message.clone());
            *status.metadata_mut() = trailers;
            let stream: BoxMessageStream = Box::pin(tokio_stream::iter([Err(status)]));
            return Ok(DispatchResponse { headers, body: stream, stats: None });
        }

        let template = mock.message.as_ref().ok_or_else(|| Status::from(Error::EmptyMock))?;

        let (first, rest) = match peeked {
            Some(bytes) => (bytes, downstream),
            None => {
                let (first, replay) = peek_first(downstream).await?;
                (first.unwrap_or_default(), replay)
            }
        };
        // The data map a response template renders against is sourced from
        // the *request* matcher's own body template, since that's the
        // schema the inbound bytes were actually encoded with (spec §4.F.5:
        // "call DataMap(firstRecv)" on the rule's body-matcher template). A
        // rule with no body matcher at all has no such schema to decode
        // against, so fall back to the response template's own descriptor,
        // which at least lets `{{ .field }}` references resolve against a
        // zero value instead of erroring.
        let data: DataMap = match &matcher.body {
            Some(body_template) => body_template.data_map(&first).map_err(protodef_status)?,
            None => decode_data_map(template.descriptor(), &first).map_err(protodef_status)?,
        };
        let body = template.generate(&data, ctx).map_err(protodef_status)?;

        drain_in_background(rest);

        let stream: BoxMessageStream = Box::pin(tokio_stream::iter([Ok(body)]).chain(trailer_terminator(trailers)));
        Ok(DispatchResponse { headers, body: stream, stats: None })
    }

    async fn dispatch_forward(
        &self,
        forward: &Forward,
        matcher: &crate::rules::RequestMatcher,
        snapshot: &Snapshot,
        ctx: &InvocationContext,
        peeked: Option<Bytes>,
        downstream: BoxMessageStream,
    ) -> Result<DispatchResponse, Status> {
        let upstream = snapshot
            .upstream(&forward.upstream)
            .ok_or_else(|| Status::from(Error::UpstreamDial(format!("unknown upstream {:?}", forward.upstream))))?;

        let method = match (&matcher.uri, &forward.rewrite) {
            (Some(uri), Some(rewrite)) => uri.replace_all(&ctx.method, rewrite.as_str()).into_owned(),
            _ => ctx.method.clone(),
        };
        let path: http::uri::PathAndQuery = method
            .parse()
            .map_err(|_| Status::invalid_argument(format!("invalid forwarded method {method:?}")))?;

        // Plant the Forward's extra headers into the outgoing metadata,
        // only where the caller didn't already set that key (spec §4.F.6).
        let mut outgoing = MetadataMap::new();
        for (key, values) in &ctx.metadata {
            for value in values {
                insert_ascii(&mut outgoing, key, value);
            }
        }
        for (key, value) in &forward.header {
            if outgoing.get(key.as_str()).is_none() {
                insert_ascii(&mut outgoing, key, value);
            }
        }

        let (upstream_tx, upstream_rx_send) = mpsc::channel::<Bytes>(16);
        if let Some(first) = &peeked {
            if upstream_tx.send(first.clone()).await.is_err() {
                return Err(Status::unavailable("failed to queue first forwarded message"));
            }
        }

        let mut client = tonic::client::Grpc::new(upstream.channel.clone());
        client
            .ready()
            .await
            .map_err(|e| Status::from(Error::UpstreamDial(format!("{:?}: {e}", upstream.name))))?;

        let mut request = tonic::Request::new(ReceiverStream::new(upstream_rx_send));
        *request.metadata_mut() = outgoing;

        let response = client.streaming(request, path, RawBytesCodec::default()).await?;
        let (upstream_headers, upstream_body, _extensions) = response.into_parts();

        // Run the pipe (§4.B) on a detached task so `dispatch_forward` can
        // return the response headers to the server shell immediately,
        // streaming the body (and, once both directions have drained, the
        // joined header+trailer metadata) through `downstream_rx`.
        let (downstream_tx, downstream_rx) = mpsc::channel::<Result<Bytes, Status>>(16);
        let header_snapshot = upstream_headers.clone();
        let trailer_tx = downstream_tx.clone();
        let (stats_tx, stats_rx) = oneshot::channel::<PipeStats>();
        tokio::spawn(async move {
            match pipe(downstream, upstream_tx, upstream_body, downstream_tx).await {
                Ok((stats, trailers)) => {
                    let _ = stats_tx.send(stats);
                    let mut joined = header_snapshot;
                    append_metadata(&mut joined, &trailers);
                    if !joined.is_empty() {
                        let mut status = Status::ok("");
                        *status.metadata_mut() = joined;
                        let _ = trailer_tx.send(Err(status)).await;
                    }
                }
                Err(status) => {
                    let _ = trailer_tx.send(Err(status)).await;
                }
            }
        });

        let stream: BoxMessageStream = Box::pin(ReceiverStream::new(downstream_rx));
        Ok(DispatchResponse { headers: upstream_headers, body: stream, stats: Some(stats_rx) })
    }
}

/// Consume exactly one message off `stream` (the request-scoped carrier of
/// spec §4.F.3), returning it alongside the *remainder* of the stream: the
/// first message is not replayed onto it, since every caller of this
/// function already has it in hand and forwarding both would double-send it
/// upstream.
async fn peek_first(mut stream: BoxMessageStream) -> Result<(Option<Bytes>, BoxMessageStream), Status> {
    match stream.next().await {
        Some(Ok(bytes)) => Ok((Some(bytes), stream)),
        Some(Err(status)) => Err(status),
        None => Ok((None, Box::pin(tokio_stream::empty()))),
    }
}

/// A mock doesn't read further than the messages it needs for matching, but
/// the downstream call still needs its stream drained to observe a clean
/// half-close rather than an abandoned call.
fn drain_in_background(mut stream: BoxMessageStream) {
    tokio::spawn(async move { while stream.next().await.is_some() {} });
}

/// A single-item stream carrying `trailers` as a successful (`Code::Ok`)
/// terminal status, the mechanism the server shell uses to attach custom
/// trailing metadata to an otherwise successful response. Empty when there
/// is nothing to attach, so it doesn't inject a spurious trailer frame.
fn trailer_terminator(trailers: MetadataMap) -> impl Stream<Item = Result<Bytes, Status>> {
    let item = if trailers.is_empty() {
        None
    } else {
        let mut status = Status::ok("");
        *status.metadata_mut() = trailers;
        Some(Err(status))
    };
    tokio_stream::iter(item)
}

fn insert_ascii(map: &mut MetadataMap, key: &str, value: &str) {
    if let (Ok(key), Ok(value)) = (key.parse(), value.parse()) {
        map.insert(key, value);
    }
}

/// Append every entry of `from` onto `into`, preserving repeated keys
/// (`MetadataMap::insert` would instead replace them).
fn append_metadata(into: &mut MetadataMap, from: &MetadataMap) {
    for kv in from.iter() {
        match kv {
            tonic::metadata::KeyAndValueRef::Ascii(key, value) => {
                into.append(key.clone(), value.clone());
            }
            tonic::metadata::KeyAndValueRef::Binary(key, value) => {
                into.append_bin(key.clone(), value.clone());
            }
        }
    }
}

fn protodef_status(err: ProtodefError) -> Status {
    Status::from(Error::TemplateGenerate(err.to_string()))
}
