//! The ambient concerns wrapped around every call: panic recovery, the
//! `app`/`author`/`version` response headers, metadata pass-through, timed
//! logging, and the embedded health responder. The server shell (§4.I)
//! applies these in the left-to-right order spec.md §4.H describes; they are
//! plain functions rather than a `tower` stack because the server shell
//! already hand-rolls its own dispatch instead of building on
//! `tonic::transport::Server`'s fixed-route `Router`.

use std::fmt::Write as _;
use std::future::Future;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use http::HeaderMap;
use tonic::metadata::{KeyAndValueRef, MetadataMap};
use tonic::Status;
use tracing::{debug, info, warn};

use crate::error::Error;
use crate::pipe::PipeStats;

/// Static response headers and the message a recovered panic is reported
/// with; configured once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub app: String,
    pub author: String,
    pub version: String,
    pub recoverer_message: String,
    pub debug: bool,
}

/// **AppInfo**: writes `app`, `author`, `version` response headers. Applied
/// to the raw HTTP response headers, the one shape every branch of the
/// server shell (dynamic dispatch, reflection, health) converges on before
/// the response leaves the handler.
pub fn apply_app_info(headers: &mut HeaderMap, cfg: &Config) {
    insert(headers, "app", &cfg.app);
    insert(headers, "author", &cfg.author);
    insert(headers, "version", &cfg.version);
}

fn insert(headers: &mut HeaderMap, key: &'static str, value: &str) {
    if let Ok(value) = http::HeaderValue::from_str(value) {
        headers.insert(key, value);
    }
}

/// **Recoverer**: run `fut`, catching a panic instead of letting it unwind
/// across the task boundary. A caught panic is logged with `method`/`peer`
/// and turned into a `ResourceExhausted` status carrying `message`.
pub async fn recover<F, T>(method: &str, peer: Option<SocketAddr>, message: &str, fut: F) -> Result<T, Status>
where
    F: Future<Output = Result<T, Status>>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => {
            let reason = panic_message(&panic);
            warn!(method, peer = ?peer, panic = %reason, "recovered from panic in handler");
            Err(Status::from(Error::Recovered(message.to_string())))
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Headers whose values are hidden as `***` in debug-mode call logs.
const REDACTED_HEADERS: &[&str] = &["authorization", "cookie", "set-cookie"];

/// **Log**: times the call and logs its outcome; in debug mode also dumps
/// headers/trailers with sensitive ones redacted.
pub struct CallLog {
    method: String,
    peer: Option<SocketAddr>,
    started: Instant,
    debug: bool,
}

impl CallLog {
    pub fn start(method: impl Into<String>, peer: Option<SocketAddr>, debug: bool) -> Self {
        CallLog { method: method.into(), peer, started: Instant::now(), debug }
    }

    pub fn finish(self, stats: Option<PipeStats>, headers: Option<&MetadataMap>, trailers: Option<&MetadataMap>, outcome: &Result<(), Status>) {
        let elapsed = self.started.elapsed();
        match outcome {
            Ok(()) => info!(
                method = %self.method,
                peer = ?self.peer,
                elapsed_ms = elapsed.as_millis() as u64,
                sent_messages = stats.map(|s| s.sent_messages),
                received_messages = stats.map(|s| s.received_messages),
                sent_bytes = stats.map(|s| s.sent_bytes),
                received_bytes = stats.map(|s| s.received_bytes),
                "call completed"
            ),
            Err(status) => warn!(
                method = %self.method,
                peer = ?self.peer,
                elapsed_ms = elapsed.as_millis() as u64,
                code = ?status.code(),
                message = %status.message(),
                "call failed"
            ),
        }

        if self.debug {
            if let Some(headers) = headers {
                debug!(method = %self.method, headers = %dump(headers), "request headers");
            }
            if let Some(trailers) = trailers {
                debug!(method = %self.method, trailers = %dump(trailers), "response trailers");
            }
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

fn dump(map: &MetadataMap) -> String {
    let mut out = String::new();
    for kv in map.iter() {
        let (key, value) = match kv {
            KeyAndValueRef::Ascii(key, value) => (key.as_str().to_string(), value.to_str().unwrap_or("<invalid>").to_string()),
            KeyAndValueRef::Binary(key, value) => (key.as_str().to_string(), format!("{value:?}")),
        };
        let shown = if REDACTED_HEADERS.contains(&key.as_str()) { "***".to_string() } else { value };
        let _ = write!(out, "{key}={shown}; ");
    }
    out
}

/// **Maybe(flag, mw)**: conditional enable — evaluates `build` only when
/// `flag` is set.
pub fn maybe<T>(flag: bool, build: impl FnOnce() -> T) -> Option<T> {
    flag.then(build)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redacted_headers_are_hidden() {
        let mut headers = MetadataMap::new();
        headers.insert("authorization", "Bearer secret".parse().unwrap());
        headers.insert("x-request-id", "abc".parse().unwrap());
        let dumped = dump(&headers);
        assert!(dumped.contains("authorization=***"));
        assert!(dumped.contains("x-request-id=abc"));
    }

    #[tokio::test]
    async fn recover_turns_panic_into_resource_exhausted() {
        let result: Result<(), Status> = recover("method", None, "boom", async { panic!("oh no") }).await;
        let status = result.unwrap_err();
        assert_eq!(status.code(), tonic::Code::ResourceExhausted);
        assert!(status.message().contains("boom"));
    }

    #[test]
    fn maybe_only_builds_when_enabled() {
        assert!(maybe(false, || 1).is_none());
        assert_eq!(maybe(true, || 1), Some(1));
    }
}
