//! The on-disk configuration contract (spec §6): a YAML document naming
//! upstreams to dial and the rules that route calls to them or to a canned
//! response, plus one optional fallback applied when nothing else matches.

pub mod dial;
pub mod file;

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Deserialize;

use groxy_core::error::Error;

/// Schema version this binary understands; any other value is rejected.
pub const SUPPORTED_VERSION: &str = "1";

#[derive(Debug, Deserialize)]
pub struct Document {
    pub version: String,
    #[serde(default)]
    pub upstreams: BTreeMap<String, UpstreamCfg>,
    #[serde(default)]
    pub rules: Vec<RuleCfg>,
    #[serde(default, rename = "not-matched")]
    pub not_matched: Option<RespondCfg>,
}

#[derive(Debug, Deserialize)]
pub struct UpstreamCfg {
    pub address: String,
    #[serde(default)]
    pub tls: bool,
    #[serde(default, rename = "serve-reflection")]
    pub serve_reflection: bool,
}

#[derive(Debug, Deserialize)]
pub struct RuleCfg {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(rename = "match")]
    pub matcher: MatchCfg,
    #[serde(default)]
    pub respond: Option<RespondCfg>,
    #[serde(default)]
    pub forward: Option<ForwardCfg>,
}

#[derive(Debug, Default, Deserialize)]
pub struct MatchCfg {
    pub uri: String,
    #[serde(default)]
    pub header: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ForwardCfg {
    pub upstream: String,
    #[serde(default)]
    pub header: BTreeMap<String, String>,
    #[serde(default)]
    pub rewrite: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RespondCfg {
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub metadata: MetadataCfg,
    #[serde(default)]
    pub status: Option<StatusCfg>,
    #[serde(default, with = "humantime_serde")]
    pub delay: Option<Duration>,
}

#[derive(Debug, Default, Deserialize)]
pub struct MetadataCfg {
    #[serde(default)]
    pub header: BTreeMap<String, String>,
    #[serde(default)]
    pub trailer: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
pub struct StatusCfg {
    pub code: String,
    #[serde(default)]
    pub message: String,
}

/// Parse and shape-validate a YAML document. Doesn't dial upstreams or
/// compile snippets; [`file::build`] does that once parsing succeeds.
pub fn parse(yaml: &str) -> Result<Document, Error> {
    let doc: Document = serde_yaml::from_str(yaml).map_err(|e| Error::Config(format!("invalid YAML: {e}")))?;
    if doc.version != SUPPORTED_VERSION {
        return Err(Error::Config(format!(
            "unsupported config version {:?}, expected {SUPPORTED_VERSION:?}",
            doc.version
        )));
    }
    for rule in &doc.rules {
        if rule.matcher.uri.is_empty() {
            return Err(Error::Config("rule match.uri must not be empty".into()));
        }
        match (&rule.respond, &rule.forward) {
            (Some(_), Some(_)) => {
                return Err(Error::Config("rule has both respond and forward, exactly one is required".into()));
            }
            (None, None) => {
                return Err(Error::Config("rule has neither respond nor forward".into()));
            }
            _ => {}
        }
    }
    Ok(doc)
}

/// Maps the canonical gRPC status code names used in config (e.g.
/// `NOT_FOUND`) onto [`tonic::Code`]. Accepts the bare numeric form too,
/// since that's what a config built by hand will often contain.
pub fn parse_code(raw: &str) -> Result<tonic::Code, Error> {
    if let Ok(n) = raw.parse::<i32>() {
        return Ok(tonic::Code::from_i32(n));
    }
    let code = match raw.to_ascii_uppercase().as_str() {
        "OK" => tonic::Code::Ok,
        "CANCELLED" | "CANCELED" => tonic::Code::Cancelled,
        "UNKNOWN" => tonic::Code::Unknown,
        "INVALID_ARGUMENT" => tonic::Code::InvalidArgument,
        "DEADLINE_EXCEEDED" => tonic::Code::DeadlineExceeded,
        "NOT_FOUND" => tonic::Code::NotFound,
        "ALREADY_EXISTS" => tonic::Code::AlreadyExists,
        "PERMISSION_DENIED" => tonic::Code::PermissionDenied,
        "RESOURCE_EXHAUSTED" => tonic::Code::ResourceExhausted,
        "FAILED_PRECONDITION" => tonic::Code::FailedPrecondition,
        "ABORTED" => tonic::Code::Aborted,
        "OUT_OF_RANGE" => tonic::Code::OutOfRange,
        "UNIMPLEMENTED" => tonic::Code::Unimplemented,
        "INTERNAL" => tonic::Code::Internal,
        "UNAVAILABLE" => tonic::Code::Unavailable,
        "DATA_LOSS" => tonic::Code::DataLoss,
        "UNAUTHENTICATED" => tonic::Code::Unauthenticated,
        other => return Err(Error::Config(format!("unknown status code {other:?}"))),
    };
    Ok(code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unsupported_version() {
        let err = parse("version: \"2\"\nrules: []\n").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn rejects_respond_and_forward_together() {
        let yaml = r#"
version: "1"
upstreams:
  up:
    address: "127.0.0.1:1"
rules:
  - match: { uri: "/a/B" }
    respond: { status: { code: "OK" } }
    forward: { upstream: "up" }
"#;
        let err = parse(yaml).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn accepts_minimal_forward_rule() {
        let yaml = r#"
version: "1"
upstreams:
  up:
    address: "127.0.0.1:1"
rules:
  - match: { uri: "/a/B" }
    forward: { upstream: "up" }
"#;
        let doc = parse(yaml).expect("parses");
        assert_eq!(doc.rules.len(), 1);
        assert_eq!(doc.upstreams.len(), 1);
    }

    #[test]
    fn parses_known_status_codes() {
        assert_eq!(parse_code("NOT_FOUND").unwrap(), tonic::Code::NotFound);
        assert_eq!(parse_code("invalid_argument").unwrap(), tonic::Code::InvalidArgument);
        assert!(parse_code("NOT_A_CODE").is_err());
    }
}
