//! The file-backed discovery provider: polls a YAML document on disk on an
//! interval, debounces rapid successive writes, and turns its contents into
//! the upstreams and rules a [`groxy_core::discovery::Discovery`] merges.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use regex::Regex;
use tokio::sync::Mutex;
use tracing::warn;

use groxy_core::discovery::{Provider, ProviderSnapshot};
use groxy_core::error::Error;
use groxy_core::protodef::{compile, CompileOptions};
use groxy_core::rules::{Action, Forward, Mock, RequestMatcher, Rule, Upstream};

use super::{dial, parse, parse_code, Document, RespondCfg};

/// URI pattern for the rule synthesized from `not-matched`, matching every method.
const NOT_MATCHED_URI: &str = ".*";

pub struct FileProvider {
    name: String,
    file_name: PathBuf,
    check_interval: Duration,
    delay: Duration,
    last_modif: Mutex<Option<SystemTime>>,
}

impl FileProvider {
    pub fn new(file_name: impl Into<PathBuf>, check_interval: Duration, delay: Duration) -> Self {
        let file_name = file_name.into();
        let name = format!("file:{}", file_name.display());
        let initial = std::fs::metadata(&file_name).and_then(|m| m.modified()).ok();
        FileProvider {
            name,
            file_name,
            check_interval,
            delay,
            last_modif: Mutex::new(initial),
        }
    }
}

#[async_trait]
impl Provider for FileProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn snapshot(&self) -> Result<ProviderSnapshot, Error> {
        let yaml = tokio::fs::read_to_string(&self.file_name)
            .await
            .map_err(|e| Error::Config(format!("reading {:?}: {e}", self.file_name)))?;
        let doc = parse(&yaml)?;
        let (upstreams, rules) = build(&doc).await?;

        if let Ok(modif) = get_modif_time(&self.file_name).await {
            *self.last_modif.lock().await = Some(modif);
        }

        Ok(ProviderSnapshot { upstreams, rules })
    }

    async fn changed(&self) {
        loop {
            tokio::time::sleep(self.check_interval).await;
            let modif = match get_modif_time(&self.file_name).await {
                Ok(modif) => modif,
                Err(err) => {
                    warn!(file = %self.file_name.display(), error = %err, "skipping config check");
                    continue;
                }
            };
            let last = *self.last_modif.lock().await;
            if let Some(prev) = last {
                if modif <= prev {
                    continue;
                }
                if modif.duration_since(prev).unwrap_or_default() < self.delay {
                    continue;
                }
            }
            return;
        }
    }
}

async fn get_modif_time(path: &Path) -> Result<SystemTime, Error> {
    let meta = tokio::fs::metadata(path)
        .await
        .map_err(|e| Error::Config(format!("stat {:?}: {e}", path)))?;
    if meta.is_dir() {
        return Err(Error::Config(format!("{path:?} is a directory, not a file")));
    }
    meta.modified().map_err(|e| Error::Config(format!("reading mtime of {path:?}: {e}")))
}

/// Dials every upstream and compiles every rule (plus the synthesized
/// `not-matched` trailer, if present) against `doc`.
async fn build(doc: &Document) -> Result<(Vec<Upstream>, Vec<Rule>), Error> {
    let mut upstreams = Vec::with_capacity(doc.upstreams.len());
    for (name, cfg) in &doc.upstreams {
        if cfg.address.is_empty() {
            return Err(Error::Config(format!("upstream {name:?} has an empty address")));
        }
        let channel = dial::dial(&cfg.address, cfg.tls).await?;
        upstreams.push(Upstream {
            name: name.clone(),
            address: cfg.address.clone(),
            tls: cfg.tls,
            serve_reflection: cfg.serve_reflection,
            channel,
        });
    }

    let opts = CompileOptions::default();
    let mut rules = Vec::with_capacity(doc.rules.len() + 1);
    for (index, rule_cfg) in doc.rules.iter().enumerate() {
        let matcher = build_matcher(&rule_cfg.matcher, &opts)?;
        let action = match (&rule_cfg.respond, &rule_cfg.forward) {
            (Some(respond), None) => Action::Mock(build_mock(respond, &opts)?),
            (None, Some(forward)) => Action::Forward(Forward {
                upstream: forward.upstream.clone(),
                header: forward.header.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
                rewrite: forward.rewrite.clone(),
            }),
            _ => {
                return Err(Error::Config(format!(
                    "rule {:?} must set exactly one of respond or forward",
                    rule_cfg.name.as_deref().unwrap_or("<unnamed>")
                )));
            }
        };
        rules.push(Rule { matcher, action, source_index: index });
    }

    if let Some(not_matched) = &doc.not_matched {
        let matcher = RequestMatcher {
            uri: Some(Regex::new(NOT_MATCHED_URI).expect("constant regex compiles")),
            header: BTreeMap::new(),
            body: None,
        };
        let mock = build_mock(not_matched, &opts)?;
        rules.push(Rule {
            matcher,
            action: Action::Mock(mock),
            source_index: rules.len(),
        });
    }

    Ok((upstreams, rules))
}

fn build_matcher(cfg: &super::MatchCfg, opts: &CompileOptions) -> Result<RequestMatcher, Error> {
    let uri = Regex::new(&cfg.uri).map_err(|e| Error::Config(format!("invalid match.uri {:?}: {e}", cfg.uri)))?;

    let mut header = BTreeMap::new();
    for (key, pattern) in &cfg.header {
        // A plain literal behaves as exact-match once anchored; a caller
        // who wants genuine regex behavior just writes an unanchored group.
        let anchored = format!("^(?:{pattern})$");
        let compiled = Regex::new(&anchored)
            .map_err(|e| Error::Config(format!("invalid match.header[{key:?}] {pattern:?}: {e}")))?;
        header.insert(key.clone(), compiled);
    }

    let body = match &cfg.body {
        Some(snippet) => Some(Arc::new(compile(snippet, opts).map_err(|e| Error::Config(format!("compiling match.body: {e}")))?)),
        None => None,
    };

    Ok(RequestMatcher { uri: Some(uri), header, body })
}

fn build_mock(cfg: &RespondCfg, opts: &CompileOptions) -> Result<Mock, Error> {
    if cfg.body.is_some() && cfg.status.is_some() {
        return Err(Error::Config("respond must set exactly one of body or status, not both".into()));
    }
    if cfg.body.is_none() && cfg.status.is_none() {
        return Err(Error::Config("respond must set one of body or status".into()));
    }

    let message = match &cfg.body {
        Some(snippet) => Some(Arc::new(compile(snippet, opts).map_err(|e| Error::Config(format!("compiling respond.body: {e}")))?)),
        None => None,
    };

    let (code, status_message) = match &cfg.status {
        Some(status) => (parse_code(&status.code)?, status.message.clone()),
        None => (tonic::Code::Ok, String::new()),
    };

    Ok(Mock {
        message,
        status_message,
        headers: cfg.metadata.header.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        trailers: cfg.metadata.trailer.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        code,
        delay: cfg.delay,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_file_errors_cleanly() {
        let provider = FileProvider::new("/nonexistent/groxy.yml", Duration::from_secs(1), Duration::ZERO);
        let err = provider.snapshot().await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn not_matched_synthesizes_trailing_rule() {
        let yaml = r#"
version: "1"
not-matched:
  status: { code: "NOT_FOUND", message: "no route" }
"#;
        let doc = parse(yaml).expect("parses");
        let (upstreams, rules) = build(&doc).await.expect("builds");
        assert!(upstreams.is_empty());
        assert_eq!(rules.len(), 1);
        assert!(rules[0].matcher.uri.as_ref().unwrap().is_match("/any/Method"));
    }
}
