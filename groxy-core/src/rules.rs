//! The data model discovery providers produce and the dispatcher consumes:
//! upstreams to dial, and the rules that decide which upstream (or canned
//! response) answers a given call.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use tonic::transport::Channel;
use tonic::Code;

use crate::protodef::Template;

/// A dialled (or dialable) backend a [`Forward`] action can route to.
#[derive(Clone)]
pub struct Upstream {
    pub name: String,
    pub address: String,
    pub tls: bool,
    pub serve_reflection: bool,
    pub channel: Channel,
}

impl std::fmt::Debug for Upstream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Upstream")
            .field("name", &self.name)
            .field("address", &self.address)
            .field("tls", &self.tls)
            .field("serve_reflection", &self.serve_reflection)
            .finish()
    }
}

/// A canned response built from a compiled template, plus the headers,
/// trailers, status and pre-send delay it's delivered with.
///
/// Exactly one of `message` (body) or `code != Ok` (status) should be set by
/// the provider that built this `Mock`; neither set is the "empty mock"
/// configuration error (`Error::EmptyMock`).
pub struct Mock {
    pub message: Option<Arc<Template>>,
    pub status_message: String,
    pub headers: Vec<(String, String)>,
    pub trailers: Vec<(String, String)>,
    pub code: Code,
    pub delay: Option<Duration>,
}

impl std::fmt::Debug for Mock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mock")
            .field("has_message", &self.message.is_some())
            .field("headers", &self.headers)
            .field("trailers", &self.trailers)
            .field("code", &self.code)
            .field("delay", &self.delay)
            .finish()
    }
}

impl Default for Mock {
    fn default() -> Self {
        Mock {
            message: None,
            status_message: String::new(),
            headers: Vec::new(),
            trailers: Vec::new(),
            code: Code::Ok,
            delay: None,
        }
    }
}

impl Mock {
    /// A mock is "ill-formed" (`Error::EmptyMock`) when a provider produced
    /// neither a body template nor a non-`Ok` status.
    pub fn is_empty(&self) -> bool {
        self.message.is_none() && self.code == Code::Ok
    }
}

/// Routes a matched call to a named upstream, optionally adding headers to
/// the outgoing metadata and/or rewriting the method path before piping the
/// rest of the call through unmodified.
///
/// A path rewrite is applied as `matcher.uri.replace_all(method, rewrite)`:
/// it reuses the owning rule's own URI regex as the pattern, so there is
/// nothing to compile here beyond the replacement template string.
#[derive(Debug)]
pub struct Forward {
    pub upstream: String,
    pub header: Vec<(String, String)>,
    pub rewrite: Option<String>,
}

/// What a matched rule does once phase 1 (and, if needed, phase 2)
/// matching picks it.
pub enum Action {
    Mock(Mock),
    Forward(Forward),
}

impl std::fmt::Debug for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Action::Mock(m) => f.debug_tuple("Mock").field(m).finish(),
            Action::Forward(fwd) => f.debug_tuple("Forward").field(fwd).finish(),
        }
    }
}

/// Phase 1 is URI and metadata matching; phase 2, only reached when phase 1
/// leaves more than one candidate with a body matcher, inspects the first
/// message's contents.
pub struct RequestMatcher {
    pub uri: Option<Regex>,
    pub header: BTreeMap<String, Regex>,
    pub body: Option<Arc<Template>>,
}

impl std::fmt::Debug for RequestMatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestMatcher")
            .field("uri", &self.uri.as_ref().map(Regex::as_str))
            .field("header_keys", &self.header.keys().collect::<Vec<_>>())
            .field("has_body", &self.body.is_some())
            .finish()
    }
}

impl RequestMatcher {
    /// Phase 1: does `method` and `metadata` satisfy this rule's URI and
    /// header constraints? Each header key present on the rule must match
    /// at least one value under that key in `metadata`, anchored regex
    /// semantics (a plain string behaves as an exact match).
    pub fn matches_phase1(&self, method: &str, metadata: &BTreeMap<String, Vec<String>>) -> bool {
        if let Some(uri) = &self.uri {
            if !uri.is_match(method) {
                return false;
            }
        }
        for (key, pattern) in &self.header {
            let matched = metadata
                .get(key)
                .map(|values| values.iter().any(|v| pattern.is_match(v)))
                .unwrap_or(false);
            if !matched {
                return false;
            }
        }
        true
    }

    pub fn has_body_matcher(&self) -> bool {
        self.body.is_some()
    }
}

/// A single entry from a discovery provider: a matcher and the action to
/// take when it wins.
pub struct Rule {
    pub matcher: RequestMatcher,
    pub action: Action,
    /// Position in the provider's own listing, used only to break ties
    /// between otherwise equally-specific rules.
    pub source_index: usize,
}

impl std::fmt::Debug for Rule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rule")
            .field("matcher", &self.matcher)
            .field("action", &self.action)
            .field("source_index", &self.source_index)
            .finish()
    }
}

/// Sort rules for phase 1 evaluation: rules with more header constraints
/// first (more specific wins), a body matcher present breaks remaining
/// ties, then stable source order.
pub fn sort_rules(rules: &mut [Rule]) {
    rules.sort_by(|a, b| {
        b.matcher
            .header
            .len()
            .cmp(&a.matcher.header.len())
            .then_with(|| b.matcher.body.is_some().cmp(&a.matcher.body.is_some()))
            .then_with(|| a.source_index.cmp(&b.source_index))
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matcher(headers: usize, body: bool) -> RequestMatcher {
        let mut header = BTreeMap::new();
        for i in 0..headers {
            header.insert(format!("k{i}"), Regex::new(".*").unwrap());
        }
        RequestMatcher { uri: None, header, body: if body { Some(Arc::new(stub_body_template())) } else { None } }
    }

    fn stub_body_template() -> crate::protodef::Template {
        crate::protodef::compile(
            r#"
message Probe {
  option (groxypb.target) = true;
  string greeting = 1 [(groxypb.value) = "hello"];
}
"#,
            &crate::protodef::CompileOptions::default(),
        )
        .expect("stub body template compiles")
    }

    #[test]
    fn more_specific_rules_sort_first() {
        let mut rules = vec![
            Rule { matcher: matcher(0, false), action: Action::Mock(Mock::default()), source_index: 0 },
            Rule { matcher: matcher(2, false), action: Action::Mock(Mock::default()), source_index: 1 },
            Rule { matcher: matcher(1, false), action: Action::Mock(Mock::default()), source_index: 2 },
        ];
        sort_rules(&mut rules);
        let header_counts: Vec<usize> = rules.iter().map(|r| r.matcher.header.len()).collect();
        assert_eq!(header_counts, vec![2, 1, 0]);
    }

    #[test]
    fn ties_break_by_source_order() {
        let mut rules = vec![
            Rule { matcher: matcher(1, false), action: Action::Mock(Mock::default()), source_index: 3 },
            Rule { matcher: matcher(1, false), action: Action::Mock(Mock::default()), source_index: 1 },
        ];
        sort_rules(&mut rules);
        assert_eq!(rules[0].source_index, 1);
        assert_eq!(rules[1].source_index, 3);
    }

    #[test]
    fn body_matcher_wins_remaining_header_count_ties() {
        let mut rules = vec![
            Rule { matcher: matcher(1, false), action: Action::Mock(Mock::default()), source_index: 0 },
            Rule { matcher: matcher(1, true), action: Action::Mock(Mock::default()), source_index: 1 },
        ];
        sort_rules(&mut rules);
        assert!(rules[0].matcher.body.is_some(), "the body-bearing rule sorts first on a header-count tie");
        assert!(rules[1].matcher.body.is_none());
    }
}
