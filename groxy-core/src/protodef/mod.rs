//! Compiles Protobuf-snippet templates (mocks and forward-rewrites) and
//! evaluates them against inbound messages.
//!
//! A snippet is a Protobuf message literal enriched with three custom field
//! options (`value`, `matcher`) and one message option (`target`), folded
//! and compiled on the fly with `protox`. The result is a [`Template`]: a
//! value that can decide whether an inbound message matches it, and can
//! generate an outbound message from a combination of the inbound message's
//! own fields and the invocation's metadata.

mod annotations;
mod compiler;
pub mod error;
mod fold;
mod funcs;
mod template;
mod value;

pub use compiler::{compile, CompileOptions};
pub use error::ProtodefError;
pub use funcs::ExtraFunc;
pub use template::{decode_data_map, DataMap, InvocationContext, Template};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_snippet_compiles_and_matches_itself() {
        let snippet = r#"
message Reply {
  option (groxypb.target) = true;
  string greeting = 1 [(groxypb.value) = "hello"];
}
"#;
        let tmpl = compile(snippet, &CompileOptions::default()).expect("compiles");
        let ctx = InvocationContext::default();
        let data = decode_data_map(tmpl.descriptor(), &[]).expect("decode empty");
        let generated = tmpl.generate(&data, &ctx).expect("generate");
        assert!(tmpl.matches(&generated, &ctx).expect("matches"));
    }

    #[test]
    fn missing_target_is_reported() {
        let snippet = r#"
message Reply {
  string greeting = 1;
}
"#;
        let err = compile(snippet, &CompileOptions::default()).unwrap_err();
        matches!(err, ProtodefError::NoTarget);
    }
}
