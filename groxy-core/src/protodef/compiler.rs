//! Turns a snippet's source text into a compiled [`Template`]: fold
//! multi-line strings, prefix the boilerplate every snippet shares, compile
//! it with `protox`, locate the target message, and classify its fields.

use std::collections::HashMap;
use std::fs;

use prost_reflect::DescriptorPool;
use regex::Regex;

use super::annotations;
use super::error::ProtodefError;
use super::fold::fold;
use super::funcs::{build_environment, ExtraFunc};
use super::template::Template;

/// The three lines prepended to every folded snippet before compilation.
/// Syntax errors reported by the compiler are shifted back by this many
/// lines so they point at the user's original text.
const PREFIX_LINES: usize = 3;

const ANNOTATIONS_PROTO: &str = include_str!("annotations.proto");
const GENERATED_FILE_NAME: &str = "groxy_runtime_gen.proto";

/// Functions and other knobs an embedder can override when compiling
/// snippets.
#[derive(Default, Clone)]
pub struct CompileOptions {
    pub extra_funcs: HashMap<String, ExtraFunc>,
}

/// The only import a snippet is allowed to declare on its own; the compiler
/// already injects it once as part of the shared prefix.
const ALLOWED_IMPORT: &str = "groxypb/annotations.proto";

/// Snippets may not import anything beyond the annotations this compiler
/// already injects: there is no second file on disk for a user-declared
/// import to resolve against, and allowing arbitrary imports would leak the
/// compiler's scratch directory layout into what's a user-facing template
/// language.
fn reject_foreign_imports(folded: &str) -> Result<(), ProtodefError> {
    let re = Regex::new(r#"(?m)^\s*import\s+"([^"]+)"\s*;"#).unwrap();
    for caps in re.captures_iter(folded) {
        let path = &caps[1];
        if path != ALLOWED_IMPORT {
            return Err(ProtodefError::UnknownImport(path.to_string()));
        }
    }
    Ok(())
}

/// Compile `snippet` into a [`Template`].
pub fn compile(snippet: &str, opts: &CompileOptions) -> Result<Template, ProtodefError> {
    let folded = fold(snippet)?;
    reject_foreign_imports(&folded)?;
    let prefixed = format!("syntax = \"proto3\";\nimport \"groxypb/annotations.proto\";\n\n{folded}");

    let dir = tempfile::tempdir().map_err(|e| ProtodefError::Compile(format!("creating scratch dir: {e}")))?;
    let groxypb_dir = dir.path().join("groxypb");
    fs::create_dir_all(&groxypb_dir).map_err(|e| ProtodefError::Compile(format!("creating scratch dir: {e}")))?;
    fs::write(groxypb_dir.join("annotations.proto"), ANNOTATIONS_PROTO)
        .map_err(|e| ProtodefError::Compile(format!("writing annotations.proto: {e}")))?;
    let proto_path = dir.path().join(GENERATED_FILE_NAME);
    fs::write(&proto_path, &prefixed).map_err(|e| ProtodefError::Compile(format!("writing snippet: {e}")))?;

    let fds = protox::compile([GENERATED_FILE_NAME], [dir.path()]).map_err(adjust_protox_error)?;

    let pool = DescriptorPool::from_file_descriptor_set(fds)
        .map_err(|e| ProtodefError::Compile(format!("building descriptor pool: {e}")))?;

    let file = pool
        .get_file_by_name(GENERATED_FILE_NAME)
        .ok_or_else(|| ProtodefError::Compile("compiled snippet missing from pool".into()))?;

    let mut targets = Vec::new();
    for message in file.messages() {
        if annotations::is_target(&pool, &message)? {
            targets.push(message);
        }
    }

    let target = match targets.len() {
        0 => return Err(ProtodefError::NoTarget),
        1 => targets.remove(0),
        _ => return Err(ProtodefError::MultipleTarget(targets.iter().map(|m| m.full_name().to_string()).collect())),
    };

    let mut static_msg = prost_reflect::DynamicMessage::new(target.clone());
    let mut templated = Vec::new();
    let mut matchers = Vec::new();
    let engine = rhai::Engine::new();

    for field in target.fields() {
        // Classification follows the spec's if/else-if/else order: a
        // templated `value` wins over a `matcher` on the same field, a
        // `matcher` wins over treating the field as static, and a field with
        // neither annotation is static with its (possibly empty) `value`.
        let value_src = annotations::value_of(&pool, &field)?;
        if let Some(value_src) = &value_src {
            if annotations::looks_like_template(value_src) {
                templated.push((field, value_src.clone()));
                continue;
            }
        }
        if let Some(matcher_src) = annotations::matcher_of(&pool, &field)? {
            let ast = engine.compile_expression(&matcher_src).map_err(|e| ProtodefError::Field {
                field: field.full_name().to_string(),
                message: format!("compiling matcher: {e}"),
            })?;
            matchers.push((field, ast));
            continue;
        }
        let value = super::value::parse_field_value(&field, value_src.as_deref().unwrap_or(""))?;
        static_msg.set_field(&field, value);
    }

    if templated.is_empty() && matchers.is_empty() {
        return Ok(Template::new_static(target, static_msg));
    }

    let env = build_environment(&opts.extra_funcs);
    Ok(Template::new_combined(target, static_msg, templated, matchers, env))
}

fn adjust_protox_error(e: protox::Error) -> ProtodefError {
    let message = e.to_string();
    let re = Regex::new(r":(\d+):(\d+)").unwrap();
    if let Some(caps) = re.captures(&message) {
        let line: usize = caps[1].parse().unwrap_or(0);
        let col: usize = caps[2].parse().unwrap_or(0);
        let line = line.saturating_sub(PREFIX_LINES).max(1);
        return ProtodefError::Syntax { line, col, message };
    }
    ProtodefError::Syntax { line: 0, col: 0, message }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn foreign_import_is_rejected() {
        let snippet = r#"
import "google/protobuf/any.proto";

message Reply {
  option (groxypb.target) = true;
  string greeting = 1;
}
"#;
        let err = compile(snippet, &CompileOptions::default()).unwrap_err();
        assert!(matches!(err, ProtodefError::UnknownImport(path) if path == "google/protobuf/any.proto"));
    }

    #[test]
    fn the_shared_annotations_import_is_allowed_if_repeated() {
        let snippet = r#"
import "groxypb/annotations.proto";

message Reply {
  option (groxypb.target) = true;
  string greeting = 1;
}
"#;
        compile(snippet, &CompileOptions::default()).expect("compiles");
    }
}
