//! The compiled form of a snippet: either a fully static message, or one
//! with templated and/or matcher fields evaluated per invocation.

use std::collections::{BTreeMap, HashMap};

use bytes::Bytes;
use minijinja::Environment;
use prost::Message as _;
use prost_reflect::{DynamicMessage, FieldDescriptor, MessageDescriptor, Value};
use serde::Serialize;

use super::error::ProtodefError;
use super::value::parse_field_value;

/// Per-invocation data made available to matcher expressions and templated
/// fields alongside the message's own decoded fields.
///
/// `cancelled` is not part of the rendering context proper (it has no
/// sensible serialized form) but rides along so the mock pre-send delay can
/// be cut short by the server shell's own shutdown signal instead of running
/// to completion after the listener has already stopped accepting work.
#[derive(Debug, Clone, Default, Serialize)]
pub struct InvocationContext {
    pub method: String,
    pub metadata: BTreeMap<String, Vec<String>>,
    #[serde(skip)]
    pub cancelled: Option<tokio_util::sync::CancellationToken>,
}

/// All of a message's fields, decoded, keyed by field name. Built once per
/// inbound message and reused across `Generate`/matcher evaluation.
pub type DataMap = HashMap<String, Value>;

/// Decode `bytes` against `descriptor`, yielding every known field's value
/// (proto3 zero value when absent).
pub fn decode_data_map(descriptor: &MessageDescriptor, bytes: &[u8]) -> Result<DataMap, ProtodefError> {
    let msg = DynamicMessage::decode(descriptor.clone(), bytes)
        .map_err(|e| ProtodefError::Compile(format!("decoding message: {e}")))?;
    Ok(descriptor
        .fields()
        .map(|f| {
            let v = msg.get_field(&f).into_owned();
            (f.name().to_string(), v)
        })
        .collect())
}

struct TemplatedField {
    field: FieldDescriptor,
    tmpl_src: String,
}

struct MatcherField {
    field: FieldDescriptor,
    ast: rhai::AST,
}

/// A compiled snippet, ready to match inbound messages and/or generate
/// outbound ones.
pub enum Template {
    /// No field is templated or matcher-driven: the message is identical on
    /// every invocation.
    Static {
        descriptor: MessageDescriptor,
        message: DynamicMessage,
    },
    Combined {
        descriptor: MessageDescriptor,
        static_msg: DynamicMessage,
        templated: Vec<TemplatedField>,
        matchers: Vec<MatcherField>,
        env: Environment<'static>,
        engine: rhai::Engine,
    },
}

impl Template {
    pub(super) fn new_static(descriptor: MessageDescriptor, message: DynamicMessage) -> Self {
        Template::Static { descriptor, message }
    }

    pub(super) fn new_combined(
        descriptor: MessageDescriptor,
        static_msg: DynamicMessage,
        templated: Vec<(FieldDescriptor, String)>,
        matchers: Vec<(FieldDescriptor, rhai::AST)>,
        env: Environment<'static>,
    ) -> Self {
        let mut engine = rhai::Engine::new();
        engine.set_fast_operators(false);
        Template::Combined {
            descriptor,
            static_msg,
            templated: templated
                .into_iter()
                .map(|(field, tmpl_src)| TemplatedField { field, tmpl_src })
                .collect(),
            matchers: matchers
                .into_iter()
                .map(|(field, ast)| MatcherField { field, ast })
                .collect(),
            env,
            engine,
        }
    }

    pub fn descriptor(&self) -> &MessageDescriptor {
        match self {
            Template::Static { descriptor, .. } => descriptor,
            Template::Combined { descriptor, .. } => descriptor,
        }
    }

    pub fn data_map(&self, bytes: &[u8]) -> Result<DataMap, ProtodefError> {
        decode_data_map(self.descriptor(), bytes)
    }

    /// Whether the inbound message (after zeroing templated/matcher fields
    /// and dropping anything unknown to the descriptor) is byte-identical
    /// to the static prefill, and every matcher field evaluates truthy.
    pub fn matches(&self, bytes: &[u8], ctx: &InvocationContext) -> Result<bool, ProtodefError> {
        match self {
            Template::Static { descriptor, message } => {
                let cmp = normalize(descriptor, bytes, &[])?;
                Ok(cmp.encode_to_vec() == message.encode_to_vec())
            }
            Template::Combined {
                descriptor,
                static_msg,
                templated,
                matchers,
                engine,
                ..
            } => {
                let exclude: Vec<&FieldDescriptor> = templated
                    .iter()
                    .map(|t| &t.field)
                    .chain(matchers.iter().map(|m| &m.field))
                    .collect();
                let orig = DynamicMessage::decode(descriptor.clone(), bytes)
                    .map_err(|e| ProtodefError::Compile(format!("decoding message: {e}")))?;
                let cmp = normalize_from(&orig, descriptor, &exclude);
                if cmp.encode_to_vec() != static_msg.encode_to_vec() {
                    return Ok(false);
                }
                for m in matchers {
                    if !eval_matcher(engine, &m.ast, descriptor, &orig, &m.field, ctx)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
        }
    }

    /// Render the message to send: static fields as compiled, templated
    /// fields rendered against `data` merged with `ctx`.
    pub fn generate(&self, data: &DataMap, ctx: &InvocationContext) -> Result<Bytes, ProtodefError> {
        match self {
            Template::Static { message, .. } => Ok(Bytes::from(message.encode_to_vec())),
            Template::Combined {
                static_msg,
                templated,
                env,
                ..
            } => {
                let mut msg = static_msg.clone();
                if !templated.is_empty() {
                    let render_ctx = build_render_context(data, ctx)?;
                    for t in templated {
                        let rendered = env
                            .render_str(&t.tmpl_src, &render_ctx)
                            .map_err(|e| ProtodefError::Field {
                                field: t.field.full_name().to_string(),
                                message: format!("rendering template: {e}"),
                            })?;
                        let value = parse_field_value(&t.field, &rendered)?;
                        msg.set_field(&t.field, value);
                    }
                }
                Ok(Bytes::from(msg.encode_to_vec()))
            }
        }
    }
}

fn normalize(descriptor: &MessageDescriptor, bytes: &[u8], exclude: &[&FieldDescriptor]) -> Result<DynamicMessage, ProtodefError> {
    let orig = DynamicMessage::decode(descriptor.clone(), bytes)
        .map_err(|e| ProtodefError::Compile(format!("decoding message: {e}")))?;
    Ok(normalize_from(&orig, descriptor, exclude))
}

/// Copy only the fields the descriptor knows about (dropping anything
/// unknown to it) and clear `exclude`, so the result can be compared
/// byte-for-byte against a static prefill.
fn normalize_from(orig: &DynamicMessage, descriptor: &MessageDescriptor, exclude: &[&FieldDescriptor]) -> DynamicMessage {
    let mut cmp = DynamicMessage::new(descriptor.clone());
    for field in descriptor.fields() {
        if orig.has_field(&field) {
            cmp.set_field(&field, orig.get_field(&field).into_owned());
        }
    }
    for field in exclude {
        cmp.clear_field(field);
    }
    cmp
}

/// Evaluate a field's matcher expression with every known field of the
/// message bound by name (so a matcher can reference its own field, or any
/// sibling field, by that name) plus `ctx` bound to the invocation context.
/// Undefined-variable references are tolerated by the engine; only a
/// non-boolean result is an error.
fn eval_matcher(
    engine: &rhai::Engine,
    ast: &rhai::AST,
    descriptor: &MessageDescriptor,
    orig: &DynamicMessage,
    field: &FieldDescriptor,
    ctx: &InvocationContext,
) -> Result<bool, ProtodefError> {
    let mut scope = rhai::Scope::new();
    for f in descriptor.fields() {
        let value = orig.get_field(&f).into_owned();
        let value_dyn = rhai::serde::to_dynamic(&value).map_err(|e| ProtodefError::Field {
            field: field.full_name().to_string(),
            message: format!("converting field {:?} for matcher: {e}", f.name()),
        })?;
        scope.push(f.name().to_string(), value_dyn);
    }
    let ctx_dyn = rhai::serde::to_dynamic(ctx).map_err(|e| ProtodefError::Field {
        field: field.full_name().to_string(),
        message: format!("converting context for matcher: {e}"),
    })?;
    scope.push("ctx", ctx_dyn);

    let result: rhai::Dynamic = engine.eval_ast_with_scope(&mut scope, ast).map_err(|e| ProtodefError::Field {
        field: field.full_name().to_string(),
        message: format!("evaluating matcher: {e}"),
    })?;

    result.as_bool().map_err(|_| ProtodefError::Field {
        field: field.full_name().to_string(),
        message: "matcher must evaluate to a bool".into(),
    })
}

fn build_render_context(data: &DataMap, ctx: &InvocationContext) -> Result<minijinja::Value, ProtodefError> {
    let mut obj = serde_json::Map::with_capacity(data.len() + 1);
    for (name, value) in data {
        let v = serde_json::to_value(value)
            .map_err(|e| ProtodefError::Compile(format!("converting field {name:?} for templating: {e}")))?;
        obj.insert(name.clone(), v);
    }
    let ctx_json =
        serde_json::to_value(ctx).map_err(|e| ProtodefError::Compile(format!("converting context for templating: {e}")))?;
    obj.insert("ctx".to_string(), ctx_json);
    Ok(minijinja::Value::from_serialize(&serde_json::Value::Object(obj)))
}
