//! Readers for the `groxypb.target`/`groxypb.value`/`groxypb.matcher`
//! custom options, looked up as extensions against a [`DescriptorPool`]
//! that has `annotations.proto` compiled into it.

use prost::Message;
use prost_reflect::{DescriptorPool, DynamicMessage, ExtensionDescriptor, FieldDescriptor, MessageDescriptor};

use super::error::ProtodefError;

const TARGET_EXT: &str = "groxypb.target";
const VALUE_EXT: &str = "groxypb.value";
const MATCHER_EXT: &str = "groxypb.matcher";

fn extension(pool: &DescriptorPool, full_name: &str) -> Result<ExtensionDescriptor, ProtodefError> {
    pool.get_extension_by_name(full_name)
        .ok_or_else(|| ProtodefError::Compile(format!("annotations.proto not present in pool: missing {full_name}")))
}

/// Re-encode `message.options()` and decode it back as a [`DynamicMessage`]
/// against the pool's own (extension-aware) descriptor for the options
/// message type, so extension fields registered from `annotations.proto`
/// become visible.
fn dynamic_message_options(pool: &DescriptorPool, message: &MessageDescriptor) -> Result<DynamicMessage, ProtodefError> {
    let bytes = message.options().encode_to_vec();
    let desc = pool
        .get_message_by_name("google.protobuf.MessageOptions")
        .ok_or_else(|| ProtodefError::Compile("google.protobuf.MessageOptions missing from pool".into()))?;
    DynamicMessage::decode(desc, bytes.as_slice())
        .map_err(|e| ProtodefError::Compile(format!("decoding message options: {e}")))
}

fn dynamic_field_options(pool: &DescriptorPool, field: &FieldDescriptor) -> Result<DynamicMessage, ProtodefError> {
    let bytes = field.options().encode_to_vec();
    let desc = pool
        .get_message_by_name("google.protobuf.FieldOptions")
        .ok_or_else(|| ProtodefError::Compile("google.protobuf.FieldOptions missing from pool".into()))?;
    DynamicMessage::decode(desc, bytes.as_slice())
        .map_err(|e| ProtodefError::Compile(format!("decoding field options: {e}")))
}

/// Whether `message` carries `groxypb.target = true`.
pub fn is_target(pool: &DescriptorPool, message: &MessageDescriptor) -> Result<bool, ProtodefError> {
    let ext = extension(pool, TARGET_EXT)?;
    let opts = dynamic_message_options(pool, message)?;
    if !opts.has_extension(&ext) {
        return Ok(false);
    }
    Ok(opts.get_extension(&ext).as_bool().unwrap_or(false))
}

/// The raw `groxypb.value` string set on `field`, if any.
pub fn value_of(pool: &DescriptorPool, field: &FieldDescriptor) -> Result<Option<String>, ProtodefError> {
    let ext = extension(pool, VALUE_EXT)?;
    let opts = dynamic_field_options(pool, field)?;
    if !opts.has_extension(&ext) {
        return Ok(None);
    }
    Ok(opts.get_extension(&ext).as_str().map(str::to_owned))
}

/// The raw `groxypb.matcher` string set on `field`, if any.
pub fn matcher_of(pool: &DescriptorPool, field: &FieldDescriptor) -> Result<Option<String>, ProtodefError> {
    let ext = extension(pool, MATCHER_EXT)?;
    let opts = dynamic_field_options(pool, field)?;
    if !opts.has_extension(&ext) {
        return Ok(None);
    }
    Ok(opts.get_extension(&ext).as_str().map(str::to_owned))
}

/// A `value` string is treated as a template (rather than a literal) when it
/// contains Jinja-style directives.
pub fn looks_like_template(value: &str) -> bool {
    value.contains("{{") || value.contains("{%")
}
