use std::fmt;

/// Errors produced while compiling a snippet into a [`super::Template`] or
/// while evaluating one against a request.
#[derive(Debug)]
pub enum ProtodefError {
    /// A back-tick delimited multi-line string was never closed.
    UnclosedMultilineString { line: usize, col: usize },

    /// The (back-tick-folded, prefixed) snippet failed to parse as protobuf.
    /// `line`/`col` are already adjusted back to the user's original text.
    Syntax { line: usize, col: usize, message: String },

    /// No message in the snippet carries `groxypb.target = true`.
    NoTarget,

    /// More than one message in the snippet carries `groxypb.target = true`.
    MultipleTarget(Vec<String>),

    /// The snippet imports something other than `groxypb/annotations.proto`.
    UnknownImport(String),

    /// A field's `value`/`matcher` annotation failed to compile or evaluate.
    Field { field: String, message: String },

    /// Building a message out of a descriptor pool failed at a layer below
    /// field-level parsing (e.g. extension lookup, pool assembly).
    Compile(String),
}

impl fmt::Display for ProtodefError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtodefError::UnclosedMultilineString { line, col } => {
                write!(f, "({line}:{col}) unclosed multiline string")
            }
            ProtodefError::Syntax { line, col, message } => {
                write!(f, "({line}:{col}) {message}")
            }
            ProtodefError::NoTarget => write!(f, "no target message found"),
            ProtodefError::MultipleTarget(names) => {
                write!(f, "multiple target messages found: {names:?}")
            }
            ProtodefError::UnknownImport(name) => {
                write!(f, "imports in snippets are not supported: {name}")
            }
            ProtodefError::Field { field, message } => {
                write!(f, "field {field:?}: {message}")
            }
            ProtodefError::Compile(message) => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for ProtodefError {}
