use std::fmt;

/// All error kinds produced by the dispatch engine.
///
/// Every variant that can reach a caller renders with the stable `{groxy}`
/// marker once converted into a [`tonic::Status`], so operators can tell
/// proxy-originated errors apart from upstream ones.
#[derive(Debug)]
pub enum Error {
    /// Phase-1 matching produced an empty set.
    NoMatch,

    /// A matched `Mock` rule has neither `Body` nor `Status` set.
    EmptyMock,

    /// A `Template::Generate` call failed (template execution or value parsing).
    TemplateGenerate(String),

    /// Failed to open a stream to an upstream (connect or call-create error).
    UpstreamDial(String),

    /// An upstream ended the call with a status; surfaced verbatim unless the
    /// caller explicitly re-wraps it (e.g. reflection's client-class prefix).
    Upstream(tonic::Status),

    /// A snippet failed to compile into a `Template`.
    Protodef(crate::protodef::error::ProtodefError),

    /// Configuration is malformed (bad YAML shape, unresolvable upstream, …).
    Config(String),

    /// A handler panicked; caught by the `Recoverer` middleware.
    Recovered(String),

    /// Filesystem or other I/O failure.
    Io(std::io::Error),

    /// Anything else.
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::NoMatch => write!(f, "didn't match request to any rule"),
            Error::EmptyMock => write!(f, "empty mock"),
            Error::TemplateGenerate(msg) => write!(f, "failed to generate response: {msg}"),
            Error::UpstreamDial(msg) => write!(f, "failed to create upstream: {msg}"),
            Error::Upstream(status) => write!(f, "{} - {}", status.code(), status.message()),
            Error::Protodef(err) => write!(f, "{err}"),
            Error::Config(msg) => write!(f, "{msg}"),
            Error::Recovered(msg) => write!(f, "{msg}"),
            Error::Io(err) => write!(f, "I/O error: {err}"),
            Error::Other(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            Error::Protodef(err) => Some(err),
            Error::Other(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<tonic::Status> for Error {
    fn from(status: tonic::Status) -> Self {
        Error::Upstream(status)
    }
}

impl From<crate::protodef::error::ProtodefError> for Error {
    fn from(err: crate::protodef::error::ProtodefError) -> Self {
        Error::Protodef(err)
    }
}

/// Marker prepended to every user-visible, proxy-originated error message.
pub const MARKER: &str = "{groxy}";

impl From<Error> for tonic::Status {
    fn from(err: Error) -> Self {
        match err {
            // Upstream statuses are surfaced verbatim (spec: "Upstream end
            // with status: surfaced verbatim to the caller").
            Error::Upstream(status) => status,
            Error::Recovered(msg) => {
                tonic::Status::resource_exhausted(format!("{MARKER} {msg}"))
            }
            other => tonic::Status::internal(format!("{MARKER} {other}")),
        }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
