/// Wrapper for problems when driving the MUSB diagnostics.
#[derive(Debug)]
pub enum Error {
    /// A read or write of the controller register block failed.
    ///
    /// Register access is assumed to be reliable. When it is not, the controller
    /// instance should be considered unusable: nothing in this crate retries.
    RegisterAccess(std::io::Error),
    /// The operator-supplied command could not be read from its source.
    InputFault(std::io::Error),
    /// The endpoint host could not allocate another directory or file.
    OutOfResources,
    /// A diagnostic directory with this name already exists on the endpoint host.
    AlreadyExists(String),
    /// No diagnostic endpoint or directory with this name exists.
    NotFound(String),
    /// A write was attempted on an endpoint that only supports reads.
    ReadOnlyEndpoint(&'static str),
    /// The background worker running a timed sequence panicked.
    ///
    /// The power register may be left with suspend or resume asserted.
    SequenceAborted,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::RegisterAccess(e) => write!(f, "register access failed: {e}"),
            Error::InputFault(e) => write!(f, "could not read command input: {e}"),
            Error::OutOfResources => write!(f, "out of diagnostic endpoint resources"),
            Error::AlreadyExists(name) => write!(f, "diagnostic directory {name:?} already exists"),
            Error::NotFound(name) => write!(f, "no diagnostic endpoint named {name:?}"),
            Error::ReadOnlyEndpoint(name) => write!(f, "endpoint {name:?} is read-only"),
            Error::SequenceAborted => write!(f, "timed sequence worker aborted"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::RegisterAccess(e) | Error::InputFault(e) => Some(e),
            _ => None,
        }
    }
}

#[doc(hidden)]
impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::RegisterAccess(value)
    }
}
