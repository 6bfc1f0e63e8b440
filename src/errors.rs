use std::fmt;

/// Configuration-time and run-time error conditions raised by this crate.
///
/// Every variant is turned into an `anyhow::Error` at the call site via
/// `?` or `.into()`, the same way the teacher crate wraps its own local
/// error types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A target specification string could not be parsed.
    BadTargetSpec { input: String, reason: String },
    /// A port range string could not be parsed.
    BadPortSpec { input: String },
    /// Combined target space exceeds the sanity gate (spec.md §4.B).
    TooManyAddresses,
    /// A binary scan log was malformed (bad magic, truncated record, bad checksum).
    BadScanLog { reason: String },
    /// A scan configuration value is out of range or missing.
    BadConfig { reason: String },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::BadTargetSpec { input, reason } => {
                write!(f, "invalid target specification \"{input}\": {reason}")
            }
            Error::BadPortSpec { input } => write!(f, "invalid port range \"{input}\""),
            Error::TooManyAddresses => write!(
                f,
                "refusing to scan an address space this large, see --stream-targets"
            ),
            Error::BadScanLog { reason } => write!(f, "malformed scan log: {reason}"),
            Error::BadConfig { reason } => write!(f, "invalid scan configuration: {reason}"),
        }
    }
}

impl std::error::Error for Error {}
