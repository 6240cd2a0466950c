use std::{error, fmt};

use crate::dtype::DataType;

/// Code generation and planning errors
///
/// All variants are fatal for the function being processed; there is no
/// partial emission. An unrecognized intrinsic is deliberately *not* an
/// error: it degrades to a plain extern call and a warning on the emitter.
#[derive(Debug, Clone)]
pub enum Error {
    /// A dtype/lanes combination the type printer does not cover
    UnsupportedType(DataType),
    /// A storage scope outside {global, shared.dyn, shared, local}
    UnsupportedScope(String),
    /// Structurally invalid IR: bad region rank, wrong intrinsic arity,
    /// a variable read before any binding, a missing attribute
    MalformedIr(String),
    /// The planner could not place a local-memory allocation
    AllocationFailed { buffer: String, reason: String },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsupportedType(t) => write!(f, "unsupported data type `{t}`"),
            Self::UnsupportedScope(scope) => write!(f, "unsupported storage scope `{scope}`"),
            Self::MalformedIr(what) => write!(f, "malformed IR: {what}"),
            Self::AllocationFailed { buffer, reason } => {
                write!(f, "cannot place allocation `{buffer}`: {reason}")
            }
        }
    }
}

impl error::Error for Error {}
