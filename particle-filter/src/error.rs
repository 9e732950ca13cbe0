use std::fmt::{self, Display};

/// Errors raised by the filter core.
///
/// All of these indicate caller misuse (broken shape contracts or
/// unsupported configuration), not recoverable runtime conditions.
/// Numerical degeneracy is *not* an error; it is mitigated in place
/// and reported through `log::warn!`.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterError {
    /// Two tensors that must agree on a dimension did not.
    ShapeMismatch {
        context: &'static str,
        expected: usize,
        actual: usize,
    },
    /// A configuration value was outside its supported range.
    InvalidConfig { context: &'static str },
}

impl Display for FilterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterError::ShapeMismatch {
                context,
                expected,
                actual,
            } => {
                write!(
                    f,
                    "shape mismatch in {context}: expected {expected}, got {actual}"
                )
            }
            FilterError::InvalidConfig { context } => {
                write!(f, "invalid configuration: {context}")
            }
        }
    }
}

impl std::error::Error for FilterError {}

pub(crate) fn check_dim(
    context: &'static str,
    expected: usize,
    actual: usize,
) -> Result<(), FilterError> {
    if expected == actual {
        Ok(())
    } else {
        Err(FilterError::ShapeMismatch {
            context,
            expected,
            actual,
        })
    }
}
