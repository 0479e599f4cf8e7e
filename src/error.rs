use thiserror::Error;

/// Errors raised by the estimation core.
#[derive(Debug, Error)]
pub enum EstimateError {
    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("level {level} has no samples")]
    NoSamples { level: usize },

    #[error("level {level} has {n_samples} samples, need at least {required}")]
    InsufficientSamples {
        level: usize,
        n_samples: usize,
        required: usize,
    },

    /// Moment 0 must be the constant 1 with zero variance.
    #[error("moment 0 invariant violated: {what} = {value} on level {level:?}")]
    MomentInvariant {
        what: &'static str,
        level: Option<usize>,
        value: f64,
    },

    #[error("shape mismatch in {what}: expected {expected}, found {found}")]
    ShapeMismatch {
        what: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("regression failed: {0}")]
    Regression(String),

    #[error("quadrature failed: {0}")]
    Quadrature(String),
}

pub type Result<T> = std::result::Result<T, EstimateError>;

impl From<linregress::Error> for EstimateError {
    fn from(err: linregress::Error) -> Self {
        EstimateError::Regression(err.to_string())
    }
}
