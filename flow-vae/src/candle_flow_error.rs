use thiserror::Error;

/// Failures raised by the flow-augmented posterior.
///
/// Module code keeps returning `candle_core::Result`; these are wrapped
/// with [`candle_core::Error::wrap`] so callers can still tell them
/// apart by message or by downcasting the wrapped error.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FlowVaeError {
    /// invalid construction arguments
    #[error("configuration error: {0}")]
    Configuration(String),
    /// input or amortized parameters with inconsistent shapes
    #[error("shape mismatch in {what}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        what: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    /// tensors from different devices mixed in one call
    #[error("device mismatch: {0}")]
    DeviceMismatch(String),
    /// non-positive variance, NaN or Inf
    #[error("numerical instability: {0}")]
    NumericalInstability(String),
}

impl From<FlowVaeError> for candle_core::Error {
    fn from(err: FlowVaeError) -> Self {
        candle_core::Error::wrap(err)
    }
}

/// short-hand for `Err(FlowVaeError::Configuration(..).into())`
pub fn config_error<T>(msg: impl Into<String>) -> candle_core::Result<T> {
    Err(FlowVaeError::Configuration(msg.into()).into())
}
