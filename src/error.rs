use std::{collections::TryReserveError, error::Error, fmt, io};

/// The result type used across the gradient buffer.
pub type Result<T> = std::result::Result<T, BufferErr>;

/// Failures raised while configuring, refilling or sampling the buffer.
#[derive(Debug)]
pub enum BufferErr {
    /// The direction flag was neither `in` nor `out`.
    InvalidDirection(String),
    /// The device designator could not be parsed.
    InvalidDevice(String),
    /// No feature dimension was given and the layer does not declare one.
    UnknownDimension { layer: usize },
    /// The target layer does not exist in the model.
    InvalidLayer { layer: usize, layers: usize },
    /// A construction parameter is out of range.
    InvalidConfig(&'static str),
    /// The sample source ran dry before the pool could be refilled.
    EndOfStream,
    /// More rows were offered to the pool than it has room for.
    CapacityExceeded { got: usize, remaining: usize },
    /// The model failed while running the forward or backward pass.
    Model(String),
    /// Refill bookkeeping tried to append to a pool that is already full.
    PoolFull { len: usize, capacity: usize },
    ShapeMismatch {
        what: &'static str,
        got: usize,
        expected: usize,
    },
    /// A numerical value that should be finite was not.
    NonFinite(&'static str),
    /// A previous refill failed, leaving the pool in an unusable state.
    Poisoned,
    /// Storage for the pool's rows could not be reserved.
    Alloc(TryReserveError),
    Io(io::Error),
    Json(serde_json::Error),
}

impl fmt::Display for BufferErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BufferErr::InvalidDirection(got) => {
                write!(f, "io must be either 'in' or 'out', got '{got}'")
            }
            BufferErr::InvalidDevice(got) => write!(f, "invalid device designator '{got}'"),
            BufferErr::UnknownDimension { layer } => write!(
                f,
                "the feature dimension of layer {layer} cannot be inferred, \
                 it must be specified directly"
            ),
            BufferErr::InvalidLayer { layer, layers } => {
                write!(f, "layer {layer} does not exist, the model has {layers} layers")
            }
            BufferErr::InvalidConfig(msg) => write!(f, "invalid config: {msg}"),
            BufferErr::EndOfStream => write!(f, "end of data stream reached"),
            BufferErr::CapacityExceeded { got, remaining } => write!(
                f,
                "tried to append {got} rows with only {remaining} slots remaining"
            ),
            BufferErr::Model(msg) => write!(f, "model error: {msg}"),
            BufferErr::PoolFull { len, capacity } => write!(
                f,
                "refill inconsistency: pool already holds {len} of {capacity} rows"
            ),
            BufferErr::ShapeMismatch {
                what,
                got,
                expected,
            } => write!(f, "shape mismatch for {what}: got {got}, expected {expected}"),
            BufferErr::NonFinite(what) => write!(f, "non-finite value in {what}"),
            BufferErr::Poisoned => write!(
                f,
                "a previous refill failed, the buffer must be recreated"
            ),
            BufferErr::Alloc(e) => write!(f, "failed to reserve pool storage: {e}"),
            BufferErr::Io(e) => write!(f, "io error: {e}"),
            BufferErr::Json(e) => write!(f, "json error: {e}"),
        }
    }
}

impl Error for BufferErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            BufferErr::Alloc(e) => Some(e),
            BufferErr::Io(e) => Some(e),
            BufferErr::Json(e) => Some(e),
            _ => None,
        }
    }
}

impl From<TryReserveError> for BufferErr {
    fn from(value: TryReserveError) -> Self {
        Self::Alloc(value)
    }
}

impl From<io::Error> for BufferErr {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<serde_json::Error> for BufferErr {
    fn from(value: serde_json::Error) -> Self {
        Self::Json(value)
    }
}
