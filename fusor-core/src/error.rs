#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("shape mismatch: {op} on {shape:?}: {msg}")]
    ShapeMismatch {
        op: &'static str,
        shape: Vec<i64>,
        msg: String,
    },

    #[error("dtype mismatch: expected {expected}, got {got}")]
    DTypeMismatch { expected: String, got: String },

    #[error("unsupported op for target `{target}`: {op}")]
    UnsupportedOp { target: &'static str, op: String },

    /// A post-rewrite verification failure. Always a compiler bug.
    #[error("IR invariant violated: {msg}\n{uops}")]
    IrViolation { msg: String, uops: String },

    #[error("no driver registered for device {device}")]
    NoDriver { device: String },

    #[error(transparent)]
    Driver(Box<dyn std::error::Error + Send + Sync>),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// An error with the backtrace captured where it was raised.
    #[error("{inner}\nraised at:\n{backtrace}")]
    Traced {
        inner: Box<Self>,
        backtrace: Box<std::backtrace::Backtrace>,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Wrap with a backtrace when the environment has capture enabled
    /// (`RUST_BACKTRACE`); already-traced errors pass through unchanged.
    pub fn bt(self) -> Self {
        if matches!(self, Error::Traced { .. }) {
            return self;
        }
        let backtrace = std::backtrace::Backtrace::capture();
        if let std::backtrace::BacktraceStatus::Captured = backtrace.status() {
            return Error::Traced {
                inner: Box::new(self),
                backtrace: Box::new(backtrace),
            };
        }
        self
    }
}

/// Adapter for boxing collaborator errors into [`Error::Driver`].
pub trait WrapErr<O> {
    fn w(self) -> Result<O>;
}

impl<O, E: std::error::Error + Send + Sync + 'static> WrapErr<O> for std::result::Result<O, E> {
    fn w(self) -> Result<O> {
        self.map_err(|e| Error::Driver(Box::new(e)).bt())
    }
}
