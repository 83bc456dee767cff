#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineErrorKind {
    /// Operation attempted in a state that forbids it (e.g. after teardown).
    Lifecycle,
    /// Invalid registration into the module tree (duplicate or bad name).
    Registration,
    /// Script evaluation failed; details went to the error sink.
    Script,
    /// Module resolution or precompiled-unit decoding failed.
    Module,
    /// Host filesystem failure while loading script source.
    Io,
    /// Runtime construction or another engine-internal failure.
    Internal,
}

#[derive(Debug, Clone)]
pub struct EngineError {
    pub kind: EngineErrorKind,
    pub message: String,
}

impl EngineError {
    pub fn new(kind: EngineErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub(crate) fn lifecycle(message: impl Into<String>) -> Self {
        Self::new(EngineErrorKind::Lifecycle, message)
    }

    pub(crate) fn registration(message: impl Into<String>) -> Self {
        Self::new(EngineErrorKind::Registration, message)
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for EngineError {}
