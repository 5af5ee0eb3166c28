pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

#[derive(thiserror::Error, Debug)]
pub enum OrchestratorError {
    #[error("validation error: {0}")]
    Validation(String),

    /// A stage was asked to start before its prerequisite stages finished.
    #[error("precondition error: {0}")]
    Precondition(String),

    #[error("invocation error: {0}")]
    Invocation(String),

    #[error("store error: {message}")]
    Store { message: String, transient: bool },

    #[error("serialization error: {0}")]
    Serde(String),

    #[error("timeout: {0}")]
    Timeout(String),

    /// The render reached the FAILED or abandoned terminal state.
    #[error("render failed: {0}")]
    RenderFailed(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl OrchestratorError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn precondition(msg: impl Into<String>) -> Self {
        Self::Precondition(msg.into())
    }

    pub fn invocation(msg: impl Into<String>) -> Self {
        Self::Invocation(msg.into())
    }

    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store {
            message: msg.into(),
            transient: false,
        }
    }

    pub fn transient_store(msg: impl Into<String>) -> Self {
        Self::Store {
            message: msg.into(),
            transient: true,
        }
    }

    pub fn serde(msg: impl Into<String>) -> Self {
        Self::Serde(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    pub fn render_failed(msg: impl Into<String>) -> Self {
        Self::RenderFailed(msg.into())
    }

    /// Human-readable detail for error records: the display text, with the full cause chain for
    /// wrapped errors.
    pub fn detail(&self) -> String {
        match self {
            Self::Other(e) => format!("{e:#}"),
            other => other.to_string(),
        }
    }

    /// Whether retrying the operation that produced this error can succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Store {
                transient: true,
                ..
            } | Self::Invocation(_)
                | Self::Timeout(_)
        )
    }
}

impl From<serde_json::Error> for OrchestratorError {
    fn from(e: serde_json::Error) -> Self {
        Self::serde(e.to_string())
    }
}
