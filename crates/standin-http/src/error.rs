//! Error taxonomy for routing, synthesis, scripting, and the test harness.

/// Errors surfaced by the stand-in engine.
#[derive(Debug, thiserror::Error)]
pub enum StandinError {
    #[error("Endpoint '{0}' is already registered")]
    DuplicateName(String),
    #[error("Parameter '{0}' is already defined on this endpoint")]
    DuplicateParameter(String),
    #[error("Path '{path}' is matched by more than one endpoint ({first} and {second})")]
    AmbiguousRoute {
        path: String,
        first: String,
        second: String,
    },
    #[error("Endpoint '{0}' is sealed: an earlier rule already matches every request")]
    EndpointSealed(String),
    #[error("Referenced parameter '{0}' was not found")]
    ParameterNotFound(String),
    #[error("Response file not found: {0}")]
    FileNotFound(String),
    #[error("Match evaluation failed: {0}")]
    MatchEvaluation(String),
    #[error("Invalid pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },
    #[error("Script compilation failed: {0}")]
    ScriptCompilation(String),
    #[error("Script execution failed: {0}")]
    ScriptRuntime(String),
    #[error("Script artifact instantiation still racing after {attempts} attempts")]
    CompilationRaceExhausted { attempts: u32 },
    #[error("Upstream forward failed: {0}")]
    UpstreamForward(String),
    #[error("Cannot encode body as {charset}: {reason}")]
    Encoding { charset: String, reason: String },
    #[error("Invalid configuration: {0}")]
    Configuration(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StandinError {
    /// Whether this error indicates a broken configuration rather than a
    /// per-request failure. Configuration errors are fatal and never retried.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            StandinError::DuplicateName(_)
                | StandinError::DuplicateParameter(_)
                | StandinError::AmbiguousRoute { .. }
                | StandinError::EndpointSealed(_)
                | StandinError::InvalidPattern { .. }
                | StandinError::Configuration(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, StandinError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configuration_classification() {
        assert!(StandinError::DuplicateName("a".into()).is_configuration());
        assert!(StandinError::EndpointSealed("a".into()).is_configuration());
        assert!(!StandinError::ParameterNotFound("p".into()).is_configuration());
        assert!(!StandinError::CompilationRaceExhausted { attempts: 5 }.is_configuration());
    }

    #[test]
    fn test_display_strings() {
        let err = StandinError::AmbiguousRoute {
            path: "/barista".into(),
            first: "bar".into(),
            second: "barista".into(),
        };
        assert!(err.to_string().contains("/barista"));
        assert!(err.to_string().contains("bar"));
    }
}
