use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum TranslateError {
    #[error("{file}:{line}: error: {reason}")]
    ParseError {
        file: String,
        line: usize,
        reason: String,
    },

    #[error("{file}:{line}: error: [{func}] '{op}': {reason}")]
    AnalysisError {
        file: String,
        line: usize,
        func: String,
        op: String,
        reason: String,
    },

    #[error("prototype error for '{name}': {reason}")]
    ProtoError { name: String, reason: String },

    #[error("{file}:{line}: capacity exceeded: {reason}")]
    CapacityError {
        file: String,
        line: usize,
        reason: String,
    },
}
