use sqlparser::parser::ParserError;
use thiserror::Error;

/// Declared permission metadata or settings are malformed.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("operation '{operation}' declares autowire together with explicit rules")]
    ConflictingDeclaration { operation: String },

    #[error("operation '{operation}' declares requires_permissions without autowire or rules")]
    EmptyDeclaration { operation: String },

    #[error("operation '{operation}' has an invalid rule: {reason}")]
    InvalidRule { operation: String, reason: String },

    #[error("invalid autowire settings: {0}")]
    InvalidAutowire(String),

    #[error("invalid setting {key}: {reason}")]
    InvalidSetting { key: &'static str, reason: String },

    #[error("failed to read policy file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse policy file {path}: {source}")]
    PolicyFile {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// SQL text could not be rewritten under the resolved policy.
#[derive(Debug, Error)]
pub enum RewriteError {
    #[error("failed to parse SQL: {0}")]
    Parse(#[from] ParserError),

    #[error("expected exactly one statement, found {0}")]
    StatementCount(usize),

    #[error("statement type cannot carry permission predicates: {0}")]
    UnsupportedStatement(String),

    #[error("no context attribute '{0}' to bind the permission predicate")]
    MissingAttribute(String),

    #[error("no permission rule applies to the tables referenced by the statement")]
    NoApplicableRule,

    #[error("value for column '{0}' contains a backslash or NUL byte")]
    UnsafeValue(String),
}

/// Failure raised by a stage of the interceptor chain.
#[derive(Debug, Error)]
pub enum InterceptError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Rewrite(#[from] RewriteError),

    #[error("statement rejected: {0}")]
    Rejected(String),

    #[error("statement execution failed: {0}")]
    Execution(#[source] Box<dyn std::error::Error + Send + Sync>),
}
