use std::path::PathBuf;
use thiserror::Error;

/// Build-phase errors. Any of these aborts startup.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("failed to parse schema fragment '{namespace}': {message}")]
    Parse { namespace: String, message: String },

    #[error("invalid plugin namespace '{0}': expected lowercase ascii letters, digits or '_'")]
    InvalidNamespace(String),

    #[error("duplicate name '{name}' declared by '{namespace}'")]
    DuplicateName { namespace: String, name: String },

    #[error("'{owner}' references '{target}', which is not a declared {expected}")]
    DanglingReference {
        owner: String,
        target: String,
        expected: &'static str,
    },

    #[error("operation '{0}' has no resolver")]
    MissingResolver(String),

    #[error("resolver registered for undeclared target '{0}'")]
    UnknownResolverTarget(String),

    #[error("mutation '{0}' cannot be public")]
    PublicMutation(String),

    #[error("invalid mutation action for '{operation}': {reason}")]
    InvalidMutationAction { operation: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("type '{0}' has no collection")]
    UnknownType(String),

    #[error("unknown collection '{0}'")]
    UnknownCollection(String),

    #[error("document '{id}' not found in '{collection}'")]
    NotFound { collection: String, id: String },

    #[error("document '{id}' already exists in '{collection}'")]
    DuplicateId { collection: String, id: String },

    #[error("record does not match the shape of '{collection}': {reason}")]
    ShapeMismatch { collection: String, reason: String },

    #[error("store backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MutationError {
    #[error("referenced {type_name} '{id}' does not exist")]
    ReferenceNotFound { type_name: String, id: String },

    #[error("invalid mutation input: {0}")]
    InvalidInput(String),

    #[error("'{0}' is not an executable mutation")]
    UnknownMutation(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Failure of a top-level operation resolver.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("{0}")]
    Message(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Mutation(#[from] MutationError),
}

impl ResolveError {
    pub fn message(message: impl Into<String>) -> Self {
        ResolveError::Message(message.into())
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("unknown plugin '{0}'")]
    UnknownPlugin(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}
