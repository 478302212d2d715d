use thiserror::Error;

pub type Result<T> = std::result::Result<T, FunctionError>;

#[derive(Debug, Error)]
pub enum FunctionError {
    #[error("cannot decode {kind} object: {source}")]
    Deserialize {
        kind: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("cannot serialize JSON patch: {0}")]
    SerializePatch(#[source] serde_json::Error),

    #[error("cannot decode JSON patch: {0}")]
    DecodePatch(String),

    #[error("cannot read configuration file {path}: {message}")]
    Configuration { path: String, message: String },
}
