use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    TomlDe(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("User not found: {0}")]
    UserNotFound(String),

    #[error("User expired: {0}")]
    UserExpired(String),

    #[error("User {uid} reached its cap of {cap} sessions")]
    SessionsCapReached { uid: String, cap: u32 },

    #[error("Configuration error: {0}")]
    Configuration(String),
}
