use thiserror::Error;

#[derive(Error, Debug)]
pub enum InspectError {
    #[error("Analyzer spawn failed: {0}")]
    AnalyzerSpawnFailed(String),

    #[error("No active session: {0}")]
    NoSession(String),

    #[error("JSON-RPC parse error: {0}")]
    JsonRpcParseError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

// JSON-RPC error codes - Only export codes that are actually used
pub const ERROR_PARSE_ERROR: i32 = -32700;
pub const ERROR_METHOD_NOT_FOUND: i32 = -32601;
pub const ERROR_INTERNAL_ERROR: i32 = -32603;
