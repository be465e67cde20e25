use thiserror::Error;

/// Setup errors. Always raised before any network activity starts.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load config: {0}")]
    Load(#[from] config::ConfigError),
    #[error("No chains configured")]
    NoChains,
    #[error("Missing required field for chain '{chain}': {field}")]
    MissingField { chain: String, field: String },
    #[error("Invalid value for '{field}' on chain '{chain}': {reason}")]
    InvalidValue {
        chain: String,
        field: String,
        reason: String,
    },
}

/// Transient failures talking to a data source. These enter the retry path.
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("HTTP request to {endpoint} failed: {source}")]
    Http {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("Provider returned status {status} for {endpoint}")]
    Status { endpoint: String, status: u16 },
    #[error("RPC error: {0}")]
    Rpc(#[from] alloy_transport::TransportError),
    #[error("Request to {endpoint} timed out after {secs}s")]
    Timeout { endpoint: String, secs: u64 },
    #[error("Malformed response from {endpoint}: {reason}")]
    Malformed { endpoint: String, reason: String },
    #[error("Provider returned no {what} for {id}")]
    NotFound { what: &'static str, id: String },
    #[error("No chain reader configured for {0}")]
    Unavailable(&'static str),
    #[error("Remote backfill failed: {0}")]
    Remote(String),
}

/// Malformed or undecodable on-chain data. Never fatal; counted and skipped.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("Log data too short: expected at least {expected} bytes, got {got}")]
    ShortData { expected: usize, got: usize },
    #[error("Missing decoded parameter '{0}'")]
    MissingParameter(String),
    #[error("Invalid parameter '{name}': {reason}")]
    InvalidParameter { name: String, reason: String },
    #[error("ABI decoding failed: {0}")]
    Abi(#[from] alloy_sol_types::Error),
}

/// Failures publishing to the remote store. Logged per batch; the run continues.
#[derive(Error, Debug)]
pub enum PublishError {
    #[error("Publish request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Invalid publish URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("Remote store rejected batch with status {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("Failed to serialize batch: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("Local artifact I/O failed for {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}
