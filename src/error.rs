use std::{fmt, path::PathBuf, time::Duration};

use serde_json::Value;
use thiserror::Error;

/// Error codes carried by error responses
///
/// The first five are the standard JSON-RPC 2.0 codes; the tool codes live in the
/// implementation-defined server error range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// The input could not be parsed as JSON
    ParseError,
    /// The JSON is not a valid envelope
    InvalidRequest,
    /// The method does not exist
    MethodNotFound,
    /// Invalid method parameters
    InvalidParams,
    /// Internal server error
    InternalError,
    /// No tool is registered under the requested name
    ToolNotFound,
    /// The tool ran and failed
    ToolExecutionError,
}

impl ErrorCode {
    /// Maps a wire code back to an [`ErrorCode`]. Unknown codes become `InternalError`.
    pub fn from_code(code: i32) -> Self {
        match code {
            -32700 => ErrorCode::ParseError,
            -32600 => ErrorCode::InvalidRequest,
            -32601 => ErrorCode::MethodNotFound,
            -32602 => ErrorCode::InvalidParams,
            -32001 => ErrorCode::ToolNotFound,
            -32002 => ErrorCode::ToolExecutionError,
            _ => ErrorCode::InternalError,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ParseError => "parse-error",
            ErrorCode::InvalidRequest => "invalid-request",
            ErrorCode::MethodNotFound => "method-not-found",
            ErrorCode::InvalidParams => "invalid-params",
            ErrorCode::InternalError => "internal-error",
            ErrorCode::ToolNotFound => "tool-not-found",
            ErrorCode::ToolExecutionError => "tool-execution-error",
        }
    }
}

impl From<ErrorCode> for i32 {
    fn from(code: ErrorCode) -> i32 {
        match code {
            ErrorCode::ParseError => -32700,
            ErrorCode::InvalidRequest => -32600,
            ErrorCode::MethodNotFound => -32601,
            ErrorCode::InvalidParams => -32602,
            ErrorCode::InternalError => -32603,
            ErrorCode::ToolNotFound => -32001,
            ErrorCode::ToolExecutionError => -32002,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised while loading or validating configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration file not found: {path}")]
    NotFound { path: PathBuf },

    #[error("failed to read configuration file: {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse configuration file: {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid configuration: {message}")]
    Invalid { message: String },
}

/// Main error type for the SDK
#[derive(Debug, Error)]
pub enum Error {
    /// A protocol-level failure: an error response from the peer, or a dispatch failure
    #[error("{code}: {message}")]
    Protocol {
        code: ErrorCode,
        message: String,
        data: Option<Value>,
    },

    /// The connection could not be opened, was closed, or returned something undecodable
    #[error("connection error: {0}")]
    Connection(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("not connected")]
    NotConnected,

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Creates a protocol error without structured data
    pub fn protocol(code: ErrorCode, message: impl Into<String>) -> Self {
        Error::Protocol {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Creates a protocol error carrying structured data
    pub fn protocol_with_data(code: ErrorCode, message: impl Into<String>, data: Value) -> Self {
        Error::Protocol {
            code,
            message: message.into(),
            data: Some(data),
        }
    }

    /// The error code, for protocol-level failures only
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Error::Protocol { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// True for failures raised before any response existed
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Error::Connection(_) | Error::Timeout(_) | Error::NotConnected | Error::Io(_)
        )
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Error::Connection(format!("http request timed out: {err}"))
        } else {
            Error::Connection(err.to_string())
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::Connection(err.to_string())
    }
}

impl From<&str> for Error {
    fn from(message: &str) -> Self {
        Error::Other(message.to_string())
    }
}

impl From<String> for Error {
    fn from(message: String) -> Self {
        Error::Other(message)
    }
}
