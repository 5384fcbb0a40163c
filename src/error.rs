//! Error types for the estrace proxy.
//!
//! Decode, parse and generation errors are absorbed by the pipeline and turned
//! into pass-through; only [`ProxyError`] ever reaches the operator.

use thiserror::Error;

/// The response body could not be turned into text.
#[derive(Error, Debug)]
pub enum DecodeError {
    /// Content-Encoding we do not know how to undo (e.g. `zstd`)
    #[error("unsupported content-encoding: {0}")]
    Unsupported(String),

    /// The compressed stream was truncated or malformed
    #[error("corrupt {encoding} stream: {source}")]
    Corrupt {
        encoding: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// Decompressed bytes are not UTF-8, so they cannot be a script
    #[error("body is not valid UTF-8")]
    NotText(#[from] std::string::FromUtf8Error),
}

/// The decoded text is not a standalone script.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("empty body")]
    Empty,

    #[error("body is a JSON document")]
    Json,

    #[error("syntax error: {0}")]
    Syntax(String),
}

/// The instrumented tree could not be serialized.
#[derive(Error, Debug)]
pub enum GenerationError {
    #[error("emitter failed: {0}")]
    Emit(#[from] std::io::Error),

    #[error("emitter produced invalid UTF-8")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// Why a response was not transformed.
#[derive(Error, Debug)]
pub enum TransformError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Generation(#[from] GenerationError),
}

/// Errors that can occur while forwarding a request upstream.
#[derive(Error, Debug)]
pub enum ProxyError {
    /// HTTP protocol error
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    /// Invalid upstream URL or request target
    #[error("Invalid URI: {0}")]
    InvalidUri(String),

    /// I/O error on the listener or a connection
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Connection error to upstream
    #[error("Connection error: {0}")]
    Connection(String),

    /// Trace configuration file could not be loaded
    #[error("Config error: {0}")]
    Config(String),
}

/// Result type alias for proxy operations.
pub type ProxyResult<T> = Result<T, ProxyError>;
