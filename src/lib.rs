//! estrace rewrites JavaScript served by an upstream development server so
//! that every traced function call leaves a record in a page-global buffer.
//!
//! A response travels [`decode`] → [`parse`] → [`instrument`] → [`codegen`]
//! inside [`pipeline`], and [`headers`] fixes up what no longer matches the new
//! body. Anything that fails along the way is passed through untouched.
//! [`proxy`] is the HTTP forwarder around it.

pub mod codegen;
pub mod config;
pub mod decode;
pub mod error;
pub mod headers;
pub mod instrument;
pub mod parse;
pub mod pipeline;
pub mod proxy;

pub use config::{ProxyConfig, TraceConfig};
pub use error::{ProxyError, ProxyResult, TransformError};
pub use instrument::{instrument_script, InstrumentStats, TraceTransform};
pub use pipeline::{instrument_source, process_response, Processed};
