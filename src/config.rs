//! Runtime configuration.
//!
//! [`TraceConfig`] names the globals the injected runtime uses; it is read from
//! a JSON object the same way plugin options are read, key by key with defaults.
//! [`ProxyConfig`] is what the binary needs to listen and forward.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::LazyLock;

use http::Uri;
use regex::Regex;
use tracing::warn;

use crate::error::{ProxyError, ProxyResult};

static JS_IDENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_$][A-Za-z0-9_$]*$").expect("identifier regex"));

pub const DEFAULT_GLOBAL_OBJECT: &str = "window";
pub const DEFAULT_BUFFER_NAME: &str = "__estrace";
pub const DEFAULT_DEPTH_NAME: &str = "__estrace_call_depth";

/// Names of the shared runtime globals written into every instrumented script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceConfig {
    /// Object the globals hang off (`window.__estrace`)
    pub global_object: String,
    /// Trace Buffer property
    pub buffer_name: String,
    /// Call Depth Counter property
    pub depth_name: String,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            global_object: DEFAULT_GLOBAL_OBJECT.to_string(),
            buffer_name: DEFAULT_BUFFER_NAME.to_string(),
            depth_name: DEFAULT_DEPTH_NAME.to_string(),
        }
    }
}

impl TraceConfig {
    pub fn new(mut config: HashMap<String, serde_json::Value>) -> Self {
        let defaults = Self::default();
        let global_object = take_ident(&mut config, "global_object", defaults.global_object);
        let buffer_name = take_ident(&mut config, "buffer_name", defaults.buffer_name);
        let depth_name = take_ident(&mut config, "depth_name", defaults.depth_name);

        Self {
            global_object,
            buffer_name,
            depth_name,
        }
    }

    /// Parse a JSON object. Anything that is not an object yields the defaults.
    pub fn from_json(json: &str) -> ProxyResult<Self> {
        let map: HashMap<String, serde_json::Value> = serde_json::from_str(json)
            .map_err(|e| ProxyError::Config(format!("trace config is not a JSON object: {e}")))?;
        Ok(Self::new(map))
    }

    pub fn from_file(path: &Path) -> ProxyResult<Self> {
        let json = std::fs::read_to_string(path).map_err(|e| {
            ProxyError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_json(&json)
    }
}

fn take_ident(config: &mut HashMap<String, serde_json::Value>, key: &str, default: String) -> String {
    match config.remove(key) {
        None => default,
        Some(serde_json::Value::String(s)) if JS_IDENT.is_match(&s) => s,
        Some(other) => {
            warn!(key, value = %other, "ignoring trace config value, not a JavaScript identifier");
            default
        }
    }
}

/// Listener and upstream settings for the proxy.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Origin every request is forwarded to, e.g. `http://localhost:3000`
    pub upstream: Uri,
    pub listen: SocketAddr,
    pub trace: TraceConfig,
}

impl ProxyConfig {
    pub fn new(upstream: &str, bind: &str, port: u16, trace: TraceConfig) -> ProxyResult<Self> {
        let upstream = parse_upstream(upstream)?;
        let listen: SocketAddr = format!("{bind}:{port}")
            .parse()
            .map_err(|e| ProxyError::InvalidUri(format!("bad listen address {bind}:{port}: {e}")))?;
        Ok(Self {
            upstream,
            listen,
            trace,
        })
    }

    /// `host[:port]` of the upstream, used to rewrite the `Host` header.
    pub fn upstream_authority(&self) -> String {
        self.upstream
            .authority()
            .map(|a| a.to_string())
            .unwrap_or_default()
    }
}

/// Accepts `http://host[:port][/...]`. A bare `host:port` is read as http.
pub fn parse_upstream(raw: &str) -> ProxyResult<Uri> {
    let candidate = if raw.contains("://") {
        raw.to_string()
    } else {
        format!("http://{raw}")
    };
    let uri: Uri = candidate
        .parse()
        .map_err(|e| ProxyError::InvalidUri(format!("{raw}: {e}")))?;
    match uri.scheme_str() {
        Some("http") => {}
        Some(other) => {
            return Err(ProxyError::InvalidUri(format!(
                "{raw}: scheme {other} not supported, only http"
            )))
        }
        None => return Err(ProxyError::InvalidUri(format!("{raw}: missing scheme"))),
    }
    if uri.authority().is_none() {
        return Err(ProxyError::InvalidUri(format!("{raw}: missing host")));
    }
    Ok(uri)
}
