//! Per-response processing: decode, parse, instrument, regenerate, reconcile.
//!
//! Every failure before the body is regenerated turns into pass-through: the
//! client gets the original bytes with only the always-on header rules applied.

use bytes::Bytes;
use http::header::CONTENT_ENCODING;
use http::HeaderMap;
use swc_core::common::{Globals, GLOBALS};
use tracing::{debug, info, warn};

use crate::codegen::generate;
use crate::config::TraceConfig;
use crate::decode::{decode_body, Encoding};
use crate::error::{DecodeError, GenerationError, ParseError, TransformError};
use crate::headers::{reconcile_headers, BodyOutcome};
use crate::instrument::{instrument_script, InstrumentStats};
use crate::parse::{parse_script, ParsedScript};

/// Working set for one intercepted response. Lives only while that response
/// is processed.
pub struct ScriptUnit {
    pub url: String,
    pub source: String,
    pub parsed: ParsedScript,
}

impl ScriptUnit {
    pub fn new(url: &str, source: String) -> Result<Self, ParseError> {
        let parsed = parse_script(url, &source)?;
        Ok(Self {
            url: url.to_string(),
            source,
            parsed,
        })
    }

    /// Instrument and regenerate. Consumes the unit.
    pub fn instrument(self, config: &TraceConfig) -> Result<(String, InstrumentStats), GenerationError> {
        let ParsedScript {
            source_map,
            comments,
            script,
        } = self.parsed;
        let out = instrument_script(script, &self.url, Some(source_map.clone()), config);
        let code = generate(&out.script, source_map, Some(&comments))?;
        debug!(
            url = %self.url,
            source_bytes = self.source.len(),
            instrumented_bytes = code.len(),
            "regenerated script"
        );
        Ok((code, out.stats))
    }
}

/// Text in, instrumented text out.
pub fn instrument_source(
    url: &str,
    source: &str,
    config: &TraceConfig,
) -> Result<(String, InstrumentStats), TransformError> {
    GLOBALS.set(&Globals::new(), || {
        let unit = ScriptUnit::new(url, source.to_string())?;
        Ok(unit.instrument(config)?)
    })
}

/// The response to send back to the client.
#[derive(Debug)]
pub struct Processed {
    pub headers: HeaderMap,
    pub body: Bytes,
    pub outcome: BodyOutcome,
}

/// Run a fully buffered upstream response through the pipeline.
pub fn process_response(url: &str, headers: &HeaderMap, body: Bytes, config: &TraceConfig) -> Processed {
    match transform_body(url, headers, &body, config) {
        Ok((code, encoding, stats)) => {
            info!(
                url,
                encoding = encoding.as_str(),
                functions = stats.functions,
                returns = stats.returns,
                original_bytes = body.len(),
                instrumented_bytes = code.len(),
                "instrumented script"
            );
            let outcome = BodyOutcome::Transformed {
                was_compressed: encoding.is_compressed(),
            };
            Processed {
                headers: reconcile_headers(headers, outcome),
                body: Bytes::from(code),
                outcome,
            }
        }
        Err(e) => {
            match &e {
                TransformError::Parse(reason) => debug!(url, reason = %reason, "passing through"),
                TransformError::Decode(error) => warn!(url, error = %error, "cannot decode body, passing through"),
                TransformError::Generation(error) => {
                    warn!(url, error = %error, "cannot regenerate script, passing through")
                }
            }
            Processed {
                headers: reconcile_headers(headers, BodyOutcome::PassThrough),
                body,
                outcome: BodyOutcome::PassThrough,
            }
        }
    }
}

fn transform_body(
    url: &str,
    headers: &HeaderMap,
    body: &[u8],
    config: &TraceConfig,
) -> Result<(String, Encoding, InstrumentStats), TransformError> {
    let declared = match headers.get(CONTENT_ENCODING) {
        None => None,
        Some(v) => Some(
            v.to_str()
                .map_err(|_| DecodeError::Unsupported(String::from_utf8_lossy(v.as_bytes()).into_owned()))?,
        ),
    };
    let encoding = Encoding::from_header(declared)?;
    let text = decode_body(body, encoding)?;
    let (code, stats) = instrument_source(url, &text, config)?;
    Ok((code, encoding, stats))
}
