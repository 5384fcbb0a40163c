//! Parse decoded text as a standalone script.
//!
//! Anything that is not a script (empty bodies, JSON documents, HTML, syntax
//! errors) comes back as a [`ParseError`]; callers treat every variant as
//! "no AST" and pass the response through.

use serde::de::IgnoredAny;
use swc_core::{
    common::{comments::SingleThreadedComments, sync::Lrc, FileName, SourceMap},
    ecma::{
        ast::{EsVersion, Script},
        parser::{parse_file_as_script, EsSyntax, Syntax},
    },
};

use crate::error::ParseError;

/// A parsed tree together with the source map that knows its positions and
/// the comments the generator re-attaches by position.
pub struct ParsedScript {
    pub source_map: Lrc<SourceMap>,
    pub comments: SingleThreadedComments,
    pub script: Script,
}

pub fn parse_script(url: &str, text: &str) -> Result<ParsedScript, ParseError> {
    if text.trim().is_empty() {
        return Err(ParseError::Empty);
    }
    // `{}` and friends are valid scripts too, but a JSON response is data.
    if serde_json::from_str::<IgnoredAny>(text).is_ok() {
        return Err(ParseError::Json);
    }

    let source_map: Lrc<SourceMap> = Default::default();
    let fm = source_map.new_source_file(FileName::Custom(url.to_string()).into(), text.to_string());

    let comments = SingleThreadedComments::default();
    let mut recovered = vec![];
    let script = parse_file_as_script(
        &fm,
        Syntax::Es(EsSyntax::default()),
        EsVersion::latest(),
        Some(&comments),
        &mut recovered,
    )
    .map_err(|e| ParseError::Syntax(e.kind().msg().to_string()))?;

    // A tree rebuilt by error recovery is not the program the browser would run.
    if let Some(e) = recovered.first() {
        return Err(ParseError::Syntax(e.kind().msg().to_string()));
    }

    Ok(ParsedScript {
        source_map,
        comments,
        script,
    })
}
