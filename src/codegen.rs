//! Serialize an (instrumented) script back to JavaScript text.

use swc_core::{
    common::{comments::Comments, sync::Lrc, SourceMap},
    ecma::{
        ast::{EsVersion, Script},
        codegen::{text_writer::JsWriter, Config, Emitter},
    },
};

use crate::error::GenerationError;

/// Emit `script` as plain (non-minified) JavaScript. Comments recorded by the
/// parser are written back next to the nodes they were attached to.
pub fn generate(
    script: &Script,
    source_map: Lrc<SourceMap>,
    comments: Option<&dyn Comments>,
) -> Result<String, GenerationError> {
    let mut buf = vec![];
    {
        let mut emitter = Emitter {
            cfg: Config::default().with_target(EsVersion::latest()),
            cm: source_map.clone(),
            comments,
            wr: JsWriter::new(source_map, "\n", &mut buf, None),
        };
        emitter.emit_script(script)?;
    }
    Ok(String::from_utf8(buf)?)
}
