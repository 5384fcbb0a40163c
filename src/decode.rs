//! Response body decoding: undo `Content-Encoding` and require UTF-8.

use std::io::{Cursor, Read};

use brotli::Decompressor;
use flate2::read::{GzDecoder, ZlibDecoder};

use crate::error::DecodeError;

/// Declared body encoding, from the `Content-Encoding` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Identity,
    Gzip,
    Brotli,
    Deflate,
}

impl Encoding {
    /// `None` header means identity. Unknown tokens are an error so the caller
    /// can pass the body through untouched.
    pub fn from_header(value: Option<&str>) -> Result<Self, DecodeError> {
        let token = value.unwrap_or("").trim().to_ascii_lowercase();
        match token.as_str() {
            "" | "identity" => Ok(Encoding::Identity),
            "gzip" | "x-gzip" => Ok(Encoding::Gzip),
            "br" => Ok(Encoding::Brotli),
            "deflate" => Ok(Encoding::Deflate),
            _ => Err(DecodeError::Unsupported(token)),
        }
    }

    pub fn is_compressed(self) -> bool {
        !matches!(self, Encoding::Identity)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Encoding::Identity => "identity",
            Encoding::Gzip => "gzip",
            Encoding::Brotli => "br",
            Encoding::Deflate => "deflate",
        }
    }
}

/// Decode a fully buffered body into text.
pub fn decode_body(body: &[u8], encoding: Encoding) -> Result<String, DecodeError> {
    let bytes = match encoding {
        Encoding::Identity => body.to_vec(),
        Encoding::Gzip => read_all(GzDecoder::new(body), encoding)?,
        Encoding::Deflate => read_all(ZlibDecoder::new(body), encoding)?,
        Encoding::Brotli => read_all(Decompressor::new(Cursor::new(body), 4096), encoding)?,
    };
    Ok(String::from_utf8(bytes)?)
}

fn read_all(mut reader: impl Read, encoding: Encoding) -> Result<Vec<u8>, DecodeError> {
    let mut out = Vec::new();
    reader
        .read_to_end(&mut out)
        .map_err(|source| DecodeError::Corrupt {
            encoding: encoding.as_str(),
            source,
        })?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::{GzEncoder, ZlibEncoder};
    use flate2::Compression;
    use std::io::Write;

    const SCRIPT: &str = "function add(a, b) { return a + b; }";

    #[test]
    fn header_tokens() {
        assert_eq!(Encoding::from_header(None).unwrap(), Encoding::Identity);
        assert_eq!(Encoding::from_header(Some(" GZIP ")).unwrap(), Encoding::Gzip);
        assert_eq!(Encoding::from_header(Some("br")).unwrap(), Encoding::Brotli);
        assert!(matches!(
            Encoding::from_header(Some("zstd")),
            Err(DecodeError::Unsupported(t)) if t == "zstd"
        ));
    }

    #[test]
    fn gzip_body() {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(SCRIPT.as_bytes()).unwrap();
        let gz = enc.finish().unwrap();
        assert_eq!(decode_body(&gz, Encoding::Gzip).unwrap(), SCRIPT);
    }

    #[test]
    fn deflate_body() {
        let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
        enc.write_all(SCRIPT.as_bytes()).unwrap();
        let z = enc.finish().unwrap();
        assert_eq!(decode_body(&z, Encoding::Deflate).unwrap(), SCRIPT);
    }

    #[test]
    fn brotli_body() {
        let mut out = Vec::new();
        {
            let mut w = brotli::CompressorWriter::new(&mut out, 4096, 5, 22);
            w.write_all(SCRIPT.as_bytes()).unwrap();
        }
        assert_eq!(decode_body(&out, Encoding::Brotli).unwrap(), SCRIPT);
    }

    #[test]
    fn corrupt_gzip_is_an_error() {
        let err = decode_body(b"definitely not gzip", Encoding::Gzip).unwrap_err();
        assert!(matches!(err, DecodeError::Corrupt { encoding: "gzip", .. }));
    }

    #[test]
    fn binary_is_not_text() {
        let err = decode_body(&[0xff, 0xfe, 0x00, 0x80], Encoding::Identity).unwrap_err();
        assert!(matches!(err, DecodeError::NotText(_)));
    }
}
