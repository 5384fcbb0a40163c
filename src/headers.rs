//! Header reconciliation for the outgoing response.
//!
//! Survivors keep their relative order; their original spelling travels in
//! the response extensions and is restored by the server on the wire.

use std::sync::LazyLock;

use http::HeaderMap;
use regex::Regex;

static CONTENT_SECURITY_POLICY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^content-security-policy").expect("csp regex"));
static CONTENT_LENGTH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^content-length").expect("content-length regex"));
static CONTENT_ENCODING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^content-encoding").expect("content-encoding regex"));

/// What happened to the body on its way through the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyOutcome {
    /// Original bytes are sent unchanged.
    PassThrough,
    /// Body was decoded, instrumented and regenerated as plain text.
    Transformed { was_compressed: bool },
}

/// Whether a header named `name` must be left out of the response.
pub fn should_drop(name: &str, outcome: BodyOutcome) -> bool {
    if CONTENT_SECURITY_POLICY.is_match(name) {
        return true;
    }
    match outcome {
        BodyOutcome::PassThrough => false,
        BodyOutcome::Transformed { was_compressed } => {
            CONTENT_LENGTH.is_match(name) || (was_compressed && CONTENT_ENCODING.is_match(name))
        }
    }
}

/// Rebuild the header map without the dropped entries.
pub fn reconcile_headers(original: &HeaderMap, outcome: BodyOutcome) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(original.len());
    for (name, value) in original {
        if !should_drop(name.as_str(), outcome) {
            out.append(name.clone(), value.clone());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn sample() -> HeaderMap {
        let mut h = HeaderMap::new();
        h.append("x-first", HeaderValue::from_static("1"));
        h.append("content-type", HeaderValue::from_static("application/javascript"));
        h.append("content-encoding", HeaderValue::from_static("gzip"));
        h.append("content-security-policy", HeaderValue::from_static("default-src 'self'"));
        h.append(
            "content-security-policy-report-only",
            HeaderValue::from_static("script-src 'none'"),
        );
        h.append("content-length", HeaderValue::from_static("120"));
        h.append("set-cookie", HeaderValue::from_static("a=1"));
        h.append("set-cookie", HeaderValue::from_static("b=2"));
        h.append("x-last", HeaderValue::from_static("z"));
        h
    }

    fn names(h: &HeaderMap) -> Vec<&str> {
        h.iter().map(|(n, _)| n.as_str()).collect()
    }

    #[test]
    fn matching_ignores_case() {
        let transformed = BodyOutcome::Transformed { was_compressed: true };
        assert!(should_drop("Content-Security-Policy", BodyOutcome::PassThrough));
        assert!(should_drop("CONTENT-LENGTH", transformed));
        assert!(should_drop("Content-Encoding", transformed));
        assert!(!should_drop("Content-Type", transformed));
        assert!(!should_drop("Content-Length", BodyOutcome::PassThrough));
    }

    #[test]
    fn pass_through_only_drops_csp() {
        let out = reconcile_headers(&sample(), BodyOutcome::PassThrough);
        assert_eq!(
            names(&out),
            vec![
                "x-first",
                "content-type",
                "content-encoding",
                "content-length",
                "set-cookie",
                "set-cookie",
                "x-last"
            ]
        );
    }

    #[test]
    fn transformed_compressed_drops_length_and_encoding() {
        let out = reconcile_headers(&sample(), BodyOutcome::Transformed { was_compressed: true });
        assert_eq!(
            names(&out),
            vec!["x-first", "content-type", "set-cookie", "set-cookie", "x-last"]
        );
        let cookies: Vec<_> = out.get_all("set-cookie").iter().collect();
        assert_eq!(cookies, vec!["a=1", "b=2"]);
    }

    #[test]
    fn transformed_identity_keeps_encoding_header() {
        let out = reconcile_headers(&sample(), BodyOutcome::Transformed { was_compressed: false });
        assert!(out.contains_key("content-encoding"));
        assert!(!out.contains_key("content-length"));
    }
}
