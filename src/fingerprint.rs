//! SHA-256 certificate fingerprints used for peer pinning.
//!
//! The canonical text form is `sha-256 AB:CD:...` (upper-case hex, colon
//! separated). Parsing is lenient: the prefix is optional, colons and spaces
//! are ignored, and hex is case-insensitive.

use std::io::{Error, ErrorKind, Result};

use subtle::ConstantTimeEq;

pub const FINGERPRINT_PREFIX: &str = "sha-256";

const SHA256_LEN: usize = 32;

/// Raw SHA-256 digest of a DER certificate.
pub fn certificate_digest(cert_der: &[u8]) -> [u8; SHA256_LEN] {
    let digest = aws_lc_rs::digest::digest(&aws_lc_rs::digest::SHA256, cert_der);
    let mut out = [0u8; SHA256_LEN];
    out.copy_from_slice(digest.as_ref());
    out
}

/// Formatted fingerprint of a DER certificate.
pub fn certificate_fingerprint(cert_der: &[u8]) -> String {
    format_fingerprint(&certificate_digest(cert_der))
}

pub fn format_fingerprint(digest: &[u8]) -> String {
    let hex = digest
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<String>>()
        .join(":");
    format!("{FINGERPRINT_PREFIX} {hex}")
}

/// Parse a fingerprint string into digest bytes.
pub fn parse_fingerprint(fingerprint: &str) -> Result<Vec<u8>> {
    let trimmed = fingerprint.trim();
    let body = match trimmed.get(..FINGERPRINT_PREFIX.len()) {
        Some(prefix) if prefix.eq_ignore_ascii_case(FINGERPRINT_PREFIX) => {
            &trimmed[FINGERPRINT_PREFIX.len()..]
        }
        _ => trimmed,
    };

    let clean_fp = body.replace([':', ' '], "");

    if clean_fp.len() != SHA256_LEN * 2 {
        return Err(Error::new(
            ErrorKind::InvalidInput,
            format!(
                "Invalid fingerprint, expected {} hex chars, got {}: {}",
                SHA256_LEN * 2,
                clean_fp.len(),
                fingerprint
            ),
        ));
    }

    (0..clean_fp.len())
        .step_by(2)
        .map(|i| {
            clean_fp
                .get(i..i + 2)
                .and_then(|pair| u8::from_str_radix(pair, 16).ok())
        })
        .collect::<Option<Vec<u8>>>()
        .ok_or_else(|| {
            Error::new(
                ErrorKind::InvalidInput,
                format!("Invalid fingerprint, could not convert to hex: {fingerprint}"),
            )
        })
}

/// Constant-time comparison of a parsed fingerprint against a certificate.
pub fn fingerprint_matches(expected: &[u8], cert_der: &[u8]) -> bool {
    let actual = certificate_digest(cert_der);
    expected.len() == actual.len() && bool::from(expected.ct_eq(&actual))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_shape() {
        let fp = certificate_fingerprint(b"not really a certificate");
        assert!(fp.starts_with("sha-256 "));
        // 32 bytes -> 32 pairs + 31 colons
        assert_eq!(fp.len(), "sha-256 ".len() + 32 * 2 + 31);
        assert!(!fp.ends_with(':'));
        assert_eq!(fp, fp.to_uppercase().replace("SHA-256", "sha-256"));
    }

    #[test]
    fn test_parse_roundtrip_and_match() {
        let der = b"certificate bytes";
        let fp = certificate_fingerprint(der);
        let parsed = parse_fingerprint(&fp).unwrap();
        assert_eq!(parsed, certificate_digest(der).to_vec());
        assert!(fingerprint_matches(&parsed, der));
        assert!(!fingerprint_matches(&parsed, b"other certificate"));
    }

    #[test]
    fn test_parse_lenient_forms() {
        let der = b"lenient";
        let canonical = parse_fingerprint(&certificate_fingerprint(der)).unwrap();

        let bare_lower = certificate_digest(der)
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect::<String>();
        assert_eq!(parse_fingerprint(&bare_lower).unwrap(), canonical);

        let spaced = format!("SHA-256   {}", bare_lower.to_uppercase());
        assert_eq!(parse_fingerprint(&spaced).unwrap(), canonical);
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        let err = parse_fingerprint("sha-256 AB:CD").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);

        let not_hex = "zz".repeat(32);
        let err = parse_fingerprint(&not_hex).unwrap_err();
        assert!(err.to_string().contains("could not convert to hex"));
    }

    #[test]
    fn test_match_rejects_wrong_length() {
        assert!(!fingerprint_matches(&[0u8; 20], b"anything"));
    }
}
