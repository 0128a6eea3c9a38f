//! TLS/DTLS record header codec and traffic classification.
//!
//! Stream records carry a 5-byte header: content type, protocol version and a
//! big-endian payload length. DTLS records share the type and version prefix
//! but add an epoch and sequence number before the length (13 bytes total).

use crate::error::SecureError;

/// TLS record header size (ContentType + ProtocolVersion + Length)
pub const TLS_RECORD_HEADER_SIZE: usize = 5;

/// DTLS record header size (adds Epoch + SequenceNumber)
pub const DTLS_RECORD_HEADER_SIZE: usize = 13;

pub const CONTENT_TYPE_CHANGE_CIPHER_SPEC: u8 = 0x14;
pub const CONTENT_TYPE_ALERT: u8 = 0x15;
pub const CONTENT_TYPE_HANDSHAKE: u8 = 0x16;
pub const CONTENT_TYPE_APPLICATION_DATA: u8 = 0x17;
pub const CONTENT_TYPE_HEARTBEAT: u8 = 0x18;

/// Record-layer version used by TLS 1.2 and TLS 1.3.
pub const TLS12_VERSION: u16 = 0x0303;
pub const DTLS12_VERSION: u16 = 0xfefd;

const TLS_VERSION_MAJOR: u8 = 0x03;
const DTLS_VERSION_MAJOR: u8 = 0xfe;

/// Largest plaintext fragment a single record may carry (2^14).
pub const MAX_PLAINTEXT_FRAGMENT: usize = 16384;

/// Upper bound on AEAD expansion per record: TLS 1.2 GCM adds an 8-byte
/// explicit nonce and 16-byte tag, TLS 1.3 a content type byte, tag and
/// optional padding.
pub const MAX_RECORD_EXPANSION: usize = 64;

/// Worst-case wire size of `plaintext_len` bytes split into fragments of at
/// most `fragment_len` bytes.
pub fn max_ciphertext_len(plaintext_len: usize, fragment_len: usize) -> usize {
    let records = plaintext_len.div_ceil(fragment_len.max(1)).max(1);
    plaintext_len + records * (TLS_RECORD_HEADER_SIZE + MAX_RECORD_EXPANSION)
}

/// Parsed 5-byte stream record header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub content_type: u8,
    pub version: u16,
    pub payload_len: u16,
}

impl RecordHeader {
    /// Parse and validate a stream record header.
    ///
    /// Any payload length is accepted; the header's length is authoritative
    /// and the caller reads exactly that many bytes before decrypting.
    pub fn parse(header: &[u8]) -> Result<Self, SecureError> {
        if header.len() < TLS_RECORD_HEADER_SIZE {
            return Err(SecureError::RecordFraming(format!(
                "truncated record header: {} of {} bytes",
                header.len(),
                TLS_RECORD_HEADER_SIZE
            )));
        }

        let content_type = header[0];
        if !(CONTENT_TYPE_CHANGE_CIPHER_SPEC..=CONTENT_TYPE_HEARTBEAT).contains(&content_type) {
            return Err(SecureError::RecordFraming(format!(
                "invalid TLS content type: 0x{content_type:02x}"
            )));
        }

        // SSL 3.0 through TLS 1.3 all use 0x03 as the major record version.
        if header[1] != TLS_VERSION_MAJOR {
            return Err(SecureError::RecordFraming(format!(
                "invalid TLS protocol version: 0x{:02x}{:02x}",
                header[1], header[2]
            )));
        }

        Ok(Self {
            content_type,
            version: u16::from_be_bytes([header[1], header[2]]),
            payload_len: u16::from_be_bytes([header[3], header[4]]),
        })
    }

    /// Header plus payload.
    #[inline]
    pub fn record_len(&self) -> usize {
        TLS_RECORD_HEADER_SIZE + self.payload_len as usize
    }

    #[inline]
    pub fn encode(&self) -> [u8; TLS_RECORD_HEADER_SIZE] {
        let version = self.version.to_be_bytes();
        let len = self.payload_len.to_be_bytes();
        [self.content_type, version[0], version[1], len[0], len[1]]
    }
}

/// Returns true if `buf` starts with a complete TLS or DTLS handshake
/// record header.
pub fn is_handshake_record(buf: &[u8]) -> bool {
    matches_record_header(buf, CONTENT_TYPE_HANDSHAKE)
}

/// Returns true if `buf` starts with a complete TLS or DTLS application data
/// record header.
pub fn is_application_data_record(buf: &[u8]) -> bool {
    matches_record_header(buf, CONTENT_TYPE_APPLICATION_DATA)
}

fn matches_record_header(buf: &[u8], content_type: u8) -> bool {
    if buf.len() < TLS_RECORD_HEADER_SIZE || buf[0] != content_type {
        return false;
    }
    match buf[1] {
        TLS_VERSION_MAJOR => true,
        DTLS_VERSION_MAJOR => buf.len() >= DTLS_RECORD_HEADER_SIZE,
        _ => false,
    }
}

#[cfg(test)]
pub(crate) fn make_tls_record(content_type: u8, payload: &[u8]) -> Vec<u8> {
    let header = RecordHeader {
        content_type,
        version: TLS12_VERSION,
        payload_len: payload.len() as u16,
    };
    let mut record = header.encode().to_vec();
    record.extend_from_slice(payload);
    record
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_application_data_header() {
        let header = RecordHeader::parse(&[0x17, 0x03, 0x03, 0x27, 0x10]).unwrap();
        assert_eq!(header.content_type, CONTENT_TYPE_APPLICATION_DATA);
        assert_eq!(header.version, TLS12_VERSION);
        assert_eq!(header.payload_len, 10_000);
        assert_eq!(header.record_len(), 10_005);
    }

    #[test]
    fn test_parse_accepts_full_length_range() {
        let empty = RecordHeader::parse(&[0x16, 0x03, 0x01, 0x00, 0x00]).unwrap();
        assert_eq!(empty.record_len(), 5);

        let max = RecordHeader::parse(&[0x17, 0x03, 0x03, 0xff, 0xff]).unwrap();
        assert_eq!(max.record_len(), 5 + 65535);
    }

    #[test]
    fn test_parse_truncated_header() {
        let result = RecordHeader::parse(&[0x17, 0x03, 0x03, 0x00]);
        assert!(matches!(result, Err(SecureError::RecordFraming(_))));
    }

    #[test]
    fn test_parse_invalid_content_type() {
        let result = RecordHeader::parse(&[0xff, 0x03, 0x03, 0x00, 0x05]);
        let err = result.unwrap_err();
        assert!(err.to_string().contains("invalid TLS content type"));
    }

    #[test]
    fn test_parse_invalid_version() {
        let result = RecordHeader::parse(&[0x16, 0x02, 0x00, 0x00, 0x05]);
        let err = result.unwrap_err();
        assert!(err.to_string().contains("invalid TLS protocol version"));
    }

    #[test]
    fn test_encode_matches_parse() {
        let record = make_tls_record(CONTENT_TYPE_HANDSHAKE, b"hello");
        let header = RecordHeader::parse(&record).unwrap();
        assert_eq!(header.encode(), [0x16, 0x03, 0x03, 0x00, 0x05]);
        assert_eq!(&record[TLS_RECORD_HEADER_SIZE..], b"hello");
    }

    #[test]
    fn test_max_ciphertext_len() {
        assert_eq!(max_ciphertext_len(0, MAX_PLAINTEXT_FRAGMENT), 69);
        assert_eq!(max_ciphertext_len(16384, MAX_PLAINTEXT_FRAGMENT), 16384 + 69);
        assert_eq!(max_ciphertext_len(16385, MAX_PLAINTEXT_FRAGMENT), 16385 + 2 * 69);
        assert_eq!(max_ciphertext_len(1000, 100), 1000 + 10 * 69);
    }

    #[test]
    fn test_classify_tls_records() {
        let handshake = make_tls_record(CONTENT_TYPE_HANDSHAKE, b"client hello");
        let app_data = make_tls_record(CONTENT_TYPE_APPLICATION_DATA, b"ping");

        assert!(is_handshake_record(&handshake));
        assert!(!is_application_data_record(&handshake));
        assert!(is_application_data_record(&app_data));
        assert!(!is_handshake_record(&app_data));
    }

    #[test]
    fn test_classify_dtls_records() {
        // type, version, epoch(2), sequence(6), length(2)
        let mut dtls = vec![0x16, 0xfe, 0xfd, 0, 0, 0, 0, 0, 0, 0, 1, 0x00, 0x02];
        dtls.extend_from_slice(b"hi");
        assert!(is_handshake_record(&dtls));

        // Too short to hold the DTLS header.
        assert!(!is_handshake_record(&dtls[..8]));

        dtls[0] = CONTENT_TYPE_APPLICATION_DATA;
        assert!(is_application_data_record(&dtls));
    }

    #[test]
    fn test_classify_rejects_garbage() {
        assert!(!is_handshake_record(b""));
        assert!(!is_handshake_record(&[0x16, 0x03]));
        assert!(!is_handshake_record(b"GET / HTTP/1.1\r\n"));
        assert!(!is_application_data_record(&[0x17, 0x01, 0x00, 0x00, 0x00]));
    }
}
