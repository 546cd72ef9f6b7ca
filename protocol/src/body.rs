//! Base64 body encoding, chunked over 8 KiB input windows so neither side
//! builds one unbounded intermediate string for a large request/response
//! body.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

/// Must stay a multiple of 3: base64 encodes in 3-byte groups, so any
/// other chunk size would insert padding mid-stream and break both the
/// single-pass equivalence and decodability of the concatenated output.
const CHUNK_SIZE: usize = 8 * 1023;

/// Encodes `bytes` to base64 by feeding it through in 8 KiB windows and
/// concatenating the result. Equivalent to encoding the whole buffer at
/// once — base64's 3-byte alignment means only the chunking strategy
/// changes, not the output — but avoids allocating a second buffer the
/// size of the whole un-chunked base64 string during encode.
pub fn encode_chunked(bytes: &[u8]) -> String {
    let mut out = String::with_capacity((bytes.len() * 4 / 3) + 4);
    for chunk in bytes.chunks(CHUNK_SIZE) {
        BASE64.encode_string(chunk, &mut out);
    }
    out
}

/// Decodes a base64 string produced by [`encode_chunked`] (or any standard
/// base64 without line breaks) back to raw bytes.
pub fn decode(encoded: &str) -> Result<Vec<u8>, base64::DecodeError> {
    BASE64.decode(encoded)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_small_body() {
        let data = b"hello world";
        let encoded = encode_chunked(data);
        assert_eq!(decode(&encoded).unwrap(), data);
    }

    #[test]
    fn round_trips_across_chunk_boundary() {
        let data: Vec<u8> = (0..(CHUNK_SIZE * 3 + 17)).map(|i| (i % 256) as u8).collect();
        let encoded = encode_chunked(&data);
        assert_eq!(decode(&encoded).unwrap(), data);
    }

    #[test]
    fn chunking_does_not_change_output_vs_single_pass() {
        let data: Vec<u8> = (0..20_000u32).map(|i| (i % 256) as u8).collect();
        let chunked = encode_chunked(&data);
        let whole = BASE64.encode(&data);
        assert_eq!(chunked, whole);
    }

    #[test]
    fn empty_body_round_trips() {
        assert_eq!(decode(&encode_chunked(b"")).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn encoded_output_has_no_embedded_whitespace() {
        let data: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
        let encoded = encode_chunked(&data);
        assert!(!encoded.contains('\n') && !encoded.contains(' '));
    }
}
