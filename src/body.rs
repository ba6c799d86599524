//! Body chunk encoding: base64 tokens separated by single ASCII spaces.

use base64::{engine::general_purpose::STANDARD, Engine as _};

use crate::errors::{CacheError, CacheResult};

/// An ordered, finite sequence of binary chunks as handed to/from the HTTP
/// layer.
pub type Body = Vec<Vec<u8>>;

/// Encode chunks as base64 tokens joined by a single space. An empty body
/// encodes as the empty string.
pub fn encode_chunks(chunks: &[Vec<u8>]) -> String {
    chunks
        .iter()
        .map(|chunk| STANDARD.encode(chunk))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Decode a stored body string back into its chunk sequence. Only the
/// trailing whitespace run (if any) is trimmed; tokens are then split on the
/// literal `' '` separator without collapsing interior runs, since a chunk
/// may itself be empty (its base64 encoding is the empty string), and two
/// adjacent empty chunks or an empty chunk flanked by non-empty ones shows up
/// as a doubled space that must decode back to a zero-length chunk rather
/// than vanish.
pub fn decode_to_chunks(raw: &str) -> CacheResult<Body> {
    let trimmed = raw.trim_end_matches(|c: char| c.is_ascii_whitespace());
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    trimmed
        .split(' ')
        .map(|token| {
            STANDARD
                .decode(token)
                .map_err(|e| CacheError::Encoding(e.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_body_round_trips_to_empty_string() {
        assert_eq!(encode_chunks(&[]), "");
        assert_eq!(decode_to_chunks("").unwrap(), Vec::<Vec<u8>>::new());
    }

    #[test]
    fn round_trips_multiple_chunks() {
        let chunks: Body = vec![b"asd".to_vec(), b"qwe".to_vec()];
        let encoded = encode_chunks(&chunks);
        assert_eq!(encoded.split(' ').count(), 2);
        assert_eq!(decode_to_chunks(&encoded).unwrap(), chunks);
    }

    #[test]
    fn decode_tolerates_trailing_whitespace() {
        let encoded = format!("{}  \n", encode_chunks(&[b"asd".to_vec()]));
        assert_eq!(decode_to_chunks(&encoded).unwrap(), vec![b"asd".to_vec()]);
    }

    #[test]
    fn interior_empty_chunk_round_trips() {
        let chunks: Body = vec![vec![1, 2, 3], Vec::new(), vec![4, 5, 6]];
        let encoded = encode_chunks(&chunks);
        assert_eq!(encoded, "AQID  BAUG");
        assert_eq!(decode_to_chunks(&encoded).unwrap(), chunks);
    }
}
