//! Per-variant identifier: the descriptor stored as a member of the
//! `P|request|origin|path|method` sorted set.

use serde::{Deserialize, Serialize};

use crate::errors::CacheResult;
use crate::header::NormalizedHeaders;

/// `score = specificity` padded to 4 digits, so that lex-reverse iteration
/// of the request set visits the most specific variant first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identifier {
    pub id: String,
    pub specificity: u32,
    pub vary: NormalizedHeaders,
    pub hash: String,
    pub tags: Vec<String>,
    #[serde(rename = "expireAt")]
    pub expire_at: i64,
}

impl Identifier {
    pub fn score(&self) -> String {
        format!("{:04}", self.specificity.min(9999))
    }

    /// Encode for storage as a request-set member. The `score` field is
    /// written first by hand rather than through the derived `Serialize`
    /// impl: a `HashMap`/arbitrary-ordering serializer would silently break
    /// the lexicographic ordering the read path depends on, so the field
    /// order here is load-bearing and is built explicitly rather than left
    /// to a crate feature flag (`preserve_order`).
    pub fn encode_for_request_set(&self) -> CacheResult<String> {
        let id = serde_json::to_string(&self.id)?;
        let vary = serde_json::to_string(&self.vary)?;
        let hash = serde_json::to_string(&self.hash)?;
        let tags = serde_json::to_string(&self.tags)?;
        Ok(format!(
            r#"{{"score":"{score}","id":{id},"specificity":{specificity},"vary":{vary},"hash":{hash},"tags":{tags},"expireAt":{expire_at}}}"#,
            score = self.score(),
            id = id,
            specificity = self.specificity,
            vary = vary,
            hash = hash,
            tags = tags,
            expire_at = self.expire_at,
        ))
    }

    /// Decoding doesn't care about field order; `score` is redundant with
    /// `specificity` and is discarded.
    pub fn decode_from_request_set(raw: &str) -> CacheResult<Self> {
        #[derive(Deserialize)]
        struct Wire {
            id: String,
            specificity: u32,
            vary: NormalizedHeaders,
            hash: String,
            tags: Vec<String>,
            #[serde(rename = "expireAt")]
            expire_at: i64,
        }
        let wire: Wire = serde_json::from_str(raw)?;
        Ok(Self {
            id: wire.id,
            specificity: wire.specificity,
            vary: wire.vary,
            hash: wire.hash,
            tags: wire.tags,
            expire_at: wire.expire_at,
        })
    }

    pub fn is_expired(&self, now_epoch_secs: i64) -> bool {
        self.expire_at < now_epoch_secs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Identifier {
        Identifier {
            id: "abc".to_string(),
            specificity: 2,
            vary: [
                ("accept-language".to_string(), "en".to_string()),
                ("a".to_string(), "1".to_string()),
            ]
            .into(),
            hash: "deadbeef".to_string(),
            tags: vec!["t1".to_string(), "t2".to_string()],
            expire_at: 1_700_000_000,
        }
    }

    #[test]
    fn score_is_first_field_and_zero_padded() {
        let encoded = sample().encode_for_request_set().unwrap();
        assert!(encoded.starts_with(r#"{"score":"0002","id":"abc""#));
    }

    #[test]
    fn round_trips_through_decode() {
        let original = sample();
        let encoded = original.encode_for_request_set().unwrap();
        let decoded = Identifier::decode_from_request_set(&encoded).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn specificity_zero_scores_as_zero() {
        let mut id = sample();
        id.specificity = 0;
        assert_eq!(id.score(), "0000");
    }
}
