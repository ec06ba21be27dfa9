use std::cmp::Ordering;

use bson::{Bson, Document, doc};
use runnel_oplog::LogicalTime;
use serde::{Deserialize, Serialize};

use crate::error::StreamError;

pub const TOKEN_VERSION: u8 = 1;

const PREFIX_LEN: usize = 16;
const HEADER_LEN: usize = PREFIX_LEN + 4;
const FLAG_FROM_INVALIDATE: u8 = 0b01;
const FLAG_FRONTIER: u8 = 0b10;

/// A totally ordered stream position.
///
/// Binary layout: `[time u32][inc u32][tie_break u64][version u8][flags u8]
/// [shard len u16][shard bytes]`, integers big-endian. The first 16 bytes
/// are the ordering key, so encoded tokens compare without decoding.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResumeToken {
    pub cluster_time: LogicalTime,
    pub tie_break: u64,
    pub from_invalidate: bool,
    pub frontier: bool,
    pub shard: Option<String>,
}

impl ResumeToken {
    pub fn event(cluster_time: LogicalTime, tie_break: u64, shard: impl Into<String>) -> Self {
        Self {
            cluster_time,
            tie_break,
            from_invalidate: false,
            frontier: false,
            shard: Some(shard.into()),
        }
    }

    /// Position for a synthesized control event, which has no shard.
    pub fn control(cluster_time: LogicalTime) -> Self {
        Self {
            cluster_time,
            tie_break: 0,
            from_invalidate: false,
            frontier: false,
            shard: None,
        }
    }

    /// Position after every event stamped at or before `cluster_time`.
    pub fn frontier(cluster_time: LogicalTime) -> Self {
        Self {
            cluster_time,
            tie_break: u64::MAX,
            from_invalidate: false,
            frontier: true,
            shard: None,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let shard = self.shard.as_deref().unwrap_or("").as_bytes();
        let mut out = Vec::with_capacity(HEADER_LEN + shard.len());
        out.extend_from_slice(&self.cluster_time.secs.to_be_bytes());
        out.extend_from_slice(&self.cluster_time.inc.to_be_bytes());
        out.extend_from_slice(&self.tie_break.to_be_bytes());
        out.push(TOKEN_VERSION);
        let mut flags = 0;
        if self.from_invalidate {
            flags |= FLAG_FROM_INVALIDATE;
        }
        if self.frontier {
            flags |= FLAG_FRONTIER;
        }
        out.push(flags);
        out.extend_from_slice(&(shard.len() as u16).to_be_bytes());
        out.extend_from_slice(shard);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, StreamError> {
        if bytes.len() < HEADER_LEN {
            return Err(StreamError::InvalidResumeToken(format!(
                "token too short: {} bytes",
                bytes.len()
            )));
        }
        let secs = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let inc = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        let mut tie = [0u8; 8];
        tie.copy_from_slice(&bytes[8..16]);
        let version = bytes[16];
        if version != TOKEN_VERSION {
            return Err(StreamError::InvalidResumeToken(format!(
                "unsupported token version {version}"
            )));
        }
        let flags = bytes[17];
        if flags & !(FLAG_FROM_INVALIDATE | FLAG_FRONTIER) != 0 {
            return Err(StreamError::InvalidResumeToken(format!("unknown flags {flags:#x}")));
        }
        let shard_len = u16::from_be_bytes([bytes[18], bytes[19]]) as usize;
        if bytes.len() != HEADER_LEN + shard_len {
            return Err(StreamError::InvalidResumeToken("token length mismatch".into()));
        }
        let shard = std::str::from_utf8(&bytes[HEADER_LEN..])
            .map_err(|_| StreamError::InvalidResumeToken("shard id is not utf-8".into()))?;
        Ok(Self {
            cluster_time: LogicalTime::new(secs, inc),
            tie_break: u64::from_be_bytes(tie),
            from_invalidate: flags & FLAG_FROM_INVALIDATE != 0,
            frontier: flags & FLAG_FRONTIER != 0,
            shard: (!shard.is_empty()).then(|| shard.to_string()),
        })
    }

    pub fn to_hex(&self) -> String {
        hex::encode_upper(self.encode())
    }

    pub fn from_hex(data: &str) -> Result<Self, StreamError> {
        let bytes = hex::decode(data)
            .map_err(|e| StreamError::InvalidResumeToken(format!("bad hex: {e}")))?;
        Self::decode(&bytes)
    }

    /// Client-visible form: `{_data: "<hex>"}`.
    pub fn to_document(&self) -> Document {
        doc! { "_data": self.to_hex() }
    }

    pub fn from_document(doc: &Document) -> Result<Self, StreamError> {
        match doc.get("_data") {
            Some(Bson::String(data)) => Self::from_hex(data),
            _ => Err(StreamError::InvalidResumeToken("missing _data".into())),
        }
    }
}

impl Ord for ResumeToken {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.cluster_time, self.tie_break)
            .cmp(&(other.cluster_time, other.tie_break))
            .then_with(|| {
                let a = self.shard.as_deref().unwrap_or("");
                let b = other.shard.as_deref().unwrap_or("");
                a.cmp(b)
            })
            .then_with(|| {
                (self.from_invalidate, self.frontier).cmp(&(other.from_invalidate, other.frontier))
            })
    }
}

impl PartialOrd for ResumeToken {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Order two encoded tokens by their fixed-width prefix, then shard id,
/// without decoding them. Agrees with [`ResumeToken`]'s `Ord`.
pub fn compare_encoded(a: &[u8], b: &[u8]) -> Ordering {
    let prefix = |t: &[u8]| t.get(..PREFIX_LEN).map(<[u8]>::to_vec).unwrap_or_default();
    let rest = |t: &[u8]| t.get(HEADER_LEN..).map(<[u8]>::to_vec).unwrap_or_default();
    let flags = |t: &[u8]| t.get(PREFIX_LEN + 1).copied().unwrap_or(0);
    prefix(a)
        .cmp(&prefix(b))
        .then_with(|| rest(a).cmp(&rest(b)))
        .then_with(|| {
            let key = |f: u8| (f & FLAG_FROM_INVALIDATE != 0, f & FLAG_FRONTIER != 0);
            key(flags(a)).cmp(&key(flags(b)))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_token_round_trips() {
        let token = ResumeToken::event(LogicalTime::new(1_700_000_000, 3), 7, "shard-a");
        assert_eq!(ResumeToken::decode(&token.encode()).unwrap(), token);
        assert_eq!(ResumeToken::from_document(&token.to_document()).unwrap(), token);
    }

    #[test]
    fn frontier_sorts_after_events_at_same_time() {
        let t = LogicalTime::new(10, 1);
        let frontier = ResumeToken::frontier(t);
        let event = ResumeToken::event(t, 1_000, "zzz");
        assert!(event < frontier);
        assert!(frontier < ResumeToken::event(t.next(), 0, "a"));
        assert_eq!(ResumeToken::decode(&frontier.encode()).unwrap().shard, None);
    }

    #[test]
    fn same_time_ties_break_on_index_then_shard() {
        let t = LogicalTime::new(10, 1);
        let a0 = ResumeToken::event(t, 0, "shard-a");
        let b0 = ResumeToken::event(t, 0, "shard-b");
        let a1 = ResumeToken::event(t, 1, "shard-a");
        assert!(a0 < b0);
        assert!(b0 < a1);
    }

    #[test]
    fn encoded_comparison_agrees_with_ord() {
        let t = LogicalTime::new(10, 1);
        let tokens = [
            ResumeToken::control(t),
            ResumeToken::event(t, 0, "a"),
            ResumeToken::event(t, 0, "b"),
            ResumeToken::event(t, 2, "a"),
            ResumeToken::frontier(t),
            ResumeToken::event(LogicalTime::new(11, 0), 0, "a"),
        ];
        for x in &tokens {
            for y in &tokens {
                assert_eq!(compare_encoded(&x.encode(), &y.encode()), x.cmp(y), "{x:?} vs {y:?}");
            }
        }
    }

    #[test]
    fn malformed_tokens_are_rejected() {
        assert!(ResumeToken::from_hex("zz").is_err());
        assert!(ResumeToken::decode(&[0u8; 5]).is_err());

        let mut bytes = ResumeToken::event(LogicalTime::new(1, 1), 0, "s").encode();
        bytes[16] = 9;
        assert!(matches!(
            ResumeToken::decode(&bytes),
            Err(StreamError::InvalidResumeToken(msg)) if msg.contains("version")
        ));

        let mut bytes = ResumeToken::event(LogicalTime::new(1, 1), 0, "s").encode();
        bytes.push(b'x');
        assert!(ResumeToken::decode(&bytes).is_err());
        assert!(ResumeToken::from_document(&doc! { "data": "00" }).is_err());
    }

    #[test]
    fn invalidate_flag_survives() {
        let mut token = ResumeToken::event(LogicalTime::new(4, 4), 1, "s");
        token.from_invalidate = true;
        let decoded = ResumeToken::from_hex(&token.to_hex()).unwrap();
        assert!(decoded.from_invalidate);
        assert!(!decoded.frontier);
    }
}
