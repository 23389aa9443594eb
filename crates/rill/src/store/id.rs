use std::fmt;
use std::str::FromStr;

/// Stream entry id: a millisecond timestamp plus a per-millisecond sequence
/// number, rendered as `{ms}-{seq}`. Ordering is total and follows append
/// order for store-assigned ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct StreamId {
    pub ms: u64,
    pub seq: u64,
}

impl StreamId {
    /// Smallest id; the conventional start cursor for scans.
    pub const ZERO: StreamId = StreamId { ms: 0, seq: 0 };

    /// Largest id; the conventional end cursor for scans.
    pub const MAX: StreamId = StreamId {
        ms: u64::MAX,
        seq: u64::MAX,
    };

    pub fn new(ms: u64, seq: u64) -> Self {
        Self { ms, seq }
    }

    /// The immediately following id (exclusive-range cursor arithmetic).
    pub fn next(self) -> Self {
        match self.seq.checked_add(1) {
            Some(seq) => Self { ms: self.ms, seq },
            None => Self {
                ms: self.ms + 1,
                seq: 0,
            },
        }
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid stream id: {0}")]
pub struct ParseStreamIdError(String);

impl FromStr for StreamId {
    type Err = ParseStreamIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ms, seq) = s
            .split_once('-')
            .ok_or_else(|| ParseStreamIdError(s.to_string()))?;
        let ms = ms
            .parse()
            .map_err(|_| ParseStreamIdError(s.to_string()))?;
        let seq = seq
            .parse()
            .map_err(|_| ParseStreamIdError(s.to_string()))?;
        Ok(Self { ms, seq })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_and_parse_round_trip() {
        let id = StreamId::new(1_700_000_000_123, 7);
        let parsed: StreamId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!("".parse::<StreamId>().is_err());
        assert!("123".parse::<StreamId>().is_err());
        assert!("a-b".parse::<StreamId>().is_err());
        assert!("1-2-3".parse::<StreamId>().is_err());
    }

    #[test]
    fn ordering_is_ms_then_seq() {
        assert!(StreamId::new(1, 5) < StreamId::new(2, 0));
        assert!(StreamId::new(2, 0) < StreamId::new(2, 1));
        assert!(StreamId::ZERO < StreamId::new(0, 1));
        assert!(StreamId::new(u64::MAX, 0) < StreamId::MAX);
    }

    #[test]
    fn next_increments_seq_and_carries() {
        assert_eq!(StreamId::new(5, 3).next(), StreamId::new(5, 4));
        assert_eq!(StreamId::new(5, u64::MAX).next(), StreamId::new(6, 0));
    }
}
