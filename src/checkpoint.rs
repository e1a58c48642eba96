//! Resume positions for incremental sync.
//!
//! A checkpoint is a position in the source change log. The store keeps one
//! per stream identifier and only ever moves it forward, so a crashed or
//! restarted process resumes from the last change it fully applied.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A position in the source change log: seconds since the epoch plus an
/// ordinal disambiguating changes within the same second.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Checkpoint {
    pub time: u32,
    pub increment: u32,
}

impl Checkpoint {
    pub fn new(time: u32, increment: u32) -> Self {
        Checkpoint { time, increment }
    }

    /// Render as `{time}:{increment}` for logs and CLI output.
    pub fn to_cli_string(&self) -> String {
        format!("{}:{}", self.time, self.increment)
    }

    /// Seconds between this position and the given change log head.
    pub fn lag_seconds(&self, head: &Checkpoint) -> i64 {
        i64::from(head.time) - i64::from(self.time)
    }
}

impl std::fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_cli_string())
    }
}

impl std::str::FromStr for Checkpoint {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        use anyhow::Context;
        let (time, increment) = s
            .split_once(':')
            .context("expected a checkpoint formatted as 'time:increment'")?;
        Ok(Checkpoint {
            time: time.parse().context("invalid checkpoint time")?,
            increment: increment.parse().context("invalid checkpoint increment")?,
        })
    }
}

impl From<bson::Timestamp> for Checkpoint {
    fn from(ts: bson::Timestamp) -> Self {
        Checkpoint {
            time: ts.time,
            increment: ts.increment,
        }
    }
}

impl From<Checkpoint> for bson::Timestamp {
    fn from(checkpoint: Checkpoint) -> Self {
        bson::Timestamp {
            time: checkpoint.time,
            increment: checkpoint.increment,
        }
    }
}

/// Durable storage for per-stream checkpoints.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// The last recorded position for the stream, if any.
    async fn last_known(&self, stream_id: &str) -> anyhow::Result<Option<Checkpoint>>;

    /// Record a new position. Fails on attempts to move backwards.
    async fn advance(&self, stream_id: &str, checkpoint: Checkpoint) -> anyhow::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_is_time_then_increment() {
        assert!(Checkpoint::new(10, 5) < Checkpoint::new(11, 0));
        assert!(Checkpoint::new(10, 5) < Checkpoint::new(10, 6));
        assert_eq!(Checkpoint::new(10, 5), Checkpoint::new(10, 5));
    }

    #[test]
    fn cli_string_round_trips() {
        let checkpoint = Checkpoint::new(1700000000, 3);
        assert_eq!(checkpoint.to_cli_string(), "1700000000:3");
        assert_eq!("1700000000:3".parse::<Checkpoint>().unwrap(), checkpoint);
        assert!("1700000000".parse::<Checkpoint>().is_err());
        assert!("a:b".parse::<Checkpoint>().is_err());
    }

    #[test]
    fn lag_is_in_seconds() {
        let behind = Checkpoint::new(100, 9);
        let head = Checkpoint::new(160, 0);
        assert_eq!(behind.lag_seconds(&head), 60);
    }

    #[test]
    fn serde_round_trip() {
        let checkpoint = Checkpoint::new(1700000000, 7);
        let json = serde_json::to_string(&checkpoint).unwrap();
        let parsed: Checkpoint = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, checkpoint);
    }
}
