use rusqlite::types::{ToSql, ToSqlOutput};
use serde::{Deserialize, Deserializer};
use thiserror::Error;

// 4 bits on the air
const CHANNEL_MAX: u8 = 16;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("channel cannot be larger than 4 bits")]
pub struct ChannelTooLarge;

/// The radio channel a transmission arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Channel(u8);

impl Channel {
    pub fn new(ch: u8) -> Result<Self, ChannelTooLarge> {
        if ch > CHANNEL_MAX {
            return Err(ChannelTooLarge);
        }
        Ok(Channel(ch))
    }
}

impl From<Channel> for u8 {
    fn from(ch: Channel) -> u8 {
        ch.0
    }
}

impl<'de> Deserialize<'de> for Channel {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let n = u8::deserialize(deserializer)?;
        Channel::new(n).map_err(serde::de::Error::custom)
    }
}

impl ToSql for Channel {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(i64::from(self.0)))
    }
}
