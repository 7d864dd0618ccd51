use std::fmt;

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Deserializer};
use thiserror::Error;

// sensor ids use only 20 bits on the air
const SENSOR_MAX: u32 = 1 << 20;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SensorError {
    #[error("sensor ID cannot be larger than 20 bits")]
    TooLarge,
    #[error("sensor ID cannot be 0 or negative")]
    TooSmall,
}

/// A sensor's radio identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Sensor(u32);

impl Sensor {
    pub fn new(id: u32) -> Result<Self, SensorError> {
        if id > SENSOR_MAX {
            return Err(SensorError::TooLarge);
        }
        if id == 0 {
            return Err(SensorError::TooSmall);
        }
        Ok(Sensor(id))
    }

    pub fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for Sensor {
    /// Formats like `A064-3345`, as found on stickers on the hardware.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let digits = format!("{:07}", self.0);
        let (head, tail) = digits.split_at(digits.len() - 4);
        write!(f, "A{head}-{tail}")
    }
}

impl TryFrom<i64> for Sensor {
    type Error = SensorError;

    fn try_from(n: i64) -> Result<Self, SensorError> {
        if n > i64::from(SENSOR_MAX) {
            return Err(SensorError::TooLarge);
        }
        if n <= 0 {
            return Err(SensorError::TooSmall);
        }
        Ok(Sensor(n as u32))
    }
}

impl<'de> Deserialize<'de> for Sensor {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let n = u32::deserialize(deserializer)?;
        Sensor::new(n).map_err(serde::de::Error::custom)
    }
}

impl ToSql for Sensor {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(i64::from(self.0)))
    }
}

impl FromSql for Sensor {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let n = i64::column_result(value)?;
        Sensor::try_from(n).map_err(|e| FromSqlError::Other(Box::new(e)))
    }
}
