use std::fmt;
use std::str::FromStr;

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use thiserror::Error;

/// The kind of a sensor loop.
///
/// The textual forms are the row ids of `honeywell5800_loop_kinds`; both
/// directions of the mapping are checked against the database by tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Door,
    DoorWindow,
    GlassBreak,
    HeatDetector,
    KeyFob,
    LowTemp,
    MaintenanceNeeded,
    MedicalAlert,
    MotionDetector,
    PanicButton,
    SmokeDetector,
    Tamper,
    TiltSwitch,
    Window,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("unknown sensor loop kind: {0:?}")]
pub struct UnknownKind(pub String);

impl Kind {
    pub const ALL: [Kind; 14] = [
        Kind::Door,
        Kind::DoorWindow,
        Kind::GlassBreak,
        Kind::HeatDetector,
        Kind::KeyFob,
        Kind::LowTemp,
        Kind::MaintenanceNeeded,
        Kind::MedicalAlert,
        Kind::MotionDetector,
        Kind::PanicButton,
        Kind::SmokeDetector,
        Kind::Tamper,
        Kind::TiltSwitch,
        Kind::Window,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Kind::Door => "door open",
            Kind::DoorWindow => "door or window open",
            Kind::GlassBreak => "glass break",
            Kind::HeatDetector => "heat detector",
            Kind::KeyFob => "key fob button",
            Kind::LowTemp => "low temperature",
            Kind::MaintenanceNeeded => "maintenance needed",
            Kind::MedicalAlert => "medical alert",
            Kind::MotionDetector => "motion detector",
            Kind::PanicButton => "panic button",
            Kind::SmokeDetector => "smoke detector",
            Kind::Tamper => "tamper",
            Kind::TiltSwitch => "tilt switch",
            Kind::Window => "window open",
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Kind {
    type Err = UnknownKind;

    fn from_str(s: &str) -> Result<Self, UnknownKind> {
        Kind::ALL
            .iter()
            .copied()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| UnknownKind(s.to_owned()))
    }
}

impl ToSql for Kind {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for Kind {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let s = value.as_str()?;
        s.parse().map_err(|e: UnknownKind| FromSqlError::Other(Box::new(e)))
    }
}
