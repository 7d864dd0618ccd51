use std::fmt;

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Deserializer};
use thiserror::Error;

// event bits that seem common to all devices
const REGISTER: u8 = 0x02;
const HEARTBEAT: u8 = 0x04;
const BATTERY_LOW: u8 = 0x08;

// the meaning of the 4 "loops" is device-dependent
const LOOP1: u8 = 0x80;
const LOOP2: u8 = 0x20;
const LOOP3: u8 = 0x10;
const LOOP4: u8 = 0x40;

const KNOWN: u8 = REGISTER | HEARTBEAT | BATTERY_LOW | LOOP1 | LOOP2 | LOOP3 | LOOP4;

#[derive(Debug, Error)]
#[error("event cannot be greater than 8 bits")]
pub struct EventTooLarge;

/// The event byte of a transmission. Unknown bits are preserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event(u8);

impl Event {
    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn is_register(self) -> bool {
        self.0 & REGISTER != 0
    }

    pub fn is_heartbeat(self) -> bool {
        self.0 & HEARTBEAT != 0
    }

    pub fn is_battery_low(self) -> bool {
        self.0 & BATTERY_LOW != 0
    }

    /// Whether loop `n` (1..=4) is open. Out-of-range loops are never open.
    pub fn loop_open(self, n: u8) -> bool {
        match n {
            1 => self.loop1(),
            2 => self.loop2(),
            3 => self.loop3(),
            4 => self.loop4(),
            _ => false,
        }
    }

    pub fn loop1(self) -> bool {
        self.0 & LOOP1 != 0
    }

    pub fn loop2(self) -> bool {
        self.0 & LOOP2 != 0
    }

    pub fn loop3(self) -> bool {
        self.0 & LOOP3 != 0
    }

    pub fn loop4(self) -> bool {
        self.0 & LOOP4 != 0
    }

    /// Spelled-out bit names, for log readability: `"L1+battery+heartbeat"`.
    /// Unknown bits are appended in hex; the zero event is `"none"`.
    pub fn verbose(self) -> String {
        if self.0 == 0 {
            return "none".to_owned();
        }
        let mut parts = Vec::new();
        if self.loop1() {
            parts.push("L1".to_owned());
        }
        if self.loop2() {
            parts.push("L2".to_owned());
        }
        if self.loop3() {
            parts.push("L3".to_owned());
        }
        if self.loop4() {
            parts.push("L4".to_owned());
        }
        if self.is_register() {
            parts.push("register".to_owned());
        }
        if self.is_battery_low() {
            parts.push("battery".to_owned());
        }
        if self.is_heartbeat() {
            parts.push("heartbeat".to_owned());
        }
        let unknown = self.0 & !KNOWN;
        if unknown != 0 {
            parts.push(format!("{unknown:#04x}"));
        }
        parts.join("+")
    }
}

impl From<u8> for Event {
    fn from(bits: u8) -> Event {
        Event(bits)
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#04x}", self.0)
    }
}

impl<'de> Deserialize<'de> for Event {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        u8::deserialize(deserializer).map(Event)
    }
}

impl ToSql for Event {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(i64::from(self.0)))
    }
}

impl FromSql for Event {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let n = i64::column_result(value)?;
        match u8::try_from(n) {
            Ok(bits) => Ok(Event(bits)),
            Err(_) => Err(FromSqlError::Other(Box::new(EventTooLarge))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn displays_as_hex() {
        assert_eq!(Event::from(0x02).to_string(), "0x02");
        assert_eq!(Event::from(0xa0).to_string(), "0xa0");
    }

    #[test]
    fn verbose_names_the_bits() {
        let cases = [
            (0x02, "register"),
            (0xa0, "L1+L2"),
            (0x84, "L1+heartbeat"),
            (0x80, "L1"),
            (0x04, "heartbeat"),
            (0x8c, "L1+battery+heartbeat"),
            (0x00, "none"),
            // not seen with real hardware, just here to tease out coverage
            (0x81, "L1+0x01"),
            (0x01, "0x01"),
        ];
        for (bits, want) in cases {
            assert_eq!(Event::from(bits).verbose(), want, "event {bits:#04x}");
        }
    }

    #[test]
    fn maps_loops_to_their_bits() {
        let e = Event::from(0x80 | 0x10);
        assert!(e.loop_open(1));
        assert!(!e.loop_open(2));
        assert!(e.loop_open(3));
        assert!(!e.loop_open(4));
        assert!(!e.loop_open(0));
        assert!(!e.loop_open(5));
    }

    #[test]
    fn rejects_wide_sql_values() {
        use rusqlite::Connection;
        let conn = Connection::open_in_memory().unwrap();
        let result: Result<Event, _> = conn.query_row("SELECT 256", [], |row| row.get(0));
        assert!(result.is_err());
    }
}
