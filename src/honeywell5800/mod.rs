//! Honeywell 5800-series wireless sensor support.

pub mod channel;
pub mod event;
pub mod kind;
pub mod receive;
pub mod sensor;
pub mod trip;

pub use channel::Channel;
pub use event::Event;
pub use kind::Kind;
pub use sensor::Sensor;
