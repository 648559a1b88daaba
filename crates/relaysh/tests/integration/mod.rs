//! Loopback test harness: a real controller with real agents dialing it

pub mod fleet;

pub use fleet::*;
