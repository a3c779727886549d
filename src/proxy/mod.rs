//! Proxy plumbing shared by the TCP and UDP services.
//!
//! - `address`: the destination address carried at the start of every unit
//! - `relay`: full-duplex stream relay with half-close and stop signals

pub mod address;
pub mod relay;

pub use address::Address;
pub use relay::{relay_stream, NoopTraffic, SessionSignals, TrafficHook};
