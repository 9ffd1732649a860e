pub mod dial;
pub mod io;
pub mod origdst;
pub mod proto;
pub mod proxy;
pub mod relay;

pub const CRLF: [u8; 2] = [0x0d, 0x0a];

/// Log target for records that must reach syslog as `LOG_CRIT`.
pub const CRIT: &str = "crit";
