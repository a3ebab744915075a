//! Wire protocol shared by the four channels
//!
//! Every inbound unit is a verb plus positional arguments. Requests are answered with a
//! reply carrying the same sequence number; notifications are fire-and-forget.

mod packet;

pub use packet::{Args, MAX_PACKET_SIZE, Packet, PacketKind};

use serde::{Deserialize, Serialize};

use crate::error::{ErrorCode, WmResult};

/// Logical channel a connection arrived on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    /// Worker processes
    Slave,
    /// Viewer processes
    Client,
    /// Programmatic bulk operations
    Service,
    /// Introspection
    Debug,
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Slave => write!(f, "slave"),
            Self::Client => write!(f, "client"),
            Self::Service => write!(f, "service"),
            Self::Debug => write!(f, "debug"),
        }
    }
}

/// Which of an instance's two views a request addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Target {
    /// Primary, always visible view
    Dbox,
    /// Detail popup
    Gbar,
}

impl Target {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Dbox => "dbox",
            Self::Gbar => "gbar",
        }
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Target {
    type Err = ErrorCode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dbox" => Ok(Self::Dbox),
            "gbar" | "detail" => Ok(Self::Gbar),
            _ => Err(ErrorCode::InvalidParameter),
        }
    }
}

impl Args {
    /// Parse a `dbox`/`gbar` target argument (`detail` is accepted for `gbar`)
    pub fn target(&self, idx: usize) -> WmResult<Target> {
        self.str(idx)?.parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args;

    #[test]
    fn test_target_parse() {
        assert_eq!("dbox".parse::<Target>(), Ok(Target::Dbox));
        assert_eq!("gbar".parse::<Target>(), Ok(Target::Gbar));
        assert_eq!("detail".parse::<Target>(), Ok(Target::Gbar));
        assert_eq!("lb".parse::<Target>(), Err(ErrorCode::InvalidParameter));
    }

    #[test]
    fn test_target_arg() {
        let a = args!["gbar", 1];
        assert_eq!(a.target(0), Ok(Target::Gbar));
        assert_eq!(a.target(1), Err(ErrorCode::InvalidParameter));
    }

    #[test]
    fn test_channel_display() {
        assert_eq!(Channel::Slave.to_string(), "slave");
        assert_eq!(Channel::Debug.to_string(), "debug");
    }
}
