//! Wire packet and positional argument access
//!
//! Simple JSON-over-newline protocol. Each packet is a single line of JSON followed by `\n`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ErrorCode, WmResult};

/// Longest accepted line, in bytes
pub const MAX_PACKET_SIZE: usize = 64 * 1024;

/// What a packet expects from the other side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PacketKind {
    /// Expects a reply carrying the same `seq`
    Request,
    /// Answers an earlier request
    Reply,
    /// Fire-and-forget
    Notify,
}

/// One framed message on any channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Packet {
    pub kind: PacketKind,
    #[serde(default)]
    pub seq: u64,
    pub cmd: String,
    #[serde(default)]
    pub args: Args,
}

impl Packet {
    pub fn request(seq: u64, cmd: impl Into<String>, args: Args) -> Self {
        Self {
            kind: PacketKind::Request,
            seq,
            cmd: cmd.into(),
            args,
        }
    }

    pub fn notify(cmd: impl Into<String>, args: Args) -> Self {
        Self {
            kind: PacketKind::Notify,
            seq: 0,
            cmd: cmd.into(),
            args,
        }
    }

    /// Build the reply for this packet
    pub fn reply(&self, args: Args) -> Self {
        Self {
            kind: PacketKind::Reply,
            seq: self.seq,
            cmd: self.cmd.clone(),
            args,
        }
    }

    /// Serialize to a single newline-terminated line
    pub fn to_line(&self) -> WmResult<String> {
        let mut line = serde_json::to_string(self).map_err(|_| ErrorCode::InvalidParameter)?;
        if line.len() > MAX_PACKET_SIZE {
            return Err(ErrorCode::NoSpace);
        }
        line.push('\n');
        Ok(line)
    }

    /// Parse one line (without or with its trailing newline)
    pub fn from_line(line: &str) -> WmResult<Self> {
        if line.len() > MAX_PACKET_SIZE {
            return Err(ErrorCode::NoSpace);
        }
        serde_json::from_str(line.trim()).map_err(|_| ErrorCode::InvalidParameter)
    }
}

/// Positional, loosely typed packet arguments
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Args(pub Vec<Value>);

impl Args {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Append an argument (builder style)
    pub fn with(mut self, value: impl Into<Value>) -> Self {
        self.0.push(value.into());
        self
    }

    pub fn push(&mut self, value: impl Into<Value>) {
        self.0.push(value.into());
    }

    fn get(&self, idx: usize) -> WmResult<&Value> {
        self.0.get(idx).ok_or(ErrorCode::InvalidParameter)
    }

    pub fn i32(&self, idx: usize) -> WmResult<i32> {
        let v = self.get(idx)?.as_i64().ok_or(ErrorCode::InvalidParameter)?;
        i32::try_from(v).map_err(|_| ErrorCode::InvalidParameter)
    }

    pub fn f64(&self, idx: usize) -> WmResult<f64> {
        self.get(idx)?.as_f64().ok_or(ErrorCode::InvalidParameter)
    }

    pub fn str(&self, idx: usize) -> WmResult<&str> {
        self.get(idx)?.as_str().ok_or(ErrorCode::InvalidParameter)
    }

    pub fn bool(&self, idx: usize) -> WmResult<bool> {
        Ok(self.i32(idx)? != 0)
    }

    /// Non-negative dimension
    pub fn size(&self, idx: usize) -> WmResult<u32> {
        u32::try_from(self.i32(idx)?).map_err(|_| ErrorCode::InvalidParameter)
    }

    /// A string argument that must not be empty
    pub fn name(&self, idx: usize) -> WmResult<&str> {
        let s = self.str(idx)?;
        if s.is_empty() {
            return Err(ErrorCode::InvalidParameter);
        }
        Ok(s)
    }

    /// `ret` code stored in the first argument of a reply
    pub fn ret(&self) -> i32 {
        self.i32(0).unwrap_or(ErrorCode::Fault.code())
    }
}

/// Build `Args` from a heterogeneous list: `args![0, "clock", 1.5]`
#[macro_export]
macro_rules! args {
    () => { $crate::protocol::Args::new() };
    ($($v:expr),+ $(,)?) => {
        $crate::protocol::Args(vec![$(::serde_json::Value::from($v)),+])
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args;

    #[test]
    fn test_request_serialize() {
        let p = Packet::request(7, "new", args![1.5, "clock"]);
        let json = serde_json::to_string(&p).unwrap();
        assert_eq!(json, r#"{"kind":"request","seq":7,"cmd":"new","args":[1.5,"clock"]}"#);
    }

    #[test]
    fn test_notify_deserialize_defaults() {
        let p = Packet::from_line("{\"kind\":\"notify\",\"cmd\":\"ping\"}\n").unwrap();
        assert_eq!(p.kind, PacketKind::Notify);
        assert_eq!(p.seq, 0);
        assert!(p.args.is_empty());
    }

    #[test]
    fn test_reply_keeps_seq() {
        let req = Packet::request(42, "resize", args!["clock", "1", 10, 10]);
        let rep = req.reply(args![0]);
        assert_eq!(rep.kind, PacketKind::Reply);
        assert_eq!(rep.seq, 42);
        assert_eq!(rep.cmd, "resize");
        assert_eq!(rep.args.ret(), 0);
    }

    #[test]
    fn test_typed_accessors() {
        let a = args![3, 2.5, "pkg", "", -1];
        assert_eq!(a.i32(0), Ok(3));
        assert_eq!(a.f64(0), Ok(3.0));
        assert_eq!(a.f64(1), Ok(2.5));
        assert_eq!(a.str(2), Ok("pkg"));
        assert_eq!(a.name(3), Err(ErrorCode::InvalidParameter));
        assert_eq!(a.size(4), Err(ErrorCode::InvalidParameter));
        assert_eq!(a.i32(1), Err(ErrorCode::InvalidParameter));
        assert_eq!(a.str(9), Err(ErrorCode::InvalidParameter));
    }

    #[test]
    fn test_garbage_line_rejected() {
        assert_eq!(Packet::from_line("not json"), Err(ErrorCode::InvalidParameter));
    }

    #[test]
    fn test_oversize_line_rejected() {
        let big = "x".repeat(MAX_PACKET_SIZE + 1);
        assert_eq!(Packet::from_line(&big), Err(ErrorCode::NoSpace));
    }

    #[test]
    fn test_missing_ret_is_fault() {
        assert_eq!(Args::new().ret(), ErrorCode::Fault.code());
    }
}
