//! Per-peer outgoing command queue
//!
//! Commands to one peer are delivered strictly in push order. A command that expects a
//! reply blocks the rest of the queue until the matching reply (or a failure) resolves
//! it; fire-and-forget commands are written back to back. The actual sending is done by
//! [`Master::drain`](crate::master::Master::drain), which owns the connections.

use std::collections::VecDeque;

use crate::error::WmResult;
use crate::master::Master;
use crate::protocol::Args;
use crate::timer::TimerId;

/// Continuation run when a queued command's reply arrives (or the command fails)
pub type ReplyFn = Box<dyn FnOnce(&mut Master, WmResult<Args>) + Send>;

/// A command waiting in a peer's queue
pub struct Command {
    /// Package the command targets; faulted packages are skipped at drain time
    pub pkg: Option<String>,
    /// Instance the command targets
    pub inst: Option<String>,
    pub cmd: String,
    pub args: Args,
    pub reply: Option<ReplyFn>,
}

impl Command {
    /// Fire-and-forget command
    pub fn notify(cmd: impl Into<String>, args: Args) -> Self {
        Self {
            pkg: None,
            inst: None,
            cmd: cmd.into(),
            args,
            reply: None,
        }
    }

    /// Command whose reply resolves `reply`
    pub fn request(cmd: impl Into<String>, args: Args, reply: ReplyFn) -> Self {
        Self {
            pkg: None,
            inst: None,
            cmd: cmd.into(),
            args,
            reply: Some(reply),
        }
    }

    /// Attach the package/instance the command is about
    pub fn for_instance(mut self, pkg: &str, inst: Option<&str>) -> Self {
        self.pkg = Some(pkg.to_string());
        self.inst = inst.map(str::to_string);
        self
    }

    pub fn expects_reply(&self) -> bool {
        self.reply.is_some()
    }
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Command")
            .field("pkg", &self.pkg)
            .field("inst", &self.inst)
            .field("cmd", &self.cmd)
            .field("args", &self.args)
            .field("expects_reply", &self.reply.is_some())
            .finish()
    }
}

/// The command currently waiting for its reply
pub struct InFlight {
    pub seq: u64,
    pub cmd: String,
    pub pkg: Option<String>,
    pub inst: Option<String>,
    pub reply: ReplyFn,
    pub timer: Option<TimerId>,
}

/// FIFO of outgoing commands for one peer
#[derive(Default)]
pub struct CommandQueue {
    pending: VecDeque<Command>,
    waiting: Option<InFlight>,
    next_seq: u64,
    delivered: u64,
}

impl CommandQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a command. Returns true when the queue was idle, i.e. a drain is due.
    pub fn push(&mut self, cmd: Command) -> bool {
        let was_idle = self.pending.is_empty() && self.waiting.is_none();
        self.pending.push_back(cmd);
        was_idle
    }

    /// Put a command back at the head (its send failed)
    pub fn push_front(&mut self, cmd: Command) {
        self.pending.push_front(cmd);
    }

    /// Next command to send, unless a reply is still outstanding
    pub fn pop_ready(&mut self) -> Option<Command> {
        if self.waiting.is_some() {
            return None;
        }
        let cmd = self.pending.pop_front()?;
        self.delivered += 1;
        Some(cmd)
    }

    /// Allocate the sequence number for a request
    pub fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    /// Block the queue until `seq` is answered
    pub fn wait_for(&mut self, in_flight: InFlight) {
        self.waiting = Some(in_flight);
    }

    pub fn is_waiting(&self) -> bool {
        self.waiting.is_some()
    }

    pub fn waiting_seq(&self) -> Option<u64> {
        self.waiting.as_ref().map(|w| w.seq)
    }

    pub fn waiting(&self) -> Option<&InFlight> {
        self.waiting.as_ref()
    }

    /// Resolve the outstanding request if `seq` matches it
    pub fn complete(&mut self, seq: u64) -> Option<InFlight> {
        if self.waiting_seq() == Some(seq) {
            self.waiting.take()
        } else {
            None
        }
    }

    /// Number of commands not yet sent
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty() && self.waiting.is_none()
    }

    /// Commands handed to the connection so far
    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    /// Drop pending commands whose package matches
    pub fn remove_package(&mut self, pkg: &str) -> Vec<Command> {
        let (removed, kept): (Vec<_>, Vec<_>) = self
            .pending
            .drain(..)
            .partition(|c| c.pkg.as_deref() == Some(pkg));
        self.pending = kept.into();
        removed
    }

    /// Empty the queue, returning the in-flight request (if any) and all pending commands
    pub fn clear(&mut self) -> (Option<InFlight>, Vec<Command>) {
        (self.waiting.take(), self.pending.drain(..).collect())
    }
}
