//! Raw input routing
//!
//! A dedicated thread reads Linux evdev `input_event` records from a device, turns
//! them into down/move/up events and posts them to the reactor. The reactor owns the
//! focus registrations and forwards each event to the focused instance's worker.

use std::fs::File;
use std::io::{self, Read};
use std::path::PathBuf;
use std::thread::{self, JoinHandle};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{ErrorCode, WmResult};
use crate::master::ReactorEvent;
use crate::protocol::Target;

const EVENT_SIZE: usize = 24;

const EV_SYN: u16 = 0x00;
const EV_KEY: u16 = 0x01;
const EV_ABS: u16 = 0x03;
const SYN_REPORT: u16 = 0x00;
const ABS_X: u16 = 0x00;
const ABS_Y: u16 = 0x01;
const ABS_MT_POSITION_X: u16 = 0x35;
const ABS_MT_POSITION_Y: u16 = 0x36;
const BTN_LEFT: u16 = 0x110;
const BTN_TOUCH: u16 = 0x14a;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    Down,
    Move,
    Up,
}

impl InputKind {
    /// Verb sent to the worker
    pub fn verb(self) -> &'static str {
        match self {
            Self::Down => "mouseDown",
            Self::Move => "mouseMove",
            Self::Up => "mouseUp",
        }
    }
}

/// A synthesized pointer event
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InputEvent {
    pub kind: InputKind,
    pub x: f64,
    pub y: f64,
    /// Seconds, from the kernel timestamp
    pub timestamp: f64,
}

/// One raw evdev record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RawEvent {
    sec: i64,
    usec: i64,
    kind: u16,
    code: u16,
    value: i32,
}

impl RawEvent {
    fn parse(buf: &[u8; EVENT_SIZE]) -> Self {
        let i64_at = |o: usize| i64::from_ne_bytes([
            buf[o],
            buf[o + 1],
            buf[o + 2],
            buf[o + 3],
            buf[o + 4],
            buf[o + 5],
            buf[o + 6],
            buf[o + 7],
        ]);
        Self {
            sec: i64_at(0),
            usec: i64_at(8),
            kind: u16::from_ne_bytes([buf[16], buf[17]]),
            code: u16::from_ne_bytes([buf[18], buf[19]]),
            value: i32::from_ne_bytes([buf[20], buf[21], buf[22], buf[23]]),
        }
    }
}

/// Folds raw records into pointer events at each `SYN_REPORT`
#[derive(Debug, Default)]
struct EventSynth {
    x: i32,
    y: i32,
    pressed: bool,
    was_pressed: bool,
    moved: bool,
}

impl EventSynth {
    fn feed(&mut self, raw: RawEvent) -> Option<InputEvent> {
        match (raw.kind, raw.code) {
            (EV_ABS, ABS_X | ABS_MT_POSITION_X) => {
                self.moved |= self.x != raw.value;
                self.x = raw.value;
                None
            }
            (EV_ABS, ABS_Y | ABS_MT_POSITION_Y) => {
                self.moved |= self.y != raw.value;
                self.y = raw.value;
                None
            }
            (EV_KEY, BTN_TOUCH | BTN_LEFT) => {
                self.pressed = raw.value != 0;
                None
            }
            (EV_SYN, SYN_REPORT) => self.report(raw.sec as f64 + raw.usec as f64 / 1_000_000.0),
            _ => None,
        }
    }

    fn report(&mut self, timestamp: f64) -> Option<InputEvent> {
        let kind = match (self.was_pressed, self.pressed) {
            (false, true) => Some(InputKind::Down),
            (true, false) => Some(InputKind::Up),
            (true, true) if self.moved => Some(InputKind::Move),
            _ => None,
        };
        self.was_pressed = self.pressed;
        self.moved = false;
        kind.map(|kind| InputEvent {
            kind,
            x: f64::from(self.x),
            y: f64::from(self.y),
            timestamp,
        })
    }
}

/// A view that asked for raw input
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FocusEntry {
    pub pkg: String,
    pub id: String,
    pub target: Target,
}

/// Focus registrations; the most recent one receives events
#[derive(Debug, Default)]
pub struct InputRouter {
    entries: Vec<FocusEntry>,
}

impl InputRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn register(&mut self, pkg: &str, id: &str, target: Target) -> WmResult<()> {
        if self.position(pkg, id, target).is_some() {
            return Err(ErrorCode::Already);
        }
        debug!(%pkg, %id, %target, "InputRouter::register");
        self.entries.push(FocusEntry {
            pkg: pkg.to_string(),
            id: id.to_string(),
            target,
        });
        Ok(())
    }

    pub fn unregister(&mut self, pkg: &str, id: &str, target: Target) -> WmResult<()> {
        let pos = self.position(pkg, id, target).ok_or(ErrorCode::NotExist)?;
        self.entries.remove(pos);
        debug!(%pkg, %id, %target, "InputRouter::unregister");
        Ok(())
    }

    /// Drop every registration of an instance
    pub fn unregister_instance(&mut self, pkg: &str, id: &str) {
        self.entries.retain(|e| e.pkg != pkg || e.id != id);
    }

    pub fn focused(&self) -> Option<&FocusEntry> {
        self.entries.last()
    }

    fn position(&self, pkg: &str, id: &str, target: Target) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.pkg == pkg && e.id == id && e.target == target)
    }

    /// Spawn the reader thread for `device`
    pub fn start(device: PathBuf, tx: mpsc::UnboundedSender<ReactorEvent>) -> io::Result<JoinHandle<()>> {
        let file = File::open(&device)?;
        info!(device = %device.display(), "Input router started");
        thread::Builder::new()
            .name("wm-input".to_string())
            .spawn(move || read_events(file, tx))
    }
}

fn read_events(mut source: impl Read, tx: mpsc::UnboundedSender<ReactorEvent>) {
    let mut synth = EventSynth::default();
    let mut buf = [0u8; EVENT_SIZE];
    loop {
        if let Err(e) = source.read_exact(&mut buf) {
            if e.kind() != io::ErrorKind::UnexpectedEof {
                warn!(error = %e, "Input device read failed");
            }
            break;
        }
        if let Some(event) = synth.feed(RawEvent::parse(&buf))
            && tx.send(ReactorEvent::Input(event)).is_err()
        {
            break;
        }
    }
    debug!("read_events: input thread exiting");
}
