//! Widget instances and their state machine

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::buffer::{BufferSlot, Monitor};
use crate::error::{ErrorCode, WmResult};
use crate::protocol::Target;

/// Lifecycle of an instance. `Destroyed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    /// Waiting for the worker to accept it
    Created,
    /// Live on its worker
    Active,
    Destroyed,
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Active => "active",
            Self::Destroyed => "destroyed",
        };
        f.write_str(s)
    }
}

/// Detail view (gbar) state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GbarState {
    Closed,
    Opening,
    Open,
    Closing,
}

/// Pinning support and state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PinUp {
    pub supported: bool,
    pub pinned: bool,
}

/// Parameters a viewer passes to `new`
#[derive(Debug, Clone, PartialEq)]
pub struct NewInstance {
    pub owner: Option<u32>,
    pub timestamp: f64,
    pub pkg: String,
    pub content: String,
    pub cluster: String,
    pub category: String,
    pub period: f64,
    pub width: u32,
    pub height: u32,
}

/// Id derived from the creator and its timestamp; the same request always maps to
/// the same id, which makes `new` idempotent.
pub fn instance_id(owner: Option<u32>, timestamp: f64) -> String {
    format!("{}_{:.6}", owner.unwrap_or(0), timestamp)
}

/// One running occurrence of a package
pub struct Instance {
    pub pkg: String,
    pub id: String,
    pub owner: Option<u32>,
    pub timestamp: f64,
    pub content: String,
    pub title: String,
    pub cluster: String,
    pub category: String,
    pub period: f64,
    pub priority: f64,
    pub pinup: PinUp,
    pub state: InstanceState,
    /// Bumped on every create request sent to a worker; stale replies are ignored
    pub attempt: u64,
    pub gbar_state: GbarState,
    /// Where the viewer anchored the detail view
    pub gbar_pos: (f64, f64),
    pub dbox: BufferSlot,
    pub gbar: BufferSlot,
    pub extra: BTreeMap<(Target, usize), BufferSlot>,
    /// The single pending open/close/resize monitor
    pub monitor: Option<Monitor>,
    /// Views registered with the input router
    pub input_focus: Vec<Target>,
    /// Between `updateBegin` and `updateEnd`
    pub updating: Vec<Target>,
    pub created_at: DateTime<Utc>,
}

impl Instance {
    pub fn new(req: &NewInstance, id: String, gbar_size: (u32, u32)) -> Self {
        Self {
            pkg: req.pkg.clone(),
            id,
            owner: req.owner,
            timestamp: req.timestamp,
            content: req.content.clone(),
            title: String::new(),
            cluster: req.cluster.clone(),
            category: req.category.clone(),
            period: req.period,
            priority: 0.0,
            pinup: PinUp::default(),
            state: InstanceState::Created,
            attempt: 0,
            gbar_state: GbarState::Closed,
            gbar_pos: (0.0, 0.0),
            dbox: BufferSlot::new(req.width, req.height),
            gbar: BufferSlot::new(gbar_size.0, gbar_size.1),
            extra: BTreeMap::new(),
            monitor: None,
            input_focus: Vec::new(),
            updating: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn key(&self) -> (String, String) {
        (self.pkg.clone(), self.id.clone())
    }

    /// Reject mutation of a destroyed instance
    pub fn ensure_alive(&self) -> WmResult<()> {
        if self.state == InstanceState::Destroyed {
            return Err(ErrorCode::NotExist);
        }
        Ok(())
    }

    /// Reject operations that need the worker to know the instance
    pub fn ensure_active(&self) -> WmResult<()> {
        match self.state {
            InstanceState::Active => Ok(()),
            InstanceState::Created => Err(ErrorCode::Busy),
            InstanceState::Destroyed => Err(ErrorCode::NotExist),
        }
    }

    pub fn activate(&mut self) -> WmResult<()> {
        match self.state {
            InstanceState::Created => {
                self.state = InstanceState::Active;
                Ok(())
            }
            InstanceState::Active => Err(ErrorCode::Already),
            InstanceState::Destroyed => Err(ErrorCode::NotExist),
        }
    }

    pub fn slot(&self, target: Target) -> &BufferSlot {
        match target {
            Target::Dbox => &self.dbox,
            Target::Gbar => &self.gbar,
        }
    }

    pub fn slot_mut(&mut self, target: Target) -> &mut BufferSlot {
        match target {
            Target::Dbox => &mut self.dbox,
            Target::Gbar => &mut self.gbar,
        }
    }

    /// Whether `viewer` may act on this instance
    pub fn check_owner(&self, viewer: u32) -> WmResult<()> {
        match self.owner {
            Some(owner) if owner != viewer => Err(ErrorCode::PermissionDenied),
            _ => Ok(()),
        }
    }
}

/// Summary row for the debug channel
#[derive(Debug, Clone, Serialize)]
pub struct InstanceSummary {
    pub pkg: String,
    pub id: String,
    pub owner: Option<u32>,
    pub state: InstanceState,
    /// Create requests sent so far (more than one after self-heal)
    pub attempt: u64,
    pub gbar_state: GbarState,
    pub cluster: String,
    pub category: String,
    pub period: f64,
    pub width: u32,
    pub height: u32,
}

impl From<&Instance> for InstanceSummary {
    fn from(i: &Instance) -> Self {
        let (width, height) = i.dbox.size();
        Self {
            pkg: i.pkg.clone(),
            id: i.id.clone(),
            owner: i.owner,
            state: i.state,
            attempt: i.attempt,
            gbar_state: i.gbar_state,
            cluster: i.cluster.clone(),
            category: i.category.clone(),
            period: i.period,
            width,
            height,
        }
    }
}
