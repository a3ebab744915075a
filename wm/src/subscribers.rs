//! Ordered subscriber lists with unsubscribe tokens
//!
//! Hooks are stored alongside the token handed out at registration time. Notifying
//! takes the whole list out (so hooks may re-enter the owner mutably), runs it, and
//! puts back the survivors ahead of anything registered while it ran.

use tracing::debug;

/// Token returned by [`Subscribers::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionToken(u64);

/// What a hook wants after it ran
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookResult {
    /// Remove the hook
    Done,
    /// Keep it for the next notification
    Keep,
}

/// Ordered collection of hooks
pub struct Subscribers<T> {
    next: u64,
    entries: Vec<(SubscriptionToken, T)>,
}

impl<T> Default for Subscribers<T> {
    fn default() -> Self {
        Self {
            next: 1,
            entries: Vec::new(),
        }
    }
}

impl<T> Subscribers<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, hook: T) -> SubscriptionToken {
        let token = SubscriptionToken(self.next);
        self.next += 1;
        self.entries.push((token, hook));
        debug!(token = token.0, total = self.entries.len(), "Subscribers::subscribe");
        token
    }

    /// Remove a hook. `None` if it already ran to completion or is being notified.
    pub fn unsubscribe(&mut self, token: SubscriptionToken) -> Option<T> {
        let pos = self.entries.iter().position(|(t, _)| *t == token)?;
        debug!(token = token.0, "Subscribers::unsubscribe");
        Some(self.entries.remove(pos).1)
    }

    pub fn contains(&self, token: SubscriptionToken) -> bool {
        self.entries.iter().any(|(t, _)| *t == token)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Take every hook out for notification
    pub fn take_all(&mut self) -> Vec<(SubscriptionToken, T)> {
        std::mem::take(&mut self.entries)
    }

    /// Put back hooks that asked to stay, ahead of hooks added during notification
    pub fn restore(&mut self, mut kept: Vec<(SubscriptionToken, T)>) {
        kept.append(&mut self.entries);
        self.entries = kept;
    }
}
