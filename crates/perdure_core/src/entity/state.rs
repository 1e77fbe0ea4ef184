//! Entity persistence state machine types.

use serde::{Deserialize, Serialize};
use std::fmt;

/// An entity's current relationship to durable storage.
///
/// Stable states are everything but `Saving`. Transitions are driven
/// exclusively by the commit protocol and the mutation helpers
/// ([`crate::Entity::update`] / [`crate::Entity::remove`]):
///
/// ```text
/// new ──commit──▶ saving ──▶ persistent ──update──▶ dirty ──commit─▶ saving ─▶ persistent
///                    │                  └─remove──▶ pendingRemoval ─commit─▶ removed
///                    │                                  (never persisted) └▶ abandoned
///                    └─(failure)──▶ reverts to the pre-attempt stable state
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PersistenceState {
    /// Created in memory, never written to the store.
    New,
    /// A storage statement for this entity is in flight.
    Saving,
    /// In sync with the store, no local changes.
    Persistent,
    /// Persistent, with a locally applied mutation not yet written back.
    Dirty,
    /// Slated for deletion on the next commit.
    PendingRemoval,
    /// Terminal: deleted before it was ever persisted. The store was never
    /// touched.
    Abandoned,
    /// Terminal: deleted from the store after having been persistent.
    Removed,
}

impl PersistenceState {
    /// Returns true for the terminal states (`Abandoned`, `Removed`).
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Abandoned | Self::Removed)
    }

    /// Returns true if a commit from this state performs storage work.
    #[must_use]
    pub fn needs_commit(&self) -> bool {
        matches!(self, Self::New | Self::Dirty | Self::PendingRemoval)
    }

    /// Returns true if the in-memory state is not known to match the store.
    ///
    /// Used by batch teardown to decide whether a discarded, uncommitted
    /// entity represents a data-loss risk.
    #[must_use]
    pub fn is_unsynchronized(&self) -> bool {
        matches!(
            self,
            Self::New | Self::Saving | Self::Dirty | Self::PendingRemoval
        )
    }

    /// Returns the wire/display name of the state.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Saving => "saving",
            Self::Persistent => "persistent",
            Self::Dirty => "dirty",
            Self::PendingRemoval => "pendingRemoval",
            Self::Abandoned => "abandoned",
            Self::Removed => "removed",
        }
    }

    pub(crate) fn to_tag(self) -> u8 {
        match self {
            Self::New => 0,
            Self::Saving => 1,
            Self::Persistent => 2,
            Self::Dirty => 3,
            Self::PendingRemoval => 4,
            Self::Abandoned => 5,
            Self::Removed => 6,
        }
    }

    pub(crate) fn from_tag(tag: u8) -> Self {
        match tag {
            0 => Self::New,
            1 => Self::Saving,
            2 => Self::Persistent,
            3 => Self::Dirty,
            4 => Self::PendingRemoval,
            5 => Self::Abandoned,
            _ => Self::Removed,
        }
    }
}

impl fmt::Display for PersistenceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The next storage operation queued against an entity because it arrived
/// while a commit was already in flight.
///
/// At most one pending action exists at a time. Mutator closures are applied
/// to the entity's item immediately at call time, so the queued action is a
/// marker of *what* must still be written, not a deferred closure.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum PendingAction {
    /// Nothing queued.
    #[default]
    None,
    /// The item was mutated; an update must be written.
    Update,
    /// The entity was slated for removal.
    Remove,
}

impl PendingAction {
    /// Returns true if nothing is queued.
    #[must_use]
    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    /// Collapses a newly issued action into the queue.
    ///
    /// `Remove` wins over `Update`; a second `Update` is absorbed because
    /// its mutation is already visible in the item.
    #[must_use]
    pub fn merge(self, incoming: Self) -> Self {
        match (self, incoming) {
            (Self::Remove, _) | (_, Self::Remove) => Self::Remove,
            (Self::Update, _) | (_, Self::Update) => Self::Update,
            (Self::None, Self::None) => Self::None,
        }
    }
}
