//! Per-call modifiers.
//!
//! A modifier attaches a clause to the next call made through a handle and nothing after
//! it. Modifiers are folded left to right into [`Clauses`]; within one category the last
//! one applied wins.

use std::fmt;

/// Row lock strength, strongest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockStrength {
    Update,
    NoKeyUpdate,
    Share,
    KeyShare,
}

/// What to do when a row is already locked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockWait {
    #[default]
    Wait,
    NoWait,
    SkipLocked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockClause {
    pub strength: LockStrength,
    pub wait: LockWait,
}

impl fmt::Display for LockClause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self.strength {
            LockStrength::Update => "FOR UPDATE",
            LockStrength::NoKeyUpdate => "FOR NO KEY UPDATE",
            LockStrength::Share => "FOR SHARE",
            LockStrength::KeyShare => "FOR KEY SHARE",
        })?;
        match self.wait {
            LockWait::Wait => Ok(()),
            LockWait::NoWait => f.write_str(" NOWAIT"),
            LockWait::SkipLocked => f.write_str(" SKIP LOCKED"),
        }
    }
}

/// Where a read should go when no transaction is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadPreference {
    Primary,
    Replica,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Modifier {
    Lock(LockClause),
    ReadPreference(ReadPreference),
}

impl Modifier {
    /// `SELECT ... FOR UPDATE`
    pub fn for_update() -> Self {
        Modifier::Lock(LockClause {
            strength: LockStrength::Update,
            wait: LockWait::Wait,
        })
    }

    pub fn for_share() -> Self {
        Modifier::Lock(LockClause {
            strength: LockStrength::Share,
            wait: LockWait::Wait,
        })
    }

    pub fn lock(strength: LockStrength, wait: LockWait) -> Self {
        Modifier::Lock(LockClause { strength, wait })
    }

    /// Read from the primary even when replicas are registered.
    pub fn read_primary() -> Self {
        Modifier::ReadPreference(ReadPreference::Primary)
    }

    pub fn read_replica() -> Self {
        Modifier::ReadPreference(ReadPreference::Replica)
    }
}

/// Clauses queued for the next call. The default value injects nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Clauses {
    pub lock: Option<LockClause>,
    pub read_preference: Option<ReadPreference>,
}

impl Clauses {
    pub fn apply(mut self, modifier: Modifier) -> Self {
        match modifier {
            Modifier::Lock(clause) => self.lock = Some(clause),
            Modifier::ReadPreference(pref) => self.read_preference = Some(pref),
        }
        self
    }

    pub fn fold<I>(self, modifiers: I) -> Self
    where
        I: IntoIterator<Item = Modifier>,
    {
        modifiers.into_iter().fold(self, Clauses::apply)
    }

    pub fn is_empty(&self) -> bool {
        *self == Clauses::default()
    }

    /// Reads under a row lock must see the writable copy.
    pub fn requires_primary(&self) -> bool {
        self.lock.is_some() || self.read_preference == Some(ReadPreference::Primary)
    }
}
