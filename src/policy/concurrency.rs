//! Keyed concurrency policies and collision resolution strategies.
//!
//! A job may carry one [`ConcurrencyPolicy`]. When a job is submitted, its
//! policy is compared against those of every active job; two jobs whose
//! policies have the same strategy and an equal key are said to collide, and
//! the strategy decides what happens next: serialize them (FIFO), keep the
//! existing job, or replace it with the new one.

use crate::id::JobId;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// What to do when two active jobs carry equal concurrency keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollisionStrategy {
    /// The candidate waits for the existing job to finish. Failure of the
    /// existing job does not cascade to the candidate.
    Fifo,
    /// The existing job absorbs the candidate's work and the candidate is
    /// assimilated. If absorption is declined the candidate waits instead.
    SingletonKeepExisting,
    /// The candidate absorbs the existing job's work and the existing job is
    /// assimilated. If absorption is declined the existing job waits on the
    /// candidate instead.
    SingletonReplaceExisting,
}

impl fmt::Display for CollisionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fifo => write!(f, "fifo"),
            Self::SingletonKeepExisting => write!(f, "singleton-keep-existing"),
            Self::SingletonReplaceExisting => write!(f, "singleton-replace-existing"),
        }
    }
}

/// One component of a concurrency key. Components are typed; there is no
/// null component by construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeyComponent {
    Text(String),
    Int(i64),
    Bool(bool),
    Id(Uuid),
}

impl fmt::Display for KeyComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(s) => write!(f, "{s}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Id(u) => write!(f, "{u}"),
        }
    }
}

impl From<&str> for KeyComponent {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for KeyComponent {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<i64> for KeyComponent {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<i32> for KeyComponent {
    fn from(i: i32) -> Self {
        Self::Int(i as i64)
    }
}

impl From<u32> for KeyComponent {
    fn from(i: u32) -> Self {
        Self::Int(i as i64)
    }
}

impl From<bool> for KeyComponent {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<Uuid> for KeyComponent {
    fn from(u: Uuid) -> Self {
        Self::Id(u)
    }
}

impl From<JobId> for KeyComponent {
    fn from(id: JobId) -> Self {
        Self::Id(id.as_uuid())
    }
}

/// An ordered, non-empty tuple of key components. Equality is pairwise.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConcurrencyKey(Vec<KeyComponent>);

impl ConcurrencyKey {
    /// Build a key from parts. At least one component is required.
    pub fn from_parts(parts: Vec<KeyComponent>) -> crate::Result<Self> {
        if parts.is_empty() {
            return Err(crate::TetherError::invalid_argument(
                "concurrency key requires at least one component",
            ));
        }
        Ok(Self(parts))
    }

    /// The key's components, in order.
    pub fn parts(&self) -> &[KeyComponent] {
        &self.0
    }
}

impl fmt::Display for ConcurrencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, part) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, "/")?;
            }
            write!(f, "{part}")?;
        }
        Ok(())
    }
}

impl From<&str> for ConcurrencyKey {
    fn from(s: &str) -> Self {
        Self(vec![s.into()])
    }
}

impl From<String> for ConcurrencyKey {
    fn from(s: String) -> Self {
        Self(vec![s.into()])
    }
}

impl From<i64> for ConcurrencyKey {
    fn from(i: i64) -> Self {
        Self(vec![i.into()])
    }
}

impl From<Uuid> for ConcurrencyKey {
    fn from(u: Uuid) -> Self {
        Self(vec![u.into()])
    }
}

impl From<JobId> for ConcurrencyKey {
    fn from(id: JobId) -> Self {
        Self(vec![id.into()])
    }
}

impl<A, B> From<(A, B)> for ConcurrencyKey
where
    A: Into<KeyComponent>,
    B: Into<KeyComponent>,
{
    fn from((a, b): (A, B)) -> Self {
        Self(vec![a.into(), b.into()])
    }
}

impl<A, B, C> From<(A, B, C)> for ConcurrencyKey
where
    A: Into<KeyComponent>,
    B: Into<KeyComponent>,
    C: Into<KeyComponent>,
{
    fn from((a, b, c): (A, B, C)) -> Self {
        Self(vec![a.into(), b.into(), c.into()])
    }
}

impl<A, B, C, D> From<(A, B, C, D)> for ConcurrencyKey
where
    A: Into<KeyComponent>,
    B: Into<KeyComponent>,
    C: Into<KeyComponent>,
    D: Into<KeyComponent>,
{
    fn from((a, b, c, d): (A, B, C, D)) -> Self {
        Self(vec![a.into(), b.into(), c.into(), d.into()])
    }
}

/// A keyed collision policy. Two policies collide iff their strategies match
/// and their keys are equal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcurrencyPolicy {
    strategy: CollisionStrategy,
    key: ConcurrencyKey,
}

impl ConcurrencyPolicy {
    /// Jobs with this key run sequentially rather than in parallel.
    pub fn fifo(key: impl Into<ConcurrencyKey>) -> Self {
        Self {
            strategy: CollisionStrategy::Fifo,
            key: key.into(),
        }
    }

    /// Only one job with this key runs; the existing one survives and may
    /// absorb the newcomer's work. Combine with an initial delay for
    /// throttling and debouncing schemes.
    pub fn keep_existing(key: impl Into<ConcurrencyKey>) -> Self {
        Self {
            strategy: CollisionStrategy::SingletonKeepExisting,
            key: key.into(),
        }
    }

    /// Only one job with this key runs; the newest one survives. Useful when
    /// a newer job supersedes an older one that has not executed yet.
    pub fn replace_existing(key: impl Into<ConcurrencyKey>) -> Self {
        Self {
            strategy: CollisionStrategy::SingletonReplaceExisting,
            key: key.into(),
        }
    }

    pub fn strategy(&self) -> CollisionStrategy {
        self.strategy
    }

    pub fn key(&self) -> &ConcurrencyKey {
        &self.key
    }

    /// True iff `other` has the same strategy and an equal key.
    pub fn collides_with(&self, other: &ConcurrencyPolicy) -> bool {
        self == other
    }
}

impl fmt::Display for ConcurrencyPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.strategy, self.key)
    }
}
