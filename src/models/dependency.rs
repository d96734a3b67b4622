//! Dependency (link) model and the shared link-rule table.
//!
//! A dependency `predecessor → successor` constrains one anchor (start or
//! finish) of the successor relative to one anchor of the predecessor,
//! offset by a signed `lag` in hours.
//!
//! | Type | Constraint |
//! |------|-----------|
//! | FS | successor.start  ≥ predecessor.finish + lag |
//! | SS | successor.start  ≥ predecessor.start  + lag |
//! | SF | successor.finish ≥ predecessor.start  + lag |
//! | FF | successor.finish ≥ predecessor.finish + lag |
//!
//! [`LinkRule`] is the single source of these semantics. The validator,
//! the CPM passes, the cascade engine and the integrity checks all go
//! through it, generic over the time representation (hour offsets or
//! wall-clock instants).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, Sub};

use super::{Entity, EntityType};

/// The four link types.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DependencyType {
    /// Finish-to-start (default).
    #[default]
    #[serde(rename = "FS")]
    FinishToStart,
    /// Start-to-start.
    #[serde(rename = "SS")]
    StartToStart,
    /// Start-to-finish.
    #[serde(rename = "SF")]
    StartToFinish,
    /// Finish-to-finish.
    #[serde(rename = "FF")]
    FinishToFinish,
}

impl DependencyType {
    /// Looks up the link rule for this type.
    pub const fn rule(self) -> LinkRule {
        match self {
            Self::FinishToStart => LinkRule::new(Anchor::Finish, Anchor::Start),
            Self::StartToStart => LinkRule::new(Anchor::Start, Anchor::Start),
            Self::StartToFinish => LinkRule::new(Anchor::Start, Anchor::Finish),
            Self::FinishToFinish => LinkRule::new(Anchor::Finish, Anchor::Finish),
        }
    }

    /// Two-letter code.
    pub fn code(self) -> &'static str {
        match self {
            Self::FinishToStart => "FS",
            Self::StartToStart => "SS",
            Self::StartToFinish => "SF",
            Self::FinishToFinish => "FF",
        }
    }
}

impl fmt::Display for DependencyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Which end of a task a link attaches to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Anchor {
    Start,
    Finish,
}

impl Anchor {
    /// Picks the anchored value out of a (start, finish) pair.
    #[inline]
    pub fn pick<T>(self, start: T, finish: T) -> T {
        match self {
            Self::Start => start,
            Self::Finish => finish,
        }
    }
}

/// Anchors of one link type: `successor.<successor> ≥ predecessor.<predecessor> + lag`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkRule {
    pub predecessor: Anchor,
    pub successor: Anchor,
}

impl LinkRule {
    const fn new(predecessor: Anchor, successor: Anchor) -> Self {
        Self {
            predecessor,
            successor,
        }
    }

    /// Earliest successor start this link permits.
    ///
    /// `T` is a point in time (hour offset or instant), `D` a span of the
    /// same unit.
    pub fn earliest_successor_start<T, D>(
        &self,
        pred_start: T,
        pred_finish: T,
        succ_duration: D,
        lag: D,
    ) -> T
    where
        T: Add<D, Output = T> + Sub<D, Output = T>,
    {
        let bound = self.predecessor.pick(pred_start, pred_finish) + lag;
        match self.successor {
            Anchor::Start => bound,
            Anchor::Finish => bound - succ_duration,
        }
    }

    /// Latest predecessor finish this link permits.
    ///
    /// Mirror of [`earliest_successor_start`](Self::earliest_successor_start)
    /// for the backward pass.
    pub fn latest_predecessor_finish<T, D>(
        &self,
        succ_start: T,
        succ_finish: T,
        pred_duration: D,
        lag: D,
    ) -> T
    where
        T: Add<D, Output = T> + Sub<D, Output = T>,
    {
        let bound = self.successor.pick(succ_start, succ_finish) - lag;
        match self.predecessor {
            Anchor::Finish => bound,
            Anchor::Start => bound + pred_duration,
        }
    }

    /// Whether the link holds for the given dates.
    pub fn is_satisfied<T, D>(
        &self,
        pred_start: T,
        pred_finish: T,
        succ_start: T,
        succ_finish: T,
        lag: D,
    ) -> bool
    where
        T: Add<D, Output = T> + PartialOrd,
    {
        let bound = self.predecessor.pick(pred_start, pred_finish) + lag;
        self.successor.pick(succ_start, succ_finish) >= bound
    }

    /// Human-readable phrase, e.g. `"B cannot start until A finishes"`.
    pub fn describe(&self, predecessor: &str, successor: &str) -> String {
        let succ_verb = match self.successor {
            Anchor::Start => "start",
            Anchor::Finish => "finish",
        };
        let pred_verb = match self.predecessor {
            Anchor::Start => "starts",
            Anchor::Finish => "finishes",
        };
        format!("{successor} cannot {succ_verb} until {predecessor} {pred_verb}")
    }
}

/// A directed dependency between two tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dependency {
    /// Unique dependency identifier.
    pub id: String,
    pub predecessor_id: String,
    pub successor_id: String,
    #[serde(rename = "type")]
    pub dependency_type: DependencyType,
    /// Signed lag in hours.
    #[serde(default)]
    pub lag: i64,
    /// Optimistic-locking version.
    pub version: u64,
}

impl Dependency {
    /// Creates a zero-lag dependency at version 1.
    pub fn new(
        id: impl Into<String>,
        predecessor_id: impl Into<String>,
        successor_id: impl Into<String>,
        dependency_type: DependencyType,
    ) -> Self {
        Self {
            id: id.into(),
            predecessor_id: predecessor_id.into(),
            successor_id: successor_id.into(),
            dependency_type,
            lag: 0,
            version: 1,
        }
    }

    /// Creates a finish-to-start dependency with id `"{pred}->{succ}"`.
    pub fn finish_to_start(predecessor_id: &str, successor_id: &str) -> Self {
        Self::new(
            format!("{predecessor_id}->{successor_id}"),
            predecessor_id,
            successor_id,
            DependencyType::FinishToStart,
        )
    }

    /// Sets the lag (hours).
    pub fn with_lag(mut self, lag_hours: i64) -> Self {
        self.lag = lag_hours;
        self
    }

    /// Sets the version.
    pub fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    /// Link rule of this dependency's type.
    #[inline]
    pub fn rule(&self) -> LinkRule {
        self.dependency_type.rule()
    }

    /// Lag as a wall-clock duration.
    pub fn lag_duration(&self) -> chrono::Duration {
        chrono::Duration::hours(self.lag)
    }
}

impl Entity for Dependency {
    const ENTITY_TYPE: EntityType = EntityType::Dependency;

    fn entity_id(&self) -> &str {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn set_version(&mut self, version: u64) {
        self.version = version;
    }
}
