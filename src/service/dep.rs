//! # Dependency edges between services.
//!
//! A [`ServiceDep`] is a directed, typed relationship from a dependent
//! service to its dependency. Each edge is stored once in the edge pool and
//! referenced by id from both endpoints, so the dependent's `depends_on`
//! slot and the dependency's `dependents` slot observe the same flags.
//!
//! Dependency type behavior when the target fails to start or stops:
//!
//! | Type      | Dependent waits for target start?  | Failure cascades?         | Non-restart stop of target       |
//! |-----------|------------------------------------|---------------------------|----------------------------------|
//! | Regular   | yes                                | yes                       | dependent stops                  |
//! | Soft      | no                                 | no                        | link broken                      |
//! | WaitsFor  | yes (start or failure)             | no                        | link broken                      |
//! | Milestone | yes, until first successful start  | while waiting only        | link broken                      |
//! | Before    | ordering only                      | no                        | n/a, never acquires              |
//! | After     | ordering only                      | no                        | n/a, never acquires              |

use std::fmt;

use crate::service::set::ServiceId;

/// The kind of dependency relationship.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencyType {
    /// Hard dependency: failure and stop propagate to the dependent.
    Regular,
    /// Parallel start; target failure or stop does not affect the dependent.
    Soft,
    /// Like soft, but the dependent waits for the target to start or fail.
    WaitsFor,
    /// Hard until the target first starts successfully, soft afterwards.
    Milestone,
    /// Ordering constraint only: the owner starts before the target.
    Before,
    /// Ordering constraint only: the owner starts after the target.
    After,
}

impl fmt::Display for DependencyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DependencyType::Regular => "regular",
            DependencyType::Soft => "soft",
            DependencyType::WaitsFor => "waits-for",
            DependencyType::Milestone => "milestone",
            DependencyType::Before => "before",
            DependencyType::After => "after",
        };
        f.write_str(s)
    }
}

/// Identifier of an edge in the [`ServiceSet`](crate::ServiceSet) edge pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EdgeId(pub(crate) usize);

/// A dependency edge. `from` depends on `to`.
#[derive(Debug)]
pub struct ServiceDep {
    pub from: ServiceId,
    pub to: ServiceId,
    pub dep_type: DependencyType,
    /// The dependent is waiting for the target to start.
    pub waiting_on: bool,
    /// The dependent holds an acquisition (a `require`) on the target.
    pub holding_acq: bool,
}

impl ServiceDep {
    pub fn new(from: ServiceId, to: ServiceId, dep_type: DependencyType) -> Self {
        Self {
            from,
            to,
            dep_type,
            waiting_on: false,
            holding_acq: false,
        }
    }

    /// True for a hard edge: REGULAR, or MILESTONE that is still waiting.
    pub fn is_hard(&self) -> bool {
        self.dep_type == DependencyType::Regular
            || (self.dep_type == DependencyType::Milestone && self.waiting_on)
    }

    /// True for a pure ordering constraint (BEFORE or AFTER).
    pub fn is_only_ordering(&self) -> bool {
        matches!(self.dep_type, DependencyType::Before | DependencyType::After)
    }
}
