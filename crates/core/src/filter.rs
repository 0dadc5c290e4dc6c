// SPDX-License-Identifier: MIT

//! Query algebra over targets: time constraints and a recursive filter.

use crate::state::SimpleStatus;
use crate::target::Target;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Pattern predicate over a string field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchPattern {
    Equals(String),
    /// Regular expression, `regex` syntax.
    Matches(String),
}

impl MatchPattern {
    fn matches(&self, value: &str) -> bool {
        match self {
            MatchPattern::Equals(s) => value == s,
            MatchPattern::Matches(re) => regex::Regex::new(re)
                .map(|re| re.is_match(value))
                .unwrap_or(false),
        }
    }

    fn validate(&self) -> Result<(), FilterError> {
        if let MatchPattern::Matches(re) = self {
            regex::Regex::new(re).map_err(|e| FilterError::BadRegex {
                pattern: re.clone(),
                message: e.to_string(),
            })?;
        }
        Ok(())
    }
}

/// Status predicate of the filter algebra.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusPredicate {
    Simple(SimpleStatus),
    /// A live process exists right now.
    ReallyRunning,
    /// Non-terminal: a kill request would take effect.
    Killable,
    DeadBecauseOfDependencies,
    ActivatedByUser,
}

impl StatusPredicate {
    pub fn matches(&self, target: &Target) -> bool {
        match self {
            StatusPredicate::Simple(s) => target.state_kind().simple() == *s,
            StatusPredicate::ReallyRunning => target.state_kind().really_running(),
            StatusPredicate::Killable => target.is_alive(),
            StatusPredicate::DeadBecauseOfDependencies => target.dead_because_of_dependencies(),
            StatusPredicate::ActivatedByUser => target.activated_by_user(),
        }
    }
}

/// Recursive filter over targets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetFilter {
    True,
    False,
    And(Vec<TargetFilter>),
    Or(Vec<TargetFilter>),
    Not(Box<TargetFilter>),
    Status(StatusPredicate),
    HasTag(MatchPattern),
    Name(MatchPattern),
    Id(MatchPattern),
}

impl Default for TargetFilter {
    fn default() -> Self {
        TargetFilter::True
    }
}

/// Rejection of a malformed filter at request time.
#[derive(Debug, Error)]
pub enum FilterError {
    #[error("invalid regex {pattern:?}: {message}")]
    BadRegex { pattern: String, message: String },
}

impl TargetFilter {
    pub fn matches(&self, target: &Target) -> bool {
        match self {
            TargetFilter::True => true,
            TargetFilter::False => false,
            TargetFilter::And(fs) => fs.iter().all(|f| f.matches(target)),
            TargetFilter::Or(fs) => fs.iter().any(|f| f.matches(target)),
            TargetFilter::Not(f) => !f.matches(target),
            TargetFilter::Status(p) => p.matches(target),
            TargetFilter::HasTag(p) => target.tags.iter().any(|t| p.matches(t)),
            TargetFilter::Name(p) => p.matches(&target.name),
            TargetFilter::Id(p) => p.matches(target.id.as_str()),
        }
    }

    /// Check every embedded regex compiles; called at protocol dispatch so a
    /// malformed filter is a protocol error, not a silent non-match.
    pub fn validate(&self) -> Result<(), FilterError> {
        match self {
            TargetFilter::True | TargetFilter::False | TargetFilter::Status(_) => Ok(()),
            TargetFilter::And(fs) | TargetFilter::Or(fs) => {
                fs.iter().try_for_each(|f| f.validate())
            }
            TargetFilter::Not(f) => f.validate(),
            TargetFilter::HasTag(p) | TargetFilter::Name(p) | TargetFilter::Id(p) => p.validate(),
        }
    }
}

/// Time window of a target query, in epoch milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TimeConstraint {
    #[default]
    All,
    /// Exclude targets that finished strictly before `t`.
    NotFinishedBefore(u64),
    CreatedAfter(u64),
    StatusChangedSince(u64),
}

impl TimeConstraint {
    pub fn matches(&self, target: &Target) -> bool {
        match self {
            TimeConstraint::All => true,
            TimeConstraint::NotFinishedBefore(t) => {
                target.finished_at_ms().map(|f| f >= *t).unwrap_or(true)
            }
            TimeConstraint::CreatedAfter(t) => target.created_at_ms() > *t,
            TimeConstraint::StatusChangedSince(t) => target.status_changed_at_ms() >= *t,
        }
    }
}

/// A complete target query: time window plus filter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TargetQuery {
    #[serde(default)]
    pub time_constraint: TimeConstraint,
    #[serde(default)]
    pub filter: TargetFilter,
}

impl TargetQuery {
    pub fn matches(&self, target: &Target) -> bool {
        self.time_constraint.matches(target) && self.filter.matches(target)
    }
}

#[cfg(test)]
#[path = "filter_tests.rs"]
mod tests;
