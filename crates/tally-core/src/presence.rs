//! Two-state presence toggle.
//!
//! `Closed --mark--> Open --mark--> Closed`. The open timestamp lives
//! inside the `Open` variant, so "opened_at is set iff open" holds by
//! construction.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Presence {
    #[default]
    Closed,
    Open { opened_at: DateTime<Utc> },
}

/// What the caller expects a mark to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarkIntent {
    /// Flip whatever the current state is.
    #[default]
    Toggle,
    /// Caller expects to open a session; rejected if already open.
    Start,
    /// Caller expects to close a session; rejected if already closed.
    End,
}

impl FromStr for MarkIntent {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "toggle" => Ok(MarkIntent::Toggle),
            "start" => Ok(MarkIntent::Start),
            "end" => Ok(MarkIntent::End),
            other => Err(format!("unknown mark intent: {other:?}")),
        }
    }
}

/// Event reported to callers and notifiers after a committed mark.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarkEvent {
    Start,
    End,
}

impl MarkEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarkEvent::Start => "start",
            MarkEvent::End => "end",
        }
    }
}

impl fmt::Display for MarkEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated state change, not yet committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Opened {
        at: DateTime<Utc>,
    },
    /// `[opened_at, closed_at)` is handed to the ledger.
    Closed {
        opened_at: DateTime<Utc>,
        closed_at: DateTime<Utc>,
    },
}

impl Transition {
    pub fn event(&self) -> MarkEvent {
        match self {
            Transition::Opened { .. } => MarkEvent::Start,
            Transition::Closed { .. } => MarkEvent::End,
        }
    }

    /// Presence after this transition is applied.
    pub fn presence_after(&self) -> Presence {
        match self {
            Transition::Opened { at } => Presence::Open { opened_at: *at },
            Transition::Closed { .. } => Presence::Closed,
        }
    }

    /// Instant the transition happened.
    pub fn at(&self) -> DateTime<Utc> {
        match self {
            Transition::Opened { at } => *at,
            Transition::Closed { closed_at, .. } => *closed_at,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransitionError {
    #[error("session already open since {opened_at}")]
    AlreadyOpen { opened_at: DateTime<Utc> },
    #[error("no open session to close")]
    NotOpen,
    #[error("close at {closed_at} is not after open at {opened_at}")]
    NonPositiveInterval {
        opened_at: DateTime<Utc>,
        closed_at: DateTime<Utc>,
    },
}

impl Presence {
    pub fn is_open(&self) -> bool {
        matches!(self, Presence::Open { .. })
    }

    pub fn opened_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Presence::Open { opened_at } => Some(*opened_at),
            Presence::Closed => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Presence::Open { .. } => "open",
            Presence::Closed => "closed",
        }
    }

    /// Validate a mark against the current state and produce the flip.
    pub fn mark(&self, intent: MarkIntent, now: DateTime<Utc>) -> Result<Transition, TransitionError> {
        match (*self, intent) {
            (Presence::Closed, MarkIntent::Toggle | MarkIntent::Start) => Ok(Transition::Opened { at: now }),
            (Presence::Closed, MarkIntent::End) => Err(TransitionError::NotOpen),
            (Presence::Open { opened_at }, MarkIntent::Start) => Err(TransitionError::AlreadyOpen { opened_at }),
            (Presence::Open { opened_at }, MarkIntent::Toggle | MarkIntent::End) => {
                if now <= opened_at {
                    return Err(TransitionError::NonPositiveInterval {
                        opened_at,
                        closed_at: now,
                    });
                }
                Ok(Transition::Closed {
                    opened_at,
                    closed_at: now,
                })
            }
        }
    }
}
