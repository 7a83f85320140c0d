// src/types.rs

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Lifecycle state shared by tasks and steps.
///
/// Transitions only move forward: `Pending -> Running -> Stop | SystemError`.
/// A terminal state never goes back to `Pending` or `Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum State {
    #[default]
    Pending,
    Running,
    Stop,
    SystemError,
}

impl State {
    /// Ordering rank used to reject regressions.
    fn rank(self) -> u8 {
        match self {
            State::Pending => 0,
            State::Running => 1,
            State::Stop | State::SystemError => 2,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, State::Stop | State::SystemError)
    }

    /// Whether moving from `self` to `next` is allowed.
    ///
    /// `Stop` may still be escalated to `SystemError`, the reverse is not allowed.
    pub fn can_transition_to(self, next: State) -> bool {
        match (self, next) {
            (State::Stop, State::SystemError) => true,
            (State::SystemError, _) => next == State::SystemError,
            _ => next.rank() >= self.rank(),
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            State::Pending => "Pending",
            State::Running => "Running",
            State::Stop => "Stop",
            State::SystemError => "System Error",
        };
        f.write_str(s)
    }
}

/// Sort order for task listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ListOrder {
    #[default]
    StartTime,
    EndTime,
    RemainingTtl,
}

impl FromStr for ListOrder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "start" | "begin" => Ok(ListOrder::StartTime),
            "end" | "completed" => Ok(ListOrder::EndTime),
            "ttl" | "expire" => Ok(ListOrder::RemainingTtl),
            other => Err(format!(
                "invalid list order: {other} (expected \"start\", \"end\" or \"ttl\")"
            )),
        }
    }
}

/// Parse a duration string such as `"500ms"`, `"30s"`, `"5m"` or `"2h"`.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration string".to_string());
    }

    // Find the boundary between digits and suffix.
    let idx = s
        .chars()
        .position(|c| !c.is_ascii_digit())
        .ok_or_else(|| "duration missing unit suffix".to_string())?;

    let (num_part, unit_part) = s.split_at(idx);
    let value: u64 = num_part
        .parse()
        .map_err(|e| format!("invalid duration number '{}': {}", num_part, e))?;
    let unit = unit_part.trim().to_lowercase();

    let secs_per_unit: u64 = match unit.as_str() {
        "ms" => return Ok(Duration::from_millis(value)),
        "s" => 1,
        "m" => 60,
        "h" => 60 * 60,
        _ => {
            return Err(format!(
                "unsupported duration unit '{}'; expected ms, s, m, or h",
                unit
            ))
        }
    };
    value
        .checked_mul(secs_per_unit)
        .map(Duration::from_secs)
        .ok_or_else(|| format!("duration '{}' is too large", s))
}

/// Serde adapter for optional duration strings in TOML files.
pub mod opt_duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        match raw {
            None => Ok(None),
            Some(s) => super::parse_duration(&s)
                .map(Some)
                .map_err(serde::de::Error::custom),
        }
    }
}
