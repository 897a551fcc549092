use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::tracker::UnitState;
use crate::core::errors::Result;

/// Outcome of one unit in a run
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct UnitOutcome {
    pub unit: String,
    pub priority: i32,
    pub dedicated_worker: bool,
    pub seed: u64,
    pub state: UnitState,
    /// Wall-clock time from start of `on_generate` to completion or failure
    pub duration_ms: Option<u64>,
    pub error: Option<String>,
}

/// Summary of a run, as handed to the end callback
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RunReport {
    pub run_id: Uuid,
    pub seed: u64,
    pub started_at: Option<DateTime<Utc>>,
    /// Time between `start()` and the detected end; `None` while running
    pub elapsed_ms: Option<u64>,
    /// True iff every unit completed
    pub all_complete: bool,
    /// Units ordered by priority, then id
    pub units: Vec<UnitOutcome>,
    /// A consolidated error message if any unit failed
    pub error: Option<String>,
}

impl RunReport {
    pub(crate) fn new(
        run_id: Uuid,
        seed: u64,
        started_at: Option<DateTime<Utc>>,
        elapsed_ms: Option<u64>,
        units: Vec<UnitOutcome>,
    ) -> Self {
        let all_complete = units.iter().all(|u| u.state == UnitState::Completed);
        let error_messages: Vec<String> = units
            .iter()
            .filter_map(|u| u.error.as_ref().map(|e| format!("{}: {}", u.unit, e)))
            .collect();
        let error = if error_messages.is_empty() {
            None
        } else {
            Some(error_messages.join("\n"))
        };

        Self {
            run_id,
            seed,
            started_at,
            elapsed_ms,
            all_complete,
            units,
            error,
        }
    }

    pub fn unit(&self, unit: &str) -> Option<&UnitOutcome> {
        self.units.iter().find(|outcome| outcome.unit == unit)
    }

    /// Units that have not reached a terminal state
    pub fn unfinished(&self) -> impl Iterator<Item = &UnitOutcome> {
        self.units.iter().filter(|outcome| !outcome.state.is_terminal())
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
