use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The temporal visibility token. In production every query uses real
/// wall-clock now; in simulation, no component may read data with
/// availability after `current_time` (the lookahead prohibition).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Production,
    Simulation,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeContext {
    pub current_time: DateTime<Utc>,
    pub mode: Mode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub simulation_id: Option<String>,
}

impl TimeContext {
    pub fn now() -> Self {
        Self {
            current_time: Utc::now(),
            mode: Mode::Production,
            simulation_id: None,
        }
    }

    pub fn at(current_time: DateTime<Utc>, simulation_id: impl Into<String>) -> Self {
        Self {
            current_time,
            mode: Mode::Simulation,
            simulation_id: Some(simulation_id.into()),
        }
    }

    pub fn is_simulation(&self) -> bool {
        matches!(self.mode, Mode::Simulation)
    }

    /// Advances simulated time. Only valid in simulation mode; production
    /// time always tracks the real wall clock.
    pub fn advance_to(&mut self, new_time: DateTime<Utc>) -> Result<()> {
        if !self.is_simulation() {
            bail!("cannot advance time outside simulation mode");
        }
        self.current_time = new_time;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn advance_to_rejected_outside_simulation() {
        let mut tc = TimeContext::now();
        let res = tc.advance_to(Utc::now() + Duration::days(1));
        assert!(res.is_err());
    }

    #[test]
    fn advance_to_allowed_in_simulation() {
        let mut tc = TimeContext::at(Utc::now(), "sim_1");
        let later = Utc::now() + Duration::days(1);
        assert!(tc.advance_to(later).is_ok());
        assert_eq!(tc.current_time, later);
    }
}
