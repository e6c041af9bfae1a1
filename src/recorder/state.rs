use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum RecorderStatus {
    #[default]
    Idle,
    Running,
    Paused,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecorderState {
    pub status: RecorderStatus,
    /// Session-relative seconds recorded so far; a resumed run continues here.
    pub elapsed: f64,
    /// Wall-clock time of the first start; the session key derives from it.
    pub started_at: Option<DateTime<Local>>,
    /// The sensor was missing when the current run armed.
    pub degraded: bool,
}

impl RecorderState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn can_start(&self) -> bool {
        self.status != RecorderStatus::Running
    }

    pub fn begin_run(&mut self, now: DateTime<Local>, degraded: bool) {
        self.status = RecorderStatus::Running;
        self.started_at.get_or_insert(now);
        self.degraded = degraded;
    }

    pub fn pause(&mut self, elapsed: f64) {
        self.status = RecorderStatus::Paused;
        self.elapsed = elapsed;
        self.degraded = false;
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_start_time_is_kept_across_resumes() {
        let mut state = RecorderState::new();
        let first = Local::now();
        state.begin_run(first, false);
        state.pause(1.5);

        state.begin_run(first + chrono::Duration::seconds(30), false);
        assert_eq!(state.started_at, Some(first));
        assert_eq!(state.elapsed, 1.5);

        state.reset();
        assert_eq!(state.status, RecorderStatus::Idle);
        assert!(state.started_at.is_none());
    }
}
