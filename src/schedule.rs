use crate::config::ScheduleConfig;
use chrono::{DateTime, Local, Timelike};

/// Daily recording window in local time. Both hours are inclusive, so
/// `6..=17` records from 06:00 until 17:59. A window whose start is after
/// its end wraps past midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActiveHours {
    start_hour: u32,
    end_hour: u32,
}

impl ActiveHours {
    pub fn new(start_hour: u32, end_hour: u32) -> Self {
        Self {
            start_hour,
            end_hour,
        }
    }

    /// None when the schedule is not configured (record around the clock).
    pub fn from_config(config: &ScheduleConfig) -> Option<Self> {
        match (config.start_hour, config.end_hour) {
            (Some(start), Some(end)) => Some(Self::new(start, end)),
            _ => None,
        }
    }

    pub fn contains_hour(&self, hour: u32) -> bool {
        if self.start_hour <= self.end_hour {
            (self.start_hour..=self.end_hour).contains(&hour)
        } else {
            hour >= self.start_hour || hour <= self.end_hour
        }
    }

    pub fn is_active_at(&self, t: &DateTime<Local>) -> bool {
        self.contains_hour(t.hour())
    }
}
