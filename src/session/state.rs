//! Paid-session countdown arithmetic.
//!
//! Pure state: every operation takes `now` explicitly so that expiry and
//! pause accounting can be exercised without waiting.

use chrono::{DateTime, Duration, Utc};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionState {
    pub active: bool,
    pub session_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    /// Meaningful while running; while paused `remaining_on_pause` is
    /// authoritative
    pub end_time: Option<DateTime<Utc>>,
    pub paused: bool,
    pub pause_started_at: Option<DateTime<Utc>>,
    pub remaining_on_pause: Option<Duration>,
    paused_total: Duration,
}

/// Summary of a session that just ended
#[derive(Debug, Clone, PartialEq)]
pub struct EndedSession {
    pub session_id: String,
    /// Wall time minus time spent paused
    pub used: Duration,
}

impl EndedSession {
    pub fn used_hours(&self) -> f64 {
        self.used.num_milliseconds().max(0) as f64 / 3_600_000.0
    }
}

/// Convert fractional hours to a duration, millisecond precision.
/// `None` if the value is not finite or does not fit.
pub fn hours(value: f64) -> Option<Duration> {
    from_millis(value * 3_600_000.0)
}

/// Convert fractional minutes to a duration, millisecond precision.
/// `None` if the value is not finite or does not fit.
pub fn minutes(value: f64) -> Option<Duration> {
    from_millis(value * 60_000.0)
}

fn from_millis(millis: f64) -> Option<Duration> {
    let millis = millis.round();
    if !millis.is_finite() || millis.abs() >= i64::MAX as f64 {
        return None;
    }
    Duration::try_milliseconds(millis as i64)
}

impl SessionState {
    /// Begin a session, replacing any current one. Returns false, leaving
    /// the state untouched, if the end time is not representable.
    pub fn start(&mut self, session_id: impl Into<String>, length: Duration, now: DateTime<Utc>) -> bool {
        let Some(end_time) = now.checked_add_signed(length) else {
            return false;
        };
        *self = SessionState {
            active: true,
            session_id: Some(session_id.into()),
            started_at: Some(now),
            end_time: Some(end_time),
            ..SessionState::default()
        };
        true
    }

    /// Close the session. Returns `None` if none was active, so repeated
    /// ends have no further effect.
    pub fn end(&mut self, now: DateTime<Utc>) -> Option<EndedSession> {
        if !self.active {
            return None;
        }

        let mut paused = self.paused_total;
        if let (true, Some(since)) = (self.paused, self.pause_started_at) {
            paused += now - since;
        }
        let used = self
            .started_at
            .map(|start| now - start - paused)
            .unwrap_or_else(Duration::zero);
        let ended = EndedSession {
            session_id: self.session_id.clone().unwrap_or_default(),
            used: used.max(Duration::zero()),
        };

        *self = SessionState::default();
        Some(ended)
    }

    /// Add time. While paused the frozen remainder grows; otherwise the end
    /// moves out. Non-positive amounts, inactive sessions and extensions
    /// past the representable range are ignored.
    pub fn extend(&mut self, by: Duration) -> bool {
        if !self.active || by <= Duration::zero() {
            return false;
        }

        if self.paused {
            let remaining = self.remaining_on_pause.unwrap_or_else(Duration::zero);
            let Some(remaining) = remaining.checked_add(&by) else {
                return false;
            };
            self.remaining_on_pause = Some(remaining);
        } else if let Some(end) = self.end_time {
            let Some(end) = end.checked_add_signed(by) else {
                return false;
            };
            self.end_time = Some(end);
        }
        true
    }

    /// Freeze the countdown. Returns false if inactive or already paused.
    pub fn pause(&mut self, now: DateTime<Utc>) -> bool {
        if !self.active || self.paused {
            return false;
        }

        let remaining = self
            .end_time
            .map(|end| (end - now).max(Duration::zero()))
            .unwrap_or_else(Duration::zero);
        self.paused = true;
        self.pause_started_at = Some(now);
        self.remaining_on_pause = Some(remaining);
        true
    }

    /// Resume the countdown so that exactly the frozen remainder is left
    pub fn resume(&mut self, now: DateTime<Utc>) -> bool {
        if !self.active || !self.paused {
            return false;
        }

        let remaining = self.remaining_on_pause.take().unwrap_or_else(Duration::zero);
        if let Some(since) = self.pause_started_at.take() {
            self.paused_total += now - since;
        }
        self.end_time = Some(
            now.checked_add_signed(remaining)
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        );
        self.paused = false;
        true
    }

    /// Time left, frozen while paused, never negative
    pub fn remaining(&self, now: DateTime<Utc>) -> Option<Duration> {
        if !self.active {
            return None;
        }
        let remaining = if self.paused {
            self.remaining_on_pause.unwrap_or_else(Duration::zero)
        } else {
            self.end_time.map_or_else(Duration::zero, |end| end - now)
        };
        Some(remaining.max(Duration::zero()))
    }

    /// A running session whose end has been reached
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.active && !self.paused && self.end_time.is_some_and(|end| now >= end)
    }
}
