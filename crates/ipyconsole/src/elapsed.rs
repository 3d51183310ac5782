//! Elapsed-time label for a console tab.

use std::time::{Duration, Instant};

const DAY: u64 = 24 * 3600;

/// Monotonic timer started at the first prompt.
///
/// The shown time never decreases: a `now` earlier than the last reading
/// repeats that reading.
#[derive(Debug, Clone)]
pub struct ElapsedTimer {
    origin: Option<Instant>,
    last: Duration,
    ended: bool,
    visible: bool,
}

impl ElapsedTimer {
    pub fn new(visible: bool) -> Self {
        Self {
            origin: None,
            last: Duration::ZERO,
            ended: false,
            visible,
        }
    }

    pub fn start(&mut self, now: Instant) {
        self.origin = Some(now);
        self.last = Duration::ZERO;
        self.ended = false;
    }

    pub fn is_started(&self) -> bool {
        self.origin.is_some()
    }

    /// Freeze the label in its "ended" color.
    pub fn stop(&mut self) {
        self.ended = true;
    }

    pub fn set_visible(&mut self, visible: bool) {
        self.visible = visible;
    }

    pub fn is_visible(&self) -> bool {
        self.visible
    }

    pub fn elapsed(&mut self, now: Instant) -> Duration {
        let Some(origin) = self.origin else {
            return Duration::ZERO;
        };
        self.last = self.last.max(now.saturating_duration_since(origin));
        self.last
    }

    /// Label text, empty when hidden or not started.
    pub fn label(&mut self, now: Instant) -> String {
        if !self.visible || self.origin.is_none() {
            return String::new();
        }
        let text = format_elapsed(self.elapsed(now));
        let color = if self.ended { "#8e8e8e" } else { "#3775a9" };
        format!("<span style='color: {}'><b>{}</b></span>", color, text)
    }
}

/// `HH:MM:SS`, or `D HH:MM:SS` past a day.
pub fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    let hms = format!(
        "{:02}:{:02}:{:02}",
        (secs % DAY) / 3600,
        (secs % 3600) / 60,
        secs % 60
    );
    if secs >= DAY {
        format!("{} {}", secs / DAY, hms)
    } else {
        hms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_elapsed() {
        assert_eq!(format_elapsed(Duration::from_secs(0)), "00:00:00");
        assert_eq!(format_elapsed(Duration::from_secs(3725)), "01:02:05");
        assert_eq!(format_elapsed(Duration::from_secs(DAY + 61)), "1 00:01:01");
    }

    #[test]
    fn test_elapsed_never_decreases() {
        let t0 = Instant::now();
        let mut timer = ElapsedTimer::new(true);
        timer.start(t0);
        let hour = timer.elapsed(t0 + Duration::from_secs(3600));
        assert_eq!(hour, Duration::from_secs(3600));

        let stepped_back = timer.elapsed(t0 + Duration::from_secs(3599));
        assert!(stepped_back >= hour);
        assert_eq!(timer.elapsed(t0), hour);

        let mut previous = Duration::ZERO;
        for secs in [3600, 3601, 3500, 4000, 10] {
            let reading = timer.elapsed(t0 + Duration::from_secs(secs));
            assert!(reading >= previous);
            previous = reading;
        }
        assert_eq!(previous, Duration::from_secs(4000));
    }

    #[test]
    fn test_restart_resets_reading() {
        let t0 = Instant::now();
        let mut timer = ElapsedTimer::new(true);
        timer.start(t0);
        timer.elapsed(t0 + Duration::from_secs(90));
        let t1 = t0 + Duration::from_secs(100);
        timer.start(t1);
        assert_eq!(timer.elapsed(t1 + Duration::from_secs(2)), Duration::from_secs(2));
    }

    #[test]
    fn test_label_visibility_and_color() {
        let t0 = Instant::now();
        let mut timer = ElapsedTimer::new(false);
        timer.start(t0);
        assert_eq!(timer.label(t0), "");
        timer.set_visible(true);
        let live = timer.label(t0 + Duration::from_secs(1));
        assert!(live.contains("00:00:01"));
        timer.stop();
        let ended = timer.label(t0 + Duration::from_secs(1));
        assert_ne!(live, ended);
    }
}
