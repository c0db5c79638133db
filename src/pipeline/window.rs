use crate::source::Frame;

use super::event::Event;
use super::PipelineError;

/// What a window reduces its frames to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowMode {
    /// Number of frames that arrived. Payloads are not inspected.
    Events,
    /// Sum of every count carried by the frames.
    Rate,
}

/// Reduces the frames of the currently open window to one integer.
#[derive(Debug)]
pub struct WindowCounter {
    mode: WindowMode,
    current: i64,
}

impl WindowCounter {
    pub fn new(mode: WindowMode) -> Self {
        Self { mode, current: 0 }
    }

    /// Record one frame into the open window.
    ///
    /// Only rate windows decode the payload, so only they can fail.
    pub fn record(&mut self, frame: &Frame) -> Result<(), PipelineError> {
        let delta = match self.mode {
            WindowMode::Events => 1,
            WindowMode::Rate => Event::from_frame(frame)?.total(),
        };
        self.current = self.current.saturating_add(delta);
        Ok(())
    }

    /// Close the current window, returning its value and opening the next.
    ///
    /// An empty window closes with 0.
    pub fn close(&mut self) -> i64 {
        std::mem::take(&mut self.current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record_all(counter: &mut WindowCounter, payloads: &[&str]) {
        for payload in payloads {
            counter
                .record(&Frame::new(*payload))
                .expect("valid payload");
        }
    }

    #[test]
    fn test_events_mode_counts_frames() {
        let mut counter = WindowCounter::new(WindowMode::Events);
        record_all(
            &mut counter,
            &[r#"{"1F600":3}"#, r#"{"1F601":1,"1F602":9}"#, "not json"],
        );
        assert_eq!(counter.close(), 3);
    }

    #[test]
    fn test_rate_mode_sums_values() {
        let mut counter = WindowCounter::new(WindowMode::Rate);
        record_all(&mut counter, &[r#"{"1F600":3}"#, r#"{"1F601":1,"1F602":9}"#]);
        assert_eq!(counter.close(), 13);
    }

    #[test]
    fn test_rate_mode_rejects_malformed_payload() {
        let mut counter = WindowCounter::new(WindowMode::Rate);
        record_all(&mut counter, &[r#"{"1F600":2}"#]);
        let err = counter
            .record(&Frame::new("not json"))
            .expect_err("malformed");
        assert_eq!(err.kind(), "malformed_payload");
        assert_eq!(counter.close(), 2);
    }

    #[test]
    fn test_close_resets_window() {
        let mut counter = WindowCounter::new(WindowMode::Rate);
        record_all(&mut counter, &[r#"{"1F600":4}"#]);
        assert_eq!(counter.close(), 4);
        assert_eq!(counter.close(), 0);
    }

    #[test]
    fn test_empty_window_closes_with_zero() {
        let mut counter = WindowCounter::new(WindowMode::Events);
        assert_eq!(counter.close(), 0);
    }
}
