//! Transfer progress logging.

use tracing::info;

use super::files::readable_size;
use crate::memory;

const MARKS: [u8; 4] = [25, 50, 75, 100];

/// Logs a transfer's progress once per quarter, with the process RSS.
#[derive(Debug)]
pub struct ProgressTracker {
    label: String,
    total: u64,
    next_mark: usize,
}

impl ProgressTracker {
    #[must_use]
    pub fn new(label: impl Into<String>, total: u64) -> Self {
        Self {
            label: label.into(),
            total,
            next_mark: 0,
        }
    }

    /// Records `done` bytes. Returns the marks crossed by this update.
    pub fn update(&mut self, done: u64) -> Vec<u8> {
        let percent = if self.total == 0 {
            100
        } else {
            (done.min(self.total) * 100 / self.total) as u8
        };

        let mut crossed = Vec::new();
        while let Some(&mark) = MARKS.get(self.next_mark) {
            if percent < mark {
                break;
            }
            self.next_mark += 1;
            crossed.push(mark);
        }

        if let Some(&mark) = crossed.last() {
            info!(
                "{}: {}% ({} / {}) | RAM: {:.1} MB",
                self.label,
                mark,
                readable_size(done),
                readable_size(self.total),
                memory::process_rss_mb()
            );
        }

        crossed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_marks_logged_once() {
        let mut progress = ProgressTracker::new("clip.mp4", 1000);
        assert!(progress.update(100).is_empty());
        assert_eq!(progress.update(260), vec![25]);
        assert!(progress.update(300).is_empty());
        assert_eq!(progress.update(1000), vec![50, 75, 100]);
        assert!(progress.update(1000).is_empty());
    }

    #[test]
    fn test_empty_file_completes() {
        let mut progress = ProgressTracker::new("empty", 0);
        assert_eq!(progress.update(0), vec![25, 50, 75, 100]);
    }
}
