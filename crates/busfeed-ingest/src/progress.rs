//! Terminal progress display

use crate::driver::Progress;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

/// Spinner for an ingestion run of unknown length
pub fn create_spinner(message: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} [{elapsed_precise}] {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.set_message(message.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

/// One-line summary of a progress snapshot
pub fn describe(progress: &Progress) -> String {
    format!(
        "{} rows, {} sent, {} acknowledged, {} failed",
        progress.total_seen, progress.sent, progress.acknowledged, progress.failed
    )
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_describe() {
        let progress = Progress {
            total_seen: 200,
            sent: 198,
            acknowledged: 150,
            failed: 2,
        };
        assert_eq!(
            describe(&progress),
            "200 rows, 198 sent, 150 acknowledged, 2 failed"
        );
    }

    #[test]
    fn test_create_spinner() {
        let pb = create_spinner("Publishing");
        assert!(!pb.is_finished());
        pb.finish_and_clear();
        assert!(pb.is_finished());
    }
}
