//! Watching the initramfs journal port for boot failures.
//!
//! When the guest fails before switching to the real root, the initramfs
//! dumps its journal to a virtio-serial port that QEMU captures into a file.
//! A non-empty capture file therefore means the boot failed.

use std::path::Path;
use std::time::Duration;

/// How often the capture file is polled.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Lines of the captured journal included in the error.
const EXCERPT_LINES: usize = 20;

/// Return an excerpt of the captured journal if the guest reported a failure.
pub(crate) async fn read_failure(path: &Path) -> Option<String> {
    let contents = tokio::fs::read(path).await.ok()?;
    if contents.iter().all(u8::is_ascii_whitespace) {
        return None;
    }
    let text = String::from_utf8_lossy(&contents);
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(EXCERPT_LINES);
    Some(lines[start..].join("\n"))
}

/// Resolve once the guest reports a failure. Never resolves otherwise.
pub(crate) async fn wait_for_failure(path: &Path) -> String {
    loop {
        if let Some(excerpt) = read_failure(path).await {
            tracing::warn!(path = %path.display(), "Guest reported an initramfs failure");
            return excerpt;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_or_empty_file_is_not_a_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.txt");
        assert!(read_failure(&path).await.is_none());

        std::fs::write(&path, "\n  \n").unwrap();
        assert!(read_failure(&path).await.is_none());
    }

    #[tokio::test]
    async fn test_excerpt_keeps_last_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.txt");
        let body: Vec<String> = (0..30).map(|i| format!("line {i}")).collect();
        std::fs::write(&path, body.join("\n")).unwrap();

        let excerpt = read_failure(&path).await.unwrap();
        assert!(excerpt.starts_with("line 10"));
        assert!(excerpt.ends_with("line 29"));
    }

    #[tokio::test]
    async fn test_watcher_pending_while_journal_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.txt");
        std::fs::write(&path, "").unwrap();

        let mut task = tokio_test::task::spawn(wait_for_failure(&path));
        tokio_test::assert_pending!(task.poll());
    }

    #[tokio::test]
    async fn test_wait_for_failure_resolves_when_written() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.txt");
        std::fs::write(&path, "").unwrap();

        let writer_path = path.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            std::fs::write(&writer_path, "ignition[123]: failed to fetch config").unwrap();
        });

        let excerpt = tokio::time::timeout(Duration::from_secs(5), wait_for_failure(&path))
            .await
            .expect("watcher should resolve");
        assert!(excerpt.contains("failed to fetch config"));
    }
}
