use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use tracing::warn;

/// Default bound on `wait_for_file` before a stale claim is stolen
/// (§4.2, §9: "Cache claim without timeout" design-note, resolved at 30s).
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

const POLL_INTERVAL: Duration = Duration::from_millis(25);

fn lock_path(artifact: &Path) -> PathBuf {
    let mut p = artifact.as_os_str().to_owned();
    p.push(".lock");
    PathBuf::from(p)
}

/// Atomically attempts to claim exclusive ownership of `artifact`'s build.
/// Succeeds for exactly one contender system-wide; returns `true` if this
/// caller now owns the claim.
pub fn have_file(artifact: &Path) -> bool {
    OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(lock_path(artifact))
        .is_ok()
}

/// Releases a previously successful [`have_file`] claim. Idempotent: a
/// missing lock file is not an error (it may already have been stolen).
pub fn release_file(artifact: &Path) {
    let _ = std::fs::remove_file(lock_path(artifact));
}

/// Blocks until `artifact` exists and is no longer claimed, or until
/// `timeout` elapses, in which case the lock is treated as abandoned: it is
/// removed and this caller becomes the new producer (returns `true`, same
/// as a fresh [`have_file`] success). Returns `false` if the artifact
/// appeared normally (the original producer finished).
pub fn wait_for_file(artifact: &Path, timeout: Duration) -> bool {
    let lock = lock_path(artifact);
    let deadline = Instant::now() + timeout;

    loop {
        if artifact.exists() {
            return false;
        }

        if !lock.exists() {
            // The producer released its claim without writing the artifact
            // (a compile failure elsewhere); try to claim it ourselves.
            return have_file(artifact);
        }

        if Instant::now() >= deadline {
            warn!(
                path = %artifact.display(),
                "cache lock exceeded {:?}, stealing stale claim",
                timeout
            );
            let _ = std::fs::remove_file(&lock);
            return have_file(artifact);
        }

        if lock_is_stale(&lock, timeout) {
            warn!(path = %artifact.display(), "cache lock mtime exceeds timeout, stealing stale claim");
            let _ = std::fs::remove_file(&lock);
            return have_file(artifact);
        }

        std::thread::sleep(POLL_INTERVAL);
    }
}

fn lock_is_stale(lock: &Path, timeout: Duration) -> bool {
    let Ok(meta) = std::fs::metadata(lock) else {
        return false;
    };
    let Ok(modified) = meta.modified() else {
        return false;
    };
    SystemTime::now()
        .duration_since(modified)
        .map(|age| age > timeout)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn exactly_one_contender_claims_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = dir.path().join("k.bin");

        assert!(have_file(&artifact));
        assert!(!have_file(&artifact));

        release_file(&artifact);
        assert!(have_file(&artifact));
    }

    #[test]
    fn wait_for_file_returns_once_artifact_appears() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = dir.path().join("k.bin");
        assert!(have_file(&artifact));

        std::thread::spawn({
            let artifact = artifact.clone();
            move || {
                std::thread::sleep(Duration::from_millis(50));
                std::fs::write(&artifact, b"done").unwrap();
            }
        });

        let stole = wait_for_file(&artifact, Duration::from_secs(5));
        assert!(!stole);
        assert!(artifact.exists());
    }

    #[test]
    fn wait_for_file_steals_after_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = dir.path().join("k.bin");
        assert!(have_file(&artifact));

        let stole = wait_for_file(&artifact, Duration::from_millis(50));
        assert!(stole);
    }
}
