//! Module to modify oom scores of host processes on Linux

use nix::errno::Errno;
use nix::unistd::Pid;
use std::fs::{self, OpenOptions};
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};

/// Lowest value the kernel accepts, processes with this score are never picked by the oom killer
pub const OOM_SCORE_ADJ_MIN: i32 = -1000;
/// Highest value the kernel accepts
pub const OOM_SCORE_ADJ_MAX: i32 = 1000;

/// Errors when adjusting the oom score of a process
#[derive(Debug, thiserror::Error)]
pub enum OomScoreError {
    /// Score is outside of [-1000, 1000]
    #[error("invalid oom score adjustment {0}, must be within [-1000, 1000]")]
    InvalidScore(i32),
    /// The process exited before we could write its score
    #[error("process {0} vanished before its oom score could be adjusted")]
    ProcessVanished(Pid),
    /// The kernel did not let us write the control file
    #[error("permission denied to adjust oom score of process {0}")]
    PermissionDenied(Pid),
    /// Any other I/O failure on the control file
    #[error("failed to access oom_score_adj of process {pid}: {source}")]
    Io {
        /// Target process
        pid: Pid,
        /// Underlying error
        #[source]
        source: io::Error,
    },
}

impl OomScoreError {
    fn from_io(pid: Pid, err: io::Error) -> Self {
        if err.kind() == ErrorKind::NotFound || err.raw_os_error() == Some(Errno::ESRCH as i32) {
            OomScoreError::ProcessVanished(pid)
        } else if err.kind() == ErrorKind::PermissionDenied {
            OomScoreError::PermissionDenied(pid)
        } else {
            OomScoreError::Io { pid, source: err }
        }
    }
}

/// Writes `oom_score_adj` of processes below a process table root
#[derive(Debug, Clone)]
pub struct OomScoreAdjuster {
    root: PathBuf,
}

impl OomScoreAdjuster {
    /// Returns an adjuster for the process table mounted at `root`
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_owned(),
        }
    }

    fn control_file(&self, pid: Pid) -> PathBuf {
        self.root.join(pid.to_string()).join("oom_score_adj")
    }

    /// Adjust the oom score of `pid`. The lower the oom score the less likely a process get killed.
    /// Writing the score a process already has is a no-op.
    pub fn apply(&self, pid: Pid, score: i32) -> Result<(), OomScoreError> {
        if !(OOM_SCORE_ADJ_MIN..=OOM_SCORE_ADJ_MAX).contains(&score) {
            return Err(OomScoreError::InvalidScore(score));
        }
        // never create the file: a missing entry means the process is gone
        let mut f = OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(self.control_file(pid))
            .map_err(|e| OomScoreError::from_io(pid, e))?;
        f.write_all(format!("{score}").as_bytes())
            .map_err(|e| OomScoreError::from_io(pid, e))?;
        Ok(())
    }

    /// Returns the current oom score adjustment of `pid`
    pub fn read(&self, pid: Pid) -> Result<i32, OomScoreError> {
        let content =
            fs::read_to_string(self.control_file(pid)).map_err(|e| OomScoreError::from_io(pid, e))?;
        content.trim().parse::<i32>().map_err(|e| OomScoreError::Io {
            pid,
            source: io::Error::new(ErrorKind::InvalidData, e),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proc::tests::fake_process;

    #[test]
    fn test_apply_and_read_back() {
        let root = tempfile::tempdir().unwrap();
        fake_process(root.path(), 4242, "balena-supervisor");
        let adjuster = OomScoreAdjuster::new(root.path());
        let pid = Pid::from_raw(4242);

        for score in [OOM_SCORE_ADJ_MIN, -800, 0, 17, OOM_SCORE_ADJ_MAX] {
            adjuster.apply(pid, score).unwrap();
            assert_eq!(adjuster.read(pid).unwrap(), score);
        }
    }

    #[test]
    fn test_apply_twice_is_idempotent() {
        let root = tempfile::tempdir().unwrap();
        fake_process(root.path(), 7, "openvpn");
        let adjuster = OomScoreAdjuster::new(root.path());
        let pid = Pid::from_raw(7);

        adjuster.apply(pid, -1000).unwrap();
        adjuster.apply(pid, -1000).unwrap();
        assert_eq!(adjuster.read(pid).unwrap(), -1000);
    }

    #[test]
    fn test_invalid_score_does_not_write() {
        let root = tempfile::tempdir().unwrap();
        fake_process(root.path(), 7, "openvpn");
        let adjuster = OomScoreAdjuster::new(root.path());
        let pid = Pid::from_raw(7);

        for score in [-1001, 1001, i32::MIN, i32::MAX] {
            match adjuster.apply(pid, score) {
                Err(OomScoreError::InvalidScore(s)) => assert_eq!(s, score),
                other => panic!("expected InvalidScore, got {other:?}"),
            }
        }
        assert_eq!(adjuster.read(pid).unwrap(), 0);
    }

    #[test]
    fn test_vanished_process() {
        let root = tempfile::tempdir().unwrap();
        let adjuster = OomScoreAdjuster::new(root.path());
        let pid = Pid::from_raw(31337);

        assert!(matches!(
            adjuster.apply(pid, -1000),
            Err(OomScoreError::ProcessVanished(p)) if p == pid
        ));
        // no control file got created on the way
        assert!(!root.path().join("31337").exists());
    }

    #[test]
    fn test_error_mapping() {
        let pid = Pid::from_raw(1);
        assert!(matches!(
            OomScoreError::from_io(pid, io::Error::from_raw_os_error(Errno::ESRCH as i32)),
            OomScoreError::ProcessVanished(_)
        ));
        assert!(matches!(
            OomScoreError::from_io(pid, io::Error::from(ErrorKind::PermissionDenied)),
            OomScoreError::PermissionDenied(_)
        ));
        assert!(matches!(
            OomScoreError::from_io(pid, io::Error::from(ErrorKind::InvalidInput)),
            OomScoreError::Io { .. }
        ));
    }
}
