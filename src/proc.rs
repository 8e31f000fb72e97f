//! Enumerate processes of a host-mounted process table

use log::debug;
use nix::unistd::Pid;
use std::fs::{self, ReadDir};
use std::io;
use std::path::{Path, PathBuf};

/// A process visible through the host process table.
///
/// Only valid for the scan that produced it: pids get recycled, so a handle
/// must never be kept around for a later pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostProcess {
    /// Pid as seen on the host (outside of any pid namespace)
    pub pid: Pid,
    /// Command name as reported by the kernel, truncated to 15 bytes
    pub name: String,
}

/// Read-only view on a procfs mount, usually the host's `/proc` bind-mounted into our container
#[derive(Debug, Clone)]
pub struct ProcessTable {
    root: PathBuf,
}

impl ProcessTable {
    /// Returns a process table rooted at `root`
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_owned(),
        }
    }

    /// Root of the process table
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Starts a fresh enumeration of all processes.
    ///
    /// Entries that disappear or cannot be read while scanning are skipped.
    /// Only failing to open the root itself is an error.
    pub fn processes(&self) -> io::Result<Processes> {
        Ok(Processes {
            entries: fs::read_dir(&self.root)?,
        })
    }

    /// Returns all processes whose command name is exactly `name`.
    /// No match is not an error.
    pub fn find_by_name(&self, name: &str) -> io::Result<Vec<HostProcess>> {
        Ok(self.processes()?.filter(|p| p.name == name).collect())
    }
}

/// Lazy iterator over a single scan of the process table
#[derive(Debug)]
pub struct Processes {
    entries: ReadDir,
}

fn parse_pid(file_name: &str) -> Option<Pid> {
    match file_name.parse::<i32>() {
        Ok(pid) if pid > 0 => Some(Pid::from_raw(pid)),
        _ => None,
    }
}

fn read_comm(dir: &Path) -> io::Result<String> {
    let comm = fs::read_to_string(dir.join("comm"))?;
    Ok(comm.trim_end_matches('\n').to_string())
}

impl Iterator for Processes {
    type Item = HostProcess;

    fn next(&mut self) -> Option<HostProcess> {
        for entry in self.entries.by_ref() {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    debug!("skip unreadable process table entry: {}", e);
                    continue;
                }
            };
            // not a process: self, sys, meminfo...
            let pid = match entry.file_name().to_str().and_then(parse_pid) {
                Some(pid) => pid,
                None => continue,
            };
            match read_comm(&entry.path()) {
                Ok(name) => return Some(HostProcess { pid, name }),
                // process exited while we were scanning
                Err(e) => debug!("skip process {}: {}", pid, e),
            }
        }
        None
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Creates `<root>/<pid>/comm` and an `oom_score_adj` of 0, like procfs does
    pub(crate) fn fake_process(root: &Path, pid: i32, name: &str) {
        let dir = root.join(pid.to_string());
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("comm"), format!("{name}\n")).unwrap();
        fs::write(dir.join("oom_score_adj"), "0\n").unwrap();
    }

    #[test]
    fn test_processes_skips_non_pid_entries() {
        let root = tempfile::tempdir().unwrap();
        fake_process(root.path(), 1, "systemd");
        fake_process(root.path(), 42, "openvpn");
        fs::create_dir(root.path().join("sys")).unwrap();
        fs::write(root.path().join("meminfo"), "MemTotal: 1 kB\n").unwrap();
        // vanished between readdir and reading comm
        fs::create_dir(root.path().join("77")).unwrap();

        let table = ProcessTable::new(root.path());
        let mut procs: Vec<HostProcess> = table.processes().unwrap().collect();
        procs.sort_by_key(|p| p.pid);
        assert_eq!(
            procs,
            vec![
                HostProcess {
                    pid: Pid::from_raw(1),
                    name: "systemd".to_string()
                },
                HostProcess {
                    pid: Pid::from_raw(42),
                    name: "openvpn".to_string()
                },
            ]
        );
    }

    #[test]
    fn test_find_by_name_exact_match() {
        let root = tempfile::tempdir().unwrap();
        fake_process(root.path(), 10, "connmand");
        fake_process(root.path(), 11, "connmand");
        fake_process(root.path(), 12, "connmanctl");

        let table = ProcessTable::new(root.path());
        let mut pids: Vec<i32> = table
            .find_by_name("connmand")
            .unwrap()
            .iter()
            .map(|p| p.pid.as_raw())
            .collect();
        pids.sort();
        assert_eq!(pids, vec![10, 11]);
        assert!(table.find_by_name("openvpn").unwrap().is_empty());
    }

    #[test]
    fn test_each_scan_is_fresh() {
        let root = tempfile::tempdir().unwrap();
        let table = ProcessTable::new(root.path());
        assert_eq!(table.processes().unwrap().count(), 0);
        fake_process(root.path(), 5, "openvpn");
        assert_eq!(table.processes().unwrap().count(), 1);
    }

    #[test]
    fn test_missing_root_is_an_error() {
        let table = ProcessTable::new(Path::new("/definitely/does/not/exist"));
        let err = table.processes().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
