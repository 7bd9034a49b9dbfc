//! Output directory lock held for the duration of a run.

use super::layout::OutputLayout;
use crate::error::{ConvertError, Result};
use log::warn;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

/// An unreadable lock younger than this may belong to a run that is starting.
const UNREADABLE_LOCK_GRACE: Duration = Duration::from_secs(60);

/// Lock file holding the PID of the process that owns an output directory.
///
/// The PID is written to a temporary file first and hard-linked into place,
/// so the lock never exists without its holder. Removed on drop. A lock left
/// behind by a process that no longer exists is cleaned up on the next acquire.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    pub fn acquire(layout: &OutputLayout) -> Result<Self> {
        fs::create_dir_all(layout.root())?;
        let path = layout.lock_path();

        let mut pending = tempfile::Builder::new()
            .prefix(".book-reader.lock.")
            .tempfile_in(layout.root())?;
        writeln!(pending, "{}", std::process::id())?;
        pending.as_file().sync_all()?;

        // Second pass only happens after removing a stale lock
        for _ in 0..2 {
            match fs::hard_link(pending.path(), &path) {
                Ok(()) => return Ok(Self { path }),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    let holder = read_holder(&path);
                    if !is_stale(&path, holder) {
                        return Err(ConvertError::Locked {
                            path,
                            pid: holder.unwrap_or_default(),
                        });
                    }
                    warn!(
                        "Removing stale lock {} (holder {:?} is gone)",
                        path.display(),
                        holder
                    );
                    match fs::remove_file(&path) {
                        Ok(()) => {}
                        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                        Err(e) => return Err(e.into()),
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        let pid = read_holder(&path).unwrap_or_default();
        Err(ConvertError::Locked { path, pid })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

fn read_holder(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

fn is_stale(path: &Path, holder: Option<u32>) -> bool {
    match holder {
        Some(pid) => !is_process_alive(pid),
        None => lock_age(path).is_some_and(|age| age > UNREADABLE_LOCK_GRACE),
    }
}

fn lock_age(path: &Path) -> Option<Duration> {
    let modified = fs::metadata(path).ok()?.modified().ok()?;
    SystemTime::now().duration_since(modified).ok()
}

#[cfg(target_os = "linux")]
fn is_process_alive(pid: u32) -> bool {
    Path::new("/proc").join(pid.to_string()).exists()
}

/// Without a cheap liveness check, assume the holder is alive; the user can
/// delete the lock file by hand.
#[cfg(not(target_os = "linux"))]
fn is_process_alive(_pid: u32) -> bool {
    true
}
