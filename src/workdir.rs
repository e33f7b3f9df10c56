//! Shared temporary root holding one work directory per script.
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Parent of every `script-<name>` work directory in a suite run.
///
/// Each script releases its subtree when done; the root itself goes away
/// with the last release. Nothing is removed in preserve mode.
#[derive(Debug)]
pub struct WorkdirRoot {
    path: PathBuf,
    remaining: AtomicUsize,
    preserve: bool,
}

impl WorkdirRoot {
    /// Create a fresh root under the system temp dir, or use `explicit`.
    ///
    /// An explicit root always implies preserve mode.
    pub fn create(explicit: Option<&Path>, scripts: usize, preserve: bool) -> io::Result<Self> {
        let (path, preserve) = match explicit {
            Some(dir) => {
                fs::create_dir_all(dir)?;
                (dir.to_path_buf(), true)
            }
            None => {
                let dir = tempfile::Builder::new()
                    .prefix("escript")
                    .disable_cleanup(true)
                    .tempdir()?;
                (dir.path().to_path_buf(), preserve)
            }
        };
        // Resolve symlinked temp dirs (macOS) so $WORK matches what
        // subprocesses print.
        let path = path.canonicalize()?;
        Ok(WorkdirRoot {
            path,
            remaining: AtomicUsize::new(scripts),
            preserve,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn preserve(&self) -> bool {
        self.preserve
    }

    pub fn script_dir(&self, name: &str) -> PathBuf {
        self.path.join(format!("script-{name}"))
    }

    /// Remove one script's work directory and drop its reference.
    pub fn release(&self, work_dir: &Path) -> io::Result<()> {
        if self.preserve {
            return Ok(());
        }
        let removed = remove_all(work_dir);
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            tracing::debug!(root = %self.path.display(), "removing workdir root");
            fs::remove_dir(&self.path)?;
        }
        removed
    }
}

/// Remove a tree, first making read-only directories writable.
pub fn remove_all(dir: &Path) -> io::Result<()> {
    if !dir.exists() {
        return Ok(());
    }
    make_writable(dir);
    fs::remove_dir_all(dir)
}

fn make_writable(dir: &Path) {
    if let Ok(metadata) = fs::symlink_metadata(dir) {
        if !metadata.is_dir() {
            return;
        }
        let mut perms = metadata.permissions();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            perms.set_mode(0o777);
        }
        #[cfg(not(unix))]
        {
            #[allow(clippy::permissions_set_readonly_false)]
            perms.set_readonly(false);
        }
        let _ = fs::set_permissions(dir, perms);
    }
    if let Ok(entries) = fs::read_dir(dir) {
        for entry in entries.flatten() {
            make_writable(&entry.path());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_is_removed_after_last_release() {
        let root = WorkdirRoot::create(None, 2, false).expect("create root");
        let a = root.script_dir("a");
        let b = root.script_dir("b");
        fs::create_dir_all(a.join("nested")).expect("mkdir a");
        fs::create_dir_all(&b).expect("mkdir b");

        root.release(&a).expect("release a");
        assert!(!a.exists());
        assert!(root.path().exists());

        root.release(&b).expect("release b");
        assert!(!root.path().exists());
    }

    #[test]
    fn explicit_root_is_preserved() {
        let temp = tempfile::tempdir().expect("tempdir");
        let explicit = temp.path().join("keep");
        let root = WorkdirRoot::create(Some(&explicit), 1, false).expect("create root");
        assert!(root.preserve());
        let dir = root.script_dir("only");
        fs::create_dir_all(&dir).expect("mkdir");
        root.release(&dir).expect("release");
        assert!(dir.exists());
    }

    #[cfg(unix)]
    #[test]
    fn remove_all_handles_read_only_directories() {
        use std::os::unix::fs::PermissionsExt;
        let temp = tempfile::tempdir().expect("tempdir");
        let locked = temp.path().join("locked");
        fs::create_dir_all(locked.join("inner")).expect("mkdir");
        fs::write(locked.join("inner/file"), "x").expect("write");
        fs::set_permissions(locked.join("inner"), fs::Permissions::from_mode(0o555))
            .expect("chmod");
        remove_all(&locked).expect("remove");
        assert!(!locked.exists());
    }
}
