use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Detach into the background.
///
/// Does nothing when the parent is already init. Otherwise forks twice
/// around `setsid`, changes into `working_dir`, sets the umask to `027` and
/// points stdin, stdout and stderr at `/dev/null`.
///
/// Call before any runtime threads exist.
pub fn daemonize(working_dir: &Path) -> io::Result<()> {
    if unsafe { libc::getppid() } == 1 {
        return Ok(());
    }

    fork_and_exit_parent()?;
    if unsafe { libc::setsid() } == -1 {
        return Err(io::Error::last_os_error());
    }
    fork_and_exit_parent()?;

    std::env::set_current_dir(working_dir)?;
    unsafe {
        libc::umask(0o027);
    }
    redirect_stdio()
}

fn fork_and_exit_parent() -> io::Result<()> {
    match unsafe { libc::fork() } {
        -1 => Err(io::Error::last_os_error()),
        0 => Ok(()),
        _ => unsafe { libc::_exit(0) },
    }
}

fn redirect_stdio() -> io::Result<()> {
    let devnull = OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/null")?;
    for fd in [libc::STDIN_FILENO, libc::STDOUT_FILENO, libc::STDERR_FILENO] {
        if unsafe { libc::dup2(devnull.as_raw_fd(), fd) } == -1 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// PID file handle that maintains an exclusive lock
pub struct PidFile {
    path: PathBuf,
    _file: File,
}

impl PidFile {
    pub fn create(path: &Path) -> anyhow::Result<Self> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        // Try to acquire exclusive lock (non-blocking)
        let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if result != 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                anyhow::bail!("Another instance is already running (PID file is locked)");
            }
            return Err(err.into());
        }

        // Only truncate once the lock is ours
        file.set_len(0)?;
        writeln!(&file, "{}", std::process::id())?;

        Ok(Self {
            path: path.to_path_buf(),
            _file: file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Delete the file and release the lock
    pub fn remove(self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "Failed to remove PID file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pid_file_records_pid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cgi-prefork.pid");

        let pid_file = PidFile::create(&path).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.trim(), std::process::id().to_string());
        assert_eq!(pid_file.path(), path.as_path());

        pid_file.remove();
        assert!(!path.exists());
    }

    #[test]
    fn test_second_instance_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cgi-prefork.pid");

        let first = PidFile::create(&path).unwrap();
        let err = PidFile::create(&path).err().unwrap();
        assert!(err.to_string().contains("already running"));

        // The refused attempt must not clobber the holder's PID
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.trim(), std::process::id().to_string());

        drop(first);
        assert!(PidFile::create(&path).is_ok());
    }
}
