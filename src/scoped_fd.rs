use std::os::unix::io::RawFd;

/// An owned file descriptor closed on drop. `-1` stands for "no fd".
pub struct ScopedFd {
    fd: RawFd,
}

impl ScopedFd {
    pub fn new() -> ScopedFd {
        ScopedFd { fd: -1 }
    }

    pub fn from_raw(fd: RawFd) -> ScopedFd {
        ScopedFd { fd }
    }

    pub fn is_open(&self) -> bool {
        self.fd >= 0
    }

    pub fn get(&self) -> RawFd {
        self.fd
    }

    /// Give up ownership without closing.
    pub fn extract(&mut self) -> RawFd {
        let result = self.fd;
        self.fd = -1;
        result
    }

    pub fn close(&mut self) {
        if self.fd >= 0 {
            // Nothing reasonable to do about a failed close here.
            let _ = nix::unistd::close(self.fd);
        }
        self.fd = -1;
    }
}

impl Default for ScopedFd {
    fn default() -> Self {
        ScopedFd::new()
    }
}

impl Drop for ScopedFd {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::fcntl::{fcntl, FcntlArg};

    #[test]
    fn close_forgets_the_fd() {
        let (read_fd, write_fd) = nix::unistd::pipe().unwrap();
        let mut scoped = ScopedFd::from_raw(read_fd);
        assert!(scoped.is_open());
        assert_eq!(scoped.get(), read_fd);
        scoped.close();
        assert!(!scoped.is_open());
        assert_eq!(scoped.get(), -1);
        let _ = nix::unistd::close(write_fd);
    }

    #[test]
    fn extract_disowns() {
        let (read_fd, write_fd) = nix::unistd::pipe().unwrap();
        let mut scoped = ScopedFd::from_raw(read_fd);
        assert_eq!(scoped.extract(), read_fd);
        assert!(!scoped.is_open());
        drop(scoped);
        assert!(fcntl(read_fd, FcntlArg::F_GETFD).is_ok());
        let _ = nix::unistd::close(read_fd);
        let _ = nix::unistd::close(write_fd);
    }
}
