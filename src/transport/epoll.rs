use std::{
    io,
    mem::MaybeUninit,
    os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd},
    time::Duration,
};

const MAX_NUM_EVENTS: usize = 512;

/// What a registered descriptor is waited on for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Interest {
    Readable,
    Writable,
}

impl Interest {
    fn flags(self) -> u32 {
        match self {
            Interest::Readable => (libc::EPOLLIN | libc::EPOLLRDHUP) as u32,
            Interest::Writable => libc::EPOLLOUT as u32,
        }
    }
}

pub(super) struct Epoll {
    fd: OwnedFd,
    events: Box<[MaybeUninit<libc::epoll_event>; MAX_NUM_EVENTS]>,
}

impl Epoll {
    pub fn new() -> io::Result<Self> {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };

        if fd == -1 {
            return Err(io::Error::last_os_error());
        }

        Ok(Self {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
            events: Box::new([MaybeUninit::uninit(); MAX_NUM_EVENTS]),
        })
    }

    fn ctl(&self, op: i32, fd: RawFd, interest: Interest, data: u64) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: interest.flags(),
            u64: data,
        };

        let ret = unsafe { libc::epoll_ctl(self.fd.as_raw_fd(), op, fd, &mut event) };

        if ret == -1 {
            return Err(io::Error::last_os_error());
        }

        Ok(())
    }

    pub fn add(&self, fd: RawFd, interest: Interest, data: u64) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, interest, data)
    }

    pub fn modify(&self, fd: RawFd, interest: Interest, data: u64) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, interest, data)
    }

    pub fn delete(&self, fd: RawFd) -> io::Result<()> {
        let ret = unsafe {
            libc::epoll_ctl(
                self.fd.as_raw_fd(),
                libc::EPOLL_CTL_DEL,
                fd,
                std::ptr::null_mut(),
            )
        };

        if ret == -1 {
            return Err(io::Error::last_os_error());
        }

        Ok(())
    }

    /// Wait for events, returning the user data of every ready descriptor.
    pub fn wait(&mut self, timeout: Duration) -> io::Result<impl Iterator<Item = u64> + '_> {
        let timeout = timeout.as_millis().min(i32::MAX as u128) as i32;

        let n = unsafe {
            libc::epoll_wait(
                self.fd.as_raw_fd(),
                self.events.as_mut_ptr() as *mut _,
                MAX_NUM_EVENTS as i32,
                timeout,
            )
        };

        if n == -1 {
            return Err(io::Error::last_os_error());
        }

        Ok(self
            .events
            .iter()
            .take(n as usize)
            .map(|x| unsafe { x.assume_init() }.u64))
    }
}
