//! epoll-backed I/O manager
//!
//! [`IoManager`] is a scheduler whose idle fibers block in `epoll_wait`
//! instead of spinning. Fibers and callbacks register interest in a file
//! descriptor becoming readable or writable; when it does, the registered
//! target is scheduled. Expired timers are turned into scheduled callbacks
//! by the same wait loop.

mod fd;
mod reactor;

pub use reactor::IoManager;

use std::fmt;

/// Readiness kinds a fiber can wait for
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Event {
    /// The descriptor is readable
    Read,
    /// The descriptor is writable
    Write,
}

impl Event {
    /// Both kinds, in trigger order
    pub const ALL: [Event; 2] = [Event::Read, Event::Write];

    /// The epoll flag for this kind
    pub(crate) fn bits(self) -> u32 {
        match self {
            Event::Read => libc::EPOLLIN as u32,
            Event::Write => libc::EPOLLOUT as u32,
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::Read => f.write_str("READ"),
            Event::Write => f.write_str("WRITE"),
        }
    }
}

/// Render an epoll event mask as `EPOLLIN|EPOLLET` style text
pub(crate) struct EventMask(pub(crate) u32);

impl fmt::Display for EventMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(i32, &str); 6] = [
            (libc::EPOLLIN, "EPOLLIN"),
            (libc::EPOLLOUT, "EPOLLOUT"),
            (libc::EPOLLERR, "EPOLLERR"),
            (libc::EPOLLHUP, "EPOLLHUP"),
            (libc::EPOLLRDHUP, "EPOLLRDHUP"),
            (libc::EPOLLET, "EPOLLET"),
        ];
        if self.0 == 0 {
            return f.write_str("0");
        }
        let mut first = true;
        for (flag, name) in NAMES {
            if self.0 & flag as u32 != 0 {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_bits() {
        assert_eq!(Event::Read.bits(), libc::EPOLLIN as u32);
        assert_eq!(Event::Write.bits(), libc::EPOLLOUT as u32);
        assert_eq!(Event::Read.to_string(), "READ");
    }

    #[test]
    fn test_event_mask_display() {
        let mask = (libc::EPOLLIN | libc::EPOLLET) as u32;
        assert_eq!(EventMask(mask).to_string(), "EPOLLIN|EPOLLET");
        assert_eq!(EventMask(0).to_string(), "0");
    }
}
