use std::fmt;

/// Readiness delivered to an [`EventHandler`] by the loop thread.
///
/// A thin view over the epoll readiness bits of one dispatched entry.
/// Registrations are edge-triggered, so a readiness kind is reported once
/// per transition and the handler must drain the descriptor to exhaustion
/// before the kind is reported again.
///
/// [`EventHandler`]: crate::EventHandler
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct Ready(pub(crate) u32);

impl Ready {
    /// Returns true if the event contains readable readiness.
    #[inline]
    pub fn is_readable(self) -> bool {
        (self.0 as libc::c_int & libc::EPOLLIN) != 0
            || (self.0 as libc::c_int & libc::EPOLLPRI) != 0
    }

    /// Returns true if the event contains writable readiness.
    #[inline]
    pub fn is_writable(self) -> bool {
        (self.0 as libc::c_int & libc::EPOLLOUT) != 0
    }

    /// Returns true if the event contains error readiness.
    ///
    /// The socket also receives a readable or writable event; reading or
    /// writing to it will surface the error itself.
    #[inline]
    pub fn is_error(self) -> bool {
        (self.0 as libc::c_int & libc::EPOLLERR) != 0
    }

    /// Returns true if the peer closed its write half, or the whole
    /// connection is down.
    #[inline]
    pub fn is_read_closed(self) -> bool {
        // Both halves of the socket have closed.
        self.0 as libc::c_int & libc::EPOLLHUP != 0
            // Socket has received FIN or called shutdown(SHUT_RD).
            || (self.0 as libc::c_int & libc::EPOLLIN != 0
                && self.0 as libc::c_int & libc::EPOLLRDHUP != 0)
    }

    /// Returns true if our write half can no longer make progress.
    #[inline]
    pub fn is_write_closed(self) -> bool {
        // Both halves of the socket have closed.
        self.0 as libc::c_int & libc::EPOLLHUP != 0
            || (self.0 as libc::c_int & libc::EPOLLOUT != 0
                && self.0 as libc::c_int & libc::EPOLLERR != 0)
            || self.0 as libc::c_int == libc::EPOLLERR
    }
}

impl fmt::Debug for Ready {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = fmt.debug_struct("Ready");
        d.field("readable", &self.is_readable())
            .field("writable", &self.is_writable())
            .field("error", &self.is_error())
            .field("read_closed", &self.is_read_closed())
            .field("write_closed", &self.is_write_closed())
            .finish()
    }
}
