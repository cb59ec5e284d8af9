//! One-shot POSIX interval timer that signals one receiver thread.

use crate::Result;
use nix::errno::Errno;
use nix::libc;
use nix::sys::signal::Signal;
use std::time::Duration;

/// A `CLOCK_REALTIME` timer delivering `signal` to the thread `receiver` when it expires.
///
/// Arming and disarming are single `timer_settime` calls and may be issued from a signal
/// handler.
#[derive(Debug)]
pub struct Timer {
    id: libc::timer_t,
    timeout: Duration,
}

// `timer_t` is an opaque kernel id; the timer syscalls are thread safe.
unsafe impl Send for Timer {}
unsafe impl Sync for Timer {}

impl Timer {
    /// Create a disarmed timer firing `timeout` after each `start`.
    pub fn new(signal: Signal, receiver: libc::pid_t, timeout: Duration) -> Result<Self> {
        let mut ev: libc::sigevent = unsafe { std::mem::zeroed() };
        ev.sigev_notify = libc::SIGEV_SIGNAL | libc::SIGEV_THREAD_ID;
        ev.sigev_signo = signal as libc::c_int;
        ev.sigev_notify_thread_id = receiver;
        let mut id: libc::timer_t = std::ptr::null_mut();
        Errno::result(unsafe { libc::timer_create(libc::CLOCK_REALTIME, &mut ev, &mut id) })?;
        Ok(Timer { id, timeout })
    }

    fn arm(&self, value: Duration) -> Result<()> {
        // A zero interval makes the timer one-shot, a zero value disarms it.
        let mut spec: libc::itimerspec = unsafe { std::mem::zeroed() };
        spec.it_value.tv_sec = value.as_secs() as libc::time_t;
        spec.it_value.tv_nsec = value.subsec_nanos() as _;
        Errno::result(unsafe { libc::timer_settime(self.id, 0, &spec, std::ptr::null_mut()) })?;
        Ok(())
    }

    /// Fire once after the configured timeout.
    #[inline]
    pub fn start(&self) -> Result<()> {
        self.arm(self.timeout)
    }

    /// Cancel a pending expiration.
    #[inline]
    pub fn stop(&self) -> Result<()> {
        self.arm(Duration::from_secs(0))
    }

    /// Whether an expiration is pending.
    pub fn is_armed(&self) -> Result<bool> {
        let mut cur: libc::itimerspec = unsafe { std::mem::zeroed() };
        Errno::result(unsafe { libc::timer_gettime(self.id, &mut cur) })?;
        Ok(cur.it_value.tv_sec != 0 || cur.it_value.tv_nsec != 0)
    }

    /// Configured timeout.
    #[inline]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        let _ = self.stop();
        unsafe {
            libc::timer_delete(self.id);
        }
    }
}
