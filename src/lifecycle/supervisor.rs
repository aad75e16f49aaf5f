//! Parent process supervision.
//!
//! # Responsibilities
//! - Notice when the owning process dies, even abnormally
//! - Pick the best detection strategy the platform offers at runtime
//!
//! # Strategies, in preference order
//! 1. Death signal: the kernel sends SIGUSR1 when the parent dies
//!    (`prctl(PR_SET_PDEATHSIG)`); delivery is handled by `Signals`
//! 2. Process-exit filter: a one-shot `kqueue` watch on the parent pid
//! 3. Polling: compare `getppid()` with the pid seen at startup

use std::time::Duration;

use futures_util::future::BoxFuture;
use nix::unistd::{getppid, Pid};
use tokio::time::{interval_at, Instant};

/// How often the polling strategy checks the parent pid.
pub const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// A way of learning that the parent has exited.
pub trait ParentWatch: Send {
    /// Short name for logs.
    fn strategy(&self) -> &'static str;

    /// Resolves once the parent is known to be gone.
    fn exited(&mut self) -> BoxFuture<'_, ()>;
}

/// Probe the strategies in order and return the first that can be armed.
pub fn supervise(parent: Pid) -> Box<dyn ParentWatch> {
    let watch: Box<dyn ParentWatch> = if let Some(watch) = DeathSignal::arm(parent) {
        Box::new(watch)
    } else if let Some(watch) = process_exit_filter(parent) {
        watch
    } else {
        Box::new(Polling::new(parent, POLL_INTERVAL))
    };

    tracing::info!(
        strategy = watch.strategy(),
        parent_pid = parent.as_raw(),
        "Watching parent process"
    );
    watch
}

/// Parent death delivered as SIGUSR1 by the kernel.
pub struct DeathSignal {
    parent: Pid,
}

impl DeathSignal {
    pub fn arm(parent: Pid) -> Option<Self> {
        #[cfg(any(target_os = "linux", target_os = "android"))]
        match nix::sys::prctl::set_pdeathsig(nix::sys::signal::Signal::SIGUSR1) {
            Ok(()) => return Some(Self { parent }),
            Err(e) => tracing::debug!(error = %e, "prctl(PR_SET_PDEATHSIG) unavailable"),
        }

        let _ = parent;
        None
    }
}

impl ParentWatch for DeathSignal {
    fn strategy(&self) -> &'static str {
        "death-signal"
    }

    fn exited(&mut self) -> BoxFuture<'_, ()> {
        let parent = self.parent;
        Box::pin(async move {
            // A parent that died before the signal was armed never sends it.
            if getppid() != parent {
                tracing::error!("Parent process exited before supervision started");
                return;
            }
            std::future::pending::<()>().await
        })
    }
}

/// Periodic `getppid()` comparison.
pub struct Polling {
    parent: Pid,
    every: Duration,
    current_parent: fn() -> Pid,
}

impl Polling {
    pub fn new(parent: Pid, every: Duration) -> Self {
        Self::with_probe(parent, every, getppid)
    }

    /// Poll with a custom parent-pid source.
    pub fn with_probe(parent: Pid, every: Duration, current_parent: fn() -> Pid) -> Self {
        Self {
            parent,
            every,
            current_parent,
        }
    }
}

impl ParentWatch for Polling {
    fn strategy(&self) -> &'static str {
        "polling"
    }

    fn exited(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let mut ticker = interval_at(Instant::now() + self.every, self.every);
            loop {
                ticker.tick().await;
                let current = (self.current_parent)();
                if current != self.parent {
                    tracing::error!(
                        expected = self.parent.as_raw(),
                        current = current.as_raw(),
                        "Parent process exited unexpectedly"
                    );
                    return;
                }
            }
        })
    }
}

#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
fn process_exit_filter(parent: Pid) -> Option<Box<dyn ParentWatch>> {
    kqueue::ProcessExitFilter::arm(parent).map(|watch| Box::new(watch) as Box<dyn ParentWatch>)
}

#[cfg(not(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
)))]
fn process_exit_filter(_parent: Pid) -> Option<Box<dyn ParentWatch>> {
    None
}

#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
mod kqueue {
    use std::os::fd::{AsFd, AsRawFd, RawFd};

    use futures_util::future::BoxFuture;
    use nix::sys::event::{EventFilter, EventFlag, FilterFlag, KEvent, Kqueue};
    use nix::unistd::Pid;
    use tokio::io::unix::AsyncFd;

    use super::{ParentWatch, Polling, POLL_INTERVAL};

    const NO_WAIT: libc::timespec = libc::timespec { tv_sec: 0, tv_nsec: 0 };

    struct KqueueFd(Kqueue);

    impl AsRawFd for KqueueFd {
        fn as_raw_fd(&self) -> RawFd {
            self.0.as_fd().as_raw_fd()
        }
    }

    /// One-shot `EVFILT_PROC`/`NOTE_EXIT` watch on the parent pid.
    pub struct ProcessExitFilter {
        parent: Pid,
        kq: AsyncFd<KqueueFd>,
    }

    impl ProcessExitFilter {
        pub fn arm(parent: Pid) -> Option<Self> {
            let kq = Kqueue::new()
                .map_err(|e| tracing::debug!(error = %e, "kqueue unavailable"))
                .ok()?;
            let watch = KEvent::new(
                parent.as_raw() as usize,
                EventFilter::EVFILT_PROC,
                EventFlag::EV_ADD | EventFlag::EV_ENABLE | EventFlag::EV_ONESHOT,
                FilterFlag::NOTE_EXIT,
                0,
                0,
            );
            kq.kevent(&[watch], &mut [], Some(NO_WAIT))
                .map_err(|e| tracing::debug!(error = %e, "Unable to watch parent with kqueue"))
                .ok()?;
            let kq = AsyncFd::new(KqueueFd(kq))
                .map_err(|e| tracing::debug!(error = %e, "Unable to register kqueue"))
                .ok()?;
            Some(Self { parent, kq })
        }

        fn parent_exited(&self) -> bool {
            let mut fired = [KEvent::new(
                0,
                EventFilter::EVFILT_PROC,
                EventFlag::empty(),
                FilterFlag::empty(),
                0,
                0,
            )];
            match self.kq.get_ref().0.kevent(&[], &mut fired, Some(NO_WAIT)) {
                Ok(1) => {
                    fired[0].ident() == self.parent.as_raw() as usize
                        && fired[0].fflags().contains(FilterFlag::NOTE_EXIT)
                }
                _ => false,
            }
        }
    }

    impl ParentWatch for ProcessExitFilter {
        fn strategy(&self) -> &'static str {
            "kqueue"
        }

        fn exited(&mut self) -> BoxFuture<'_, ()> {
            Box::pin(async move {
                loop {
                    let mut guard = match self.kq.readable().await {
                        Ok(guard) => guard,
                        Err(e) => {
                            tracing::warn!(error = %e, "kqueue wait failed, falling back to polling");
                            return Polling::new(self.parent, POLL_INTERVAL).exited().await;
                        }
                    };
                    if self.parent_exited() {
                        tracing::error!("Parent process exited unexpectedly");
                        return;
                    }
                    guard.clear_ready();
                }
            })
        }
    }
}
