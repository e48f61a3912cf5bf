//! The event reactor: a readiness-multiplexing loop over `mio::Poll`.
//!
//! Exactly one reactor thread exists; it owns all socket I/O, parsing,
//! routing dispatch, and response draining. Registered handlers must not
//! block and must return promptly — anything slow belongs on a container
//! worker thread.
//!
//! Container workers produce response bytes asynchronously, so the loop
//! also carries a [`Notifier`]: a `Send + Sync` handle that marks a
//! connection as having drainable output and wakes the poll. Marked
//! connections get a writable dispatch once per iteration, which is the
//! edge-triggered equivalent of the level-triggered write readiness the
//! drain logic was designed around.

pub mod collector;

use std::cell::RefCell;
use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};
use tracing::{error, trace};

use crate::errors::ServerError;
use crate::reactor::collector::Collector;

const WAKER_TOKEN: Token = Token(usize::MAX);
const POLL_TIMEOUT: Duration = Duration::from_millis(250);
const EVENT_CAPACITY: usize = 64;

/// Event classes a handler can watch a descriptor for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchClass {
    Read,
    Write,
    /// Peer closed its end (hangup).
    Hangup,
}

/// Per-descriptor event callbacks. One handler serves all classes
/// registered for its descriptor.
pub trait FdHandler {
    fn on_readable(&mut self) {}
    fn on_writable(&mut self) {}
    fn on_hangup(&mut self) {}
}

/// Registration entry. The handler reference is non-owning: descriptors
/// are owned by whatever registered them (server, connection table), and
/// a stale entry is simply skipped at dispatch.
struct Watch {
    handler: Weak<RefCell<dyn FdHandler>>,
    read: bool,
    write: bool,
    hangup: bool,
}

impl Watch {
    fn interests(&self) -> Option<Interest> {
        // Hangup events ride on read interest with epoll.
        let mut interests = None;
        if self.read || self.hangup {
            interests = Some(Interest::READABLE);
        }
        if self.write {
            interests = Some(match interests {
                Some(i) => i | Interest::WRITABLE,
                None => Interest::WRITABLE,
            });
        }
        interests
    }

    fn set(&mut self, class: WatchClass, enabled: bool) {
        match class {
            WatchClass::Read => self.read = enabled,
            WatchClass::Write => self.write = enabled,
            WatchClass::Hangup => self.hangup = enabled,
        }
    }

    fn is_empty(&self) -> bool {
        !(self.read || self.write || self.hangup)
    }
}

/// Cross-thread handle for announcing "this connection has new bytes to
/// drain". Cheap to clone; safe to use from container workers.
#[derive(Clone)]
pub struct Notifier {
    waker: Arc<Waker>,
    ready: Arc<Mutex<Vec<RawFd>>>,
}

impl Notifier {
    pub fn notify_writable(&self, fd: RawFd) {
        {
            let mut ready = self.ready.lock().unwrap_or_else(|e| e.into_inner());
            if !ready.contains(&fd) {
                ready.push(fd);
            }
        }
        if let Err(e) = self.waker.wake() {
            error!("wake failed: {e}");
        }
    }
}

pub struct EventLoop {
    poll: RefCell<Poll>,
    waker: Arc<Waker>,
    watches: RefCell<HashMap<RawFd, Watch>>,
    write_ready: Arc<Mutex<Vec<RawFd>>>,
    collector: Collector,
    stop: Arc<AtomicBool>,
}

impl EventLoop {
    pub fn new() -> Result<Self, ServerError> {
        let poll = Poll::new().map_err(|e| ServerError::sys("epoll_create", e))?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)
            .map_err(|e| ServerError::sys("eventfd", e))?;
        Ok(Self {
            poll: RefCell::new(poll),
            waker: Arc::new(waker),
            watches: RefCell::new(HashMap::new()),
            write_ready: Arc::new(Mutex::new(Vec::new())),
            collector: Collector::new(),
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Registers `handler` for one event class on `fd`. Idempotent per
    /// `(fd, class)`; classes merge into a single registration per fd,
    /// and the handler passed last wins for all of them.
    pub fn add_watch(
        &self,
        fd: RawFd,
        class: WatchClass,
        handler: Rc<RefCell<dyn FdHandler>>,
    ) -> Result<(), ServerError> {
        let mut watches = self.watches.borrow_mut();
        let existed = watches.contains_key(&fd);
        let watch = watches.entry(fd).or_insert_with(|| Watch {
            handler: Rc::downgrade(&handler),
            read: false,
            write: false,
            hangup: false,
        });
        watch.handler = Rc::downgrade(&handler);
        let before = watch.interests();
        watch.set(class, true);
        let after = watch.interests();

        if before != after {
            if let Err(e) = self.apply_registration(fd, existed, after) {
                if !existed {
                    watches.remove(&fd);
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// Unregisters one class; once no class remains for `fd`, the
    /// descriptor is removed entirely. Unknown descriptors are a no-op.
    pub fn remove_watch(&self, fd: RawFd, class: WatchClass) -> Result<(), ServerError> {
        let mut watches = self.watches.borrow_mut();
        let Some(watch) = watches.get_mut(&fd) else {
            return Ok(());
        };
        let before = watch.interests();
        watch.set(class, false);
        let after = watch.interests();

        if watch.is_empty() {
            watches.remove(&fd);
        }
        if before != after {
            self.apply_registration(fd, true, after)?;
        }
        Ok(())
    }

    /// Removes every watch for `fd` (used when closing a descriptor).
    pub fn remove_fd(&self, fd: RawFd) {
        let had = self.watches.borrow_mut().remove(&fd).is_some();
        if had {
            let poll = self.poll.borrow();
            if let Err(e) = poll.registry().deregister(&mut SourceFd(&fd)) {
                error!("epoll_ctl failed deregistering fd {fd}: {e}");
            }
        }
    }

    fn apply_registration(
        &self,
        fd: RawFd,
        existed: bool,
        interests: Option<Interest>,
    ) -> Result<(), ServerError> {
        let poll = self.poll.borrow();
        let registry = poll.registry();
        let token = Token(fd as usize);
        let result = match (existed, interests) {
            (false, Some(i)) => registry.register(&mut SourceFd(&fd), token, i),
            (true, Some(i)) => registry.reregister(&mut SourceFd(&fd), token, i),
            (true, None) => registry.deregister(&mut SourceFd(&fd)),
            (false, None) => Ok(()),
        };
        result.map_err(|e| {
            error!("epoll_ctl failed for fd {fd}: {e}");
            ServerError::sys("epoll_ctl", e)
        })
    }

    /// Hands an object to the collector, deferring its drop to the end of
    /// the current (or next) reactor iteration.
    pub fn schedule_retire(&self, obj: Rc<dyn std::any::Any>) {
        self.collector.schedule_retire(obj);
    }

    pub fn collector(&self) -> &Collector {
        &self.collector
    }

    /// A `Send + Sync` handle for worker threads to request write
    /// dispatch on a connection.
    pub fn notifier(&self) -> Notifier {
        Notifier {
            waker: self.waker.clone(),
            ready: self.write_ready.clone(),
        }
    }

    /// The stop flag, suitable for `signal_hook::flag::register`.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    /// Requests loop exit after the current iteration.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Err(e) = self.waker.wake() {
            error!("wake failed: {e}");
        }
    }

    /// Runs the dispatch loop until [`stop`](Self::stop) or a genuine
    /// multiplexing failure. Each iteration: poll with a bounded timeout,
    /// dispatch ready descriptors, dispatch worker-notified writables,
    /// then flush the collector.
    pub fn run(&self) -> Result<(), ServerError> {
        let mut events = Events::with_capacity(EVENT_CAPACITY);

        while !self.stop.load(Ordering::Relaxed) {
            {
                let mut poll = self.poll.borrow_mut();
                match poll.poll(&mut events, Some(POLL_TIMEOUT)) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        error!("epoll_wait failed: {e}");
                        return Err(ServerError::sys("epoll_wait", e));
                    }
                }
            }

            for event in events.iter() {
                if event.token() == WAKER_TOKEN {
                    continue;
                }
                let fd = event.token().0 as RawFd;

                if event.is_readable() {
                    if let Some(handler) = self.handler_for(fd, WatchClass::Read) {
                        handler.borrow_mut().on_readable();
                    }
                }
                if event.is_writable() {
                    if let Some(handler) = self.handler_for(fd, WatchClass::Write) {
                        handler.borrow_mut().on_writable();
                    }
                }
                if event.is_read_closed() {
                    if let Some(handler) = self.handler_for(fd, WatchClass::Hangup) {
                        handler.borrow_mut().on_hangup();
                    }
                }
            }

            for fd in self.take_write_ready() {
                // Worker-produced bytes: drain regardless of whether the
                // connection armed write interest.
                let handler = {
                    let watches = self.watches.borrow();
                    watches.get(&fd).and_then(|w| w.handler.upgrade())
                };
                if let Some(handler) = handler {
                    trace!("draining worker-notified fd {fd}");
                    handler.borrow_mut().on_writable();
                }
            }

            self.collector.collect();
        }
        Ok(())
    }

    /// Upgrades the handler for `fd` if that class is still watched.
    /// Looked up per class so a handler that removed itself mid-event is
    /// not dispatched again; stale (dropped) handlers are skipped.
    fn handler_for(&self, fd: RawFd, class: WatchClass) -> Option<Rc<RefCell<dyn FdHandler>>> {
        let watches = self.watches.borrow();
        let watch = watches.get(&fd)?;
        let wanted = match class {
            WatchClass::Read => watch.read,
            WatchClass::Write => watch.write,
            WatchClass::Hangup => watch.hangup,
        };
        if !wanted {
            return None;
        }
        watch.handler.upgrade()
    }

    fn take_write_ready(&self) -> Vec<RawFd> {
        let mut ready = self.write_ready.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::take(&mut *ready)
    }
}
