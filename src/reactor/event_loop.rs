// src/reactor/event_loop.rs

//! A single-threaded, readiness-driven event loop built on `mio`.
//!
//! Every channel registered with a loop has its callbacks invoked on the loop's own
//! thread. Other threads interact with the loop only by handing it work through
//! `queue_in_loop`/`run_in_loop`, which wakes the poller through a `mio::Waker`.

use super::channel::Channel;
use mio::{Events, Poll, Registry, Token, Waker};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::thread::{self, JoinHandle, ThreadId};
use tracing::{debug, error, warn};

/// Token reserved for the cross-thread waker.
const WAKE_TOKEN: Token = Token(0);
const EVENTS_CAPACITY: usize = 1024;

type Task = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct PendingTasks {
    tasks: Vec<Task>,
    /// Set once the loop has exited; later tasks are dropped instead of queued.
    stopped: bool,
}

struct Shared {
    name: String,
    registry: Registry,
    waker: Waker,
    pending: Mutex<PendingTasks>,
    /// Non-owning back-references used only to route readiness events.
    channels: Mutex<HashMap<Token, Weak<Channel>>>,
    next_token: AtomicUsize,
    thread_id: OnceLock<ThreadId>,
    quit: AtomicBool,
}

/// A cloneable handle to an event loop. It can be shared freely between threads.
#[derive(Clone)]
pub struct EventLoop {
    shared: Arc<Shared>,
}

impl EventLoop {
    fn new(name: String, poll: &Poll) -> io::Result<Self> {
        let registry = poll.registry().try_clone()?;
        let waker = Waker::new(poll.registry(), WAKE_TOKEN)?;
        Ok(Self {
            shared: Arc::new(Shared {
                name,
                registry,
                waker,
                pending: Mutex::new(PendingTasks::default()),
                channels: Mutex::new(HashMap::new()),
                next_token: AtomicUsize::new(WAKE_TOKEN.0 + 1),
                thread_id: OnceLock::new(),
                quit: AtomicBool::new(false),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Returns true when called from the thread running this loop.
    pub fn is_in_loop_thread(&self) -> bool {
        self.shared.thread_id.get() == Some(&thread::current().id())
    }

    /// Panics unless called from the loop thread.
    pub fn assert_in_loop_thread(&self) {
        assert!(
            self.is_in_loop_thread(),
            "event loop '{}' was accessed from foreign thread {:?}",
            self.shared.name,
            thread::current().id()
        );
    }

    /// Schedules `task` to run on the loop thread. The task is always deferred to the
    /// next loop iteration, even when the caller is already on the loop thread.
    ///
    /// If the loop has already stopped the task is dropped without running.
    pub fn queue_in_loop<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut pending = self.shared.pending.lock();
        if pending.stopped {
            drop(pending);
            debug!(
                "Event loop '{}' has stopped; dropping queued task.",
                self.shared.name
            );
            return;
        }
        pending.tasks.push(Box::new(task));
        drop(pending);
        self.wakeup();
    }

    /// Runs `task` immediately when called on the loop thread, otherwise queues it.
    pub fn run_in_loop<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_in_loop_thread() {
            task();
        } else {
            self.queue_in_loop(task);
        }
    }

    /// Asks the loop to exit after its current iteration. Tasks still queued at that
    /// point, and tasks queued afterwards, are dropped without running.
    pub fn quit(&self) {
        self.shared.quit.store(true, Ordering::Release);
        self.wakeup();
    }

    fn wakeup(&self) {
        if let Err(e) = self.shared.waker.wake() {
            warn!("Failed to wake event loop '{}': {}", self.shared.name, e);
        }
    }

    pub(crate) fn registry(&self) -> &Registry {
        &self.shared.registry
    }

    pub(crate) fn next_token(&self) -> Token {
        Token(self.shared.next_token.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn attach(&self, token: Token, channel: Weak<Channel>) {
        self.shared.channels.lock().insert(token, channel);
    }

    pub(crate) fn detach(&self, token: Token) {
        self.shared.channels.lock().remove(&token);
    }

    fn run(&self, mut poll: Poll) -> io::Result<()> {
        let _ = self.shared.thread_id.set(thread::current().id());
        let mut events = Events::with_capacity(EVENTS_CAPACITY);
        debug!("Event loop '{}' started.", self.shared.name);

        while !self.shared.quit.load(Ordering::Acquire) {
            if let Err(e) = poll.poll(&mut events, None) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(e);
            }

            for event in events.iter() {
                if event.token() == WAKE_TOKEN {
                    continue;
                }
                // The map lock must be released before dispatching: callbacks may
                // create or remove channels.
                let channel = self
                    .shared
                    .channels
                    .lock()
                    .get(&event.token())
                    .and_then(Weak::upgrade);
                if let Some(channel) = channel {
                    channel.handle_event(event);
                }
            }

            self.run_pending_tasks();
        }
        Ok(())
    }

    /// Marks the loop as stopped and drops whatever work is still queued.
    fn drain_on_exit(&self) {
        let leftover = {
            let mut pending = self.shared.pending.lock();
            pending.stopped = true;
            std::mem::take(&mut pending.tasks)
        };
        if !leftover.is_empty() {
            debug!(
                "Event loop '{}' dropping {} queued task(s) on exit.",
                self.shared.name,
                leftover.len()
            );
        }
        drop(leftover);
        debug!("Event loop '{}' stopped.", self.shared.name);
    }

    fn run_pending_tasks(&self) {
        // Swap the queue out so tasks can queue more work without deadlocking.
        let tasks = std::mem::take(&mut self.shared.pending.lock().tasks);
        for task in tasks {
            task();
        }
    }
}

/// Owns the OS thread that runs an `EventLoop`. Dropping it stops and joins the loop.
pub struct EventLoopThread {
    event_loop: EventLoop,
    handle: Option<JoinHandle<()>>,
}

impl EventLoopThread {
    /// Spawns a named thread and starts an event loop on it.
    pub fn spawn(name: impl Into<String>) -> io::Result<Self> {
        let name = name.into();
        let poll = Poll::new()?;
        let event_loop = EventLoop::new(name.clone(), &poll)?;

        let runner = event_loop.clone();
        let handle = thread::Builder::new().name(name).spawn(move || {
            let result = runner.run(poll);
            runner.drain_on_exit();
            if let Err(e) = result {
                error!("Event loop '{}' terminated: {}", runner.name(), e);
            }
        })?;
        let _ = event_loop.shared.thread_id.set(handle.thread().id());

        Ok(Self {
            event_loop,
            handle: Some(handle),
        })
    }

    pub fn event_loop(&self) -> &EventLoop {
        &self.event_loop
    }
}

impl Drop for EventLoopThread {
    fn drop(&mut self) {
        self.event_loop.quit();
        if let Some(handle) = self.handle.take() {
            if self.event_loop.is_in_loop_thread() {
                // Joining ourselves would deadlock; the loop exits on its own.
                return;
            }
            if handle.join().is_err() {
                error!("Event loop '{}' thread panicked.", self.event_loop.name());
            }
        }
    }
}
