#![deny(unsafe_code)]

//! # Overview
//!
//! A process-wide table of live worker threads, each tagged with a
//! [`Class`] (transport-plane vs. control-plane) and a human-readable name,
//! plus a cooperative "begin shutdown" flag that lets control-plane workers
//! ask transport-plane workers to wind down without tearing down shared
//! buffers out from under them.
//!
//! # Design
//!
//! [`Registry::global`] is the single process-scoped singleton (the
//! workspace's only global, per the "Global mutable state" design note).
//! [`Registry::spawn`] reserves a slot, starts a detached [`std::thread`],
//! and hands the routine an opaque [`Handle`] — an index into the table,
//! not a reference to the registry or the thread itself. This breaks the
//! cyclic ownership the original implementation had (each worker held a
//! pointer back to its owner, which held the worker's join state): a worker
//! only ever needs its own `Handle` to call [`Registry::should_exit`], and
//! the table only ever needs the handle to mark a slot free again.
//!
//! # Invariants
//!
//! - [`Registry::should_exit`] for [`Class::Control`] is true once shutdown
//!   has begun.
//! - [`Registry::should_exit`] for [`Class::Transport`] is true only once
//!   shutdown has begun **and** no [`Class::Transport`] worker remains
//!   registered, so a watchdog or orchestrator thread cannot race ahead of
//!   the send/receive/crypto threads it is waiting on.
//! - Registration fails (and is fatal to the caller) once the fixed-size
//!   table is full.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, OnceLock};
use std::thread;
use std::time::Duration;

/// Maximum number of concurrently registered worker threads.
pub const CAPACITY: usize = 256;

/// Which half of the pipeline a worker belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Class {
    /// Moves or transforms transfer bytes: `sender_thread`, `receiver_thread`,
    /// crypto workers, the watchdog.
    Transport,
    /// Everything else: protocol drivers, the session orchestrator.
    Control,
}

/// An opaque reference to a registered worker's slot.
///
/// Carries only a table index and a generation counter so a stale handle
/// (from a slot that has since been reused) is detected rather than
/// silently operating on the wrong worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handle {
    index: usize,
    generation: u32,
}

/// Errors returned by registry operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The fixed-capacity table has no free slot.
    #[error("thread registry is full (capacity {CAPACITY})")]
    TableFull,
    /// An operation named a handle whose slot has since been reused.
    #[error("stale thread registry handle")]
    StaleHandle,
}

struct Slot {
    used: bool,
    generation: u32,
    class: Class,
    name: String,
}

/// The process-wide thread registry.
pub struct Registry {
    slots: Mutex<Vec<Slot>>,
    transport_count: AtomicUsize,
    control_count: AtomicUsize,
    shutdown: AtomicBool,
    idle: Condvar,
}

impl Registry {
    fn new() -> Self {
        let slots = (0..CAPACITY)
            .map(|_| Slot {
                used: false,
                generation: 0,
                class: Class::Control,
                name: String::new(),
            })
            .collect();
        Self {
            slots: Mutex::new(slots),
            transport_count: AtomicUsize::new(0),
            control_count: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
            idle: Condvar::new(),
        }
    }

    /// Returns the single process-wide registry, creating it on first use.
    pub fn global() -> &'static Registry {
        static REGISTRY: OnceLock<Registry> = OnceLock::new();
        REGISTRY.get_or_init(Registry::new)
    }

    fn reserve(&self, name: &str, class: Class) -> Result<Handle, Error> {
        let mut slots = self.slots.lock().unwrap();
        let index = slots.iter().position(|s| !s.used).ok_or(Error::TableFull)?;
        let slot = &mut slots[index];
        slot.used = true;
        slot.generation = slot.generation.wrapping_add(1);
        slot.class = class;
        slot.name = name.to_string();
        let handle = Handle {
            index,
            generation: slot.generation,
        };
        drop(slots);
        match class {
            Class::Transport => self.transport_count.fetch_add(1, Ordering::SeqCst),
            Class::Control => self.control_count.fetch_add(1, Ordering::SeqCst),
        };
        Ok(handle)
    }

    /// Spawns `routine` on a new detached OS thread, registering it under
    /// `name`/`class` before the thread starts and unregistering it
    /// automatically (even on panic) once `routine` returns.
    pub fn spawn<F>(&'static self, name: impl Into<String>, class: Class, routine: F) -> Result<Handle, Error>
    where
        F: FnOnce(Handle) + Send + 'static,
    {
        let name = name.into();
        let handle = self.reserve(&name, class)?;
        tracing::debug!(thread = %name, ?class, "registered worker");
        thread::Builder::new()
            .name(name)
            .spawn(move || {
                let guard = UnregisterGuard {
                    registry: self,
                    handle,
                };
                routine(handle);
                drop(guard);
            })
            .expect("failed to spawn OS thread");
        Ok(handle)
    }

    /// Marks `handle`'s slot free. Idempotent if called twice is not
    /// supported: calling it on an already-freed slot is a logic error and
    /// returns [`Error::StaleHandle`].
    pub fn unregister(&self, handle: Handle) -> Result<(), Error> {
        let class = {
            let mut slots = self.slots.lock().unwrap();
            let slot = slots.get_mut(handle.index).ok_or(Error::StaleHandle)?;
            if !slot.used || slot.generation != handle.generation {
                return Err(Error::StaleHandle);
            }
            slot.used = false;
            slot.class
        };
        match class {
            Class::Transport => self.transport_count.fetch_sub(1, Ordering::SeqCst),
            Class::Control => self.control_count.fetch_sub(1, Ordering::SeqCst),
        };
        self.idle.notify_all();
        Ok(())
    }

    /// Number of currently registered workers of `class`.
    pub fn count(&self, class: Class) -> usize {
        match class {
            Class::Transport => self.transport_count.load(Ordering::SeqCst),
            Class::Control => self.control_count.load(Ordering::SeqCst),
        }
    }

    /// Flips the cooperative shutdown flag. One-way: there is no
    /// `end_shutdown`.
    pub fn begin_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.idle.notify_all();
    }

    /// Whether shutdown has begun.
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Whether a worker of `class` should exit its loop now.
    ///
    /// `Class::Control` workers exit as soon as shutdown begins.
    /// `Class::Transport` workers also wait for every other transport
    /// worker to have unregistered, so the last one to notice shutdown
    /// does not tear down a buffer a sibling is still touching.
    pub fn should_exit(&self, class: Class) -> bool {
        if !self.is_shutting_down() {
            return false;
        }
        match class {
            Class::Control => true,
            Class::Transport => self.count(Class::Transport) == 0,
        }
    }

    /// Blocks the calling thread until every `Class::Transport` worker has
    /// unregistered, or `timeout` elapses. Returns `true` if the wait ended
    /// because the count reached zero.
    pub fn wait_for_transport_drain(&self, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        let guard = self.slots.lock().unwrap();
        let (_guard, result) = self
            .idle
            .wait_timeout_while(guard, timeout, |_| {
                self.count(Class::Transport) != 0 && std::time::Instant::now() < deadline
            })
            .unwrap();
        !result.timed_out() || self.count(Class::Transport) == 0
    }
}

struct UnregisterGuard {
    registry: &'static Registry,
    handle: Handle,
}

impl Drop for UnregisterGuard {
    fn drop(&mut self) {
        let _ = self.registry.unregister(self.handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn fresh_registry() -> Registry {
        Registry::new()
    }

    #[test]
    fn spawn_registers_and_unregister_guard_clears_on_return() {
        let registry: &'static Registry = Box::leak(Box::new(fresh_registry()));
        let (tx, rx) = mpsc::channel();
        registry
            .spawn("worker", Class::Transport, move |_handle| {
                tx.send(()).unwrap();
            })
            .unwrap();
        rx.recv_timeout(Duration::from_secs(1)).unwrap();
        // Give the guard's Drop a moment to run after the closure returns.
        for _ in 0..1000 {
            if registry.count(Class::Transport) == 0 {
                break;
            }
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(registry.count(Class::Transport), 0);
    }

    #[test]
    fn should_exit_waits_for_transport_drain() {
        let registry: &'static Registry = Box::leak(Box::new(fresh_registry()));
        let handle = registry.reserve("transport-worker", Class::Transport).unwrap();
        registry
            .reserve("control-worker", Class::Control)
            .unwrap();

        registry.begin_shutdown();
        assert!(registry.should_exit(Class::Control));
        assert!(!registry.should_exit(Class::Transport));

        registry.unregister(handle).unwrap();
        assert!(registry.should_exit(Class::Transport));
    }

    #[test]
    fn stale_handle_is_rejected() {
        let registry: &'static Registry = Box::leak(Box::new(fresh_registry()));
        let handle = registry.reserve("one-shot", Class::Control).unwrap();
        registry.unregister(handle).unwrap();
        assert!(matches!(registry.unregister(handle), Err(Error::StaleHandle)));
    }

    #[test]
    fn table_full_is_reported() {
        let registry: &'static Registry = Box::leak(Box::new(fresh_registry()));
        for i in 0..CAPACITY {
            registry.reserve(&format!("w{i}"), Class::Control).unwrap();
        }
        assert!(matches!(registry.reserve("overflow", Class::Control), Err(Error::TableFull)));
    }
}
