//! Stop-the-world rendezvous (§4.1): cooperative (yield-check) and uncooperative
//! (real-time signal) strategies for bringing every running thread to a safepoint.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::thread::ThreadHandle;

/// Which mechanism brings threads to a safepoint.
///
/// Fixed at `VMKit` construction (§4.1 design note: this is a plain enum, not a
/// trait object, so the hot safepoint path never pays for virtual dispatch).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RendezvousStrategy {
    /// Threads reach a safepoint only at compiler-inserted yield checks.
    Cooperative,
    /// Threads are brought to a safepoint by a reserved POSIX real-time signal.
    Uncooperative { signal: libc::c_int },
}

struct RvState {
    nb_joined: usize,
}

/// The stop-the-world coordinator owned by one `VMKit`.
pub struct Rendezvous {
    strategy: RendezvousStrategy,
    state: Mutex<RvState>,
    /// Signalled by `join`/`another_mark` when every expected thread has joined.
    cond_all_joined: Condvar,
    /// Signalled by `finish_rv` once the collection is over.
    cond_end_rv: Condvar,
    handler_installed: AtomicBool,
}

impl Rendezvous {
    pub fn new(strategy: RendezvousStrategy) -> Self {
        Self {
            strategy,
            state: Mutex::new(RvState { nb_joined: 0 }),
            cond_all_joined: Condvar::new(),
            cond_end_rv: Condvar::new(),
            handler_installed: AtomicBool::new(false),
        }
    }

    pub fn strategy(&self) -> RendezvousStrategy {
        self.strategy
    }

    /// Announce intent to start a collection. The actual safepoint request happens
    /// in `synchronize`; this only exists so `VMKit::start_collection` has a place
    /// to hang its "is one already running" check against `initiator.yield_requested()`
    /// before committing to drive one itself.
    pub fn start_rv(&self) {
        log::debug!("rendezvous: start_rv");
    }

    /// Abandon initiating a rendezvous because one is already in progress elsewhere;
    /// the caller will instead `join` as a participant.
    pub fn cancel_rv(&self) {
        log::debug!("rendezvous: cancel_rv (already in progress)");
    }

    /// Bring every other running thread to a safepoint. Caller (`VMKit::start_collection`)
    /// already holds the registry lock, so `running` is a stable snapshot.
    ///
    /// Returns once every thread in `running` other than `initiator` has observed
    /// the request and parked.
    pub fn synchronize(&self, initiator: &ThreadHandle, running: &[Arc<ThreadHandle>]) {
        let target = running.len();
        let mut state = self.state.lock();
        debug_assert_eq!(state.nb_joined, 0, "rendezvous already in progress");

        match self.strategy {
            RendezvousStrategy::Cooperative => {
                for t in running {
                    t.request_yield();
                }
                initiator.mark_joined_rv();
                for t in running {
                    if t.id() != initiator.id() && t.last_sp().is_some() {
                        state.nb_joined += 1;
                        t.mark_joined_rv();
                    }
                }
            }
            RendezvousStrategy::Uncooperative { signal } => {
                for t in running {
                    t.request_yield();
                    if t.id() == initiator.id() {
                        continue;
                    }
                    let rc = unsafe { libc::pthread_kill(t.pthread(), signal) };
                    if rc != 0 {
                        log::error!("pthread_kill failed delivering rendezvous signal: {rc}");
                        std::process::abort();
                    }
                }
                initiator.mark_joined_rv();
            }
        }

        // "Add myself": the initiator counts as joined immediately in both
        // strategies (it never calls `join` on itself), then waits for the rest.
        state.nb_joined += 1;
        while state.nb_joined != target {
            self.cond_all_joined.wait(&mut state);
        }
        state.nb_joined = 0;
    }

    /// Called by a participant thread that has observed a yield request — from a
    /// cooperative yield check or from the uncooperative signal handler. Parks
    /// until `finish_rv` broadcasts the end of the collection.
    pub fn join(&self, thread: &ThreadHandle) {
        thread.set_in_rv(true);
        {
            let mut state = self.state.lock();
            let old_sp = thread.last_sp();
            thread.set_last_sp(Some(approximate_frame_pointer()));
            if !thread.has_joined_rv() {
                thread.mark_joined_rv();
                state.nb_joined += 1;
                self.cond_all_joined.notify_all();
            }
            while thread.yield_requested() {
                self.cond_end_rv.wait(&mut state);
            }
            thread.set_last_sp(old_sp);
        }
        thread.set_in_rv(false);
    }

    /// Called by a cooperative VM immediately before entering a region of
    /// uncooperative native code, so a concurrent rendezvous does not need to wait
    /// for this thread to reach its next yield check.
    pub fn join_before_uncooperative(&self, thread: &ThreadHandle) {
        debug_assert!(
            thread.last_sp().is_some(),
            "SP must be set before entering uncooperative code"
        );
        thread.set_in_rv(true);
        {
            let mut state = self.state.lock();
            if thread.yield_requested() {
                if !thread.has_joined_rv() {
                    thread.mark_joined_rv();
                    state.nb_joined += 1;
                    self.cond_all_joined.notify_all();
                }
                while thread.yield_requested() {
                    self.cond_end_rv.wait(&mut state);
                }
            }
        }
        thread.set_in_rv(false);
    }

    /// Called by a cooperative VM immediately after leaving a region of
    /// uncooperative native code, recording the SP the thread had while in it.
    pub fn join_after_uncooperative(&self, thread: &ThreadHandle, sp: usize) {
        thread.set_in_rv(true);
        {
            let mut state = self.state.lock();
            if thread.yield_requested() {
                thread.set_last_sp(Some(sp));
                if !thread.has_joined_rv() {
                    thread.mark_joined_rv();
                    state.nb_joined += 1;
                    self.cond_all_joined.notify_all();
                }
                while thread.yield_requested() {
                    self.cond_end_rv.wait(&mut state);
                }
                thread.set_last_sp(None);
            }
        }
        thread.set_in_rv(false);
    }

    /// Called by the initiator once tracing, reference scanning and finalizer
    /// scanning are done. Clears every participant's rendezvous flags and wakes
    /// everyone parked in `join`.
    pub fn finish_rv(&self, initiator: &ThreadHandle, running: &[Arc<ThreadHandle>]) {
        for t in running {
            t.clear_yield();
            t.clear_joined_rv();
        }
        initiator.clear_yield();
        initiator.clear_joined_rv();
        self.cond_end_rv.notify_all();
    }

    /// Idempotent, once-per-thread installation of the uncooperative signal
    /// handler. Must be called on every thread before it can safely be a target of
    /// the rendezvous signal.
    ///
    /// If this thread's join counter is already nonzero when it gets around to
    /// installing the handler, a
    /// signal was already sent and lost racing with installation, so it joins the
    /// in-progress rendezvous immediately instead of waiting for a signal that will
    /// never arrive.
    pub fn prepare_for_join(&self, thread: &ThreadHandle) -> crate::error::Result<()> {
        let RendezvousStrategy::Uncooperative { signal } = self.strategy else {
            return Ok(());
        };

        install_signal_handler(signal)?;

        if self.state.lock().nb_joined != 0 {
            self.join(thread);
        }
        Ok(())
    }
}

fn install_signal_handler(signal: libc::c_int) -> crate::error::Result<()> {
    unsafe {
        let mut mask: libc::sigset_t = std::mem::zeroed();
        libc::sigfillset(&mut mask);
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = rendezvous_signal_handler as usize;
        sa.sa_mask = mask;
        sa.sa_flags = libc::SA_RESTART;
        if libc::sigaction(signal, &sa, std::ptr::null_mut()) != 0 {
            return Err(crate::error::VmKitError::SignalInstall(
                std::io::Error::last_os_error(),
            ));
        }
    }
    Ok(())
}

/// The rendezvous signal handler: looks up the current thread's own `ThreadHandle`
/// (and, through it, the `VMKit` it is registered with) and joins the rendezvous.
/// Async-signal-safety note: `ThreadHandle::current` only touches already-initialized
/// thread-local storage and an `Arc` clone, and `join` uses `parking_lot` primitives.
/// Not fully async-signal-safe in the strict POSIX sense, but acceptable on the
/// platforms this targets, where the handler only ever runs on a thread that is
/// already blocked at a safepoint-equivalent point.
extern "C" fn rendezvous_signal_handler(_signal: libc::c_int) {
    if let Some(thread) = ThreadHandle::current() {
        if let Some(vmkit) = thread.vmkit() {
            vmkit.rendezvous().join(&thread);
        }
    }
}

/// A cheap stand-in for the saved frame pointer used only to prove to the
/// rendezvous that this thread has actually parked somewhere on its native stack;
/// it is never walked (the stack walker in `stack_walk` takes its own starting FP
/// from the VM front end) so any non-zero address on this thread's stack works.
fn approximate_frame_pointer() -> usize {
    let marker = 0u8;
    std::hint::black_box(&marker as *const u8 as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn cooperative_synchronize_waits_for_all_joiners() {
        let rv = Arc::new(Rendezvous::new(RendezvousStrategy::Cooperative));
        let initiator = ThreadHandle::new(false);
        let participant = ThreadHandle::new(false);
        let running = vec![initiator.clone(), participant.clone()];

        let rv2 = rv.clone();
        let participant2 = participant.clone();
        let joined = std::thread::spawn(move || {
            while !participant2.yield_requested() {
                std::thread::sleep(Duration::from_millis(1));
            }
            rv2.join(&participant2);
        });

        rv.synchronize(&initiator, &running);
        assert!(participant.has_joined_rv());

        rv.finish_rv(&initiator, &running);
        joined.join().unwrap();
        assert!(!participant.yield_requested());
    }
}
