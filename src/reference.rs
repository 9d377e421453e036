//! Weak/soft/phantom reference queues and the reference worker (§4.2).

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use spin::Mutex as SpinMutex;

use crate::collector::{Collector, ObjectRef, TracingContext};
use crate::options::QUEUE_GROWTH_FACTOR;
use crate::vm::{VirtualMachine, VmId};

/// Which reachability semantics a reference object carries (§4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceSemantics {
    /// Cleared as soon as the referent is otherwise unreachable.
    Weak,
    /// May be retained under memory pressure; policy is the collector's (`retain_referent`).
    Soft,
    /// Never retained; exists only to run cleanup after the referent dies.
    Phantom,
}

/// One queued reference object together with the VM whose `get_referent`/
/// `set_referent`/`enqueue_reference` hooks it must be processed through — the
/// substrate is shared by several VMs (§3), so ownership travels with the entry
/// rather than being assumed to be a single process-wide VM.
#[derive(Clone, Copy)]
struct Entry {
    owner: VmId,
    reference: ObjectRef,
}

/// A spinlock-protected, append-only growable array of reference objects.
///
/// Grounded directly in §4.2: "append-only `Vec` with a spinlock... grows by a
/// constant factor (initial capacity 256, growth ×2) when full; there is no upper
/// bound beyond allocation failure (fatal)".
pub struct ReferenceQueue {
    semantics: ReferenceSemantics,
    entries: SpinMutex<Vec<Entry>>,
}

impl ReferenceQueue {
    pub fn new(semantics: ReferenceSemantics, initial_capacity: usize) -> Self {
        Self {
            semantics,
            entries: SpinMutex::new(Vec::with_capacity(initial_capacity)),
        }
    }

    pub fn semantics(&self) -> ReferenceSemantics {
        self.semantics
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append a reference object, growing the backing vector by §4.2's fixed policy
    /// (initial capacity, then ×2) if it is full. An allocation failure here aborts
    /// the process via the global allocator's own out-of-memory handler, matching
    /// the fatal-OOM policy §7 specifies for the substrate's internal queues.
    pub fn add_reference(&self, owner: VmId, reference: ObjectRef) {
        let mut entries = self.entries.lock();
        if entries.len() == entries.capacity() {
            let additional = (entries.capacity() * QUEUE_GROWTH_FACTOR).max(1) - entries.capacity();
            entries.reserve(additional);
        }
        entries.push(Entry { owner, reference });
    }

    /// Scan the queue during collection (§4.2 algorithm), dispatching each entry to
    /// its owning VM, and append cleared references to `to_enqueue`.
    pub fn scan(
        &self,
        vm_for: &dyn Fn(VmId) -> Option<Arc<dyn VirtualMachine>>,
        collector: &dyn Collector,
        ctx: &mut TracingContext,
        to_enqueue: &ReferenceQueue,
    ) {
        let drained: Vec<Entry> = std::mem::take(&mut *self.entries.lock());

        let mut survivors = Vec::with_capacity(drained.len());
        for entry in drained {
            if !collector.is_live(entry.reference, ctx) {
                // Clear the referent slot before dropping `r` from the queue. `r`
                // itself did not survive, so this is only observable if some other
                // live object still points at it through a non-reference field;
                // harmless otherwise.
                if let Some(vm) = vm_for(entry.owner) {
                    vm.set_referent(entry.reference, None);
                }
                continue;
            }

            let Some(vm) = vm_for(entry.owner) else {
                continue;
            };

            let Some(e) = vm.get_referent(entry.reference) else {
                continue;
            };

            if self.semantics == ReferenceSemantics::Soft {
                collector.retain_referent(e, ctx);
            }

            let forwarded_r = collector.get_forwarded_reference(entry.reference, ctx);

            if collector.is_live(e, ctx) {
                let forwarded_e = collector.get_forwarded_referent(e, ctx);
                vm.set_referent(forwarded_r, Some(forwarded_e));
                survivors.push(Entry {
                    owner: entry.owner,
                    reference: forwarded_r,
                });
            } else {
                vm.set_referent(forwarded_r, None);
                to_enqueue.add_reference(entry.owner, forwarded_r);
            }
        }

        *self.entries.lock() = survivors;
    }
}

/// Owns the three reference queues plus the cross-collection `to_enqueue` staging
/// area, and runs the daemon worker that delivers cleared references to user code.
pub struct ReferenceThread {
    pub weak: ReferenceQueue,
    pub soft: ReferenceQueue,
    pub phantom: ReferenceQueue,
    to_enqueue: ReferenceQueue,
    wake: Mutex<bool>,
    cond: Condvar,
}

impl ReferenceThread {
    pub fn new(initial_capacity: usize) -> Self {
        Self {
            weak: ReferenceQueue::new(ReferenceSemantics::Weak, initial_capacity),
            soft: ReferenceQueue::new(ReferenceSemantics::Soft, initial_capacity),
            phantom: ReferenceQueue::new(ReferenceSemantics::Phantom, initial_capacity),
            to_enqueue: ReferenceQueue::new(ReferenceSemantics::Weak, initial_capacity),
            wake: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    /// Scan all three queues, done once per collection after strong roots have been
    /// traced (§4.2).
    pub fn scan_all(
        &self,
        vm_for: &dyn Fn(VmId) -> Option<Arc<dyn VirtualMachine>>,
        collector: &dyn Collector,
        ctx: &mut TracingContext,
    ) {
        self.weak.scan(vm_for, collector, ctx, &self.to_enqueue);
        self.soft.scan(vm_for, collector, ctx, &self.to_enqueue);
        self.phantom.scan(vm_for, collector, ctx, &self.to_enqueue);
    }

    /// Called at end-of-collection to wake the worker if anything was queued.
    pub fn notify_end_of_collection(&self) {
        *self.wake.lock() = true;
        self.cond.notify_all();
    }

    /// The worker loop: run on a dedicated daemon thread (§4.2, §9 "daemon threads
    /// do not block process exit"). Drains `to_enqueue` and delivers each reference
    /// to its owning VM's `enqueue_reference`, catching any panic from user code.
    pub fn run_worker(self: &Arc<Self>, vm_for: impl Fn(VmId) -> Option<Arc<dyn VirtualMachine>>) {
        loop {
            {
                let mut wake = self.wake.lock();
                while !*wake {
                    self.cond.wait(&mut wake);
                }
                *wake = false;
            }

            let drained: Vec<Entry> = std::mem::take(&mut *self.to_enqueue.entries.lock());
            for entry in drained {
                let Some(vm) = vm_for(entry.owner) else {
                    continue;
                };
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    vm.enqueue_reference(entry.reference);
                }));
                if let Err(panic) = result {
                    log::error!("reference enqueue callback panicked: {}", describe_panic(&panic));
                }
            }
        }
    }

    pub fn to_enqueue_len(&self) -> usize {
        self.to_enqueue.len()
    }
}

fn describe_panic(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_reference_grows_past_initial_capacity() {
        let q = ReferenceQueue::new(ReferenceSemantics::Weak, 2);
        for i in 0..10 {
            unsafe {
                q.add_reference(VmId(0), ObjectRef::from_raw((i + 1) as *mut ()));
            }
        }
        assert_eq!(q.len(), 10);
    }
}
