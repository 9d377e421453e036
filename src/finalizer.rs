//! Finalization candidate/ready queues and the finalizer worker (§4.3).

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use spin::Mutex as SpinMutex;

use crate::collector::{Collector, ObjectRef, TracingContext};
use crate::options::QUEUE_GROWTH_FACTOR;
use crate::vm::{FinalizeKind, VirtualMachine, VmId};

/// One object awaiting finalization: its handle, which VM owns it, and — once it
/// has been scanned ready — how it should be torn down (§3 "FinalizerThread").
#[derive(Clone)]
pub struct FinalizationCandidate {
    pub object: ObjectRef,
    pub owner: VmId,
    /// `None` while still a live candidate; filled in by `scan_finalization_queue`
    /// when the object graduates to the ready queue.
    pub kind: Option<FinalizeKind>,
}

struct Queues {
    candidates: Vec<FinalizationCandidate>,
    ready: Vec<FinalizationCandidate>,
}

/// Owns the finalization candidate/ready vectors (one shared spinlock, §5: "a single
/// lock, deliberately simple") and runs the daemon worker that invokes finalizers.
pub struct FinalizerThread {
    queues: SpinMutex<Queues>,
    wake: Mutex<bool>,
    cond: Condvar,
}

impl FinalizerThread {
    pub fn new(initial_capacity: usize) -> Self {
        Self {
            queues: SpinMutex::new(Queues {
                candidates: Vec::with_capacity(initial_capacity),
                ready: Vec::new(),
            }),
            wake: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    /// Register an object whose class has a non-trivial finalizer.
    pub fn add_finalization_candidate(&self, object: ObjectRef, owner: VmId) {
        let mut queues = self.queues.lock();
        if queues.candidates.len() == queues.candidates.capacity() {
            let additional =
                (queues.candidates.capacity() * QUEUE_GROWTH_FACTOR).max(1) - queues.candidates.capacity();
            queues.candidates.reserve(additional);
        }
        queues.candidates.push(FinalizationCandidate {
            object,
            owner,
            kind: None,
        });
    }

    /// Scan the candidate queue during collection (§4.3): objects still live stay
    /// candidates (forwarded if the collector moves objects); unreachable ones are
    /// resurrected for one last run via `retain_for_finalize`, have their
    /// `FinalizeKind` resolved through the owning VM, and move to `ready`.
    pub fn scan_finalization_queue(
        &self,
        vm_for: impl Fn(VmId) -> Option<Arc<dyn VirtualMachine>>,
        collector: &dyn Collector,
        ctx: &mut TracingContext,
    ) {
        let mut queues = self.queues.lock();
        let drained: Vec<FinalizationCandidate> = std::mem::take(&mut queues.candidates);

        let mut still_candidates = Vec::with_capacity(drained.len());
        for mut candidate in drained {
            if collector.is_live(candidate.object, ctx) {
                candidate.object = collector.get_forwarded_finalizable(candidate.object, ctx);
                still_candidates.push(candidate);
                continue;
            }

            let Some(vm) = vm_for(candidate.owner) else {
                continue;
            };
            let resurrected = collector.retain_for_finalize(candidate.object, ctx);
            candidate.kind = Some(vm.finalize_kind(resurrected));
            candidate.object = resurrected;
            queues.ready.push(candidate);
        }

        queues.candidates = still_candidates;
    }

    /// Called at end-of-collection to wake the worker if anything graduated to
    /// `ready`.
    pub fn notify_end_of_collection(&self) {
        *self.wake.lock() = true;
        self.cond.notify_all();
    }

    /// The worker loop: drains `ready` and runs each candidate's finalizer —
    /// `VirtualMachine::finalize_object` for a managed finalizer, the destructor
    /// function pointer directly for a native one (§4.3). Order within one batch
    /// is unspecified. Panics are caught and logged; finalizers never run on a
    /// mutator thread.
    pub fn run_worker(self: &Arc<Self>, vm_for: impl Fn(VmId) -> Option<Arc<dyn VirtualMachine>>) {
        loop {
            {
                let mut wake = self.wake.lock();
                while !*wake {
                    self.cond.wait(&mut wake);
                }
                *wake = false;
            }

            let ready: Vec<FinalizationCandidate> = std::mem::take(&mut self.queues.lock().ready);
            for candidate in ready {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    match candidate.kind {
                        Some(FinalizeKind::Native(dtor)) => unsafe { dtor(candidate.object) },
                        Some(FinalizeKind::Managed) | None => {
                            if let Some(vm) = vm_for(candidate.owner) {
                                vm.finalize_object(candidate.object);
                            }
                        }
                    }
                }));
                if let Err(panic) = result {
                    log::error!("finalizer callback panicked: {}", describe_panic(&panic));
                }
            }
        }
    }

    pub fn candidate_count(&self) -> usize {
        self.queues.lock().candidates.len()
    }

    pub fn ready_count(&self) -> usize {
        self.queues.lock().ready.len()
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
