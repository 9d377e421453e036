//! The VM contract (§6): everything a managed-language front end implements so the
//! substrate can drive tracing, reference processing, and finalization on its behalf.

use std::fmt;

use crate::collector::{Collector, ObjectRef, TracingContext};
use crate::thread::ThreadHandle;

/// A VM's stable slot index in `VMKit::vms`, assigned by `add_vm` and unchanged for
/// the VM's lifetime in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VmId(pub usize);

impl fmt::Display for VmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "vm#{}", self.0)
    }
}

/// How a finalizable object's teardown resolves once it becomes unreachable (§6,
/// "Object contract"). The substrate itself never interprets an object's header; the
/// owning VM answers this question for each candidate when it is scanned ready.
#[derive(Clone, Copy)]
pub enum FinalizeKind {
    /// The object has a user-visible managed finalizer; `VirtualMachine::finalize_object`
    /// is called on the finalizer worker.
    Managed,
    /// The object only needs its native destructor run (no managed code involved).
    /// Carries the destructor to call directly, bypassing `finalize_object`.
    Native(unsafe extern "C" fn(ObjectRef)),
}

impl fmt::Debug for FinalizeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FinalizeKind::Managed => f.write_str("FinalizeKind::Managed"),
            FinalizeKind::Native(ptr) => {
                write!(f, "FinalizeKind::Native({:p})", *ptr as *const ())
            }
        }
    }
}

/// Language-level error raised through a VM's [`VirtualMachine::raise_language_error`]
/// hook. The substrate detects these conditions but has no language-level exception
/// model of its own to throw them with (§7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LanguageError {
    /// A monitor wait was interrupted via `ThreadHandle::interrupt`.
    Interrupted,
    /// `wait`/`notify` was called by a thread that does not hold the monitor.
    IllegalMonitorState,
}

/// The per-language hooks the substrate calls during tracing, reference processing,
/// and finalization (§6).
///
/// Implementations must be `Send + Sync`: the registry fans calls out to every
/// registered VM from whichever thread drives the rendezvous.
pub trait VirtualMachine: Send + Sync {
    /// This VM's slot in the owning `VMKit`'s registry.
    fn vm_id(&self) -> VmId;

    /// Called once by `VMKit::add_vm` to record the slot it was assigned.
    fn set_vm_id(&self, id: VmId);

    /// The collector this VM's objects are allocated with and traced by.
    fn collector(&self) -> &dyn Collector;

    /// Mark every strong root owned by this VM (its classes, static fields, and the
    /// stacks of its attached threads). Called with the world stopped.
    fn tracer(&self, ctx: &mut TracingContext);

    /// Called on every VM, still inside the stop-the-world window, before the
    /// rendezvous synchronizes — lets a VM snapshot state it needs during tracing.
    fn start_collection(&self);

    /// Called on every VM after tracing and reference/finalizer scanning complete,
    /// still inside the stop-the-world window.
    fn end_collection(&self);

    /// Read a weak/soft/phantom reference object's current referent, if any.
    fn get_referent(&self, reference: ObjectRef) -> Option<ObjectRef>;

    /// Clear or update a reference object's referent slot.
    fn set_referent(&self, reference: ObjectRef, value: Option<ObjectRef>);

    /// Deliver a cleared reference to user code outside the stop-the-world window.
    fn enqueue_reference(&self, reference: ObjectRef);

    /// Run a finalizable object's managed finalizer. Only called for
    /// `FinalizeKind::Managed` candidates; native destructors are invoked directly by
    /// the finalizer worker.
    fn finalize_object(&self, obj: ObjectRef);

    /// Resolve how `obj` should be torn down once finalization starts. Consulted when
    /// a candidate graduates from `candidates` to `ready` (§4.3).
    fn finalize_kind(&self, obj: ObjectRef) -> FinalizeKind;

    /// Size in bytes of `obj`'s allocation, used for clone-style copies.
    fn object_size(&self, obj: ObjectRef) -> usize;

    /// Run the VM's entry point on the calling (launcher) thread.
    fn run_application_impl(&self, thread: &ThreadHandle, argv: &[String]) -> i32;

    /// Deliver a language-level error (interrupted wait, illegal monitor state) that
    /// the substrate detected but has no exception model of its own to raise.
    fn raise_language_error(&self, error: LanguageError, thread: &ThreadHandle);
}
