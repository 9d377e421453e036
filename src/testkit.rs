//! In-tree test doubles (§9 "Test tooling"): a `TestVm` and a `TestCollector` that
//! implement the full [`VirtualMachine`]/[`Collector`] contracts over a plain mark
//! set, so the integration scenarios in `tests/` can exercise the substrate without
//! a real managed-language front end.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use parking_lot::Mutex as PlMutex;

use crate::collector::{Collector, ObjectRef, TracingContext};
use crate::thread::ThreadHandle;
use crate::vm::{FinalizeKind, LanguageError, VirtualMachine, VmId};

/// A non-moving, mark-set collector. Allocations are leaked for the lifetime of the
/// process (acceptable for a test double); liveness is whatever `TestCollector::mark`
/// or a tracing pass puts into the current `TracingContext`'s `MarkSet`.
#[derive(Default)]
pub struct TestCollector {
    allocated: AtomicUsize,
}

/// The `TracingContext` payload this collector uses: the set of objects found live
/// so far in the current collection.
#[derive(Default)]
pub struct MarkSet(HashSet<ObjectRef>);

impl MarkSet {
    pub fn contains(&self, obj: ObjectRef) -> bool {
        self.0.contains(&obj)
    }
}

impl TestCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a `size`-byte object and hand back an opaque handle to it.
    pub fn alloc_object(&self, size: usize) -> ObjectRef {
        let ptr = self.allocate(size);
        assert!(!ptr.is_null(), "test allocation failed");
        unsafe { ObjectRef::from_raw(ptr as *mut ()) }
    }

    /// Start a fresh tracing pass with an empty mark set.
    pub fn new_tracing_context() -> TracingContext {
        TracingContext::new(MarkSet::default())
    }

    pub fn bytes_allocated(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }
}

impl Collector for TestCollector {
    fn allocate(&self, size: usize) -> *mut u8 {
        self.allocated.fetch_add(size, Ordering::Relaxed);
        Box::leak(vec![0u8; size].into_boxed_slice()).as_mut_ptr()
    }

    fn is_live(&self, obj: ObjectRef, ctx: &TracingContext) -> bool {
        ctx.downcast_ref::<MarkSet>()
            .expect("TestCollector used with a non-MarkSet TracingContext")
            .contains(obj)
    }

    fn mark_and_trace(&self, obj: ObjectRef, ctx: &mut TracingContext) {
        ctx.downcast_mut::<MarkSet>()
            .expect("TestCollector used with a non-MarkSet TracingContext")
            .0
            .insert(obj);
    }

    fn mark_and_trace_root(&self, slot: &mut ObjectRef, ctx: &mut TracingContext) {
        self.mark_and_trace(*slot, ctx);
    }

    fn get_forwarded_reference(&self, r: ObjectRef, _ctx: &TracingContext) -> ObjectRef {
        r
    }

    fn get_forwarded_referent(&self, e: ObjectRef, _ctx: &TracingContext) -> ObjectRef {
        e
    }

    fn get_forwarded_finalizable(&self, o: ObjectRef, _ctx: &TracingContext) -> ObjectRef {
        o
    }

    fn retain_referent(&self, e: ObjectRef, ctx: &mut TracingContext) {
        self.mark_and_trace(e, ctx);
    }

    fn retain_for_finalize(&self, o: ObjectRef, ctx: &mut TracingContext) -> ObjectRef {
        self.mark_and_trace(o, ctx);
        o
    }
}

/// A minimal `VirtualMachine` whose object model is "an `ObjectRef` is just an
/// opaque handle with an optional referent and an optional finalize kind", backed
/// entirely by hash maps guarded by ordinary mutexes — there is no rendezvous-hot
/// path here, so plain `std::sync::Mutex` is fine (§9).
///
/// Takes its `TestCollector` by `Arc` rather than owning one, so several `TestVm`s
/// in one test can share a single collector the way §2 describes VMs doing in
/// production ("multiple managed VMs coexist in one process under a single
/// garbage collector").
pub struct TestVm {
    vm_id: PlMutex<Option<VmId>>,
    collector: Arc<TestCollector>,
    referents: Mutex<HashMap<ObjectRef, Option<ObjectRef>>>,
    finalize_kinds: Mutex<HashMap<ObjectRef, FinalizeKind>>,
    enqueued: Mutex<Vec<ObjectRef>>,
    finalized: Mutex<Vec<ObjectRef>>,
    language_errors: Mutex<Vec<(LanguageError, u64)>>,
    start_collection_calls: AtomicUsize,
    end_collection_calls: AtomicUsize,
}

impl TestVm {
    pub fn new(collector: Arc<TestCollector>) -> Self {
        Self {
            vm_id: PlMutex::new(None),
            collector,
            referents: Mutex::new(HashMap::new()),
            finalize_kinds: Mutex::new(HashMap::new()),
            enqueued: Mutex::new(Vec::new()),
            finalized: Mutex::new(Vec::new()),
            language_errors: Mutex::new(Vec::new()),
            start_collection_calls: AtomicUsize::new(0),
            end_collection_calls: AtomicUsize::new(0),
        }
    }

    pub fn test_collector(&self) -> &TestCollector {
        &self.collector
    }

    pub fn alloc_object(&self, size: usize) -> ObjectRef {
        self.collector.alloc_object(size)
    }

    /// Register `reference` as carrying `referent`, so `get_referent`/`set_referent`
    /// have something to report.
    pub fn link_reference(&self, reference: ObjectRef, referent: Option<ObjectRef>) {
        self.referents.lock().unwrap().insert(reference, referent);
    }

    pub fn set_finalize_kind(&self, obj: ObjectRef, kind: FinalizeKind) {
        self.finalize_kinds.lock().unwrap().insert(obj, kind);
    }

    pub fn enqueued_references(&self) -> Vec<ObjectRef> {
        self.enqueued.lock().unwrap().clone()
    }

    pub fn finalized_objects(&self) -> Vec<ObjectRef> {
        self.finalized.lock().unwrap().clone()
    }

    pub fn language_errors(&self) -> Vec<(LanguageError, u64)> {
        self.language_errors.lock().unwrap().clone()
    }

    pub fn start_collection_calls(&self) -> usize {
        self.start_collection_calls.load(Ordering::Relaxed)
    }

    pub fn end_collection_calls(&self) -> usize {
        self.end_collection_calls.load(Ordering::Relaxed)
    }
}

impl VirtualMachine for TestVm {
    fn vm_id(&self) -> VmId {
        self.vm_id.lock().expect("vm_id read before set_vm_id")
    }

    fn set_vm_id(&self, id: VmId) {
        *self.vm_id.lock() = Some(id);
    }

    fn collector(&self) -> &dyn Collector {
        &self.collector
    }

    fn tracer(&self, ctx: &mut TracingContext) {
        for reference in self.referents.lock().unwrap().keys() {
            self.collector.mark_and_trace(*reference, ctx);
        }
    }

    fn start_collection(&self) {
        self.start_collection_calls.fetch_add(1, Ordering::Relaxed);
    }

    fn end_collection(&self) {
        self.end_collection_calls.fetch_add(1, Ordering::Relaxed);
    }

    fn get_referent(&self, reference: ObjectRef) -> Option<ObjectRef> {
        self.referents.lock().unwrap().get(&reference).copied().flatten()
    }

    fn set_referent(&self, reference: ObjectRef, value: Option<ObjectRef>) {
        self.referents.lock().unwrap().insert(reference, value);
    }

    fn enqueue_reference(&self, reference: ObjectRef) {
        self.enqueued.lock().unwrap().push(reference);
    }

    fn finalize_object(&self, obj: ObjectRef) {
        self.finalized.lock().unwrap().push(obj);
    }

    fn finalize_kind(&self, obj: ObjectRef) -> FinalizeKind {
        self.finalize_kinds
            .lock()
            .unwrap()
            .get(&obj)
            .copied()
            .unwrap_or(FinalizeKind::Managed)
    }

    fn object_size(&self, _obj: ObjectRef) -> usize {
        0
    }

    fn run_application_impl(&self, _thread: &ThreadHandle, _argv: &[String]) -> i32 {
        0
    }

    fn raise_language_error(&self, error: LanguageError, thread: &ThreadHandle) {
        self.language_errors.lock().unwrap().push((error, thread.id()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mark_and_trace_makes_object_live() {
        let collector = TestCollector::new();
        let obj = collector.alloc_object(8);
        let mut ctx = TestCollector::new_tracing_context();

        assert!(!collector.is_live(obj, &ctx));
        collector.mark_and_trace(obj, &mut ctx);
        assert!(collector.is_live(obj, &ctx));
    }

    #[test]
    fn test_vm_reports_referent_and_enqueue_calls() {
        let vm = TestVm::new(Arc::new(TestCollector::new()));
        let reference = vm.alloc_object(8);
        let referent = vm.alloc_object(8);
        vm.link_reference(reference, Some(referent));

        assert_eq!(vm.get_referent(reference), Some(referent));
        vm.set_referent(reference, None);
        assert_eq!(vm.get_referent(reference), None);

        vm.enqueue_reference(reference);
        assert_eq!(vm.enqueued_references(), vec![reference]);
    }

    #[test]
    fn test_vm_finalize_kind_defaults_to_managed() {
        let vm = TestVm::new(Arc::new(TestCollector::new()));
        let obj = vm.alloc_object(8);
        assert!(matches!(vm.finalize_kind(obj), FinalizeKind::Managed));
    }
}
