//! S1: one VM, one mutator, one weak reference to a freshly-allocated object. After
//! `start_collection`/`end_collection` with the referent unreachable, the weak
//! reference's referent is null and the enqueue worker observes it exactly once.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use vmkit::options::VMKitOptions;
use vmkit::rendezvous::RendezvousStrategy;
use vmkit::testkit::{TestCollector, TestVm};
use vmkit::thread::ThreadHandle;
use vmkit::vmkit::CollectionOutcome;
use vmkit::VMKit;

#[test]
fn unreachable_weak_referent_is_nulled_and_enqueued_once() {
    let vmkit = VMKit::new(VMKitOptions::default(), RendezvousStrategy::Cooperative);

    let thread = ThreadHandle::new(false);
    vmkit.register_prepared_thread(thread.clone());
    vmkit.register_running_thread(thread.clone()).unwrap();

    let collector = Arc::new(TestCollector::new());
    let vm = Arc::new(TestVm::new(collector.clone()));
    let vm_id = vmkit.add_vm(vm.clone());

    // `reference` is the weak reference object itself, rooted by the mutator.
    // `referent` is what it points to and has no other root.
    let reference = vm.alloc_object(16);
    let referent = vm.alloc_object(16);
    vm.link_reference(reference, Some(referent));
    vmkit.add_weak_reference(vm_id, reference).unwrap();

    match vmkit.start_collection() {
        CollectionOutcome::Ran(guard) => {
            let mut ctx = TestCollector::new_tracing_context();
            // `TestVm::tracer` marks every linked reference object as a root; the
            // referent is never traced directly, so it is unreachable this cycle.
            guard.tracer(&mut ctx);
            guard.scan_references(&*collector, &mut ctx);
            vmkit.end_collection(guard);
        }
        CollectionOutcome::AlreadyRunning => panic!("no other collection was in progress"),
    }

    assert_eq!(vm.get_referent(reference), None, "weak referent must be nulled");

    let deadline = Instant::now() + Duration::from_secs(2);
    while vm.enqueued_references().is_empty() {
        assert!(Instant::now() < deadline, "reference worker did not run in time");
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(vm.enqueued_references(), vec![reference]);

    assert_eq!(vm.start_collection_calls(), 1);
    assert_eq!(vm.end_collection_calls(), 1);
}
