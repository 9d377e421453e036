//! S4: an unreachable finalizable object is finalized exactly once, on the
//! finalizer worker, after the collection that found it dead has ended.

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
fn unreachable_object_is_finalized_once_after_collection() {
    let vmkit = VMKit::new(VMKitOptions::default(), RendezvousStrategy::Cooperative);

    let thread = ThreadHandle::new(false);
    vmkit.register_prepared_thread(thread.clone());
    vmkit.register_running_thread(thread.clone()).unwrap();

    let collector = Arc::new(TestCollector::new());
    let vm = Arc::new(TestVm::new(collector.clone()));
    let vm_id = vmkit.add_vm(vm.clone());

    let obj = vm.alloc_object(8);
    vmkit.add_finalization_candidate(vm_id, obj).unwrap();

    match vmkit.start_collection() {
        CollectionOutcome::Ran(guard) => {
            let mut ctx = TestCollector::new_tracing_context();
            // No root traces `obj`: it is unreachable this cycle.
            guard.tracer(&mut ctx);
            guard.scan_finalization(&*collector, &mut ctx);
            vmkit.end_collection(guard);
        }
        CollectionOutcome::AlreadyRunning => panic!("no other collection was in progress"),
    }

    let deadline = Instant::now() + Duration::from_secs(2);
    while vm.finalized_objects().is_empty() {
        assert!(Instant::now() < deadline, "finalizer worker did not run in time");
        thread::sleep(Duration::from_millis(5));
    }

    assert_eq!(vm.finalized_objects(), vec![obj]);

    // A second collection with nothing newly dead must not re-finalize it.
    thread::sleep(Duration::from_millis(20));
    assert_eq!(vm.finalized_objects(), vec![obj]);
}
