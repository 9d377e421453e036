//! S3: two threads call `start_collection` concurrently. Exactly one drives the
//! collection (`Ran`); the other observes `AlreadyRunning` after joining the first.

use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use vmkit::options::VMKitOptions;
use vmkit::rendezvous::RendezvousStrategy;
use vmkit::testkit::{TestCollector, TestVm};
use vmkit::thread::ThreadHandle;
use vmkit::vmkit::CollectionOutcome;
use vmkit::VMKit;

#[test]
fn concurrent_start_collection_has_exactly_one_driver() {
    let vmkit = VMKit::new(VMKitOptions::default(), RendezvousStrategy::Cooperative);

    let initiator = ThreadHandle::new(false);
    vmkit.register_prepared_thread(initiator.clone());
    vmkit.register_running_thread(initiator.clone()).unwrap();

    let (tx, rx) = mpsc::channel();
    let vmkit2 = vmkit.clone();
    let second = thread::spawn(move || {
        let handle = ThreadHandle::new(false);
        vmkit2.register_prepared_thread(handle.clone());
        vmkit2.register_running_thread(handle.clone()).unwrap();
        tx.send(handle.clone()).unwrap();

        while !handle.yield_requested() {
            thread::sleep(Duration::from_millis(1));
        }

        let joined_existing = match vmkit2.start_collection() {
            CollectionOutcome::AlreadyRunning => true,
            CollectionOutcome::Ran(guard) => {
                vmkit2.end_collection(guard);
                false
            }
        };
        (joined_existing, handle)
    });

    // Barrier: the second thread's handle is sent only after it has registered as
    // running, so the snapshot `start_collection` takes below is guaranteed to
    // include it.
    let _second_handle_preview = rx.recv().unwrap();

    let vm = Arc::new(TestVm::new(Arc::new(TestCollector::new())));
    vmkit.add_vm(vm.clone());

    match vmkit.start_collection() {
        CollectionOutcome::Ran(guard) => {
            vmkit.end_collection(guard);
        }
        CollectionOutcome::AlreadyRunning => panic!("the initiator thread must drive this collection"),
    }

    let (joined_existing, second_handle) = second.join().unwrap();
    assert!(joined_existing, "the second thread must observe AlreadyRunning");
    assert!(!second_handle.yield_requested(), "finish_rv must have cleared its flag");
    assert_eq!(vm.start_collection_calls(), 1, "only the driver calls start_collection on VMs");
    assert_eq!(vm.end_collection_calls(), 1);
}
