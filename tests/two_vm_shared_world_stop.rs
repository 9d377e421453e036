//! S2: two VMs, each with a running thread, share one stop-the-world rendezvous and
//! one collector.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use vmkit::options::VMKitOptions;
use vmkit::rendezvous::RendezvousStrategy;
use vmkit::testkit::{TestCollector, TestVm};
use vmkit::thread::ThreadHandle;
use vmkit::vmkit::CollectionOutcome;
use vmkit::{Collector, VMKit};

#[test]
fn two_vms_share_one_stop_the_world() {
    let vmkit = VMKit::new(VMKitOptions::default(), RendezvousStrategy::Cooperative);

    let initiator = ThreadHandle::new(false);
    vmkit.register_prepared_thread(initiator.clone());
    vmkit.register_running_thread(initiator.clone()).unwrap();

    let participant = ThreadHandle::new(false);
    vmkit.register_prepared_thread(participant.clone());
    vmkit.register_running_thread(participant.clone()).unwrap();

    let collector = Arc::new(TestCollector::new());
    let vm_a = Arc::new(TestVm::new(collector.clone()));
    let vm_b = Arc::new(TestVm::new(collector.clone()));
    vmkit.add_vm(vm_a.clone());
    vmkit.add_vm(vm_b.clone());

    let obj_a = vm_a.alloc_object(8);
    vm_a.link_reference(obj_a, None);
    let obj_b = vm_b.alloc_object(8);
    vm_b.link_reference(obj_b, None);

    // Simulate `participant` as a cooperative mutator: it polls for a yield
    // request and joins the rendezvous once it sees one, exactly like a
    // compiler-inserted safepoint check would.
    let rendezvous_handle = vmkit.clone();
    let participant_handle = participant.clone();
    let mutator = thread::spawn(move || {
        while !participant_handle.yield_requested() {
            thread::sleep(Duration::from_millis(1));
        }
        rendezvous_handle.rendezvous().join(&participant_handle);
    });

    match vmkit.start_collection() {
        CollectionOutcome::Ran(guard) => {
            // Testable property 3: every other thread has joined or recorded an SP.
            assert!(participant.has_joined_rv() || participant.last_sp().is_some());

            let mut ctx = TestCollector::new_tracing_context();
            guard.tracer(&mut ctx);
            assert!(collector.is_live(obj_a, &ctx));
            assert!(collector.is_live(obj_b, &ctx));
            vmkit.end_collection(guard);
        }
        CollectionOutcome::AlreadyRunning => panic!("expected to drive the collection"),
    }

    mutator.join().unwrap();

    assert_eq!(vm_a.start_collection_calls(), 1);
    assert_eq!(vm_b.start_collection_calls(), 1);
    assert_eq!(vm_a.end_collection_calls(), 1);
    assert_eq!(vm_b.end_collection_calls(), 1);
    assert!(!participant.yield_requested(), "finish_rv must clear every thread's flag");
}
