//! Per-object monitors (§5): `monitor_enter`/`monitor_exit` recursion, `monitor_wait`
//! releasing the monitor until `monitor_notify` wakes it, illegal-monitor-state
//! detection, and interrupting a waiting thread.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use vmkit::options::VMKitOptions;
use vmkit::rendezvous::RendezvousStrategy;
use vmkit::testkit::{TestCollector, TestVm};
use vmkit::thread::ThreadHandle;
use vmkit::vm::LanguageError;
use vmkit::VMKit;

#[test]
fn wait_releases_the_monitor_until_notified() {
    let vmkit = VMKit::new(VMKitOptions::default(), RendezvousStrategy::Cooperative);
    let collector = Arc::new(TestCollector::new());
    let vm = Arc::new(TestVm::new(collector.clone()));
    let vm_id = vmkit.add_vm(vm.clone());

    let waiter = ThreadHandle::new(false);
    vmkit.register_prepared_thread(waiter.clone());
    vmkit.register_running_thread(waiter.clone()).unwrap();

    let obj = vm.alloc_object(8);
    vmkit.monitor_enter(obj, &waiter);

    let vmkit2 = vmkit.clone();
    let waker = thread::spawn(move || {
        // Give the waiter time to actually be parked in `monitor_wait` before
        // entering and notifying — otherwise this thread would block on
        // `monitor_enter` until the waiter's `wait` releases it anyway, but the
        // sleep keeps the ordering obvious.
        thread::sleep(Duration::from_millis(20));
        let notifier = ThreadHandle::new(false);
        vmkit2.register_prepared_thread(notifier.clone());
        vmkit2.register_running_thread(notifier.clone()).unwrap();

        vmkit2.monitor_enter(obj, &notifier);
        vmkit2.monitor_notify(vm_id, obj, &notifier);
        vmkit2.monitor_exit(vm_id, obj, &notifier);
        vmkit2.unregister_running_thread(notifier);
    });

    vmkit.monitor_wait(vm_id, obj, &waiter, None);
    vmkit.monitor_exit(vm_id, obj, &waiter);
    waker.join().unwrap();

    assert!(vm.language_errors().is_empty());
}

#[test]
fn exit_without_entering_raises_illegal_monitor_state() {
    let vmkit = VMKit::new(VMKitOptions::default(), RendezvousStrategy::Cooperative);
    let collector = Arc::new(TestCollector::new());
    let vm = Arc::new(TestVm::new(collector.clone()));
    let vm_id = vmkit.add_vm(vm.clone());

    let thread = ThreadHandle::new(false);
    vmkit.register_prepared_thread(thread.clone());
    vmkit.register_running_thread(thread.clone()).unwrap();

    let obj = vm.alloc_object(8);
    vmkit.monitor_exit(vm_id, obj, &thread);

    assert_eq!(
        vm.language_errors(),
        vec![(LanguageError::IllegalMonitorState, thread.id())]
    );
}

#[test]
fn interrupting_a_waiter_wakes_it_with_interrupted_error() {
    let vmkit = VMKit::new(VMKitOptions::default(), RendezvousStrategy::Cooperative);
    let collector = Arc::new(TestCollector::new());
    let vm = Arc::new(TestVm::new(collector.clone()));
    let vm_id = vmkit.add_vm(vm.clone());

    let waiter = ThreadHandle::new(false);
    vmkit.register_prepared_thread(waiter.clone());
    vmkit.register_running_thread(waiter.clone()).unwrap();

    let obj = vm.alloc_object(8);
    vmkit.monitor_enter(obj, &waiter);

    let waiter_id = waiter.id();
    let vmkit2 = vmkit.clone();
    let waiter2 = waiter.clone();
    let waiting = thread::spawn(move || {
        vmkit2.monitor_wait(vm_id, obj, &waiter2, None);
    });

    thread::sleep(Duration::from_millis(20));
    waiter.interrupt();
    waiting.join().unwrap();

    assert_eq!(vm.language_errors(), vec![(LanguageError::Interrupted, waiter_id)]);
}
