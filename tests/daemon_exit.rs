//! S6: a launcher thread registers as non-daemon, runs the application, and exits;
//! `wait_non_daemon_threads` only returns once every non-daemon thread (the launcher
//! plus any the application itself starts) has left.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use vmkit::options::VMKitOptions;
use vmkit::rendezvous::RendezvousStrategy;
use vmkit::testkit::{TestCollector, TestVm};
use vmkit::VMKit;

#[test]
fn wait_non_daemon_threads_returns_immediately_with_nothing_registered() {
    let vmkit = VMKit::new(VMKitOptions::default(), RendezvousStrategy::Cooperative);
    let start = Instant::now();
    vmkit.non_daemon().wait_non_daemon_threads();
    assert!(start.elapsed() < Duration::from_millis(200));
}

#[test]
fn wait_non_daemon_threads_blocks_until_the_last_one_leaves() {
    let vmkit = VMKit::new(VMKitOptions::default(), RendezvousStrategy::Cooperative);

    vmkit.non_daemon().enter_non_daemon_mode();
    let vmkit2 = vmkit.clone();
    let worker = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        vmkit2.non_daemon().leave_non_daemon_mode();
    });

    let start = Instant::now();
    vmkit.non_daemon().wait_non_daemon_threads();
    assert!(start.elapsed() >= Duration::from_millis(40));
    worker.join().unwrap();
}

#[test]
fn launcher_thread_registers_non_daemon_and_deregisters_on_exit() {
    let vmkit = VMKit::new(VMKitOptions::default(), RendezvousStrategy::Cooperative);
    let vm = Arc::new(TestVm::new(Arc::new(TestCollector::new())));
    vmkit.add_vm(vm.clone());

    vmkit.run_application(vm, Vec::new()).expect("launcher thread must spawn");

    let deadline = Instant::now() + Duration::from_secs(2);
    while vmkit.running_thread_count() == 0 {
        assert!(Instant::now() < deadline, "launcher thread never registered as running");
        thread::sleep(Duration::from_millis(1));
    }
    while vmkit.running_thread_count() != 0 {
        assert!(Instant::now() < deadline, "launcher thread never unregistered");
        thread::sleep(Duration::from_millis(1));
    }

    // By now the launcher has entered and left non-daemon mode; this must not hang.
    vmkit.non_daemon().wait_non_daemon_threads();
}
