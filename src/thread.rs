//! Per-thread state (§3 "ThreadHandle"): everything the rendezvous, the monitor
//! subsystem, and a VM's per-thread data need to hang off a single managed thread.

use std::any::Any;
use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::sync::Monitor;
use crate::vmkit::VMKit;

/// Sentinel stored in `last_sp` meaning "no recorded SP" (the thread is running
/// managed code and has not parked or entered an uncooperative region).
const NO_SP: usize = 0;

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

/// Per-thread state tracked by the substrate for one managed (mutator) thread.
///
/// A `ThreadHandle` is created when a thread attaches to a `VMKit` and lives in an
/// `Arc` shared between the thread itself (via thread-local storage, see
/// [`ThreadHandle::current`]) and the registry's `prepared_threads`/`running_threads`
/// lists.
pub struct ThreadHandle {
    id: u64,
    pthread: libc::pthread_t,
    daemon: AtomicBool,
    do_yield: AtomicBool,
    joined_rv: AtomicBool,
    in_rv: AtomicBool,
    /// Last recorded stack pointer, or [`NO_SP`]. Set while cooperatively parked or
    /// while running uncooperative native code (§3 invariant).
    last_sp: AtomicUsize,
    interrupt_flag: AtomicBool,
    /// Recursive monitor backing this thread's own park/unpark.
    monitor: Monitor<()>,
    /// The per-object monitor this thread is currently blocked in
    /// [`crate::vmkit::VMKit::monitor_wait`], if any. Consulted by `interrupt` to
    /// find the condvar to wake — the thread's own `monitor` above is unrelated to
    /// whatever object monitor it happens to be waiting on.
    waiting_monitor: Mutex<Option<Arc<Monitor<()>>>>,
    /// Per-(thread, VM) state, parallel to `VMKit::vms`. Grown whenever the VM
    /// registry grows; indexed by `VmId`.
    vm_thread_data: Mutex<Vec<Option<Box<dyn Any + Send>>>>,
    /// Back-reference to the registry this thread is attached to. Populated by
    /// `VMKit::register_prepared_thread`; consulted by the uncooperative signal
    /// handler, which has no other way to reach "its" rendezvous (§4.1).
    vmkit: Mutex<Option<Weak<VMKit>>>,
}

// SAFETY: `pthread_t` is an opaque platform handle here used only as a signal-
// delivery target; it carries no borrowed data.
unsafe impl Send for ThreadHandle {}
unsafe impl Sync for ThreadHandle {}

impl ThreadHandle {
    /// Create a handle for the calling OS thread.
    pub fn new(daemon: bool) -> Arc<Self> {
        let handle = Arc::new(Self {
            id: NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed),
            pthread: unsafe { libc::pthread_self() },
            daemon: AtomicBool::new(daemon),
            do_yield: AtomicBool::new(false),
            joined_rv: AtomicBool::new(false),
            in_rv: AtomicBool::new(false),
            last_sp: AtomicUsize::new(NO_SP),
            interrupt_flag: AtomicBool::new(false),
            monitor: Monitor::new(()),
            waiting_monitor: Mutex::new(None),
            vm_thread_data: Mutex::new(Vec::new()),
            vmkit: Mutex::new(None),
        });
        CURRENT.with(|cell| *cell.borrow_mut() = Some(handle.clone()));
        handle
    }

    /// The `ThreadHandle` for the calling OS thread, if it has attached to a VMKit.
    pub fn current() -> Option<Arc<ThreadHandle>> {
        CURRENT.with(|cell| cell.borrow().clone())
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn pthread(&self) -> libc::pthread_t {
        self.pthread
    }

    pub fn is_daemon(&self) -> bool {
        self.daemon.load(Ordering::Relaxed)
    }

    pub fn set_daemon(&self, daemon: bool) {
        self.daemon.store(daemon, Ordering::Relaxed);
    }

    pub fn request_yield(&self) {
        self.do_yield.store(true, Ordering::Release);
    }

    pub fn clear_yield(&self) {
        self.do_yield.store(false, Ordering::Release);
    }

    pub fn yield_requested(&self) -> bool {
        self.do_yield.load(Ordering::Acquire)
    }

    pub fn mark_joined_rv(&self) {
        self.joined_rv.store(true, Ordering::Release);
    }

    pub fn clear_joined_rv(&self) {
        self.joined_rv.store(false, Ordering::Release);
    }

    pub fn has_joined_rv(&self) -> bool {
        self.joined_rv.load(Ordering::Acquire)
    }

    pub fn set_in_rv(&self, value: bool) {
        self.in_rv.store(value, Ordering::Release);
    }

    pub fn is_in_rv(&self) -> bool {
        self.in_rv.load(Ordering::Acquire)
    }

    /// Record the stack pointer at which this thread parked or entered
    /// uncooperative code. `None` means the thread is executing managed code with
    /// no recorded SP.
    pub fn set_last_sp(&self, sp: Option<usize>) {
        self.last_sp.store(sp.unwrap_or(NO_SP), Ordering::Release);
    }

    pub fn last_sp(&self) -> Option<usize> {
        match self.last_sp.load(Ordering::Acquire) {
            NO_SP => None,
            sp => Some(sp),
        }
    }

    /// Set the interrupt flag and, if the thread is currently parked in
    /// [`crate::vmkit::VMKit::monitor_wait`], wake it so it observes the flag on
    /// return (§5 "Cancellation and timeouts"). Called by whichever thread wants
    /// to interrupt this one — not this thread itself.
    pub fn interrupt(&self) {
        self.interrupt_flag.store(true, Ordering::Release);
        if let Some(monitor) = self.waiting_monitor.lock().clone() {
            monitor.notify_all();
        }
    }

    /// Record the per-object monitor this thread is about to block on, or clear it
    /// once the wait returns. Set by `VMKit::monitor_wait` around its blocking call.
    pub fn set_waiting_monitor(&self, monitor: Option<Arc<Monitor<()>>>) {
        *self.waiting_monitor.lock() = monitor;
    }

    /// Clear and return the previous value of the interrupt flag.
    pub fn take_interrupt(&self) -> bool {
        self.interrupt_flag.swap(false, Ordering::AcqRel)
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupt_flag.load(Ordering::Acquire)
    }

    /// This thread's own recursive monitor, used for park/unpark and as the backing
    /// lock for `VMObject::wait`/`notify` when this thread is a monitor's owner.
    pub fn monitor(&self) -> &Monitor<()> {
        &self.monitor
    }

    /// Grow the per-VM data vector to `len` slots, filling new slots with `None`.
    /// Called by the registry whenever `VMKit::vms` grows (§4.4).
    pub fn grow_vm_data(&self, len: usize) {
        let mut data = self.vm_thread_data.lock();
        while data.len() < len {
            data.push(None);
        }
    }

    /// Run `f` with this thread's state for VM `vm_id`, if any has been attached.
    /// Scoped rather than returning a reference so the lock never outlives the call.
    pub fn with_vm_data<R>(&self, vm_id: usize, f: impl FnOnce(Option<&(dyn Any + Send)>) -> R) -> R {
        let data = self.vm_thread_data.lock();
        f(data.get(vm_id).and_then(|slot| slot.as_deref()))
    }

    /// Install per-VM state for `vm_id`, replacing whatever was there.
    pub fn set_vm_data(&self, vm_id: usize, value: Option<Box<dyn Any + Send>>) {
        let mut data = self.vm_thread_data.lock();
        if data.len() <= vm_id {
            data.resize_with(vm_id + 1, || None);
        }
        data[vm_id] = value;
    }

    /// Record which registry this thread belongs to. Called once at registration.
    pub fn set_vmkit(&self, vmkit: &Arc<VMKit>) {
        *self.vmkit.lock() = Some(Arc::downgrade(vmkit));
    }

    /// The registry this thread is attached to, if it is still alive.
    pub fn vmkit(&self) -> Option<Arc<VMKit>> {
        self.vmkit.lock().as_ref().and_then(Weak::upgrade)
    }
}

thread_local! {
    static CURRENT: RefCell<Option<Arc<ThreadHandle>>> = const { RefCell::new(None) };
}
