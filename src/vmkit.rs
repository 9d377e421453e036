//! The process-wide registry (§3 "VMKit", §4.4): owns the VM slots, the thread
//! lists, the rendezvous, the lazily-created finalizer/reference workers, and the
//! function map.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::collector::{Collector, ObjectRef, TracingContext};
use crate::error::{Result, VmKitError};
use crate::finalizer::FinalizerThread;
use crate::function_map::FunctionMap;
use crate::options::VMKitOptions;
use crate::reference::ReferenceThread;
use crate::rendezvous::{Rendezvous, RendezvousStrategy};
use crate::sync::Monitor;
use crate::thread::ThreadHandle;
use crate::vm::{LanguageError, VirtualMachine, VmId};

struct Registry {
    vms: Vec<Option<Arc<dyn VirtualMachine>>>,
    prepared_threads: Vec<Arc<ThreadHandle>>,
    running_threads: Vec<Arc<ThreadHandle>>,
}

impl Registry {
    fn grow_thread_data(&self, len: usize) {
        for t in self.prepared_threads.iter().chain(self.running_threads.iter()) {
            t.grow_vm_data(len);
        }
    }
}

/// Count + condvar for the "does the process have any reason to keep running"
/// question (§4.4 "Non-daemon accounting").
pub struct NonDaemonThreadManager {
    count: Mutex<usize>,
    cond: Condvar,
}

impl NonDaemonThreadManager {
    fn new() -> Self {
        Self {
            count: Mutex::new(0),
            cond: Condvar::new(),
        }
    }

    pub fn enter_non_daemon_mode(&self) {
        *self.count.lock() += 1;
    }

    pub fn leave_non_daemon_mode(&self) {
        let mut count = self.count.lock();
        *count -= 1;
        if *count == 0 {
            self.cond.notify_all();
        }
    }

    /// Block until no non-daemon thread remains — how a host process "joins" the
    /// managed application.
    pub fn wait_non_daemon_threads(&self) {
        let mut count = self.count.lock();
        while *count != 0 {
            self.cond.wait(&mut count);
        }
    }
}

/// The outcome of [`VMKit::start_collection`] (§3/§4.4, testable property 4).
pub enum CollectionOutcome<'vmkit> {
    /// This call drove the collection; `CollectionGuard` must be passed back to
    /// [`VMKit::end_collection`] once tracing and queue scanning are done.
    Ran(CollectionGuard<'vmkit>),
    /// Another collection was already in progress; this thread joined it and the
    /// world has resumed by the time this is returned.
    AlreadyRunning,
}

/// Holds the registry lock for the duration of one stop-the-world collection.
///
/// Exists so the registry lock acquired by `start_collection` (§4.4: "Acquire the
/// registry lock... return with both locks held") can span the caller's tracing and
/// reference/finalizer scanning without VMKit itself needing to know what a
/// collector does with that window.
pub struct CollectionGuard<'vmkit> {
    vmkit: &'vmkit VMKit,
    registry: MutexGuard<'vmkit, Registry>,
}

impl<'vmkit> CollectionGuard<'vmkit> {
    /// Call every registered VM's `tracer` hook. Safe to call only with the world
    /// stopped, which is guaranteed by holding this guard.
    pub fn tracer(&self, ctx: &mut TracingContext) {
        for vm in self.registry.vms.iter().flatten() {
            vm.tracer(ctx);
        }
    }

    /// Scan the weak/soft/phantom reference queues against every registered VM's
    /// referents (§4.2). A no-op if no reference worker has ever been allocated.
    pub fn scan_references(&self, collector: &dyn Collector, ctx: &mut TracingContext) {
        if let Some(reference) = self.vmkit.reference.get() {
            reference.scan_all(&|id| self.vmkit.vm(id), collector, ctx);
        }
    }

    /// Scan the finalization candidate queue (§4.3). A no-op if no finalizer
    /// worker has ever been allocated.
    pub fn scan_finalization(&self, collector: &dyn Collector, ctx: &mut TracingContext) {
        if let Some(finalizer) = self.vmkit.finalizer.get() {
            finalizer.scan_finalization_queue(|id| self.vmkit.vm(id), collector, ctx);
        }
    }

    pub fn running_threads(&self) -> &[Arc<ThreadHandle>] {
        &self.registry.running_threads
    }
}

/// The substrate's process-wide (or, in tests, instance-scoped) registry.
pub struct VMKit {
    options: VMKitOptions,
    registry: Mutex<Registry>,
    rendezvous: Rendezvous,
    finalizer: OnceLock<Arc<FinalizerThread>>,
    reference: OnceLock<Arc<ReferenceThread>>,
    non_daemon: NonDaemonThreadManager,
    function_map: FunctionMap,
    finalizer_spawned: AtomicBool,
    reference_spawned: AtomicBool,
    /// Per-object monitors (§5 "`VMObject::wait`/`timed_wait`/`notify`/`notify_all`
    /// implement classical per-object monitors backed by a per-object
    /// lazily-allocated... recursive mutex + condvar"). Entries are created on
    /// first use and never removed; a VM is expected to drop its `ObjectRef`s
    /// (and stop calling in with them) once the underlying object is collected.
    monitors: Mutex<HashMap<ObjectRef, Arc<Monitor<()>>>>,
}

impl VMKit {
    /// Build a new, empty registry with the given rendezvous strategy.
    pub fn new(options: VMKitOptions, strategy: RendezvousStrategy) -> Arc<Self> {
        Arc::new(Self {
            options,
            registry: Mutex::new(Registry {
                vms: Vec::new(),
                prepared_threads: Vec::new(),
                running_threads: Vec::new(),
            }),
            rendezvous: Rendezvous::new(strategy),
            finalizer: OnceLock::new(),
            reference: OnceLock::new(),
            non_daemon: NonDaemonThreadManager::new(),
            function_map: FunctionMap::new(),
            finalizer_spawned: AtomicBool::new(false),
            reference_spawned: AtomicBool::new(false),
            monitors: Mutex::new(HashMap::new()),
        })
    }

    pub fn options(&self) -> &VMKitOptions {
        &self.options
    }

    pub fn rendezvous(&self) -> &Rendezvous {
        &self.rendezvous
    }

    pub fn function_map(&self) -> &FunctionMap {
        &self.function_map
    }

    pub fn non_daemon(&self) -> &NonDaemonThreadManager {
        &self.non_daemon
    }

    /// Look up a registered VM by slot, if still present.
    pub fn vm(&self, id: VmId) -> Option<Arc<dyn VirtualMachine>> {
        self.registry.lock().vms.get(id.0).and_then(Option::clone)
    }

    /// Register a new VM, assigning it the first empty slot (growing the registry
    /// by doubling if none is free) and returning that slot (§4.4).
    pub fn add_vm(&self, vm: Arc<dyn VirtualMachine>) -> VmId {
        let mut registry = self.registry.lock();

        let slot = registry.vms.iter().position(Option::is_none);
        let id = match slot {
            Some(i) => i,
            None => {
                let old_len = registry.vms.len();
                let new_len = if old_len == 0 { 1 } else { old_len * 2 };
                registry.vms.resize_with(new_len, || None);
                registry.grow_thread_data(new_len);
                old_len
            }
        };

        vm.set_vm_id(VmId(id));
        registry.vms[id] = Some(vm);
        log::debug!("registered vm at slot {id}");
        VmId(id)
    }

    /// Clear a VM's slot. Does not itself wait for the VM's threads to quiesce —
    /// callers are responsible for that.
    pub fn remove_vm(&self, id: VmId) {
        let mut registry = self.registry.lock();
        if let Some(slot) = registry.vms.get_mut(id.0) {
            *slot = None;
        }
        log::debug!("removed vm at slot {}", id.0);
    }

    /// Register a newly-created thread as prepared (attached but not yet running
    /// managed code).
    pub fn register_prepared_thread(self: &Arc<Self>, thread: Arc<ThreadHandle>) {
        let mut registry = self.registry.lock();
        thread.grow_vm_data(registry.vms.len());
        thread.set_vmkit(self);
        registry.prepared_threads.push(thread);
    }

    /// Remove a prepared thread that never ran (e.g. failed to start). Its per-VM
    /// data is dropped along with the `Arc`.
    pub fn unregister_prepared_thread(&self, thread: &Arc<ThreadHandle>) {
        let mut registry = self.registry.lock();
        registry.prepared_threads.retain(|t| t.id() != thread.id());
    }

    /// Move a thread from prepared to running, installing the uncooperative
    /// rendezvous signal handler on it if that strategy is in effect (§4.1
    /// `prepare_for_join`, "on first entry").
    ///
    /// Installs the handler *before* the thread becomes visible in
    /// `running_threads`: otherwise a concurrent `synchronize()` could snapshot
    /// this thread and `pthread_kill` it before a handler exists, which for a
    /// real-time signal terminates the process by default.
    pub fn register_running_thread(&self, thread: Arc<ThreadHandle>) -> Result<()> {
        self.rendezvous.prepare_for_join(&thread)?;
        let mut registry = self.registry.lock();
        registry.prepared_threads.retain(|t| t.id() != thread.id());
        registry.running_threads.push(thread);
        Ok(())
    }

    /// Move a thread back from running to prepared (e.g. it is about to exit or
    /// park for the long term outside any VM's accounting).
    pub fn unregister_running_thread(&self, thread: Arc<ThreadHandle>) {
        let mut registry = self.registry.lock();
        registry.running_threads.retain(|t| t.id() != thread.id());
        registry.prepared_threads.push(thread);
    }

    pub fn running_thread_count(&self) -> usize {
        self.registry.lock().running_threads.len()
    }

    /// This object's monitor, lazily allocating one on first use (§5).
    fn monitor_for(&self, obj: ObjectRef) -> Arc<Monitor<()>> {
        self.monitors
            .lock()
            .entry(obj)
            .or_insert_with(|| Arc::new(Monitor::new(())))
            .clone()
    }

    fn raise_language_error(&self, owner: VmId, error: LanguageError, thread: &ThreadHandle) {
        match self.vm(owner) {
            Some(vm) => vm.raise_language_error(error, thread),
            None => log::warn!(
                "language error {error:?} on thread {} but owning vm {owner} is gone",
                thread.id()
            ),
        }
    }

    /// Enter `obj`'s monitor, blocking until acquired. Recursive re-entry by the
    /// same thread never blocks (§5, testable property 8).
    pub fn monitor_enter(&self, obj: ObjectRef, thread: &ThreadHandle) {
        self.monitor_for(obj).raw_lock(thread.id());
    }

    /// Leave one recursion level of `obj`'s monitor. Raises
    /// `LanguageError::IllegalMonitorState` through `owner` instead of unlocking if
    /// `thread` does not currently hold it (§7).
    pub fn monitor_exit(&self, owner: VmId, obj: ObjectRef, thread: &ThreadHandle) {
        let monitor = self.monitor_for(obj);
        if !monitor.is_held_by(thread.id()) {
            self.raise_language_error(owner, LanguageError::IllegalMonitorState, thread);
            return;
        }
        // SAFETY: just checked `thread` holds this monitor.
        unsafe { monitor.raw_unlock(thread.id()) };
    }

    /// Wait on `obj`'s monitor: release every recursion level, block until
    /// notified or `timeout` elapses (`None` waits indefinitely), then reacquire
    /// them all (§5). Interrupt takes precedence over a timeout expiring at the
    /// same time: either way, raises `LanguageError::IllegalMonitorState` through
    /// `owner` if `thread` doesn't hold the monitor, or `LanguageError::Interrupted`
    /// if the thread's interrupt flag was set by the time the wait returned.
    pub fn monitor_wait(&self, owner: VmId, obj: ObjectRef, thread: &Arc<ThreadHandle>, timeout: Option<Duration>) {
        let monitor = self.monitor_for(obj);
        if !monitor.is_held_by(thread.id()) {
            self.raise_language_error(owner, LanguageError::IllegalMonitorState, thread);
            return;
        }

        thread.set_waiting_monitor(Some(monitor.clone()));
        // SAFETY: just checked `thread` holds this monitor.
        unsafe {
            match timeout {
                Some(d) => {
                    monitor.raw_wait_timeout(thread.id(), d);
                }
                None => monitor.raw_wait(thread.id()),
            }
        }
        thread.set_waiting_monitor(None);

        if thread.take_interrupt() {
            self.raise_language_error(owner, LanguageError::Interrupted, thread);
        }
    }

    /// Wake one thread parked in `monitor_wait` on `obj`. Raises
    /// `LanguageError::IllegalMonitorState` through `owner` if `thread` does not
    /// hold the monitor.
    pub fn monitor_notify(&self, owner: VmId, obj: ObjectRef, thread: &ThreadHandle) {
        let monitor = self.monitor_for(obj);
        if !monitor.is_held_by(thread.id()) {
            self.raise_language_error(owner, LanguageError::IllegalMonitorState, thread);
            return;
        }
        monitor.notify_one();
    }

    /// As [`VMKit::monitor_notify`] but wakes every thread parked on `obj`.
    pub fn monitor_notify_all(&self, owner: VmId, obj: ObjectRef, thread: &ThreadHandle) {
        let monitor = self.monitor_for(obj);
        if !monitor.is_held_by(thread.id()) {
            self.raise_language_error(owner, LanguageError::IllegalMonitorState, thread);
            return;
        }
        monitor.notify_all();
    }

    /// Lazily spawn the finalizer worker thread the first time a finalization
    /// candidate needs one.
    fn finalizer_thread(self: &Arc<Self>) -> Result<&Arc<FinalizerThread>> {
        let finalizer = self
            .finalizer
            .get_or_init(|| Arc::new(FinalizerThread::new(self.options.queue_initial_capacity)));

        if !self.finalizer_spawned.swap(true, Ordering::AcqRel) {
            let finalizer = finalizer.clone();
            let vmkit = self.clone();
            std::thread::Builder::new()
                .name("vmkit-finalizer".into())
                .stack_size(self.options.worker_stack_size)
                .spawn(move || {
                    log::info!("finalizer worker started");
                    finalizer.run_worker(move |id| vmkit.vm(id));
                })
                .map_err(|source| VmKitError::WorkerSpawn {
                    role: "finalizer",
                    source,
                })?;
        }

        Ok(finalizer)
    }

    /// Lazily spawn the reference worker thread the first time a reference needs
    /// one.
    fn reference_thread(self: &Arc<Self>) -> Result<&Arc<ReferenceThread>> {
        let reference = self
            .reference
            .get_or_init(|| Arc::new(ReferenceThread::new(self.options.queue_initial_capacity)));

        if !self.reference_spawned.swap(true, Ordering::AcqRel) {
            let reference = reference.clone();
            let vmkit = self.clone();
            std::thread::Builder::new()
                .name("vmkit-reference".into())
                .stack_size(self.options.worker_stack_size)
                .spawn(move || {
                    log::info!("reference worker started");
                    reference.run_worker(move |id| vmkit.vm(id));
                })
                .map_err(|source| VmKitError::WorkerSpawn {
                    role: "reference",
                    source,
                })?;
        }

        Ok(reference)
    }

    pub fn add_finalization_candidate(
        self: &Arc<Self>,
        owner: VmId,
        object: crate::collector::ObjectRef,
    ) -> Result<()> {
        self.finalizer_thread()?.add_finalization_candidate(object, owner);
        Ok(())
    }

    pub fn add_weak_reference(
        self: &Arc<Self>,
        owner: VmId,
        reference: crate::collector::ObjectRef,
    ) -> Result<()> {
        self.reference_thread()?.weak.add_reference(owner, reference);
        Ok(())
    }

    pub fn add_soft_reference(
        self: &Arc<Self>,
        owner: VmId,
        reference: crate::collector::ObjectRef,
    ) -> Result<()> {
        self.reference_thread()?.soft.add_reference(owner, reference);
        Ok(())
    }

    pub fn add_phantom_reference(
        self: &Arc<Self>,
        owner: VmId,
        reference: crate::collector::ObjectRef,
    ) -> Result<()> {
        self.reference_thread()?.phantom.add_reference(owner, reference);
        Ok(())
    }

    /// Request a stop-the-world collection (§4.4). If another collection is
    /// already in progress, joins it instead and returns
    /// [`CollectionOutcome::AlreadyRunning`] once the world has resumed.
    pub fn start_collection(self: &Arc<Self>) -> CollectionOutcome<'_> {
        let current = ThreadHandle::current().expect("start_collection called from an unattached thread");

        self.rendezvous.start_rv();

        if current.yield_requested() {
            self.rendezvous.cancel_rv();
            self.rendezvous.join(&current);
            return CollectionOutcome::AlreadyRunning;
        }

        log::info!("starting collection");
        let registry = self.registry.lock();

        for vm in registry.vms.iter().flatten() {
            vm.start_collection();
        }

        self.rendezvous.synchronize(&current, &registry.running_threads);

        CollectionOutcome::Ran(CollectionGuard {
            vmkit: self,
            registry,
        })
    }

    /// Spawn a `LauncherThread` for `vm` (§4.6): a dedicated OS thread that attaches
    /// as a non-daemon mutator, runs `vm.run_application_impl`, then detaches.
    ///
    /// Returns as soon as the launcher thread is spawned — it does not wait for the
    /// application to finish. The launcher is the anchor of the process: combined
    /// with any other non-daemon threads the application itself registers, a host
    /// waits for all of them to exit via [`NonDaemonThreadManager::wait_non_daemon_threads`].
    pub fn run_application(self: &Arc<Self>, vm: Arc<dyn VirtualMachine>, argv: Vec<String>) -> Result<()> {
        let vmkit = self.clone();
        std::thread::Builder::new()
            .name("vmkit-launcher".into())
            .spawn(move || {
                let thread = ThreadHandle::new(false);
                vmkit.register_prepared_thread(thread.clone());
                if let Err(err) = vmkit.register_running_thread(thread.clone()) {
                    log::error!("launcher thread failed to register: {err}");
                    return;
                }

                vmkit.non_daemon.enter_non_daemon_mode();
                let exit_code = vm.run_application_impl(&thread, &argv);
                log::info!("application exited with code {exit_code}");

                vmkit.unregister_running_thread(thread);
                vmkit.non_daemon.leave_non_daemon_mode();
            })
            .map(|_| ())
            .map_err(|source| VmKitError::WorkerSpawn {
                role: "launcher",
                source,
            })
    }

    /// Finish a collection started by [`VMKit::start_collection`] (§4.4).
    pub fn end_collection(self: &Arc<Self>, guard: CollectionGuard<'_>) {
        let current = ThreadHandle::current().expect("end_collection called from an unattached thread");

        self.rendezvous.finish_rv(&current, &guard.registry.running_threads);

        for vm in guard.registry.vms.iter().flatten() {
            vm.end_collection();
        }

        if let Some(finalizer) = self.finalizer.get() {
            finalizer.notify_end_of_collection();
        }
        if let Some(reference) = self.reference.get() {
            reference.notify_end_of_collection();
        }

        log::info!("collection finished");
        drop(guard);
    }
}
