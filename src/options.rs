//! Tunables assembled once when a [`VMKit`](crate::VMKit) is built.
//!
//! Every field has a hard-coded default and can be overridden by an environment
//! variable, read once at [`VMKitOptions::from_env`]
//! time. A malformed environment variable is a [`VmKitError::InvalidOption`], not a
//! silent fallback to the default.

use crate::error::{Result, VmKitError};

/// Initial capacity used by every growable reference/finalization queue.
pub const DEFAULT_QUEUE_INITIAL_CAPACITY: usize = 256;
/// Growth factor applied when a queue is full.
pub const QUEUE_GROWTH_FACTOR: usize = 2;

#[derive(Debug, Clone)]
pub struct VMKitOptions {
    /// Initial capacity for the weak/soft/phantom reference queues, the finalization
    /// candidate queue, and the reference worker's `to_enqueue` queue.
    pub queue_initial_capacity: usize,
    /// Real-time signal number used to request a safepoint in the uncooperative
    /// rendezvous strategy.
    pub rendezvous_signal: libc::c_int,
    /// Stack size, in bytes, for the finalizer and reference worker threads.
    pub worker_stack_size: usize,
}

impl Default for VMKitOptions {
    fn default() -> Self {
        Self {
            queue_initial_capacity: DEFAULT_QUEUE_INITIAL_CAPACITY,
            rendezvous_signal: default_rendezvous_signal(),
            worker_stack_size: 256 * 1024,
        }
    }
}

impl VMKitOptions {
    /// Build options from defaults, overridden by environment variables.
    pub fn from_env() -> Result<Self> {
        let mut opts = Self::default();

        if let Ok(raw) = std::env::var("VMKIT_QUEUE_INITIAL_CAPACITY") {
            opts.queue_initial_capacity = parse_env("VMKIT_QUEUE_INITIAL_CAPACITY", &raw)?;
            if opts.queue_initial_capacity == 0 {
                return Err(VmKitError::InvalidOption {
                    name: "VMKIT_QUEUE_INITIAL_CAPACITY",
                    reason: "must be non-zero".into(),
                });
            }
        }

        if let Ok(raw) = std::env::var("VMKIT_RENDEZVOUS_SIGNAL") {
            opts.rendezvous_signal = parse_env("VMKIT_RENDEZVOUS_SIGNAL", &raw)?;
        }

        if let Ok(raw) = std::env::var("VMKIT_WORKER_STACK_SIZE") {
            opts.worker_stack_size = parse_env("VMKIT_WORKER_STACK_SIZE", &raw)?;
            if opts.worker_stack_size < 16 * 1024 {
                return Err(VmKitError::InvalidOption {
                    name: "VMKIT_WORKER_STACK_SIZE",
                    reason: "must be at least 16KiB".into(),
                });
            }
        }

        Ok(opts)
    }
}

fn parse_env<T: std::str::FromStr>(name: &'static str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| VmKitError::InvalidOption {
            name,
            reason: format!("{raw:?} is not a valid value"),
        })
}

fn default_rendezvous_signal() -> libc::c_int {
    // SIGRTMIN is a function-like macro on glibc (the value isn't fixed across libc
    // implementations), so it must be read at runtime rather than baked in as a
    // constant. We reserve the first unused real-time signal for safepoint requests.
    cfg_if::cfg_if! {
        if #[cfg(target_os = "linux")] {
            unsafe { libc::SIGRTMIN() + 1 }
        } else {
            libc::SIGUSR2
        }
    }
}
