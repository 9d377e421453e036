//! Error types for the recoverable slice of VMKit's API.
//!
//! Most of the failure modes this crate recognises (§7 of the design notes) are not
//! represented here at all: running out of memory growing an internal queue, a
//! panicking user callback, and a failed signal-handler install are all handled by
//! logging and either aborting or silently continuing, by policy, at the call site.
//! `VmKitError` covers what's left: setup-time failures a caller can reasonably
//! react to.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum VmKitError {
    #[error("invalid VMKit option {name}: {reason}")]
    InvalidOption { name: &'static str, reason: String },

    #[error("failed to spawn {role} worker thread: {source}")]
    WorkerSpawn {
        role: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to install signal handler for uncooperative rendezvous: {0}")]
    SignalInstall(std::io::Error),

    #[error("virtual machine slot {0} is not registered")]
    UnknownVm(crate::vm::VmId),
}

pub type Result<T> = std::result::Result<T, VmKitError>;
