//! VMKit is a substrate for building managed-language virtual machines.
//!
//! It provides the infrastructure that lets multiple managed VMs coexist in one
//! process under a single garbage collector: a stop-the-world rendezvous for precise
//! tracing, a weak/soft/phantom reference subsystem, a finalizer, a per-process
//! thread registry, and an instruction-pointer-to-method map used for stack walking.
//!
//! What VMKit deliberately does *not* provide: a bytecode parser, a JIT, a type
//! system, or any particular managed language's object model. Those are supplied by
//! implementing the [`VirtualMachine`] and [`Collector`] traits.

pub mod collector;
pub mod error;
pub mod finalizer;
pub mod function_map;
pub mod options;
pub mod reference;
pub mod rendezvous;
pub mod stack_walk;
pub mod sync;
pub mod thread;
pub mod testkit;
pub mod vm;
pub mod vmkit;

pub use collector::{Collector, ObjectRef, TracingContext};
pub use error::VmKitError;
pub use options::VMKitOptions;
pub use vm::{FinalizeKind, VirtualMachine, VmId};
pub use vmkit::{CollectionOutcome, VMKit};
