//! # ExoFork Sim
//!
//! An in-memory model of the exokernel call surface, used as the hosted
//! test platform for the user-space fork library.
//!
//! The model keeps a reference-counted frame table and one page-mapping
//! table per process, validates syscall arguments the way the real kernel
//! would, and delivers page-fault upcalls synchronously from its own
//! memory-access paths. It is not a kernel: there is no instruction stream
//! and no scheduler. The driver (normally a test) decides which process is
//! "executing" via [`SimKernel::set_current`] and issues loads and stores
//! on its behalf through the [`Exokernel`] user-memory methods.
//!
//! [`Exokernel`]: exofork_abi::Exokernel

mod frames;
mod kernel;

pub use frames::FrameId;
pub use kernel::{SimKernel, SimStats, DEFAULT_FRAME_LIMIT, FIRST_PID};
