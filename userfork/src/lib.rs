//! # ExoFork
//!
//! User-space `fork` with copy-on-write, built entirely on the raw
//! page-mapping primitives of the [`Exokernel`] contract: the kernel knows
//! how to allocate, map and unmap single pages and how to deliver page
//! faults back into user code, and nothing else.
//!
//! Duplication is lazy. [`Proc::fork`] walks the parent's address space and
//! transfers every present user page into the child *by mapping, not by
//! copying*: writable and copy-on-write pages are demoted to `COW` on both
//! sides, `SHARED` pages keep their permissions, read-only pages stay
//! read-only. The first write either process makes to a `COW` page traps
//! into [`pgfault`], which copies that one page into a private frame and
//! remaps it writable.
//!
//! Failure policy: a mapping syscall that fails mid-fork or mid-resolution
//! leaves an address space that is not safe to continue with, so both the
//! orchestrator and the fault handler panic with the failing call's
//! diagnostic instead of unwinding into a half-duplicated process.
//!
//! [`Exokernel`]: exofork_abi::Exokernel

#![no_std]

#[cfg(test)]
extern crate std;

mod duppage;
mod fork;
mod pgfault;

pub use fork::{ForkResult, Proc};
pub use pgfault::{install_pgfault_handler, pgfault};
