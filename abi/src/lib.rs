//! # ExoFork ABI
//!
//! Shared vocabulary between a user process and the exokernel it runs on:
//! addresses and page numbers, the page-permission bitmask, fault records,
//! process identifiers, the error model and the [`Exokernel`] call contract.
//!
//! Everything here is `no_std`; nothing in this crate allocates.

#![no_std]

pub mod addr;
pub mod calls;
pub mod error;
pub mod fault;
pub mod layout;
pub mod perms;

// Réexportations
pub use addr::{PageNumber, VirtAddr};
pub use calls::{CreateChild, Exokernel, ProcId, ProcStatus};
pub use error::{ErrorCode, Result, SysError};
pub use fault::{FaultCause, FaultContext, FaultUpcall};
pub use perms::PagePerms;
