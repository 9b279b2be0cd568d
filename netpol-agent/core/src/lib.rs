//! Shared plumbing for the network policy agent: the naming scheme for kernel
//! address sets and the contract for invoking the packet-filter command-line
//! backends.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod exec;
pub mod names;

#[cfg(feature = "test-util")]
pub mod fake;
