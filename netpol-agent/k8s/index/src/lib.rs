//! Keeps the kernel packet-filter state converged with the cluster's pods,
//! namespaces, and network policies.
//!
//! A single [`Index`] holds the in-memory model and drives the address-set
//! and filter-rule managers. Each resource watch is consumed by its own
//! event loop ([`index_pods`], [`index_namespaces`],
//! [`index_network_policies`]) dispatching into the `SharedIndex`; the
//! write lock serializes handlers, one acquisition per step. Updates are
//! staged as delete-then-add with the lock released in between, so another
//! event may interleave, exactly as the original informer callbacks
//! allowed.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod index;
pub mod metrics;
mod namespace;
mod pod;
mod policy;


pub use self::{
    index::{Index, SharedIndex},
    namespace::index_namespaces,
    pod::index_pods,
    policy::index_network_policies,
};
