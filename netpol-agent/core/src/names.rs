//! Naming for kernel address sets and set lists.
//!
//! Sets are referenced by rules through a hashed external name so that
//! arbitrarily long namespace/label combinations stay within the backend's
//! 31-character set-name limit. The hash must be stable across process
//! restarts: a rule installed by a previous run has to resolve to the same
//! set as the one the current run manages.

/// The set list holding every known namespace set.
pub const ALL_NAMESPACES: &str = "all-namespaces";

/// Namespace whose workloads are always admitted by the chain skeleton.
pub const KUBE_SYSTEM: &str = "kube-system";

/// Deployment-controller label excluded from label-set membership.
pub const POD_TEMPLATE_HASH: &str = "pod-template-hash";

/// Prefix for every external set name.
pub const SET_PREFIX: &str = "npol-";

/// The backend's set-name length budget. `SET_PREFIX` plus ten decimal
/// digits must fit.
pub const MAX_SET_NAME_LEN: usize = 31;

/// 32-bit FNV-1a. Not collision-resistant, just short and stable.
pub fn hash32(s: &str) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for b in s.as_bytes() {
        hash ^= u32::from(*b);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

/// The kernel-facing name for an internal set or list name.
pub fn external_name(internal: &str) -> String {
    let name = format!("{}{}", SET_PREFIX, hash32(internal));
    debug_assert!(name.len() <= MAX_SET_NAME_LEN);
    name
}

/// The set holding pods carrying label `key=value`, and equally the list
/// holding namespaces carrying that label.
pub fn label_set(scope: &str, key: &str, value: &str) -> String {
    format!("{}-{}:{}", scope, key, value)
}

/// Whether a pod label key is the deployment template hash and must not
/// produce set membership.
pub fn is_template_hash(key: &str) -> bool {
    key.contains(POD_TEMPLATE_HASH)
}
