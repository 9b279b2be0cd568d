//! Management of the filter-chain graph.
//!
//! The agent owns a fixed skeleton of chains hanging off the host's FORWARD
//! chain:
//!
//! ```text
//!   FORWARD -> NETPOL
//!   NETPOL  -> accept RELATED,ESTABLISHED / accept kube-system
//!   NETPOL  -> NETPOL-INGRESS-PORT -> NETPOL-INGRESS-FROM
//!   NETPOL  -> NETPOL-EGRESS-PORT  -> NETPOL-EGRESS-TO
//!   NETPOL  -> NETPOL-TARGET-SETS
//! ```
//!
//! Policy-derived rules are always appended so the stateful exception and the
//! skeleton jumps stay ahead of them. Every mutation probes for existence
//! first; add and delete are therefore idempotent.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

use fs2::FileExt;
use netpol_agent_core::{
    exec::{self, CommandRunner, Disposition},
    names,
};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};
use tracing::{debug, warn};

const IPTABLES: &str = "iptables";
const IPTABLES_SAVE: &str = "iptables-save";
const IPTABLES_RESTORE: &str = "iptables-restore";

const CREATE_CHAIN: &str = "-N";
const APPEND: &str = "-A";
const INSERT: &str = "-I";
const DELETE: &str = "-D";
const FLUSH: &str = "-F";
const DESTROY_CHAIN: &str = "-X";
const CHECK: &str = "-C";

pub const ACCEPT: &str = "ACCEPT";
pub const REJECT: &str = "REJECT";
pub const JUMP: &str = "-j";
pub const MATCH: &str = "-m";
pub const SET_MODULE: &str = "set";
pub const MATCH_SET: &str = "--match-set";
pub const SRC: &str = "src";
pub const DST: &str = "dst";
pub const PROTOCOL: &str = "-p";
pub const DPORT: &str = "--dport";
pub const SRC_CIDR: &str = "-s";
pub const DST_CIDR: &str = "-d";

/// Chain names. Bit-exact: these appear in the kernel and must match what a
/// previous run installed.
pub mod chains {
    pub const FORWARD: &str = "FORWARD";
    pub const ROOT: &str = "NETPOL";
    pub const INGRESS_PORT: &str = "NETPOL-INGRESS-PORT";
    pub const INGRESS_FROM: &str = "NETPOL-INGRESS-FROM";
    pub const EGRESS_PORT: &str = "NETPOL-EGRESS-PORT";
    pub const EGRESS_TO: &str = "NETPOL-EGRESS-TO";
    pub const TARGET_SETS: &str = "NETPOL-TARGET-SETS";

    /// Every agent-owned chain, in teardown order.
    pub const ALL: [&str; 6] = [
        ROOT,
        INGRESS_PORT,
        INGRESS_FROM,
        EGRESS_PORT,
        EGRESS_TO,
        TARGET_SETS,
    ];
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Exec(#[from] exec::Error),

    #[error("failed to lock {path}: {source}")]
    Lock {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("snapshot io on {path}: {source}")]
    Snapshot {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// One filter rule: the chain it lives in plus its match/target argument
/// vector, exactly as handed to the backend.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Rule {
    pub chain: String,
    pub specs: Vec<String>,
}

impl Rule {
    pub fn new(chain: impl Into<String>, specs: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            chain: chain.into(),
            specs: specs.into_iter().map(Into::into).collect(),
        }
    }

    /// A bare jump rule, as used for the skeleton edges.
    pub fn jump(chain: impl Into<String>, target: &str) -> Self {
        Self::new(chain, [JUMP, target])
    }
}

/// Owns the chain skeleton and the rules within it.
#[derive(Debug)]
pub struct IptablesManager {
    runner: Arc<dyn CommandRunner>,
    /// Passed as `-w` on every rule operation; the backend CLI does not
    /// serialize concurrent writers on its own.
    wait_secs: u32,
    /// Advisory lock taken for the duration of save/restore.
    lock_path: PathBuf,
}

impl IptablesManager {
    pub fn new(runner: Arc<dyn CommandRunner>, wait_secs: u32, lock_path: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            wait_secs,
            lock_path: lock_path.into(),
        }
    }

    /// Idempotently installs the root chain, its sub-chains, and the jump
    /// edges between them.
    ///
    /// Order matters: root first, then the FORWARD jump, then the stateful
    /// exception and kube-system allowances at the head of root, then the
    /// sub-chains with their root-level jumps appended in dispatch order.
    pub fn init_chain_skeleton(&self) -> Result<()> {
        debug!("initializing filter chains");

        self.add_chain(chains::ROOT)?;

        let forward_jump = Rule::jump(chains::FORWARD, chains::ROOT);
        if !self.rule_exists(&forward_jump)? {
            self.run(INSERT, &forward_jump.chain, &forward_jump.specs)?;
        }

        let established = Rule::new(
            chains::ROOT,
            [MATCH, "state", "--state", "RELATED,ESTABLISHED", JUMP, ACCEPT],
        );
        if !self.rule_exists(&established)? {
            self.run(INSERT, &established.chain, &established.specs)?;
        }

        let kube_system = names::external_name(names::KUBE_SYSTEM);
        for dir in [DST, SRC] {
            let allow = Rule::new(
                chains::ROOT,
                [MATCH, SET_MODULE, MATCH_SET, kube_system.as_str(), dir, JUMP, ACCEPT],
            );
            self.add_rule(&allow)?;
        }

        self.add_chain(chains::INGRESS_PORT)?;
        self.add_rule(&Rule::jump(chains::ROOT, chains::INGRESS_PORT))?;
        self.add_chain(chains::INGRESS_FROM)?;

        self.add_chain(chains::EGRESS_PORT)?;
        self.add_rule(&Rule::jump(chains::ROOT, chains::EGRESS_PORT))?;
        self.add_chain(chains::EGRESS_TO)?;

        self.add_chain(chains::TARGET_SETS)?;
        self.add_rule(&Rule::jump(chains::ROOT, chains::TARGET_SETS))?;

        Ok(())
    }

    /// Reverse of [`init_chain_skeleton`]: unhook from FORWARD, then flush
    /// and destroy every agent-owned chain.
    ///
    /// [`init_chain_skeleton`]: IptablesManager::init_chain_skeleton
    pub fn teardown_chain_skeleton(&self) -> Result<()> {
        debug!("removing filter chains");

        let forward_jump = Rule::jump(chains::FORWARD, chains::ROOT);
        self.run(DELETE, &forward_jump.chain, &forward_jump.specs)?;

        for chain in chains::ALL {
            if let Err(error) = self.flush_chain(chain) {
                warn!(%chain, %error, "failed to flush chain");
            }
        }
        for chain in chains::ALL {
            self.delete_chain(chain)?;
        }
        Ok(())
    }

    pub fn add_chain(&self, chain: &str) -> Result<()> {
        match self.run(CREATE_CHAIN, chain, &[])? {
            Disposition::Applied => {}
            Disposition::Benign => debug!(%chain, "chain already exists"),
        }
        Ok(())
    }

    pub fn delete_chain(&self, chain: &str) -> Result<()> {
        match self.run(DESTROY_CHAIN, chain, &[])? {
            Disposition::Applied => {}
            Disposition::Benign => debug!(%chain, "chain does not exist"),
        }
        Ok(())
    }

    pub fn flush_chain(&self, chain: &str) -> Result<()> {
        self.run(FLUSH, chain, &[])?;
        Ok(())
    }

    /// Probes the backend for the rule.
    pub fn rule_exists(&self, rule: &Rule) -> Result<bool> {
        match self.run(CHECK, &rule.chain, &rule.specs)? {
            Disposition::Applied => Ok(true),
            Disposition::Benign => Ok(false),
        }
    }

    /// Appends the rule unless it is already present.
    pub fn add_rule(&self, rule: &Rule) -> Result<()> {
        if self.rule_exists(rule)? {
            return Ok(());
        }
        self.run(APPEND, &rule.chain, &rule.specs)?;
        Ok(())
    }

    /// Deletes the rule if it is present.
    pub fn delete_rule(&self, rule: &Rule) -> Result<()> {
        if !self.rule_exists(rule)? {
            return Ok(());
        }
        self.run(DELETE, &rule.chain, &rule.specs)?;
        Ok(())
    }

    /// Writes the backend's native snapshot to `path`, holding the advisory
    /// lock for the duration.
    pub fn save(&self, path: &Path) -> Result<()> {
        let _lock = self.lock()?;
        let code = self
            .runner
            .run_stdout_to(IPTABLES_SAVE, &[], path)
            .map_err(|source| Error::Snapshot {
                path: path.display().to_string(),
                source,
            })?;
        if code != 0 {
            return Err(exec::Error::Fatal {
                program: IPTABLES_SAVE,
                args: Vec::new(),
                code,
            }
            .into());
        }
        Ok(())
    }

    /// Replays the snapshot at `path` under the advisory lock.
    pub fn restore(&self, path: &Path) -> Result<()> {
        let _lock = self.lock()?;
        let code = self
            .runner
            .run_stdin_from(IPTABLES_RESTORE, &[], path)
            .map_err(|source| Error::Snapshot {
                path: path.display().to_string(),
                source,
            })?;
        if code != 0 {
            return Err(exec::Error::Fatal {
                program: IPTABLES_RESTORE,
                args: Vec::new(),
                code,
            }
            .into());
        }
        Ok(())
    }

    fn lock(&self) -> Result<std::fs::File> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&self.lock_path)
            .map_err(|source| Error::Lock {
                path: self.lock_path.display().to_string(),
                source,
            })?;
        file.lock_exclusive().map_err(|source| Error::Lock {
            path: self.lock_path.display().to_string(),
            source,
        })?;
        // Released on drop via close; fs2 unlocks when the descriptor goes away.
        Ok(file)
    }

    fn run(&self, op: &str, chain: &str, specs: &[String]) -> Result<Disposition> {
        let mut args = vec![
            "-w".to_string(),
            self.wait_secs.to_string(),
            op.to_string(),
            chain.to_string(),
        ];
        args.extend(specs.iter().cloned());
        Ok(exec::execute(&*self.runner, IPTABLES, &args)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use netpol_agent_core::fake::FakeKernel;

    fn manager() -> (IptablesManager, Arc<FakeKernel>) {
        let kernel = Arc::new(FakeKernel::new());
        let lock = std::env::temp_dir().join("netpol-iptables-test.lock");
        (IptablesManager::new(kernel.clone(), 60, lock), kernel)
    }

    #[test]
    fn skeleton_installs_chains_and_edges() {
        let (mgr, kernel) = manager();
        mgr.init_chain_skeleton().unwrap();

        for chain in chains::ALL {
            assert!(kernel.has_chain(chain), "missing {chain}");
        }
        assert_eq!(
            kernel.chain_rules(chains::FORWARD),
            [vec![JUMP.to_string(), chains::ROOT.to_string()]]
        );

        // The stateful exception leads the root chain; the sub-chain jumps
        // follow in dispatch order.
        let root = kernel.chain_rules(chains::ROOT);
        assert_eq!(
            root.first().unwrap(),
            &vec![
                MATCH.to_string(),
                "state".to_string(),
                "--state".to_string(),
                "RELATED,ESTABLISHED".to_string(),
                JUMP.to_string(),
                ACCEPT.to_string(),
            ]
        );
        let jumps: Vec<&str> = root
            .iter()
            .filter_map(|specs| match specs.as_slice() {
                [j, target] if j == JUMP => Some(target.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(
            jumps,
            [chains::INGRESS_PORT, chains::EGRESS_PORT, chains::TARGET_SETS]
        );
    }

    #[test]
    fn skeleton_init_is_idempotent() {
        let (mgr, kernel) = manager();
        mgr.init_chain_skeleton().unwrap();
        let root = kernel.chain_rules(chains::ROOT);
        mgr.init_chain_skeleton().unwrap();
        assert_eq!(kernel.chain_rules(chains::ROOT), root);
        assert_eq!(kernel.chain_rules(chains::FORWARD).len(), 1);
    }

    #[test]
    fn teardown_reverses_init() {
        let (mgr, kernel) = manager();
        mgr.init_chain_skeleton().unwrap();
        mgr.teardown_chain_skeleton().unwrap();

        for chain in chains::ALL {
            assert!(!kernel.has_chain(chain), "{chain} survived teardown");
        }
        assert!(kernel.chain_rules(chains::FORWARD).is_empty());
    }

    #[test]
    fn add_rule_probes_before_appending() {
        let (mgr, kernel) = manager();
        mgr.add_chain("NETPOL").unwrap();
        let rule = Rule::new("NETPOL", [JUMP, ACCEPT]);
        mgr.add_rule(&rule).unwrap();
        mgr.add_rule(&rule).unwrap();
        assert_eq!(kernel.chain_rules("NETPOL").len(), 1);

        mgr.delete_rule(&rule).unwrap();
        mgr.delete_rule(&rule).unwrap();
        assert!(kernel.chain_rules("NETPOL").is_empty());
    }

    #[test]
    fn rule_operations_wait_for_the_backend_lock() {
        let (mgr, kernel) = manager();
        mgr.add_chain("NETPOL").unwrap();
        for inv in kernel.invocations() {
            assert_eq!(inv.args[0], "-w");
            assert_eq!(inv.args[1], "60");
        }
    }
}
