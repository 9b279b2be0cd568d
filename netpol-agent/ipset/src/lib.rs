//! Management of named kernel address sets.
//!
//! Two families of objects are tracked: hash sets of pod IPs, and lists whose
//! members are other sets (one list per namespace label, plus the global
//! all-namespaces list). The in-memory element vectors mirror what has been
//! written to the kernel; every mutation goes through the backend first and
//! is recorded here only on success, so that replayed cluster events are
//! no-ops rather than errors.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

use ahash::AHashMap as HashMap;
use netpol_agent_core::{
    exec::{self, CommandRunner, Disposition},
    names,
};
use std::{path::Path, sync::Arc};
use tracing::{debug, info, warn};

const IPSET: &str = "ipset";

const CREATE: &str = "-N";
const APPEND: &str = "-A";
const DELETE: &str = "-D";
const DESTROY: &str = "-X";
const FLUSH: &str = "-F";
const EXIST_OK: &str = "-exist";

/// Storage type for pod-IP sets.
const NET_HASH: &str = "nethash";
/// Storage type for lists of sets.
const SET_LIST: &str = "setlist";

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Exec(#[from] exec::Error),

    #[error("failed to read snapshot {path}: {source}")]
    Snapshot {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Default)]
struct Ipset {
    elements: Vec<String>,
    refer_count: usize,
}

/// Owns every address set and set list installed by this agent.
#[derive(Debug)]
pub struct IpsetManager {
    runner: Arc<dyn CommandRunner>,
    sets: HashMap<String, Ipset>,
    lists: HashMap<String, Ipset>,
}

impl IpsetManager {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            sets: HashMap::default(),
            lists: HashMap::default(),
        }
    }

    /// Whether `element` is tracked in the named set.
    pub fn set_contains(&self, set: &str, element: &str) -> bool {
        self.sets
            .get(set)
            .map(|s| s.elements.iter().any(|e| e == element))
            .unwrap_or(false)
    }

    /// Whether `member` is tracked in the named list.
    pub fn list_contains(&self, list: &str, member: &str) -> bool {
        self.lists
            .get(list)
            .map(|l| l.elements.iter().any(|e| e == member))
            .unwrap_or(false)
    }

    pub fn has_set(&self, set: &str) -> bool {
        self.sets.contains_key(set)
    }

    pub fn has_list(&self, list: &str) -> bool {
        self.lists.contains_key(list)
    }

    pub fn refer_count(&self, name: &str) -> usize {
        self.sets
            .get(name)
            .or_else(|| self.lists.get(name))
            .map(|s| s.refer_count)
            .unwrap_or(0)
    }

    pub fn create_set(&mut self, name: &str) -> Result<()> {
        if self.sets.contains_key(name) {
            return Ok(());
        }
        debug!(set = %name, external = %names::external_name(name), "creating ipset");
        self.run(CREATE, Some(&names::external_name(name)), Some(NET_HASH))?;
        self.sets.insert(name.to_string(), Ipset::default());
        Ok(())
    }

    pub fn create_list(&mut self, name: &str) -> Result<()> {
        if self.lists.contains_key(name) {
            return Ok(());
        }
        debug!(list = %name, external = %names::external_name(name), "creating ipset list");
        self.run(CREATE, Some(&names::external_name(name)), Some(SET_LIST))?;
        self.lists.insert(name.to_string(), Ipset::default());
        Ok(())
    }

    pub fn add_to_set(&mut self, name: &str, ip: &str) -> Result<()> {
        if self.set_contains(name, ip) {
            return Ok(());
        }
        self.create_set(name)?;
        self.run(APPEND, Some(&names::external_name(name)), Some(ip))?;
        self.sets
            .get_mut(name)
            .expect("set was just created")
            .elements
            .push(ip.to_string());
        Ok(())
    }

    /// Adds the set named `member` to the named list, creating the list on
    /// demand. The member is referenced by its hashed kernel name.
    pub fn add_to_list(&mut self, name: &str, member: &str) -> Result<()> {
        if self.list_contains(name, member) {
            return Ok(());
        }
        self.create_list(name)?;
        self.run(
            APPEND,
            Some(&names::external_name(name)),
            Some(&names::external_name(member)),
        )?;
        self.lists
            .get_mut(name)
            .expect("list was just created")
            .elements
            .push(member.to_string());
        Ok(())
    }

    pub fn delete_from_set(&mut self, name: &str, ip: &str) -> Result<()> {
        if !self.sets.contains_key(name) {
            warn!(set = %name, "deleting from unknown ipset");
            return Ok(());
        }
        self.run(DELETE, Some(&names::external_name(name)), Some(ip))?;
        let set = self.sets.get_mut(name).expect("set is present");
        set.elements.retain(|e| e != ip);
        Ok(())
    }

    pub fn delete_from_list(&mut self, name: &str, member: &str) -> Result<()> {
        if !self.lists.contains_key(name) {
            warn!(list = %name, "deleting from unknown ipset list");
            return Ok(());
        }
        self.run(
            DELETE,
            Some(&names::external_name(name)),
            Some(&names::external_name(member)),
        )?;
        let list = self.lists.get_mut(name).expect("list is present");
        list.elements.retain(|e| e != member);
        Ok(())
    }

    /// Destroys a set, but only once it is empty and unreferenced. The
    /// backend's still-in-use refusal is treated as a logged no-op so that
    /// a rule another writer installed does not wedge reconciliation.
    pub fn delete_set(&mut self, name: &str) -> Result<()> {
        let Some(set) = self.sets.get(name) else {
            debug!(set = %name, "ipset not found");
            return Ok(());
        };
        if !set.elements.is_empty() {
            debug!(set = %name, "not destroying non-empty ipset");
            return Ok(());
        }
        if set.refer_count > 0 {
            debug!(set = %name, refs = set.refer_count, "not destroying referenced ipset");
            return Ok(());
        }
        match self.run(DESTROY, Some(&names::external_name(name)), None)? {
            Disposition::Applied => {
                self.sets.remove(name);
            }
            Disposition::Benign => {
                info!(set = %name, "cannot destroy ipset; still referenced");
            }
        }
        Ok(())
    }

    pub fn delete_list(&mut self, name: &str) -> Result<()> {
        let Some(list) = self.lists.get(name) else {
            debug!(list = %name, "ipset list not found");
            return Ok(());
        };
        if !list.elements.is_empty() {
            debug!(list = %name, "not destroying non-empty ipset list");
            return Ok(());
        }
        if list.refer_count > 0 {
            debug!(list = %name, refs = list.refer_count, "not destroying referenced ipset list");
            return Ok(());
        }
        match self.run(DESTROY, Some(&names::external_name(name)), None)? {
            Disposition::Applied => {
                self.lists.remove(name);
            }
            Disposition::Benign => {
                info!(list = %name, "cannot destroy ipset list; still referenced");
            }
        }
        Ok(())
    }

    pub fn increment_refer_count(&mut self, name: &str) {
        if let Some(s) = self.sets.get_mut(name).or_else(|| self.lists.get_mut(name)) {
            s.refer_count += 1;
        }
    }

    pub fn decrement_refer_count(&mut self, name: &str) {
        if let Some(s) = self.sets.get_mut(name).or_else(|| self.lists.get_mut(name)) {
            s.refer_count = s.refer_count.saturating_sub(1);
        }
    }

    /// Destroys every set and list whose membership is empty.
    pub fn clean(&mut self) -> Result<()> {
        let empty_sets: Vec<String> = self
            .sets
            .iter()
            .filter(|(_, s)| s.elements.is_empty())
            .map(|(n, _)| n.clone())
            .collect();
        for name in empty_sets {
            self.delete_set(&name)?;
        }

        let empty_lists: Vec<String> = self
            .lists
            .iter()
            .filter(|(_, l)| l.elements.is_empty())
            .map(|(n, _)| n.clone())
            .collect();
        for name in empty_lists {
            self.delete_list(&name)?;
        }
        Ok(())
    }

    /// Flushes and destroys the entire set namespace. Shutdown only.
    pub fn destroy(&mut self) -> Result<()> {
        self.run(FLUSH, None, None)?;
        self.run(DESTROY, None, None)?;
        self.sets.clear();
        self.lists.clear();
        Ok(())
    }

    /// Writes the backend's native snapshot to `path`.
    pub fn save(&self, path: &Path) -> Result<()> {
        let args = vec![
            "save".to_string(),
            "-file".to_string(),
            path.display().to_string(),
        ];
        exec::execute(&*self.runner, IPSET, &args)?;
        Ok(())
    }

    /// Replays the snapshot at `path`. An empty snapshot means the saved
    /// state had no sets, so the current namespace is destroyed instead.
    pub fn restore(&mut self, path: &Path) -> Result<()> {
        let meta = std::fs::metadata(path).map_err(|source| Error::Snapshot {
            path: path.display().to_string(),
            source,
        })?;
        if meta.len() == 0 {
            return self.destroy();
        }
        let args = vec![
            "restore".to_string(),
            "-file".to_string(),
            path.display().to_string(),
        ];
        exec::execute(&*self.runner, IPSET, &args)?;
        Ok(())
    }

    fn run(&self, op: &str, set: Option<&str>, spec: Option<&str>) -> Result<Disposition> {
        let mut args = vec![op.to_string(), EXIST_OK.to_string()];
        if let Some(set) = set {
            args.push(set.to_string());
        }
        if let Some(spec) = spec {
            args.push(spec.to_string());
        }
        Ok(exec::execute(&*self.runner, IPSET, &args)?)
    }
}
