//! An in-memory stand-in for the `ipset`/`iptables` binaries.
//!
//! The emulation is deliberately shallow: it tracks sets, lists, chains, and
//! rules, and reproduces the exit-status contract the managers depend on
//! (`0` applied, `1` benign, `>1` fatal), including the referenced-object
//! refusals. Tests assert against the materialized state and the recorded
//! argument vectors.

use crate::exec::CommandRunner;
use parking_lot::Mutex;
use std::{
    collections::BTreeMap,
    io,
    path::Path,
};

const FORWARD: &str = "FORWARD";

/// One recorded backend invocation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Invocation {
    pub program: &'static str,
    pub args: Vec<String>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Kind {
    Hash,
    List,
}

#[derive(Debug)]
struct Set {
    kind: Kind,
    members: Vec<String>,
}

#[derive(Debug)]
struct State {
    invocations: Vec<Invocation>,
    sets: BTreeMap<String, Set>,
    chains: BTreeMap<String, Vec<Vec<String>>>,
}

impl Default for State {
    fn default() -> Self {
        let mut chains = BTreeMap::new();
        chains.insert(FORWARD.to_string(), Vec::new());
        Self {
            invocations: Vec::new(),
            sets: BTreeMap::new(),
            chains,
        }
    }
}

/// A [`CommandRunner`] that emulates the kernel backends.
#[derive(Debug, Default)]
pub struct FakeKernel {
    state: Mutex<State>,
}

impl FakeKernel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.state.lock().invocations.clone()
    }

    pub fn has_set(&self, external: &str) -> bool {
        self.state.lock().sets.contains_key(external)
    }

    pub fn set_members(&self, external: &str) -> Vec<String> {
        self.state
            .lock()
            .sets
            .get(external)
            .map(|s| s.members.clone())
            .unwrap_or_default()
    }

    pub fn set_names(&self) -> Vec<String> {
        self.state.lock().sets.keys().cloned().collect()
    }

    pub fn has_chain(&self, chain: &str) -> bool {
        self.state.lock().chains.contains_key(chain)
    }

    pub fn chain_rules(&self, chain: &str) -> Vec<Vec<String>> {
        self.state
            .lock()
            .chains
            .get(chain)
            .cloned()
            .unwrap_or_default()
    }

    pub fn chain_names(&self) -> Vec<String> {
        self.state.lock().chains.keys().cloned().collect()
    }
}

impl State {
    fn set_is_referenced(&self, name: &str) -> bool {
        let by_rule = self
            .chains
            .values()
            .flatten()
            .any(|specs| specs.iter().any(|a| a == name));
        let by_list = self
            .sets
            .values()
            .filter(|s| s.kind == Kind::List)
            .any(|s| s.members.iter().any(|m| m == name));
        by_rule || by_list
    }

    fn chain_is_referenced(&self, chain: &str) -> bool {
        self.chains.iter().any(|(name, rules)| {
            name != chain
                && rules
                    .iter()
                    .any(|specs| specs.windows(2).any(|w| w[0] == "-j" && w[1] == chain))
        })
    }

    fn ipset(&mut self, args: &[String]) -> i32 {
        let exist_ok = args.iter().any(|a| a == "-exist");
        let rest: Vec<&String> = args.iter().skip(1).filter(|a| *a != "-exist").collect();
        match args.first().map(String::as_str) {
            Some("-N") => {
                let (Some(name), Some(kind)) = (rest.first(), rest.get(1)) else {
                    return 2;
                };
                let kind = match kind.as_str() {
                    "setlist" => Kind::List,
                    _ => Kind::Hash,
                };
                if self.sets.contains_key(name.as_str()) {
                    return if exist_ok { 0 } else { 1 };
                }
                self.sets.insert(
                    name.to_string(),
                    Set {
                        kind,
                        members: Vec::new(),
                    },
                );
                0
            }
            Some("-A") => {
                let (Some(name), Some(member)) = (rest.first(), rest.get(1)) else {
                    return 2;
                };
                let is_list = match self.sets.get(name.as_str()) {
                    Some(set) => set.kind == Kind::List,
                    None => return 1,
                };
                if is_list && !self.sets.contains_key(member.as_str()) {
                    return 1;
                }
                let set = self.sets.get_mut(name.as_str()).expect("set exists");
                if set.members.iter().any(|m| m == member.as_str()) {
                    return if exist_ok { 0 } else { 1 };
                }
                set.members.push(member.to_string());
                0
            }
            Some("-D") => {
                let (Some(name), Some(member)) = (rest.first(), rest.get(1)) else {
                    return 2;
                };
                let Some(set) = self.sets.get_mut(name.as_str()) else {
                    return 1;
                };
                match set.members.iter().position(|m| m == member.as_str()) {
                    Some(i) => {
                        set.members.remove(i);
                        0
                    }
                    None => {
                        if exist_ok {
                            0
                        } else {
                            1
                        }
                    }
                }
            }
            Some("-F") => {
                match rest.first() {
                    Some(name) => match self.sets.get_mut(name.as_str()) {
                        Some(set) => set.members.clear(),
                        None => return 1,
                    },
                    None => {
                        for set in self.sets.values_mut() {
                            set.members.clear();
                        }
                    }
                }
                0
            }
            Some("-X") => match rest.first() {
                Some(name) => {
                    if !self.sets.contains_key(name.as_str()) {
                        return 1;
                    }
                    if self.set_is_referenced(name) {
                        return 1;
                    }
                    self.sets.remove(name.as_str());
                    0
                }
                None => {
                    let referenced: Vec<String> = self
                        .sets
                        .keys()
                        .filter(|n| {
                            self.chains
                                .values()
                                .flatten()
                                .any(|specs| specs.iter().any(|a| &a == n))
                        })
                        .cloned()
                        .collect();
                    if !referenced.is_empty() {
                        return 1;
                    }
                    self.sets.clear();
                    0
                }
            },
            Some("save") | Some("restore") => 0,
            _ => 2,
        }
    }

    fn iptables(&mut self, args: &[String]) -> i32 {
        let mut args = args.to_vec();
        if args.first().map(String::as_str) == Some("-w") && args.len() >= 2 {
            args.drain(..2);
        }
        let op = args.first().cloned().unwrap_or_default();
        let Some(chain) = args.get(1).cloned() else {
            return 2;
        };
        let specs: Vec<String> = args[2..].to_vec();
        match op.as_str() {
            "-N" => {
                if self.chains.contains_key(&chain) {
                    return 1;
                }
                self.chains.insert(chain, Vec::new());
                0
            }
            "-F" => match self.chains.get_mut(&chain) {
                Some(rules) => {
                    rules.clear();
                    0
                }
                None => 1,
            },
            "-X" => {
                if chain == FORWARD {
                    return 1;
                }
                match self.chains.get(&chain) {
                    Some(rules) if !rules.is_empty() => 1,
                    Some(_) if self.chain_is_referenced(&chain) => 1,
                    Some(_) => {
                        self.chains.remove(&chain);
                        0
                    }
                    None => 1,
                }
            }
            "-C" => match self.chains.get(&chain) {
                Some(rules) => {
                    if rules.iter().any(|r| r == &specs) {
                        0
                    } else {
                        1
                    }
                }
                None => 1,
            },
            "-A" => match self.chains.get_mut(&chain) {
                Some(rules) => {
                    rules.push(specs);
                    0
                }
                None => 1,
            },
            "-I" => match self.chains.get_mut(&chain) {
                Some(rules) => {
                    rules.insert(0, specs);
                    0
                }
                None => 1,
            },
            "-D" => match self.chains.get_mut(&chain) {
                Some(rules) => match rules.iter().position(|r| r == &specs) {
                    Some(i) => {
                        rules.remove(i);
                        0
                    }
                    None => 1,
                },
                None => 1,
            },
            _ => 2,
        }
    }

    fn dispatch(&mut self, program: &'static str, args: &[String]) -> i32 {
        self.invocations.push(Invocation {
            program,
            args: args.to_vec(),
        });
        match program {
            "ipset" => self.ipset(args),
            "iptables" => self.iptables(args),
            "iptables-save" | "iptables-restore" => 0,
            _ => 2,
        }
    }
}

impl CommandRunner for FakeKernel {
    fn run(&self, program: &'static str, args: &[String]) -> io::Result<i32> {
        Ok(self.state.lock().dispatch(program, args))
    }

    fn run_stdout_to(
        &self,
        program: &'static str,
        args: &[String],
        _path: &Path,
    ) -> io::Result<i32> {
        Ok(self.state.lock().dispatch(program, args))
    }

    fn run_stdin_from(
        &self,
        program: &'static str,
        args: &[String],
        _path: &Path,
    ) -> io::Result<i32> {
        Ok(self.state.lock().dispatch(program, args))
    }
}
