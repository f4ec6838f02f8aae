//! Agent-owned firewall chains

use super::NetworkReconciler;
use crate::kernel::Outcome;
use netplane_common::Result;
use tracing::{debug, info};

/// Built-in chains that get an agent-owned overlay, per table
const OVERLAYS: &[(&str, &[&str])] = &[
    ("filter", &["INPUT", "OUTPUT", "FORWARD"]),
    ("nat", &["PREROUTING", "POSTROUTING", "INPUT", "OUTPUT"]),
];

/// An agent-owned chain hooked from a built-in chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedChain {
    pub table: &'static str,
    pub parent: &'static str,
    pub name: String,
}

impl ManagedChain {
    pub fn jump(&self) -> Vec<String> {
        vec!["-j".to_string(), self.name.clone()]
    }
}

pub(crate) fn return_rule() -> Vec<String> {
    vec!["-j".to_string(), "RETURN".to_string()]
}

impl NetworkReconciler {
    /// Overlay chain name, e.g. `NETPLANE_NAT_POSTROUTING`
    pub fn chain_name(&self, table: &str, parent: &str) -> String {
        format!(
            "{}_{}_{}",
            self.config.network.chain_prefix,
            table.to_uppercase(),
            parent
        )
    }

    pub fn managed_chains(&self) -> Vec<ManagedChain> {
        OVERLAYS
            .iter()
            .flat_map(|&(table, parents)| {
                parents.iter().map(move |&parent| ManagedChain {
                    table,
                    parent,
                    name: self.chain_name(table, parent),
                })
            })
            .collect()
    }

    pub(crate) fn is_managed_chain(&self, table: &str, chain: &str) -> bool {
        self.managed_chains()
            .iter()
            .any(|c| c.table == table && c.name == chain)
    }

    /// Create every managed chain, terminate it with RETURN and hook it at
    /// the top of its parent. Safe to repeat.
    pub fn ensure_chains(&self) -> Result<()> {
        let _guard = self.mutations.lock();
        self.ensure_chains_locked()
    }

    pub(crate) fn ensure_chains_locked(&self) -> Result<()> {
        let filter = &self.kernel.filter;
        for chain in self.managed_chains() {
            if !filter.chain_exists(chain.table, &chain.name)? {
                filter.new_chain(chain.table, &chain.name)?;
                info!("Created chain {}/{}", chain.table, chain.name);
            }
            filter.append_unique(chain.table, &chain.name, &return_rule())?;
            if filter
                .insert_unique(chain.table, chain.parent, 1, &chain.jump())?
                .changed()
            {
                debug!("Hooked {} from {}/{}", chain.name, chain.table, chain.parent);
            }
        }
        Ok(())
    }

    /// Unhook a managed chain from its parent, flush it and delete it
    pub(crate) fn remove_chain(&self, chain: &ManagedChain) -> Result<Outcome> {
        let filter = &self.kernel.filter;
        filter.delete_if_exists(chain.table, chain.parent, &chain.jump())?;
        if !filter.chain_exists(chain.table, &chain.name)? {
            return Ok(Outcome::Unchanged);
        }
        filter.flush_chain(chain.table, &chain.name)?;
        filter.delete_chain(chain.table, &chain.name)?;
        debug!("Removed chain {}/{}", chain.table, chain.name);
        Ok(Outcome::Changed)
    }

    /// Insert `rule` unless present, just ahead of the chain's last rule
    /// (the terminal RETURN in a managed chain).
    pub(crate) fn insert_before_return(
        &self,
        table: &str,
        chain: &str,
        rule: &[String],
    ) -> Result<Outcome> {
        let filter = &self.kernel.filter;
        if filter.rule_exists(table, chain, rule)? {
            return Ok(Outcome::Unchanged);
        }
        let position = filter.rule_count(table, chain)?.max(1);
        filter.insert(table, chain, position, rule)?;
        Ok(Outcome::Changed)
    }
}
