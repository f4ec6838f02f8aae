//! Ad-hoc firewall rules

use super::chains::return_rule;
use super::{NetworkReconciler, ReplayStats};
use crate::kernel::Outcome;
use netplane_common::{store, Error, FirewallRule, NewFirewallRule, Result};
use tracing::{info, warn};

impl NetworkReconciler {
    /// Apply a rule unless already present. In a managed chain that ends in
    /// RETURN the rule goes just before it; elsewhere it is appended.
    pub(crate) fn apply_rule(&self, rule: &FirewallRule) -> Result<Outcome> {
        if self.is_managed_chain(&rule.table, &rule.chain) {
            let listed = self.kernel.filter.list_rules(&rule.table, &rule.chain)?;
            if listed.last() == Some(&return_rule()) {
                return self.insert_before_return(&rule.table, &rule.chain, &rule.args);
            }
        }
        self.kernel
            .filter
            .append_unique(&rule.table, &rule.chain, &rule.args)
    }

    /// Rules that decode; malformed rows are logged and left out
    pub fn list_rules(&self) -> Result<Vec<FirewallRule>> {
        let rows = self.db.read(store::rules::list)?;
        Ok(rows
            .into_iter()
            .filter_map(|row| match row {
                Ok(rule) => Some(rule),
                Err(e) => {
                    warn!("Ignoring unreadable firewall rule row: {}", e);
                    None
                }
            })
            .collect())
    }

    pub fn get_rule(&self, uuid: &str) -> Result<FirewallRule> {
        self.db
            .read(|conn| store::rules::get(conn, uuid))?
            .ok_or_else(|| Error::not_found("firewall_rule", uuid))
    }

    /// Validate, persist and apply a rule; the row commits only if the
    /// kernel accepted the rule.
    pub fn create_rule(&self, request: NewFirewallRule) -> Result<FirewallRule> {
        let rule = request.into_rule()?;

        let _guard = self.mutations.lock();
        self.db.transaction(|tx| {
            if store::rules::get(tx, &rule.uuid)?.is_some() {
                return Err(Error::already_exists("firewall_rule", &rule.uuid));
            }
            store::rules::insert(tx, &rule)?;
            self.apply_rule(&rule)?;
            Ok(())
        })?;

        info!(
            "Added firewall rule {} ({}/{}: {})",
            rule.uuid,
            rule.table,
            rule.chain,
            rule.args.join(" ")
        );
        Ok(rule)
    }

    pub fn delete_rule(&self, uuid: &str) -> Result<()> {
        let _guard = self.mutations.lock();
        let rule = self.db.transaction(|tx| {
            let rule = store::rules::get(tx, uuid)?
                .ok_or_else(|| Error::not_found("firewall_rule", uuid))?;
            self.kernel
                .filter
                .delete_if_exists(&rule.table, &rule.chain, &rule.args)?;
            store::rules::delete(tx, uuid)?;
            Ok(rule)
        })?;

        info!("Removed firewall rule {} ({}/{})", rule.uuid, rule.table, rule.chain);
        Ok(())
    }

    pub(crate) fn replay_rules_locked(&self) -> Result<ReplayStats> {
        let rows = self.db.read(store::rules::list)?;
        let mut stats = ReplayStats::default();
        for row in rows {
            let rule = match row.and_then(|rule| rule.validate().map(|_| rule)) {
                Ok(rule) => rule,
                Err(e) => {
                    warn!("Skipping unreadable firewall rule: {}", e);
                    stats.failed += 1;
                    continue;
                }
            };
            match self.apply_rule(&rule) {
                Ok(Outcome::Changed) => stats.applied += 1,
                Ok(Outcome::Unchanged) => stats.unchanged += 1,
                Err(e) => {
                    warn!("Failed to restore firewall rule {}: {}", rule.uuid, e);
                    stats.failed += 1;
                }
            }
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use crate::kernel::PacketFilter;
    use std::sync::atomic::Ordering;

    fn request(table: &str, chain: &str, args: &str) -> NewFirewallRule {
        NewFirewallRule {
            uuid: None,
            table: table.to_string(),
            chain: chain.to_string(),
            args: args.to_string(),
        }
    }

    #[test]
    fn test_empty_args_rejected_before_any_side_effect() {
        let h = harness(coordinator());
        let calls = h.kernel.filter.calls.load(Ordering::SeqCst);

        let err = h
            .reconciler
            .create_rule(request("filter", "NETPLANE_FILTER_INPUT", "[]"))
            .unwrap_err();
        assert!(err.is_validation());
        assert!(h.reconciler.list_rules().unwrap().is_empty());
        assert_eq!(h.kernel.filter.calls.load(Ordering::SeqCst), calls);
    }

    #[test]
    fn test_rule_in_managed_chain_lands_before_return() {
        let h = harness(coordinator());
        h.reconciler.ensure_chains().unwrap();

        let rule = h
            .reconciler
            .create_rule(request(
                "filter",
                "NETPLANE_FILTER_INPUT",
                r#"["-p","tcp","--dport","22","-j","ACCEPT"]"#,
            ))
            .unwrap();
        assert_eq!(
            h.kernel.filter.rules("filter", "NETPLANE_FILTER_INPUT"),
            vec![rule.args.clone(), args(&["-j", "RETURN"])]
        );
        assert_eq!(h.reconciler.get_rule(&rule.uuid).unwrap(), rule);
    }

    #[test]
    fn test_rule_in_foreign_chain_is_appended() {
        let h = harness(coordinator());
        h.reconciler
            .create_rule(request("filter", "INPUT", r#"["-i","lo","-j","ACCEPT"]"#))
            .unwrap();
        h.reconciler
            .create_rule(request("filter", "INPUT", r#"["-i","eth1","-j","DROP"]"#))
            .unwrap();
        assert_eq!(
            h.kernel.filter.rules("filter", "INPUT"),
            vec![
                args(&["-i", "lo", "-j", "ACCEPT"]),
                args(&["-i", "eth1", "-j", "DROP"])
            ]
        );
    }

    #[test]
    fn test_duplicate_uuid_conflicts() {
        let h = harness(coordinator());
        let mut first = request("filter", "INPUT", r#"["-j","ACCEPT"]"#);
        first.uuid = Some("0b3f4f4e-8a7d-4d63-9b8e-6c1f1f0c2a11".to_string());
        let second = NewFirewallRule {
            args: r#"["-j","DROP"]"#.to_string(),
            ..first.clone()
        };
        h.reconciler.create_rule(first).unwrap();
        assert!(matches!(
            h.reconciler.create_rule(second),
            Err(Error::AlreadyExists { .. })
        ));
    }

    #[test]
    fn test_kernel_failure_rolls_back() {
        let h = harness(coordinator());
        h.kernel.filter.fail_mutations.store(true, Ordering::SeqCst);
        assert!(h
            .reconciler
            .create_rule(request("filter", "INPUT", r#"["-j","ACCEPT"]"#))
            .unwrap_err()
            .is_external());
        assert!(h.reconciler.list_rules().unwrap().is_empty());
    }

    #[test]
    fn test_delete_rule_missing_from_kernel() {
        let h = harness(coordinator());
        let rule = h
            .reconciler
            .create_rule(request("filter", "OUTPUT", r#"["-d","10.9.9.9","-j","DROP"]"#))
            .unwrap();

        // Removed out of band; deleting the record still succeeds
        h.kernel
            .filter
            .delete_if_exists("filter", "OUTPUT", &rule.args)
            .unwrap();
        h.reconciler.delete_rule(&rule.uuid).unwrap();
        assert!(matches!(
            h.reconciler.get_rule(&rule.uuid),
            Err(Error::NotFound { .. })
        ));
        assert!(matches!(
            h.reconciler.delete_rule(&rule.uuid),
            Err(Error::NotFound { .. })
        ));
    }

    #[test]
    fn test_delete_rule_removes_kernel_rule() {
        let h = harness(coordinator());
        let rule = h
            .reconciler
            .create_rule(request(
                "nat",
                "PREROUTING",
                r#"["-p","tcp","--dport","8080","-j","REDIRECT","--to-ports","80"]"#,
            ))
            .unwrap();
        assert_eq!(h.kernel.filter.rules("nat", "PREROUTING").len(), 1);

        h.reconciler.delete_rule(&rule.uuid).unwrap();
        assert!(h.kernel.filter.rules("nat", "PREROUTING").is_empty());
        assert!(h.reconciler.list_rules().unwrap().is_empty());
    }

    #[test]
    fn test_replay_is_idempotent() {
        let h = harness(coordinator());
        h.reconciler.ensure_chains().unwrap();
        h.reconciler
            .create_rule(request(
                "filter",
                "NETPLANE_FILTER_FORWARD",
                r#"["-s","10.0.9.0/24","-j","DROP"]"#,
            ))
            .unwrap();

        let before = h.kernel.filter.rules("filter", "NETPLANE_FILTER_FORWARD");
        let stats = h.reconciler.replay_rules_locked().unwrap();
        assert_eq!(stats.unchanged, 1);
        assert_eq!(h.kernel.filter.rules("filter", "NETPLANE_FILTER_FORWARD"), before);
    }
}
