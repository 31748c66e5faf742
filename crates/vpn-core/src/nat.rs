//! Network rule reconciliation
//!
//! The [`NatReconciler`] keeps exactly one outbound SNAT rule mapping the VPN
//! subnet to the host's uplink address.
//!
//! ## Apply
//!
//! ```text
//! lock ──► delete previously recorded rule (if it differs)
//!      ──► delete desired rule (tolerated: may not exist)
//!      ──► insert desired rule at position 1
//!      ──► record desired rule
//! ```
//!
//! Every operation runs under one internal mutex, so an IP-change triggered
//! apply can never interleave its delete and insert with a lifecycle-driven
//! apply or unapply.
//!
//! A superseded rule whose delete fails is kept as orphaned and deleted again
//! on every later operation until the firewall accepts it.
//!
//! ## Unapply
//!
//! [`NatReconciler::unapply_recorded`] deletes exactly the rule last
//! installed: both the host address and the server network may have changed
//! since. [`NatReconciler::unapply`] deletes the rule keyed on the inputs it
//! is given, for when nothing is recorded.

use chrono::{DateTime, Utc};
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::traits::{Firewall, NatRule, RuleRemoval};

/// Result of a reconciliation step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// No server network configured yet; nothing to reconcile
    Skipped,
    /// Rule installed at the top of the chain
    Applied(NatRule),
    /// Rule deleted
    Removed(NatRule),
    /// Rule was already absent
    NotPresent(NatRule),
}

/// Rule most recently installed by this reconciler
#[derive(Debug, Clone)]
struct AppliedRule {
    rule: NatRule,
    applied_at: DateTime<Utc>,
}

/// Everything the reconciler knows about the chain
#[derive(Debug, Default)]
struct RuleBook {
    applied: Option<AppliedRule>,
    /// Superseded rules whose delete failed; retried on every later operation
    orphaned: Vec<NatRule>,
}

/// Serialized owner of the server's SNAT rule
pub struct NatReconciler {
    firewall: Arc<dyn Firewall>,
    out_interface: String,
    book: Mutex<RuleBook>,
}

impl NatReconciler {
    /// Create a reconciler binding rules to `out_interface`
    pub fn new(firewall: Arc<dyn Firewall>, out_interface: impl Into<String>) -> Self {
        Self {
            firewall,
            out_interface: out_interface.into(),
            book: Mutex::new(RuleBook::default()),
        }
    }

    /// Host address the rule was last installed for
    pub async fn last_applied_address(&self) -> Option<Ipv4Addr> {
        self.book
            .lock()
            .await
            .applied
            .as_ref()
            .map(|a| a.rule.to_source)
    }

    /// Rule most recently installed, if still recorded
    pub async fn last_applied_rule(&self) -> Option<NatRule> {
        self.book.lock().await.applied.as_ref().map(|a| a.rule.clone())
    }

    /// When the rule was last installed
    pub async fn last_applied_at(&self) -> Option<DateTime<Utc>> {
        self.book.lock().await.applied.as_ref().map(|a| a.applied_at)
    }

    /// Superseded rules still awaiting deletion
    pub async fn orphaned_rules(&self) -> Vec<NatRule> {
        self.book.lock().await.orphaned.clone()
    }

    /// Install the rule `server_network/24 -> host_address`
    ///
    /// # Returns
    ///
    /// - `Ok(ReconcileOutcome::Skipped)`: `server_network` is unset
    /// - `Ok(ReconcileOutcome::Applied)`: Exactly one matching rule is now first
    /// - `Err(Error::NatRuleApply)`: The insert failed
    pub async fn apply(
        &self,
        server_network: Option<Ipv4Addr>,
        host_address: Ipv4Addr,
    ) -> Result<ReconcileOutcome> {
        let Some(network) = server_network else {
            debug!("No server network configured, skipping NAT apply");
            return Ok(ReconcileOutcome::Skipped);
        };

        let mut book = self.book.lock().await;
        self.apply_locked(&mut book, network, host_address).await
    }

    /// Move an installed rule to `host_address`
    ///
    /// Skipped when no rule is recorded, so a rule removed by [`unapply`]
    /// is never brought back by a change that raced with it.
    ///
    /// [`unapply`]: Self::unapply
    pub async fn reapply(
        &self,
        server_network: Option<Ipv4Addr>,
        host_address: Ipv4Addr,
    ) -> Result<ReconcileOutcome> {
        let Some(network) = server_network else {
            debug!("No server network configured, skipping NAT reapply");
            return Ok(ReconcileOutcome::Skipped);
        };

        let mut book = self.book.lock().await;
        if book.applied.is_none() {
            debug!("No NAT rule installed, skipping reapply");
            return Ok(ReconcileOutcome::Skipped);
        }

        self.apply_locked(&mut book, network, host_address).await
    }

    /// Delete the rule `server_network/24 -> host_address`
    ///
    /// Clears the record when the rule was deleted or already absent.
    pub async fn unapply(
        &self,
        server_network: Option<Ipv4Addr>,
        host_address: Ipv4Addr,
    ) -> Result<ReconcileOutcome> {
        let Some(network) = server_network else {
            debug!("No server network configured, skipping NAT unapply");
            return Ok(ReconcileOutcome::Skipped);
        };

        let mut book = self.book.lock().await;
        self.retry_orphaned(&mut book).await;

        let rule = NatRule::new(network, self.out_interface.as_str(), host_address);
        self.remove_locked(&mut book, rule).await
    }

    /// Delete exactly the rule last installed, whatever the network or host
    /// address are now
    ///
    /// Returns `Ok(None)` when no rule is recorded.
    pub async fn unapply_recorded(&self) -> Result<Option<ReconcileOutcome>> {
        let mut book = self.book.lock().await;
        self.retry_orphaned(&mut book).await;

        let Some(rule) = book.applied.as_ref().map(|a| a.rule.clone()) else {
            return Ok(None);
        };
        self.remove_locked(&mut book, rule).await.map(Some)
    }

    async fn apply_locked(
        &self,
        book: &mut RuleBook,
        network: Ipv4Addr,
        host_address: Ipv4Addr,
    ) -> Result<ReconcileOutcome> {
        self.retry_orphaned(book).await;

        let rule = NatRule::new(network, self.out_interface.as_str(), host_address);
        info!("Applying NAT rule {}", rule);

        if let Some(previous) = book.applied.as_ref().map(|a| a.rule.clone())
            && previous != rule
        {
            match self.firewall.delete_rule(&previous).await {
                Ok(_) => debug!("Deleted superseded NAT rule {}", previous),
                Err(e) => {
                    warn!("Failed to delete superseded NAT rule {}, will retry: {}", previous, e);
                    book.orphaned.push(previous);
                }
            }
        }

        match self.firewall.delete_rule(&rule).await {
            Ok(RuleRemoval::Removed) => debug!("Deleted existing NAT rule {}", rule),
            Ok(RuleRemoval::NotFound) => debug!("NAT rule {} not present", rule),
            Err(e) => warn!("Ignoring failed delete of NAT rule {}: {}", rule, e),
        }

        self.firewall
            .insert_rule_first(&rule)
            .await
            .map_err(|e| Error::nat_apply(format!("{}: {}", rule, e)))?;

        book.orphaned.retain(|orphan| *orphan != rule);
        book.applied = Some(AppliedRule {
            rule: rule.clone(),
            applied_at: Utc::now(),
        });

        Ok(ReconcileOutcome::Applied(rule))
    }

    async fn remove_locked(&self, book: &mut RuleBook, rule: NatRule) -> Result<ReconcileOutcome> {
        info!("Removing NAT rule {}", rule);

        let removal = self
            .firewall
            .delete_rule(&rule)
            .await
            .map_err(|e| Error::nat_unapply(format!("{}: {}", rule, e)))?;

        book.applied = None;

        match removal {
            RuleRemoval::Removed => Ok(ReconcileOutcome::Removed(rule)),
            RuleRemoval::NotFound => {
                debug!("NAT rule {} was not present", rule);
                Ok(ReconcileOutcome::NotPresent(rule))
            }
        }
    }

    async fn retry_orphaned(&self, book: &mut RuleBook) {
        if book.orphaned.is_empty() {
            return;
        }

        let mut remaining = Vec::new();
        for rule in std::mem::take(&mut book.orphaned) {
            match self.firewall.delete_rule(&rule).await {
                Ok(_) => info!("Deleted orphaned NAT rule {}", rule),
                Err(e) => {
                    warn!("Orphaned NAT rule {} still not deleted: {}", rule, e);
                    remaining.push(rule);
                }
            }
        }
        book.orphaned = remaining;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Firewall that only counts calls
    #[derive(Default)]
    struct CountingFirewall {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Firewall for CountingFirewall {
        async fn delete_rule(&self, _rule: &NatRule) -> Result<RuleRemoval> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(RuleRemoval::NotFound)
        }

        async fn insert_rule_first(&self, _rule: &NatRule) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_unset_network_is_noop() {
        let firewall = Arc::new(CountingFirewall::default());
        let reconciler = NatReconciler::new(firewall.clone(), "eth0");
        let host = Ipv4Addr::new(192, 168, 1, 10);

        assert_eq!(
            reconciler.apply(None, host).await.unwrap(),
            ReconcileOutcome::Skipped
        );
        assert_eq!(
            reconciler.unapply(None, host).await.unwrap(),
            ReconcileOutcome::Skipped
        );
        assert_eq!(firewall.calls.load(Ordering::SeqCst), 0);
        assert_eq!(reconciler.last_applied_address().await, None);
    }

    #[tokio::test]
    async fn test_apply_records_address_and_time() {
        let firewall = Arc::new(CountingFirewall::default());
        let reconciler = NatReconciler::new(firewall.clone(), "eth0");
        let network = Some(Ipv4Addr::new(10, 50, 60, 0));
        let host = Ipv4Addr::new(192, 168, 1, 10);

        reconciler.apply(network, host).await.unwrap();

        assert_eq!(reconciler.last_applied_address().await, Some(host));
        assert!(reconciler.last_applied_at().await.is_some());
        // one delete, one insert
        assert_eq!(firewall.calls.load(Ordering::SeqCst), 2);
    }
}
