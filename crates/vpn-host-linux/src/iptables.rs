// # iptables Firewall
//
// Firewall implementation driving `iptables -t nat` on the POSTROUTING chain.
//
// ## Commands
//
// ```text
// check:  iptables -w -t nat -C POSTROUTING -s <net>/24 -o <if> -j SNAT --to-source <addr>
// delete: iptables -w -t nat -D POSTROUTING ...
// insert: iptables -w -t nat -I POSTROUTING 1 ...
// ```
//
// `-C` exits 1 when the rule is absent, which lets delete report NotFound
// without parsing error text.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use vpn_core::process::{Invocation, ProcessRunner};
use vpn_core::traits::{Firewall, NatRule, RuleRemoval};
use vpn_core::{Error, Result};

const IPTABLES: &str = "iptables";
const CHAIN: &str = "POSTROUTING";

/// Firewall backed by the `iptables` binary
pub struct IptablesFirewall {
    runner: Arc<dyn ProcessRunner>,
    use_sudo: bool,
}

impl IptablesFirewall {
    /// Create a firewall running `iptables` through `runner`
    pub fn new(runner: Arc<dyn ProcessRunner>, use_sudo: bool) -> Self {
        Self { runner, use_sudo }
    }

    fn invocation(&self, operation: &[&str], rule: &NatRule) -> Invocation {
        let invocation = Invocation::new(IPTABLES).args(rule_args(operation, rule));
        if self.use_sudo {
            invocation.elevated()
        } else {
            invocation
        }
    }
}

/// Full argument list for `operation` (e.g. `["-I", "POSTROUTING", "1"]`) on `rule`
pub fn rule_args(operation: &[&str], rule: &NatRule) -> Vec<String> {
    let mut args: Vec<String> = vec!["-w".into(), "-t".into(), "nat".into()];
    args.extend(operation.iter().map(|s| s.to_string()));
    args.extend([
        "-s".to_string(),
        rule.source_cidr(),
        "-o".to_string(),
        rule.out_interface.clone(),
        "-j".to_string(),
        "SNAT".to_string(),
        "--to-source".to_string(),
        rule.to_source.to_string(),
    ]);
    args
}

#[async_trait]
impl Firewall for IptablesFirewall {
    async fn delete_rule(&self, rule: &NatRule) -> Result<RuleRemoval> {
        let check = self.runner.run(&self.invocation(&["-C", CHAIN], rule)).await?;
        match check.code {
            Some(0) => {}
            Some(1) => {
                debug!("iptables: no rule matching {}", rule);
                return Ok(RuleRemoval::NotFound);
            }
            _ => {
                return Err(Error::process(
                    IPTABLES,
                    format!("check failed ({:?}): {}", check.code, check.stderr.trim()),
                ));
            }
        }

        self.runner
            .run_checked(&self.invocation(&["-D", CHAIN], rule))
            .await?;
        Ok(RuleRemoval::Removed)
    }

    async fn insert_rule_first(&self, rule: &NatRule) -> Result<()> {
        self.runner
            .run_checked(&self.invocation(&["-I", CHAIN, "1"], rule))
            .await?;
        Ok(())
    }
}
