//! Security group reconciler.
//!
//! Security groups are composite like route tables: rules are converged once
//! the group is confirmed, guarded by their ledger entries. Rules the cloud
//! rejects as duplicates count as created. Authoritative groups also lose the
//! ip-range rules that are not declared.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::{
    ClusterScope, DeleteOutcome, ObjectRef, Outcome, Reconciler, deleted, tolerate_exists,
    tolerate_missing,
};
use crate::cloud::{CloudApi, RuleParams, SecurityGroupRule};
use crate::config::ReconcilerConfig;
use crate::error::{ReconcileError, Result};
use crate::identity::IdentityResolver;
use crate::ledger::{Kind, Ledger};
use crate::spec::{FLOW_INBOUND, FLOW_OUTBOUND, SecurityGroupRuleSpec, SecurityGroupSpec};

/// Cloud call parameters of a declared ip-range rule.
pub(crate) fn rule_params(rule: &SecurityGroupRuleSpec) -> RuleParams {
    RuleParams {
        flow: rule.flow.clone(),
        ip_protocol: rule.ip_protocol.clone(),
        ip_range: rule.ip_range.clone(),
        member_security_group_id: String::new(),
        from_port_range: rule.from_port_range,
        to_port_range: rule.to_port_range,
    }
}

/// Ledger name of a rule. Rule names are only unique within their group.
fn rule_key(object: &ObjectRef, group: &SecurityGroupSpec, rule: &SecurityGroupRuleSpec) -> String {
    object.logical_name(&format!("{}-{}", group.name, rule.name))
}

fn observed_params(flow: &str, rule: &SecurityGroupRule) -> RuleParams {
    RuleParams {
        flow: flow.to_string(),
        ip_protocol: rule.ip_protocol.clone(),
        ip_range: rule.ip_range.clone(),
        member_security_group_id: rule.member_security_group_id.clone(),
        from_port_range: rule.from_port_range,
        to_port_range: rule.to_port_range,
    }
}

/// Make sure a rule exists on `security_group_id`; duplicates count as success.
pub(crate) async fn ensure_rule(
    cloud: &dyn CloudApi,
    object: &ObjectRef,
    security_group_id: &str,
    params: &RuleParams,
) -> Result<()> {
    let found = cloud
        .get_security_group_from_security_group_rule(security_group_id, params)
        .await
        .map_err(object.wrap("get security group rule"))?;
    if found.is_some() {
        debug!(security_group_id = %security_group_id, "Security group rule already exists");
        return Ok(());
    }
    info!(
        security_group_id = %security_group_id,
        flow = %params.flow,
        ip_protocol = %params.ip_protocol,
        from_port = params.from_port_range,
        to_port = params.to_port_range,
        "Creating security group rule"
    );
    let created = tolerate_exists(
        cloud
            .create_security_group_rule(security_group_id, params)
            .await,
    )
    .map_err(object.wrap("create security group rule"))?;
    if created.is_none() {
        debug!(security_group_id = %security_group_id, "Security group rule already exists");
    }
    Ok(())
}

pub struct SecurityGroupReconciler {
    cloud: Arc<dyn CloudApi>,
    config: ReconcilerConfig,
}

impl SecurityGroupReconciler {
    pub fn new(cloud: Arc<dyn CloudApi>, config: ReconcilerConfig) -> Self {
        Self { cloud, config }
    }

    fn forget_group(object: &ObjectRef, ledger: &mut Ledger, spec: &SecurityGroupSpec) {
        for rule in &spec.security_group_rules {
            ledger.remove(Kind::SecurityGroupRule, &rule_key(object, spec, rule));
        }
        ledger.remove(Kind::SecurityGroup, &object.logical_name(&spec.name));
    }

    /// Remove ip-range rules present in the cloud but not declared.
    async fn prune_undeclared(
        &self,
        object: &ObjectRef,
        security_group_id: &str,
        spec: &SecurityGroupSpec,
    ) -> Result<()> {
        let Some(group) = self
            .cloud
            .get_security_group(security_group_id)
            .await
            .map_err(object.wrap("get security group"))?
        else {
            return Ok(());
        };

        let declared: Vec<RuleParams> = spec.security_group_rules.iter().map(rule_params).collect();
        let observed = group
            .inbound_rules
            .iter()
            .map(|r| observed_params(FLOW_INBOUND, r))
            .chain(
                group
                    .outbound_rules
                    .iter()
                    .map(|r| observed_params(FLOW_OUTBOUND, r)),
            );

        for params in observed {
            // Rules between groups belong to machines.
            if !params.member_security_group_id.is_empty() || declared.contains(&params) {
                continue;
            }
            info!(
                security_group_id = %security_group_id,
                flow = %params.flow,
                ip_range = %params.ip_range,
                "Deleting undeclared security group rule"
            );
            tolerate_missing(
                self.cloud
                    .delete_security_group_rule(security_group_id, &params)
                    .await,
            )
            .map_err(object.wrap("delete security group rule"))?;
        }
        Ok(())
    }
}

#[async_trait]
impl Reconciler for SecurityGroupReconciler {
    type Scope = ClusterScope;

    async fn reconcile(&self, scope: &mut ClusterScope) -> Result<Outcome> {
        let network = scope.spec.network();
        let identity = IdentityResolver::new(self.cloud.as_ref());
        let net_name = scope.object.logical_name(&network.net.name);
        let net_id = identity
            .dependency(&scope.object, Kind::Net, &net_name, &mut scope.ledger)
            .await?;

        let members = self
            .cloud
            .get_security_group_ids_from_net_ids(&net_id)
            .await
            .map_err(scope.object.wrap("list security groups"))?;

        let mut outcome = Outcome::Ready;
        for spec in &network.security_groups {
            let name = scope.object.logical_name(&spec.name);
            if !spec.resource_id.is_empty() {
                scope
                    .ledger
                    .set_resource_id(Kind::SecurityGroup, &name, &spec.resource_id);
            }

            let mut existing = None;
            if let Some((id, _)) = identity
                .lookup(&scope.object, Kind::SecurityGroup, &name, &mut scope.ledger)
                .await?
            {
                if members.contains(&id) {
                    existing = Some(id);
                } else if !spec.resource_id.is_empty() {
                    return Err(ReconcileError::NotFound {
                        kind: Kind::SecurityGroup,
                        name,
                    });
                } else {
                    warn!(security_group_id = %id, "Recorded security group is not part of the net, recreating");
                    Self::forget_group(&scope.object, &mut scope.ledger, spec);
                }
            }

            let security_group_id = match existing {
                Some(id) => {
                    let rules_recorded = spec.security_group_rules.iter().all(|r| {
                        scope
                            .ledger
                            .contains(Kind::SecurityGroupRule, &rule_key(&scope.object, spec, r))
                    });
                    if rules_recorded && !spec.authoritative {
                        debug!(security_group_id = %id, "Security group already exists");
                        continue;
                    }
                    id
                }
                None => {
                    info!(name = %name, net_id = %net_id, "Creating security group");
                    let created = tolerate_exists(
                        self.cloud
                            .create_security_group(&net_id, &name, &spec.description)
                            .await,
                    )
                    .map_err(scope.object.wrap("create security group"))?;
                    match created {
                        Some(sg) => {
                            info!(security_group_id = %sg.security_group_id, "Created security group");
                            scope.ledger.set_resource_id(
                                Kind::SecurityGroup,
                                &name,
                                sg.security_group_id.clone(),
                            );
                            sg.security_group_id
                        }
                        None => match identity
                            .recover_from_tag(
                                &scope.object,
                                Kind::SecurityGroup,
                                &name,
                                &mut scope.ledger,
                            )
                            .await?
                        {
                            Some(id) => id,
                            None => {
                                outcome = outcome.and(Outcome::Requeue(self.config.requeue_after()));
                                continue;
                            }
                        },
                    }
                }
            };

            for rule in &spec.security_group_rules {
                let rule_name = rule_key(&scope.object, spec, rule);
                if scope.ledger.contains(Kind::SecurityGroupRule, &rule_name) {
                    continue;
                }
                ensure_rule(
                    self.cloud.as_ref(),
                    &scope.object,
                    &security_group_id,
                    &rule_params(rule),
                )
                .await?;
                scope.ledger.set_resource_id(
                    Kind::SecurityGroupRule,
                    &rule_name,
                    security_group_id.clone(),
                );
            }

            if spec.authoritative {
                self.prune_undeclared(&scope.object, &security_group_id, spec)
                    .await?;
            }
        }
        Ok(outcome)
    }

    async fn finalize(&self, scope: &mut ClusterScope) -> Result<DeleteOutcome> {
        let network = scope.spec.network();
        let identity = IdentityResolver::new(self.cloud.as_ref());
        let net_name = scope.object.logical_name(&network.net.name);

        let Some((net_id, _)) = identity
            .lookup(&scope.object, Kind::Net, &net_name, &mut scope.ledger)
            .await?
        else {
            debug!("Net is already deleted, no security group expected");
            for spec in &network.security_groups {
                Self::forget_group(&scope.object, &mut scope.ledger, spec);
            }
            return Ok(DeleteOutcome::ConvergedAbsent);
        };

        let members = self
            .cloud
            .get_security_group_ids_from_net_ids(&net_id)
            .await
            .map_err(scope.object.wrap("list security groups"))?;

        // Rules first: groups may reference each other.
        let mut owned = Vec::new();
        for spec in &network.security_groups {
            let name = scope.object.logical_name(&spec.name);
            let Some((security_group_id, _)) = identity
                .lookup(&scope.object, Kind::SecurityGroup, &name, &mut scope.ledger)
                .await?
            else {
                continue;
            };
            if !members.contains(&security_group_id) {
                debug!(security_group_id = %security_group_id, "Security group is not part of the net, skipping");
                Self::forget_group(&scope.object, &mut scope.ledger, spec);
                continue;
            }

            for rule in &spec.security_group_rules {
                let rule_name = rule_key(&scope.object, spec, rule);
                if !scope.ledger.contains(Kind::SecurityGroupRule, &rule_name) {
                    continue;
                }
                info!(security_group_id = %security_group_id, rule = %rule.name, "Deleting security group rule");
                tolerate_missing(
                    self.cloud
                        .delete_security_group_rule(&security_group_id, &rule_params(rule))
                        .await,
                )
                .map_err(scope.object.wrap("delete security group rule"))?;
                scope.ledger.remove(Kind::SecurityGroupRule, &rule_name);
            }
            owned.push((name, security_group_id));
        }

        let mut outcome = DeleteOutcome::ConvergedAbsent;
        for (name, security_group_id) in owned {
            info!(security_group_id = %security_group_id, "Deleting security group");
            let gone = deleted(self.cloud.delete_security_group(&security_group_id).await)
                .map_err(scope.object.wrap("delete security group"))?;
            if gone {
                scope.ledger.remove(Kind::SecurityGroup, &name);
            } else {
                info!(security_group_id = %security_group_id, "Security group is still in use");
                outcome = outcome.and(DeleteOutcome::StillPresent {
                    requeue_after: self.config.requeue_after(),
                });
            }
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::memory::MemoryCloud;
    use crate::cloud::{CloudError, SecurityService};
    use crate::reconciler::net::NetReconciler;
    use crate::spec::{ClusterSpec, NetworkSpec, resolve_cluster};

    fn scope(security_groups: Vec<SecurityGroupSpec>) -> ClusterScope {
        let spec = resolve_cluster(ClusterSpec {
            network: NetworkSpec {
                security_groups,
                ..Default::default()
            },
        });
        ClusterScope::new(
            ObjectRef::new("default", "test-cluster", "uid"),
            spec,
            Ledger::new(),
        )
    }

    fn ssh_group(authoritative: bool) -> SecurityGroupSpec {
        SecurityGroupSpec {
            name: "test-sg".to_string(),
            description: "test".to_string(),
            security_group_rules: vec![SecurityGroupRuleSpec {
                name: "ssh".to_string(),
                flow: FLOW_INBOUND.to_string(),
                ip_protocol: "tcp".to_string(),
                ip_range: "0.0.0.0/0".to_string(),
                from_port_range: 22,
                to_port_range: 22,
            }],
            authoritative,
            resource_id: String::new(),
        }
    }

    async fn with_net(cloud: &Arc<MemoryCloud>, scope: &mut ClusterScope) {
        NetReconciler::new(cloud.clone(), ReconcilerConfig::fast())
            .reconcile(scope)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_rules_converge_once() {
        let cloud = Arc::new(MemoryCloud::new());
        let reconciler = SecurityGroupReconciler::new(cloud.clone(), ReconcilerConfig::fast());
        let mut scope = scope(vec![ssh_group(false)]);
        with_net(&cloud, &mut scope).await;

        assert!(reconciler.reconcile(&mut scope).await.unwrap().is_ready());
        assert!(scope.ledger.contains(Kind::SecurityGroupRule, "test-sg-ssh-uid"));
        let ledger = scope.ledger.clone();

        cloud.reset_calls().await;
        reconciler.reconcile(&mut scope).await.unwrap();
        assert_eq!(scope.ledger, ledger);
        assert_eq!(cloud.calls_with_prefix("create_").await, 0);
    }

    #[tokio::test]
    async fn test_duplicate_rule_counts_as_created() {
        let cloud = Arc::new(MemoryCloud::new());
        let reconciler = SecurityGroupReconciler::new(cloud.clone(), ReconcilerConfig::fast());
        let mut scope = scope(vec![ssh_group(false)]);
        with_net(&cloud, &mut scope).await;
        cloud
            .fail(
                "create_security_group_rule",
                CloudError::AlreadyExists("rule".to_string()),
            )
            .await;

        reconciler.reconcile(&mut scope).await.unwrap();
        assert!(scope.ledger.contains(Kind::SecurityGroupRule, "test-sg-ssh-uid"));
    }

    #[tokio::test]
    async fn test_authoritative_group_prunes_undeclared_rules() {
        let cloud = Arc::new(MemoryCloud::new());
        let reconciler = SecurityGroupReconciler::new(cloud.clone(), ReconcilerConfig::fast());
        let mut scope = scope(vec![ssh_group(true)]);
        with_net(&cloud, &mut scope).await;

        reconciler.reconcile(&mut scope).await.unwrap();
        let sg_id = scope.ledger.require(Kind::SecurityGroup, "test-sg-uid").unwrap();
        let group = cloud.get_security_group(&sg_id).await.unwrap().unwrap();
        assert_eq!(group.inbound_rules.len(), 1);
        // The default outbound rule is not declared.
        assert!(group.outbound_rules.is_empty());
    }

    #[tokio::test]
    async fn test_finalize_removes_rules_then_group() {
        let cloud = Arc::new(MemoryCloud::new());
        let reconciler = SecurityGroupReconciler::new(cloud.clone(), ReconcilerConfig::fast());
        let mut scope = scope(vec![ssh_group(false)]);
        with_net(&cloud, &mut scope).await;
        reconciler.reconcile(&mut scope).await.unwrap();

        let outcome = reconciler.finalize(&mut scope).await.unwrap();
        assert!(outcome.is_absent());
        assert_eq!(cloud.calls("delete_security_group_rule").await, 1);
        assert_eq!(cloud.calls("delete_security_group").await, 1);
        assert!(!scope.ledger.contains(Kind::SecurityGroup, "test-sg-uid"));
        assert!(!scope.ledger.contains(Kind::SecurityGroupRule, "test-sg-ssh-uid"));
    }
}
