//! Route table reconciler.
//!
//! Route tables are composite: once a table is confirmed, its subnet links
//! and routes are converged. That recursion only runs while the table is new
//! or some child has no ledger entry yet.
//!
//! A table whose routes point at a nat service that has not converged yet is
//! skipped for this pass instead of failing, so the cluster driver can run
//! route tables before and after the nat service.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::{
    ClusterScope, DeleteOutcome, ObjectRef, Outcome, Reconciler, deleted, tolerate_exists,
    tolerate_missing,
};
use crate::cloud::CloudApi;
use crate::config::ReconcilerConfig;
use crate::error::{ReconcileError, Result};
use crate::identity::IdentityResolver;
use crate::ledger::{Kind, Ledger};
use crate::spec::{RouteSpec, RouteTableSpec, TARGET_NAT};

/// Ledger name of a route. Route names are only unique within their table.
fn route_key(object: &ObjectRef, table: &RouteTableSpec, route: &RouteSpec) -> String {
    object.logical_name(&format!("{}-{}", table.name, route.name))
}

pub struct RouteTableReconciler {
    cloud: Arc<dyn CloudApi>,
    config: ReconcilerConfig,
}

impl RouteTableReconciler {
    pub fn new(cloud: Arc<dyn CloudApi>, config: ReconcilerConfig) -> Self {
        Self { cloud, config }
    }

    /// Resolve the cloud ID of every route target, in route order.
    ///
    /// `Ok(None)` means a nat target has not converged yet.
    async fn route_targets(
        &self,
        object: &ObjectRef,
        ledger: &mut Ledger,
        spec: &RouteTableSpec,
    ) -> Result<Option<Vec<String>>> {
        let identity = IdentityResolver::new(self.cloud.as_ref());
        let mut targets = Vec::with_capacity(spec.routes.len());
        for route in &spec.routes {
            let target_name = object.logical_name(&route.target_name);
            if route.target_type == TARGET_NAT {
                match ledger.resource_id(Kind::NatService, &target_name) {
                    Some(id) => targets.push(id.to_string()),
                    None => return Ok(None),
                }
            } else {
                let id = identity
                    .dependency(object, Kind::InternetService, &target_name, ledger)
                    .await?;
                targets.push(id);
            }
        }
        Ok(Some(targets))
    }

    fn forget_table(object: &ObjectRef, ledger: &mut Ledger, spec: &RouteTableSpec) {
        for route in &spec.routes {
            ledger.remove(Kind::Route, &route_key(object, spec, route));
        }
        ledger.remove(Kind::RouteTable, &object.logical_name(&spec.name));
    }

    /// Link the table to its subnets, recording each link ID.
    ///
    /// `subnets` holds `(logical name, subnet ID)` pairs. A subnet already
    /// linked to another table of the net is an ownership conflict.
    async fn link_subnets(
        &self,
        object: &ObjectRef,
        ledger: &mut Ledger,
        name: &str,
        route_table_id: &str,
        subnets: &[(String, String)],
        members: &[String],
    ) -> Result<()> {
        let table = self
            .cloud
            .get_route_table(route_table_id)
            .await
            .map_err(object.wrap("get route table"))?;
        let links = table.map(|t| t.links).unwrap_or_default();

        for (subnet_name, subnet_id) in subnets {
            if let Some(link) = links.iter().find(|l| &l.subnet_id == subnet_id) {
                ledger.add_link_id(Kind::RouteTable, name, link.link_route_table_id.clone());
                continue;
            }
            info!(route_table_id = %route_table_id, subnet_id = %subnet_id, "Linking route table");
            let link_id = tolerate_exists(self.cloud.link_route_table(route_table_id, subnet_id).await)
                .map_err(object.wrap("link route table"))?;
            match link_id {
                Some(link_id) => ledger.add_link_id(Kind::RouteTable, name, link_id),
                None => {
                    let owner = self
                        .linked_table(object, subnet_id, members)
                        .await?
                        .unwrap_or_else(|| "another route table".to_string());
                    warn!(subnet_id = %subnet_id, owner = %owner, "Subnet is linked to another route table");
                    return Err(ReconcileError::ConflictOwnership {
                        kind: Kind::Subnet,
                        name: subnet_name.clone(),
                        owner,
                        expected: route_table_id.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    /// The route table of the net currently linked to `subnet_id`.
    async fn linked_table(
        &self,
        object: &ObjectRef,
        subnet_id: &str,
        members: &[String],
    ) -> Result<Option<String>> {
        for route_table_id in members {
            let table = self
                .cloud
                .get_route_table(route_table_id)
                .await
                .map_err(object.wrap("get route table"))?;
            if table.is_some_and(|t| t.links.iter().any(|l| l.subnet_id == subnet_id)) {
                return Ok(Some(route_table_id.clone()));
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl Reconciler for RouteTableReconciler {
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
            .get_route_table_ids_from_net_ids(&net_id)
            .await
            .map_err(scope.object.wrap("list route tables"))?;

        let mut outcome = Outcome::Ready;
        for spec in &network.route_tables {
            let name = scope.object.logical_name(&spec.name);

            let Some(targets) = self
                .route_targets(&scope.object, &mut scope.ledger, spec)
                .await?
            else {
                info!(name = %name, "Nat service is not ready, skipping route table");
                outcome = outcome.and(Outcome::Skipped {
                    reason: format!("route table {} waits for its nat service", name),
                });
                continue;
            };

            let mut subnets = Vec::with_capacity(spec.subnets.len());
            for subnet in &spec.subnets {
                let subnet_name = scope.object.logical_name(subnet);
                let subnet_id = identity
                    .dependency(&scope.object, Kind::Subnet, &subnet_name, &mut scope.ledger)
                    .await?;
                subnets.push((subnet_name, subnet_id));
            }

            if !spec.resource_id.is_empty() {
                scope
                    .ledger
                    .set_resource_id(Kind::RouteTable, &name, &spec.resource_id);
            }

            let mut existing = None;
            if let Some((id, _)) = identity
                .lookup(&scope.object, Kind::RouteTable, &name, &mut scope.ledger)
                .await?
            {
                if members.contains(&id) {
                    existing = Some(id);
                } else if !spec.resource_id.is_empty() {
                    return Err(ReconcileError::NotFound {
                        kind: Kind::RouteTable,
                        name,
                    });
                } else {
                    warn!(route_table_id = %id, "Recorded route table is not part of the net, recreating");
                    Self::forget_table(&scope.object, &mut scope.ledger, spec);
                }
            }

            let route_table_id = match existing {
                Some(id) => {
                    let routes_recorded = spec.routes.iter().all(|r| {
                        scope
                            .ledger
                            .contains(Kind::Route, &route_key(&scope.object, spec, r))
                    });
                    let links_recorded =
                        scope.ledger.link_ids(Kind::RouteTable, &name).len() >= subnets.len();
                    if routes_recorded && links_recorded {
                        debug!(route_table_id = %id, "Route table already exists");
                        continue;
                    }
                    id
                }
                None => {
                    info!(name = %name, net_id = %net_id, "Creating route table");
                    let created = tolerate_exists(self.cloud.create_route_table(&net_id, &name).await)
                        .map_err(scope.object.wrap("create route table"))?;
                    match created {
                        Some(rt) => {
                            info!(route_table_id = %rt.route_table_id, "Created route table");
                            scope.ledger.set_resource_id(
                                Kind::RouteTable,
                                &name,
                                rt.route_table_id.clone(),
                            );
                            rt.route_table_id
                        }
                        None => match identity
                            .recover_from_tag(&scope.object, Kind::RouteTable, &name, &mut scope.ledger)
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

            self.link_subnets(
                &scope.object,
                &mut scope.ledger,
                &name,
                &route_table_id,
                &subnets,
                &members,
            )
            .await?;

            for (route, target_id) in spec.routes.iter().zip(&targets) {
                let route_name = route_key(&scope.object, spec, route);
                if scope.ledger.contains(Kind::Route, &route_name) {
                    continue;
                }
                info!(
                    route_table_id = %route_table_id,
                    destination = %route.destination,
                    target_id = %target_id,
                    "Creating route"
                );
                let created = tolerate_exists(
                    self.cloud
                        .create_route(
                            &route.destination,
                            &route_table_id,
                            target_id,
                            &route.target_type,
                        )
                        .await,
                )
                .map_err(scope.object.wrap("create route"))?;
                if created.is_none() {
                    debug!(destination = %route.destination, "Route already exists");
                }
                scope
                    .ledger
                    .set_resource_id(Kind::Route, &route_name, route_table_id.clone());
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
            debug!("Net is already deleted, no route table expected");
            for spec in &network.route_tables {
                Self::forget_table(&scope.object, &mut scope.ledger, spec);
            }
            return Ok(DeleteOutcome::ConvergedAbsent);
        };

        let members = self
            .cloud
            .get_route_table_ids_from_net_ids(&net_id)
            .await
            .map_err(scope.object.wrap("list route tables"))?;

        let mut outcome = DeleteOutcome::ConvergedAbsent;
        for spec in &network.route_tables {
            let name = scope.object.logical_name(&spec.name);
            let Some((route_table_id, _)) = identity
                .lookup(&scope.object, Kind::RouteTable, &name, &mut scope.ledger)
                .await?
            else {
                continue;
            };
            if !members.contains(&route_table_id) {
                debug!(route_table_id = %route_table_id, "Route table is not part of the net, skipping");
                Self::forget_table(&scope.object, &mut scope.ledger, spec);
                continue;
            }

            for route in &spec.routes {
                let route_name = route_key(&scope.object, spec, route);
                if !scope.ledger.contains(Kind::Route, &route_name) {
                    continue;
                }
                info!(route_table_id = %route_table_id, destination = %route.destination, "Deleting route");
                tolerate_missing(
                    self.cloud
                        .delete_route(&route.destination, &route_table_id)
                        .await,
                )
                .map_err(scope.object.wrap("delete route"))?;
                scope.ledger.remove(Kind::Route, &route_name);
            }

            let table = self
                .cloud
                .get_route_table(&route_table_id)
                .await
                .map_err(scope.object.wrap("get route table"))?;
            for link in table.map(|t| t.links).unwrap_or_default() {
                info!(
                    route_table_id = %route_table_id,
                    link_id = %link.link_route_table_id,
                    "Unlinking route table"
                );
                tolerate_missing(self.cloud.unlink_route_table(&link.link_route_table_id).await)
                    .map_err(scope.object.wrap("unlink route table"))?;
            }
            scope.ledger.clear_link_ids(Kind::RouteTable, &name);

            info!(route_table_id = %route_table_id, "Deleting route table");
            let gone = deleted(self.cloud.delete_route_table(&route_table_id).await)
                .map_err(scope.object.wrap("delete route table"))?;
            if gone {
                scope.ledger.remove(Kind::RouteTable, &name);
            } else {
                outcome = outcome.and(DeleteOutcome::StillPresent {
                    requeue_after: self.config.requeue_after(),
                });
            }
        }
        Ok(outcome)
    }
}
