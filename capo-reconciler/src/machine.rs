//! Machine pass: converge or tear down the Vm of one machine and what it owns.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::cloud::CloudApi;
use crate::config::ReconcilerConfig;
use crate::error::{ReconcileError, Result};
use crate::reconciler::keypair::KeyPairReconciler;
use crate::reconciler::public_ip;
use crate::reconciler::vm::{VmReconciler, provider_id};
use crate::reconciler::volume::VolumeReconciler;
use crate::reconciler::{DeleteOutcome, MachineScope, Outcome, Reconciler};
use crate::validation::validate_machine;

/// What a create pass surfaces to the host layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineReport {
    pub outcome: Outcome,
    /// `aws:///<subregion>/<vm-id>` once the Vm runs.
    pub provider_id: Option<String>,
    pub private_dns_name: Option<String>,
}

pub struct MachineReconciler {
    cloud: Arc<dyn CloudApi>,
    config: ReconcilerConfig,
    key_pair_reconciler: KeyPairReconciler,
    volume_reconciler: VolumeReconciler,
    vm_reconciler: VmReconciler,
}

impl MachineReconciler {
    pub fn new(cloud: Arc<dyn CloudApi>, config: ReconcilerConfig) -> Self {
        Self {
            key_pair_reconciler: KeyPairReconciler::new(cloud.clone()),
            volume_reconciler: VolumeReconciler::new(cloud.clone(), config.clone()),
            vm_reconciler: VmReconciler::new(cloud.clone(), config.clone()),
            cloud,
            config,
        }
    }

    /// Run one create pass. The spec is validated before any cloud call.
    pub async fn reconcile(&self, scope: &mut MachineScope) -> Result<MachineReport> {
        validate_machine(&scope.spec, &scope.cluster.spec)?;

        info!(namespace = %scope.object.namespace, name = %scope.object.name, "Reconciling machine");
        let deadline = self.config.pass_deadline();
        tokio::time::timeout(deadline, self.create_pass(scope))
            .await
            .map_err(|_| ReconcileError::DeadlineExceeded(deadline))?
    }

    /// Run one delete pass: Vm first, then what it used.
    pub async fn delete(&self, scope: &mut MachineScope) -> Result<DeleteOutcome> {
        info!(namespace = %scope.object.namespace, name = %scope.object.name, "Deleting machine");
        let deadline = self.config.pass_deadline();
        tokio::time::timeout(deadline, self.delete_pass(scope))
            .await
            .map_err(|_| ReconcileError::DeadlineExceeded(deadline))?
    }

    async fn create_pass(&self, scope: &mut MachineScope) -> Result<MachineReport> {
        let mut outcome = self.key_pair_reconciler.reconcile(scope).await?;

        let volumes = self.volume_reconciler.reconcile(scope).await?;
        if !volumes.is_ready() {
            return Ok(MachineReport {
                outcome: outcome.and(volumes),
                provider_id: None,
                private_dns_name: None,
            });
        }

        outcome = outcome.and(self.vm_reconciler.reconcile(scope).await?);
        let vm = self.vm_reconciler.describe(scope).await?;
        Ok(MachineReport {
            outcome,
            provider_id: vm.as_ref().map(provider_id),
            private_dns_name: vm.map(|vm| vm.private_dns_name),
        })
    }

    async fn delete_pass(&self, scope: &mut MachineScope) -> Result<DeleteOutcome> {
        let vm = self.vm_reconciler.finalize(scope).await?;
        if !vm.is_absent() {
            return Ok(vm);
        }

        let mut outcome = self.volume_reconciler.finalize(scope).await?;

        if scope.spec.vm.public_ip {
            let names = [scope.object.logical_name(&scope.spec.vm.public_ip_name)];
            let released =
                public_ip::release(self.cloud.as_ref(), &scope.object, &mut scope.ledger, &names)
                    .await?;
            if !released {
                outcome = outcome.and(DeleteOutcome::StillPresent {
                    requeue_after: self.config.requeue_after(),
                });
            }
        }

        Ok(outcome.and(self.key_pair_reconciler.finalize(scope).await?))
    }
}
