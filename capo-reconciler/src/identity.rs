//! Identity resolution: logical name to cloud ID.
//!
//! Sources are tried in order. The ledger is authoritative when it has an
//! entry; for kinds that support it, the cloud `Name` tag is consulted next so
//! identity can be recovered after the ledger was lost.

use tracing::{debug, info};

use crate::cloud::{CloudApi, NAME_TAG_KEY};
use crate::error::{ReconcileError, Result};
use crate::ledger::{Kind, Ledger};
use crate::reconciler::ObjectRef;

/// Where a resolved ID came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentitySource {
    FromLedger,
    FromTagLookup,
}

const SOURCES: [IdentitySource; 2] = [IdentitySource::FromLedger, IdentitySource::FromTagLookup];

pub struct IdentityResolver<'a> {
    cloud: &'a dyn CloudApi,
}

impl<'a> IdentityResolver<'a> {
    pub fn new(cloud: &'a dyn CloudApi) -> Self {
        Self { cloud }
    }

    /// Resolve `logical_name` of `kind`, or fail with `NotFound`.
    ///
    /// A tag hit is written back into the ledger.
    pub async fn resolve(
        &self,
        object: &ObjectRef,
        kind: Kind,
        logical_name: &str,
        ledger: &mut Ledger,
    ) -> Result<(String, IdentitySource)> {
        for source in SOURCES {
            match source {
                IdentitySource::FromLedger => {
                    if let Some(id) = ledger.resource_id(kind, logical_name) {
                        return Ok((id.to_string(), source));
                    }
                }
                IdentitySource::FromTagLookup => {
                    if !kind.supports_tag_lookup() {
                        continue;
                    }
                    let tag = self
                        .cloud
                        .read_tag(NAME_TAG_KEY, logical_name)
                        .await
                        .map_err(object.wrap(&format!("read tag of {} {}", kind, logical_name)))?;
                    if let Some(tag) = tag {
                        info!(
                            kind = %kind,
                            name = logical_name,
                            resource_id = %tag.resource_id,
                            "Recovered identity from tag"
                        );
                        ledger.set_resource_id(kind, logical_name, tag.resource_id.clone());
                        return Ok((tag.resource_id, source));
                    }
                }
            }
        }

        debug!(kind = %kind, name = logical_name, "Identity not found");
        Err(ReconcileError::NotFound {
            kind,
            name: logical_name.to_string(),
        })
    }

    /// Resolve an upstream resource; a miss means it has not converged yet.
    pub async fn dependency(
        &self,
        object: &ObjectRef,
        kind: Kind,
        logical_name: &str,
        ledger: &mut Ledger,
    ) -> Result<String> {
        match self.resolve(object, kind, logical_name, ledger).await {
            Ok((id, _)) => Ok(id),
            Err(ReconcileError::NotFound { kind, name }) => {
                Err(ReconcileError::DependencyUnresolved { kind, name })
            }
            Err(e) => Err(e),
        }
    }

    /// Like [`resolve`](Self::resolve) but maps `NotFound` to `None`.
    pub async fn lookup(
        &self,
        object: &ObjectRef,
        kind: Kind,
        logical_name: &str,
        ledger: &mut Ledger,
    ) -> Result<Option<(String, IdentitySource)>> {
        match self.resolve(object, kind, logical_name, ledger).await {
            Ok(found) => Ok(Some(found)),
            Err(ReconcileError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Find the object carrying `Name=<logical_name>`, regardless of kind.
    ///
    /// Used to recover the ID after a create was rejected as a duplicate.
    pub async fn recover_from_tag(
        &self,
        object: &ObjectRef,
        kind: Kind,
        logical_name: &str,
        ledger: &mut Ledger,
    ) -> Result<Option<String>> {
        let tag = self
            .cloud
            .read_tag(NAME_TAG_KEY, logical_name)
            .await
            .map_err(object.wrap(&format!("read tag of {} {}", kind, logical_name)))?;
        Ok(tag.map(|tag| {
            ledger.set_resource_id(kind, logical_name, tag.resource_id.clone());
            tag.resource_id
        }))
    }
}
