//! capo-reconciler: converges a declared cloud topology for a cluster and its
//! machines, and tears it down again.
//!
//! A host orchestrator calls [`ClusterReconciler::reconcile`] /
//! [`MachineReconciler::reconcile`] once per pass with the object's
//! [`Ledger`], and the `delete` counterparts once the object is being removed.
//! Every pass is safe to re-enter after a failure or a restart.

pub mod cloud;
pub mod cluster;
pub mod config;
pub mod error;
pub mod identity;
pub mod ledger;
pub mod machine;
pub mod reconciler;
pub mod spec;
pub mod validation;
pub mod wait;

pub use cluster::{ClusterReconciler, ClusterReport};
pub use config::{LoadError, PollSettings, ReconcilerConfig, load_document};
pub use error::{ReconcileError, Result};
pub use ledger::{Kind, Ledger};
pub use machine::{MachineReconciler, MachineReport};
pub use reconciler::{ClusterScope, DeleteOutcome, MachineScope, ObjectRef, Outcome};
