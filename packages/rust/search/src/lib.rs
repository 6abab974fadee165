//! Search index provisioning for siteindexer.
//!
//! Builds the resource DAG (data source, keyword index, vector index,
//! skillset, indexer) from configuration and brings a search service in line
//! with it through create-or-update calls. Every step is idempotent, so the
//! whole sequence can run on every pipeline execution.

pub mod backend;
pub mod definition;
pub mod memory;
pub mod plan;
pub mod provisioner;
pub mod resource;

pub use backend::{BackendResponse, RestSearchBackend, SearchBackend};
pub use definition::{
    DataSourceDef, EmbeddingModel, HnswParams, IndexDefinition, IndexerDef, ResourceDefinition,
    SearchIndexDef, SkillsetDef, VectorIndexDef,
};
pub use memory::MemorySearchBackend;
pub use plan::ProvisioningPlan;
pub use provisioner::{
    IndexProvisioner, IndexerTrigger, OutcomeStatus, ProvisioningAction, ProvisioningHealth,
    ProvisioningOutcome, ProvisioningReport,
};
pub use resource::{ResourceDescriptor, ResourceKind, ResourceRef};
