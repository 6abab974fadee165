//! Provisioning plan: the resource DAG and its execution waves.
//!
//! Edges point from a dependency to its dependent. A wave is the set of
//! resources whose dependencies all sit in earlier waves, so the members of
//! one wave can be provisioned concurrently.

use std::collections::HashMap;

use petgraph::Direction;
use petgraph::algo::{is_cyclic_directed, toposort};
use petgraph::graph::{DiGraph, NodeIndex};

use siteindexer_shared::{IndexerTarget, PipelineConfig, Result, SiteIndexerError};

use crate::definition::{
    DataSourceDef, EmbeddingModel, HnswParams, IndexDefinition, IndexerDef, ResourceDefinition,
    SearchIndexDef, SkillsetDef, VectorIndexDef,
};
use crate::resource::{ResourceDescriptor, ResourceKind, ResourceRef, is_valid_name};

/// Validated set of resource definitions with their dependency edges.
#[derive(Debug)]
pub struct ProvisioningPlan {
    graph: DiGraph<ResourceDefinition, ()>,
    index: HashMap<ResourceRef, NodeIndex>,
    /// Nodes in insertion order, used to keep wave contents stable.
    order: Vec<NodeIndex>,
}

impl ProvisioningPlan {
    /// Build a plan from definitions. Fails on invalid or duplicate names,
    /// on a dependency that is not part of the plan, and on cycles.
    pub fn new(definitions: Vec<ResourceDefinition>) -> Result<Self> {
        let data_source = definitions
            .iter()
            .find(|d| d.kind() == ResourceKind::DataSource)
            .map(|d| d.name().to_string());

        let mut plan = Self {
            graph: DiGraph::new(),
            index: HashMap::new(),
            order: Vec::new(),
        };

        for def in definitions {
            let resource = def.resource();
            if !is_valid_name(&resource.name) {
                return Err(SiteIndexerError::validation(format!(
                    "invalid resource name for {resource}: use lowercase letters, digits and dashes"
                )));
            }
            if plan.index.contains_key(&resource) {
                return Err(SiteIndexerError::validation(format!(
                    "{resource} is defined twice"
                )));
            }
            let idx = plan.graph.add_node(def);
            plan.index.insert(resource, idx);
            plan.order.push(idx);
        }

        for &idx in &plan.order.clone() {
            let node = &plan.graph[idx];
            let dependent = node.resource();
            for dep in node.depends_on(data_source.as_deref()) {
                let Some(&dep_idx) = plan.index.get(&dep) else {
                    return Err(SiteIndexerError::validation(format!(
                        "{dependent} depends on {dep}, which is not part of the plan"
                    )));
                };
                plan.add_edge(dep_idx, idx, &dependent, &dep)?;
            }
        }

        Ok(plan)
    }

    /// The standard pipeline plan: data source, keyword index, vector index,
    /// skillset and indexer.
    pub fn from_config(config: &PipelineConfig) -> Result<Self> {
        let names = &config.search.names;
        let embedding = EmbeddingModel {
            uri: config.embedding.uri.clone(),
            api_key: config.embedding.api_key.clone(),
            deployment_id: config.embedding.deployment_id.clone(),
            model_name: config.embedding.model_name.clone(),
            dimensions: config.embedding.dimensions,
        };
        let vector = &config.vector;

        let target_index = match config.search.indexer_target {
            IndexerTarget::Search => ResourceRef::new(ResourceKind::SearchIndex, &names.search_index),
            IndexerTarget::Vector => ResourceRef::new(ResourceKind::VectorIndex, &names.vector_index),
        };

        Self::new(vec![
            ResourceDefinition::DataSource(DataSourceDef {
                name: names.data_source.clone(),
                connection_string: config.storage_connection.clone(),
                container: config.container.clone(),
                query: Some(config.project.clone()),
            }),
            ResourceDefinition::Index(IndexDefinition::Search(SearchIndexDef {
                name: names.search_index.clone(),
            })),
            ResourceDefinition::Index(IndexDefinition::Vector(VectorIndexDef {
                name: names.vector_index.clone(),
                hnsw: HnswParams {
                    algorithm_name: vector.algorithm_name.clone(),
                    profile_name: vector.profile_name.clone(),
                    m: vector.m,
                    ef_construction: vector.ef_construction,
                    ef_search: vector.ef_search,
                },
                embedding: embedding.clone(),
            })),
            ResourceDefinition::Skillset(SkillsetDef {
                name: names.skillset.clone(),
                projection_index: names.vector_index.clone(),
                chunk_length: vector.chunk_length,
                chunk_overlap: vector.chunk_overlap,
                embedding,
            }),
            ResourceDefinition::Indexer(IndexerDef {
                name: names.indexer.clone(),
                data_source: names.data_source.clone(),
                target_index,
                skillset: Some(names.skillset.clone()),
                schedule_interval: config.indexer.schedule_interval.clone(),
                batch_size: config.indexer.batch_size,
                cache_connection: config
                    .indexer
                    .enable_cache
                    .then(|| config.storage_connection.clone()),
            }),
        ])
    }

    fn add_edge(
        &mut self,
        from: NodeIndex,
        to: NodeIndex,
        dependent: &ResourceRef,
        dep: &ResourceRef,
    ) -> Result<()> {
        let edge = self.graph.add_edge(from, to, ());
        if is_cyclic_directed(&self.graph) {
            self.graph.remove_edge(edge);
            return Err(SiteIndexerError::validation(format!(
                "dependency of {dependent} on {dep} would create a cycle"
            )));
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn get(&self, resource: &ResourceRef) -> Option<&ResourceDefinition> {
        self.index.get(resource).map(|&idx| &self.graph[idx])
    }

    /// All definitions in insertion order.
    pub fn definitions(&self) -> impl Iterator<Item = &ResourceDefinition> {
        self.order.iter().map(|&idx| &self.graph[idx])
    }

    /// The indexer of this plan, if it has one.
    pub fn indexer(&self) -> Option<&ResourceDefinition> {
        self.definitions().find(|d| d.kind() == ResourceKind::Indexer)
    }

    /// Direct dependencies of `resource`, in insertion order.
    pub fn dependencies(&self, resource: &ResourceRef) -> Vec<ResourceRef> {
        let Some(&idx) = self.index.get(resource) else {
            return Vec::new();
        };
        let mut deps: Vec<NodeIndex> = self
            .graph
            .neighbors_directed(idx, Direction::Incoming)
            .collect();
        deps.sort_by_key(|n| self.position(*n));
        deps.into_iter().map(|n| self.graph[n].resource()).collect()
    }

    pub fn descriptors(&self) -> Vec<ResourceDescriptor> {
        self.definitions()
            .map(|def| {
                let resource = def.resource();
                ResourceDescriptor {
                    depends_on: self.dependencies(&resource),
                    resource,
                }
            })
            .collect()
    }

    /// Group resources into waves. Every resource lands one wave after its
    /// deepest dependency.
    pub fn waves(&self) -> Vec<Vec<&ResourceDefinition>> {
        let Ok(sorted) = toposort(&self.graph, None) else {
            // Unreachable: edges creating a cycle are rejected in add_edge.
            return Vec::new();
        };

        let mut level: HashMap<NodeIndex, usize> = HashMap::new();
        for idx in sorted {
            let depth = self
                .graph
                .neighbors_directed(idx, Direction::Incoming)
                .filter_map(|dep| level.get(&dep))
                .map(|l| l + 1)
                .max()
                .unwrap_or(0);
            level.insert(idx, depth);
        }

        let depth = level.values().copied().max().map_or(0, |m| m + 1);
        let mut waves: Vec<Vec<&ResourceDefinition>> = vec![Vec::new(); depth];
        for &idx in &self.order {
            waves[level[&idx]].push(&self.graph[idx]);
        }
        waves
    }

    fn position(&self, idx: NodeIndex) -> usize {
        self.order
            .iter()
            .position(|&n| n == idx)
            .unwrap_or(usize::MAX)
    }
}

#[cfg(test)]
mod tests {
    use siteindexer_shared::{AppConfig, IndexerTarget};

    use super::*;

    fn config(target: IndexerTarget) -> PipelineConfig {
        let mut app = AppConfig::default();
        app.project.name = "contoso".into();
        app.project.base_url = "https://www.contoso.com".into();
        app.search.service_name = "contoso-search".into();
        app.search.indexer_target = target;
        app.embedding.uri = "https://contoso-openai.openai.azure.com".into();
        PipelineConfig::resolve_with(&app, |_| Some("secret".to_string())).unwrap()
    }

    fn names(wave: &[&ResourceDefinition]) -> Vec<String> {
        wave.iter().map(|d| d.name().to_string()).collect()
    }

    #[test]
    fn standard_plan_waves() {
        let plan = ProvisioningPlan::from_config(&config(IndexerTarget::Vector)).unwrap();
        assert_eq!(plan.len(), 5);

        let waves = plan.waves();
        assert_eq!(waves.len(), 3);
        assert_eq!(names(&waves[0]), ["web-datasource", "web-vector-skillset"]);
        assert_eq!(names(&waves[1]), ["web-index", "web-vector-index"]);
        assert_eq!(names(&waves[2]), ["web-indexer"]);
    }

    #[test]
    fn indexer_dependencies_follow_target() {
        let plan = ProvisioningPlan::from_config(&config(IndexerTarget::Search)).unwrap();
        let indexer = plan.indexer().unwrap().resource();
        let deps = plan.dependencies(&indexer);
        assert_eq!(
            deps,
            vec![
                ResourceRef::new(ResourceKind::DataSource, "web-datasource"),
                ResourceRef::new(ResourceKind::SearchIndex, "web-index"),
                ResourceRef::new(ResourceKind::Skillset, "web-vector-skillset"),
            ]
        );
    }

    #[test]
    fn missing_dependency_is_rejected() {
        let err = ProvisioningPlan::new(vec![ResourceDefinition::Indexer(IndexerDef {
            name: "orphan".into(),
            data_source: "nowhere".into(),
            target_index: ResourceRef::new(ResourceKind::SearchIndex, "idx"),
            skillset: None,
            schedule_interval: "PT1H".into(),
            batch_size: 10,
            cache_connection: None,
        })])
        .unwrap_err();
        assert!(err.to_string().contains("not part of the plan"));
    }

    #[test]
    fn duplicate_and_invalid_names_are_rejected() {
        let ds = |name: &str| {
            ResourceDefinition::Index(IndexDefinition::Search(SearchIndexDef { name: name.into() }))
        };
        assert!(ProvisioningPlan::new(vec![ds("a"), ds("a")]).is_err());
        assert!(ProvisioningPlan::new(vec![ds("Bad Name")]).is_err());
    }

    #[test]
    fn descriptors_expose_edges() {
        let plan = ProvisioningPlan::from_config(&config(IndexerTarget::Vector)).unwrap();
        let descriptors = plan.descriptors();
        let skillset = descriptors
            .iter()
            .find(|d| d.resource.kind == ResourceKind::Skillset)
            .unwrap();
        assert!(skillset.depends_on.is_empty());
        let index = descriptors
            .iter()
            .find(|d| d.resource.kind == ResourceKind::VectorIndex)
            .unwrap();
        assert_eq!(index.depends_on.len(), 1);
    }
}
