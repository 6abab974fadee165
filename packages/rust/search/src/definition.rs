//! Typed resource definitions and their REST payloads.
//!
//! Each definition knows its own name, kind, dependencies and JSON body.
//! Secrets are embedded only in [`ResourceDefinition::payload`];
//! [`ResourceDefinition::redacted_payload`] masks them for display.

use serde_json::{Value, json};
use siteindexer_shared::Secret;

use crate::resource::{ResourceDescriptor, ResourceKind, ResourceRef};

const REDACTED: &str = "***";

fn secret_value(secret: &Secret, reveal: bool) -> &str {
    if reveal { secret.expose() } else { REDACTED }
}

// ---------------------------------------------------------------------------
// Data source
// ---------------------------------------------------------------------------

/// Blob-container data source.
#[derive(Debug, Clone)]
pub struct DataSourceDef {
    pub name: String,
    pub connection_string: Secret,
    pub container: String,
    /// Folder prefix inside the container to index.
    pub query: Option<String>,
}

impl DataSourceDef {
    fn build(&self, reveal: bool) -> Value {
        let mut container = json!({ "name": self.container });
        if let Some(query) = &self.query {
            container["query"] = json!(query);
        }
        json!({
            "name": self.name,
            "description": "Blob container holding crawled page text",
            "type": "azureblob",
            "credentials": { "connectionString": secret_value(&self.connection_string, reveal) },
            "container": container,
        })
    }
}

// ---------------------------------------------------------------------------
// Indexes
// ---------------------------------------------------------------------------

/// Embedding model used for query vectorization and chunk embedding.
#[derive(Debug, Clone)]
pub struct EmbeddingModel {
    pub uri: String,
    pub api_key: Secret,
    pub deployment_id: String,
    pub model_name: String,
    pub dimensions: u32,
}

/// Keyword index over whole documents.
#[derive(Debug, Clone)]
pub struct SearchIndexDef {
    pub name: String,
}

impl SearchIndexDef {
    fn build(&self) -> Value {
        json!({
            "name": self.name,
            "fields": [
                { "name": "id", "type": "Edm.String", "key": true, "searchable": true },
                {
                    "name": "content",
                    "type": "Edm.String",
                    "searchable": true,
                    "filterable": false,
                    "sortable": false,
                    "facetable": false
                }
            ]
        })
    }
}

/// HNSW graph parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HnswParams {
    pub algorithm_name: String,
    pub profile_name: String,
    pub m: u32,
    pub ef_construction: u32,
    pub ef_search: u32,
}

/// Chunk-level vector index.
#[derive(Debug, Clone)]
pub struct VectorIndexDef {
    pub name: String,
    pub hnsw: HnswParams,
    pub embedding: EmbeddingModel,
}

impl VectorIndexDef {
    fn vectorizer_name(&self) -> String {
        format!("{}-vectorizer", self.hnsw.profile_name)
    }

    fn build(&self, reveal: bool) -> Value {
        let hnsw = &self.hnsw;
        let embedding = &self.embedding;
        json!({
            "name": self.name,
            "fields": [
                {
                    "name": "id",
                    "type": "Edm.String",
                    "key": true,
                    "searchable": true,
                    "filterable": true,
                    "sortable": true,
                    "analyzer": "keyword"
                },
                { "name": "parent_id", "type": "Edm.String", "searchable": false, "filterable": true },
                { "name": "title", "type": "Edm.String", "searchable": true },
                { "name": "chunk", "type": "Edm.String", "searchable": true, "filterable": false, "sortable": false, "facetable": false },
                {
                    "name": "vector",
                    "type": "Collection(Edm.Single)",
                    "searchable": true,
                    "dimensions": embedding.dimensions,
                    "vectorSearchProfile": hnsw.profile_name
                }
            ],
            "vectorSearch": {
                "algorithms": [{
                    "name": hnsw.algorithm_name,
                    "kind": "hnsw",
                    "hnswParameters": {
                        "m": hnsw.m,
                        "efConstruction": hnsw.ef_construction,
                        "efSearch": hnsw.ef_search,
                        "metric": "cosine"
                    }
                }],
                "profiles": [{
                    "name": hnsw.profile_name,
                    "algorithm": hnsw.algorithm_name,
                    "vectorizer": self.vectorizer_name()
                }],
                "vectorizers": [{
                    "name": self.vectorizer_name(),
                    "kind": "azureOpenAI",
                    "azureOpenAIParameters": {
                        "resourceUri": embedding.uri,
                        "deploymentId": embedding.deployment_id,
                        "modelName": embedding.model_name,
                        "apiKey": secret_value(&embedding.api_key, reveal)
                    }
                }]
            }
        })
    }
}

/// The two index shapes, each with its own schema builder.
#[derive(Debug, Clone)]
pub enum IndexDefinition {
    Search(SearchIndexDef),
    Vector(VectorIndexDef),
}

impl IndexDefinition {
    pub fn name(&self) -> &str {
        match self {
            Self::Search(def) => &def.name,
            Self::Vector(def) => &def.name,
        }
    }

    pub fn kind(&self) -> ResourceKind {
        match self {
            Self::Search(_) => ResourceKind::SearchIndex,
            Self::Vector(_) => ResourceKind::VectorIndex,
        }
    }

    fn build(&self, reveal: bool) -> Value {
        match self {
            Self::Search(def) => def.build(),
            Self::Vector(def) => def.build(reveal),
        }
    }
}

// ---------------------------------------------------------------------------
// Skillset
// ---------------------------------------------------------------------------

/// Split-then-embed enrichment projecting chunks into the vector index.
#[derive(Debug, Clone)]
pub struct SkillsetDef {
    pub name: String,
    /// Index receiving the projected chunks.
    pub projection_index: String,
    pub chunk_length: u32,
    pub chunk_overlap: u32,
    pub embedding: EmbeddingModel,
}

impl SkillsetDef {
    fn build(&self, reveal: bool) -> Value {
        let embedding = &self.embedding;
        json!({
            "name": self.name,
            "description": "Split page text into overlapping chunks and embed each chunk",
            "skills": [
                {
                    "@odata.type": "#Microsoft.Skills.Text.SplitSkill",
                    "name": "split-pages",
                    "context": "/document",
                    "textSplitMode": "pages",
                    "maximumPageLength": self.chunk_length,
                    "pageOverlapLength": self.chunk_overlap,
                    "inputs": [{ "name": "text", "source": "/document/content" }],
                    "outputs": [{ "name": "textItems", "targetName": "pages" }]
                },
                {
                    "@odata.type": "#Microsoft.Skills.Text.AzureOpenAIEmbeddingSkill",
                    "name": "embed-chunks",
                    "context": "/document/pages/*",
                    "resourceUri": embedding.uri,
                    "deploymentId": embedding.deployment_id,
                    "modelName": embedding.model_name,
                    "dimensions": embedding.dimensions,
                    "apiKey": secret_value(&embedding.api_key, reveal),
                    "inputs": [{ "name": "text", "source": "/document/pages/*" }],
                    "outputs": [{ "name": "embedding", "targetName": "vector" }]
                }
            ],
            "indexProjections": {
                "selectors": [{
                    "targetIndexName": self.projection_index,
                    "parentKeyFieldName": "parent_id",
                    "sourceContext": "/document/pages/*",
                    "mappings": [
                        { "name": "chunk", "source": "/document/pages/*" },
                        { "name": "vector", "source": "/document/pages/*/vector" },
                        { "name": "title", "source": "/document/metadata_storage_name" }
                    ]
                }],
                "parameters": { "projectionMode": "skipIndexingParentDocuments" }
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Indexer
// ---------------------------------------------------------------------------

/// Indexer binding data source, target index and skillset.
#[derive(Debug, Clone)]
pub struct IndexerDef {
    pub name: String,
    pub data_source: String,
    pub target_index: ResourceRef,
    pub skillset: Option<String>,
    /// ISO-8601 duration between scheduled runs.
    pub schedule_interval: String,
    pub batch_size: u32,
    /// Storage connection for the enrichment cache, if enabled.
    pub cache_connection: Option<Secret>,
}

impl IndexerDef {
    fn build(&self, reveal: bool) -> Value {
        let mut payload = json!({
            "name": self.name,
            "description": "Indexer for crawled page text",
            "dataSourceName": self.data_source,
            "targetIndexName": self.target_index.name,
            "schedule": { "interval": self.schedule_interval },
            "parameters": {
                "batchSize": self.batch_size,
                "configuration": {
                    "dataToExtract": "contentAndMetadata",
                    "parsingMode": "default"
                }
            },
            "fieldMappings": [{
                "sourceFieldName": "metadata_storage_path",
                "targetFieldName": "id",
                "mappingFunction": { "name": "base64Encode" }
            }]
        });
        if let Some(skillset) = &self.skillset {
            payload["skillsetName"] = json!(skillset);
        }
        if let Some(connection) = &self.cache_connection {
            payload["cache"] = json!({
                "storageConnectionString": secret_value(connection, reveal),
                "enableReprocessing": true
            });
        }
        payload
    }
}

// ---------------------------------------------------------------------------
// ResourceDefinition
// ---------------------------------------------------------------------------

/// Any provisionable resource.
#[derive(Debug, Clone)]
pub enum ResourceDefinition {
    DataSource(DataSourceDef),
    Index(IndexDefinition),
    Skillset(SkillsetDef),
    Indexer(IndexerDef),
}

impl ResourceDefinition {
    pub fn name(&self) -> &str {
        match self {
            Self::DataSource(def) => &def.name,
            Self::Index(def) => def.name(),
            Self::Skillset(def) => &def.name,
            Self::Indexer(def) => &def.name,
        }
    }

    pub fn kind(&self) -> ResourceKind {
        match self {
            Self::DataSource(_) => ResourceKind::DataSource,
            Self::Index(def) => def.kind(),
            Self::Skillset(_) => ResourceKind::Skillset,
            Self::Indexer(_) => ResourceKind::Indexer,
        }
    }

    pub fn resource(&self) -> ResourceRef {
        ResourceRef::new(self.kind(), self.name())
    }

    /// Resources that must exist before this one is provisioned.
    ///
    /// Indexes are gated on the data source; the indexer on the data source,
    /// its target index and its skillset. The skillset stands alone.
    pub fn depends_on(&self, data_source: Option<&str>) -> Vec<ResourceRef> {
        match self {
            Self::DataSource(_) | Self::Skillset(_) => Vec::new(),
            Self::Index(_) => data_source
                .map(|ds| vec![ResourceRef::new(ResourceKind::DataSource, ds)])
                .unwrap_or_default(),
            Self::Indexer(def) => {
                let mut deps = vec![
                    ResourceRef::new(ResourceKind::DataSource, &def.data_source),
                    def.target_index.clone(),
                ];
                if let Some(skillset) = &def.skillset {
                    deps.push(ResourceRef::new(ResourceKind::Skillset, skillset));
                }
                deps
            }
        }
    }

    pub fn descriptor(&self, data_source: Option<&str>) -> ResourceDescriptor {
        ResourceDescriptor {
            resource: self.resource(),
            depends_on: self.depends_on(data_source),
        }
    }

    /// Request body for the create-or-update call.
    pub fn payload(&self) -> Value {
        self.build(true)
    }

    /// Request body with secrets masked.
    pub fn redacted_payload(&self) -> Value {
        self.build(false)
    }

    fn build(&self, reveal: bool) -> Value {
        match self {
            Self::DataSource(def) => def.build(reveal),
            Self::Index(def) => def.build(reveal),
            Self::Skillset(def) => def.build(reveal),
            Self::Indexer(def) => def.build(reveal),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn embedding() -> EmbeddingModel {
        EmbeddingModel {
            uri: "https://openai.example.com".into(),
            api_key: Secret::new("embed-key"),
            deployment_id: "ada".into(),
            model_name: "text-embedding-ada-002".into(),
            dimensions: 1536,
        }
    }

    fn vector_index() -> VectorIndexDef {
        VectorIndexDef {
            name: "web-vector-index".into(),
            hnsw: HnswParams {
                algorithm_name: "hnsw-cosine".into(),
                profile_name: "vector-profile".into(),
                m: 4,
                ef_construction: 400,
                ef_search: 500,
            },
            embedding: embedding(),
        }
    }

    #[test]
    fn data_source_scopes_container_to_project() {
        let def = ResourceDefinition::DataSource(DataSourceDef {
            name: "web-ds".into(),
            connection_string: Secret::new("conn"),
            container: "web-scraper-container".into(),
            query: Some("contoso".into()),
        });
        let payload = def.payload();
        assert_eq!(payload["type"], "azureblob");
        assert_eq!(payload["container"]["query"], "contoso");
        assert_eq!(payload["credentials"]["connectionString"], "conn");
        assert_eq!(def.redacted_payload()["credentials"]["connectionString"], "***");
    }

    #[test]
    fn vector_index_schema() {
        let payload = ResourceDefinition::Index(IndexDefinition::Vector(vector_index())).payload();
        let fields = payload["fields"].as_array().unwrap();

        let id = fields.iter().find(|f| f["name"] == "id").unwrap();
        assert_eq!(id["key"], true);
        assert_eq!(id["analyzer"], "keyword");

        let vector = fields.iter().find(|f| f["name"] == "vector").unwrap();
        assert_eq!(vector["type"], "Collection(Edm.Single)");
        assert_eq!(vector["dimensions"], 1536);
        assert_eq!(vector["vectorSearchProfile"], "vector-profile");

        assert!(fields.iter().any(|f| f["name"] == "parent_id"));
        assert!(fields.iter().any(|f| f["name"] == "chunk"));

        let params = &payload["vectorSearch"]["algorithms"][0]["hnswParameters"];
        assert_eq!(params["metric"], "cosine");
        assert_eq!(params["m"], 4);
        assert_eq!(params["efSearch"], 500);
    }

    #[test]
    fn skillset_splits_then_embeds() {
        let def = ResourceDefinition::Skillset(SkillsetDef {
            name: "web-skillset".into(),
            projection_index: "web-vector-index".into(),
            chunk_length: 2000,
            chunk_overlap: 500,
            embedding: embedding(),
        });
        let payload = def.payload();
        let skills = payload["skills"].as_array().unwrap();
        assert_eq!(skills[0]["@odata.type"], "#Microsoft.Skills.Text.SplitSkill");
        assert_eq!(skills[0]["pageOverlapLength"], 500);
        assert_eq!(skills[1]["context"], "/document/pages/*");
        assert_eq!(
            payload["indexProjections"]["selectors"][0]["parentKeyFieldName"],
            "parent_id"
        );
        assert!(def.depends_on(Some("web-ds")).is_empty());
        assert_eq!(def.redacted_payload()["skills"][1]["apiKey"], "***");
    }

    #[test]
    fn indexer_depends_on_everything_it_binds() {
        let def = ResourceDefinition::Indexer(IndexerDef {
            name: "web-indexer".into(),
            data_source: "web-ds".into(),
            target_index: ResourceRef::new(ResourceKind::VectorIndex, "web-vector-index"),
            skillset: Some("web-skillset".into()),
            schedule_interval: "PT1H".into(),
            batch_size: 10,
            cache_connection: None,
        });
        let deps = def.depends_on(Some("web-ds"));
        assert_eq!(deps.len(), 3);
        assert!(deps.contains(&ResourceRef::new(ResourceKind::Skillset, "web-skillset")));

        let payload = def.payload();
        assert_eq!(payload["schedule"]["interval"], "PT1H");
        assert_eq!(payload["parameters"]["batchSize"], 10);
        assert_eq!(payload["skillsetName"], "web-skillset");
        assert!(payload.get("cache").is_none());
    }
}
