//! Status command implementation

use crate::engine::Engine;
use crate::error::Result;
use serde::Serialize;
use tracing::debug;

#[derive(Debug, Clone, Serialize)]
pub struct RelationInfo {
    pub name: String,
    pub kind: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct KnowledgeBaseInfo {
    pub name: String,
    pub backend: String,
    pub dimension: usize,
    pub chunks: usize,
    pub reranking: bool,
}

/// Status information
#[derive(Debug, Clone, Serialize)]
pub struct StatusInfo {
    pub config_path: String,
    pub db_path: String,
    pub vector_backend: String,
    pub embedding_backend: String,
    pub relations: Vec<RelationInfo>,
    pub knowledge_bases: Vec<KnowledgeBaseInfo>,
    pub jobs: usize,
}

/// Get system status
pub async fn cmd_status(engine: &Engine) -> Result<StatusInfo> {
    let config = engine.config();

    let relations = engine
        .registry()
        .relations()
        .await?
        .into_iter()
        .map(|(name, kind)| RelationInfo {
            name,
            kind: kind.as_str().to_string(),
        })
        .collect();

    let mut knowledge_bases = Vec::new();
    for kb in engine.registry().knowledge_bases() {
        let (dimension, chunks) = match kb.store().stats(kb.name()).await {
            Ok(stats) => (stats.dimension, stats.count),
            Err(e) => {
                debug!("Stats for {} unavailable: {}", kb.name(), e);
                (0, 0)
            }
        };
        knowledge_bases.push(KnowledgeBaseInfo {
            name: kb.name().to_string(),
            backend: kb.store().backend_name().to_string(),
            dimension,
            chunks,
            reranking: kb.has_reranker(),
        });
    }

    Ok(StatusInfo {
        config_path: config.paths.config_file.display().to_string(),
        db_path: config.paths.db_file.display().to_string(),
        vector_backend: config.vector_store.backend.clone(),
        embedding_backend: config.embedding.backend.clone(),
        relations,
        knowledge_bases,
        jobs: engine.catalog().list_jobs().await?.len(),
    })
}

/// Print status to console
pub fn print_status(status: &StatusInfo) {
    println!("\n📊 quarry Status\n");
    println!("Configuration: {}", status.config_path);
    println!("Catalog: {}", status.db_path);
    println!("Vector store: {}", status.vector_backend);
    println!("Embeddings: {}", status.embedding_backend);

    println!("\nRelations:");
    if status.relations.is_empty() {
        println!("  (none)");
    }
    for relation in &status.relations {
        println!("  • {} [{}]", relation.name, relation.kind);
    }

    if !status.knowledge_bases.is_empty() {
        println!("\nKnowledge bases:");
        for kb in &status.knowledge_bases {
            println!(
                "  • {}: {} chunks, {} dims on {}{}",
                kb.name,
                kb.chunks,
                kb.dimension,
                kb.backend,
                if kb.reranking { ", reranked" } else { "" }
            );
        }
    }

    println!("\nJobs: {}", status.jobs);
}
