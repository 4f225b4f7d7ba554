use anyhow::{Context, Result};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::{Settings, Valves, VectorStoreKind};
use crate::document::{load_documents, Document, ScoredNode};
use crate::embedding::AzureEmbedding;
use crate::llm::AzureChat;
use crate::splitter::split_document;
use crate::store::{EmbeddedNode, InMemoryStore, QdrantStore, VectorStore};
use crate::synthesizer::{similarity_cutoff, Synthesizer};

/// 查询结果
#[derive(Debug, Clone, Serialize)]
pub struct QueryAnswer {
    pub response: String,
    pub sources: Vec<ScoredNode>,
}

/// RAG 引擎 - 整合 splitting + embedding + vector store + llm
pub struct RagEngine {
    embedder: AzureEmbedding,
    llm: AzureChat,
    store: Arc<dyn VectorStore>,
    valves: Valves,
}

impl RagEngine {
    pub fn new(
        embedder: AzureEmbedding,
        llm: AzureChat,
        store: Arc<dyn VectorStore>,
        valves: Valves,
    ) -> Self {
        Self {
            embedder,
            llm,
            store,
            valves,
        }
    }

    /// 根据配置创建 LLM、Embedding 和向量存储客户端
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let llm = AzureChat::new(&settings.llm).context("failed to create Azure LLM client")?;
        let embedder = AzureEmbedding::new(&settings.embedder)
            .context("failed to create Azure embedding client")?;

        let store: Arc<dyn VectorStore> = match settings.vector_store {
            VectorStoreKind::Qdrant => Arc::new(
                QdrantStore::new(&settings.qdrant).context("failed to create Qdrant vector store")?,
            ),
            VectorStoreKind::Memory => Arc::new(InMemoryStore::new()),
        };

        Ok(Self::new(embedder, llm, store, settings.valves.clone()))
    }

    pub fn store_name(&self) -> &str {
        self.store.name()
    }

    /// 索引文档
    ///
    /// # 返回
    /// 写入的节点数量
    pub async fn index_documents(&self, documents: &[Document]) -> Result<usize> {
        // 1. 切分文档
        let nodes: Vec<_> = documents
            .iter()
            .flat_map(|doc| split_document(doc, self.valves.chunk_size, self.valves.chunk_overlap))
            .collect();

        if nodes.is_empty() {
            warn!("no text nodes to index");
            return Ok(0);
        }

        // 2. 批量生成 embeddings
        let texts: Vec<&str> = nodes.iter().map(|n| n.text.as_str()).collect();
        let embeddings = self.embedder.encode_batch(&texts).await?;

        let dim = embeddings
            .first()
            .map(|e| e.len())
            .filter(|&d| d > 0)
            .context("embedding model returned an empty vector")?;

        // 3. 确保集合存在，并清除这些文档之前的节点
        self.store.ensure_collection(dim).await?;
        for doc in documents {
            self.store.delete_document(&doc.id).await?;
        }

        // 4. 批量写入
        let embedded: Vec<EmbeddedNode> = nodes
            .into_iter()
            .zip(embeddings)
            .map(|(node, embedding)| EmbeddedNode { node, embedding })
            .collect();
        let count = embedded.len();
        self.store.upsert(embedded).await?;

        info!(
            documents = documents.len(),
            nodes = count,
            store = self.store.name(),
            "index built"
        );
        Ok(count)
    }

    /// 加载目录下的文档并建立索引
    pub async fn index_directory(&self, dir: &Path) -> Result<usize> {
        let documents = load_documents(dir)?;
        self.index_documents(&documents).await
    }

    /// 检索与查询最相关的节点 (已应用相似度阈值)
    pub async fn retrieve(&self, query: &str) -> Result<Vec<ScoredNode>> {
        let query_vector = self.embedder.encode(query).await?;
        let hits = self.store.search(&query_vector, self.valves.top_k).await?;
        let total = hits.len();

        let kept = similarity_cutoff(hits, self.valves.similarity_cutoff);
        if kept.len() < total {
            info!(
                dropped = total - kept.len(),
                cutoff = self.valves.similarity_cutoff,
                "nodes below similarity cutoff dropped"
            );
        }

        Ok(kept)
    }

    /// 回答查询
    pub async fn query(&self, query: &str) -> Result<QueryAnswer> {
        let sources = self.retrieve(query).await?;

        let synthesizer = Synthesizer {
            context_window: self.valves.context_window,
            streaming: self.valves.streaming,
        };
        let response = synthesizer.synthesize(&self.llm, query, &sources).await?;

        Ok(QueryAnswer { response, sources })
    }

    /// 已索引的节点数
    pub async fn indexed_count(&self) -> Result<u64> {
        self.store.count().await
    }
}
