use anyhow::{Context, Result};
use async_trait::async_trait;
use qdrant_client::qdrant::{
    Condition, CreateCollectionBuilder, DeletePointsBuilder, Distance, Filter, PointStruct,
    SearchPointsBuilder, UpsertPointsBuilder, VectorParamsBuilder,
};
use qdrant_client::Qdrant;
use std::cmp::Ordering;
use std::sync::RwLock;
use tracing::info;

use crate::config::QdrantSettings;
use crate::document::{ScoredNode, TextNode};

/// 待写入的节点及其向量
#[derive(Debug, Clone)]
pub struct EmbeddedNode {
    pub node: TextNode,
    pub embedding: Vec<f32>,
}

/// 向量存储后端
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// 后端名称 (用于日志和健康检查)
    fn name(&self) -> &str;

    /// 确保集合存在，向量维度为 `dim`
    async fn ensure_collection(&self, dim: usize) -> Result<()>;

    /// 删除属于某个文档的全部节点
    async fn delete_document(&self, doc_id: &str) -> Result<()>;

    /// 插入或覆盖节点 (按节点 ID)
    async fn upsert(&self, nodes: Vec<EmbeddedNode>) -> Result<()>;

    /// 返回与查询向量最相似的 `top_k` 个节点，按分数从高到低排序
    async fn search(&self, query: &[f32], top_k: usize) -> Result<Vec<ScoredNode>>;

    /// 已索引的节点数
    async fn count(&self) -> Result<u64>;
}

/// Qdrant 向量存储
pub struct QdrantStore {
    client: Qdrant,
    collection_name: String,
}

impl QdrantStore {
    /// 连接到 Qdrant (使用 API key)
    pub fn new(settings: &QdrantSettings) -> Result<Self> {
        let client = Qdrant::from_url(&settings.uri)
            .api_key(settings.api_key.clone())
            .build()
            .with_context(|| format!("failed to build Qdrant client for {}", settings.uri))?;

        Ok(Self {
            client,
            collection_name: settings.collection.clone(),
        })
    }
}

#[async_trait]
impl VectorStore for QdrantStore {
    fn name(&self) -> &str {
        "qdrant"
    }

    async fn ensure_collection(&self, dim: usize) -> Result<()> {
        if !self.client.collection_exists(&self.collection_name).await? {
            info!(collection = %self.collection_name, dim, "creating collection");

            self.client
                .create_collection(
                    CreateCollectionBuilder::new(&self.collection_name)
                        .vectors_config(VectorParamsBuilder::new(dim as u64, Distance::Cosine)),
                )
                .await?;
        } else {
            info!(collection = %self.collection_name, "collection already exists");
        }
        Ok(())
    }

    async fn delete_document(&self, doc_id: &str) -> Result<()> {
        self.client
            .delete_points(
                DeletePointsBuilder::new(&self.collection_name)
                    .points(Filter::must([Condition::matches(
                        "doc_id",
                        doc_id.to_string(),
                    )]))
                    .wait(true),
            )
            .await?;

        Ok(())
    }

    async fn upsert(&self, nodes: Vec<EmbeddedNode>) -> Result<()> {
        if nodes.is_empty() {
            return Ok(());
        }

        let points: Vec<PointStruct> = nodes
            .into_iter()
            .map(|n| {
                PointStruct::new(
                    n.node.id.clone(),
                    n.embedding,
                    [
                        ("node_id", n.node.id.into()),
                        ("doc_id", n.node.doc_id.into()),
                        ("file_name", n.node.file_name.into()),
                        ("text", n.node.text.into()),
                        ("start", (n.node.start as i64).into()),
                        ("end", (n.node.end as i64).into()),
                    ],
                )
            })
            .collect();

        self.client
            .upsert_points(UpsertPointsBuilder::new(&self.collection_name, points).wait(true))
            .await?;

        Ok(())
    }

    async fn search(&self, query: &[f32], top_k: usize) -> Result<Vec<ScoredNode>> {
        let search_result = self
            .client
            .search_points(
                SearchPointsBuilder::new(&self.collection_name, query.to_vec(), top_k as u64)
                    .with_payload(true),
            )
            .await?;

        let mut results = Vec::with_capacity(search_result.result.len());
        for point in search_result.result {
            let payload = point.payload;

            let string_field = |key: &str| {
                payload
                    .get(key)
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string())
                    .unwrap_or_default()
            };
            let int_field = |key: &str| {
                payload
                    .get(key)
                    .and_then(|v| v.as_integer())
                    .unwrap_or(0)
                    .max(0) as usize
            };

            results.push(ScoredNode {
                node: TextNode {
                    id: string_field("node_id"),
                    doc_id: string_field("doc_id"),
                    file_name: string_field("file_name"),
                    text: string_field("text"),
                    start: int_field("start"),
                    end: int_field("end"),
                },
                score: point.score,
            });
        }

        Ok(results)
    }

    async fn count(&self) -> Result<u64> {
        let collection_info = self.client.collection_info(&self.collection_name).await?;

        Ok(collection_info
            .result
            .and_then(|r| r.points_count)
            .unwrap_or(0))
    }
}

/// 内存向量存储 (暴力余弦相似度)
#[derive(Default)]
pub struct InMemoryStore {
    dim: RwLock<Option<usize>>,
    entries: RwLock<Vec<EmbeddedNode>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn check_dim(&self, len: usize) -> Result<()> {
        let dim = *self
            .dim
            .read()
            .map_err(|_| anyhow::anyhow!("in-memory store lock poisoned"))?;

        match dim {
            Some(d) if d != len => {
                anyhow::bail!("vector dimension mismatch: expected {}, got {}", d, len)
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl VectorStore for InMemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn ensure_collection(&self, dim: usize) -> Result<()> {
        let mut current = self
            .dim
            .write()
            .map_err(|_| anyhow::anyhow!("in-memory store lock poisoned"))?;

        match *current {
            Some(d) if d != dim => {
                anyhow::bail!("collection already has dimension {}, got {}", d, dim)
            }
            _ => {
                *current = Some(dim);
                Ok(())
            }
        }
    }

    async fn delete_document(&self, doc_id: &str) -> Result<()> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| anyhow::anyhow!("in-memory store lock poisoned"))?;

        entries.retain(|e| e.node.doc_id != doc_id);
        Ok(())
    }

    async fn upsert(&self, nodes: Vec<EmbeddedNode>) -> Result<()> {
        for n in &nodes {
            self.check_dim(n.embedding.len())?;
        }

        let mut entries = self
            .entries
            .write()
            .map_err(|_| anyhow::anyhow!("in-memory store lock poisoned"))?;

        for n in nodes {
            match entries.iter_mut().find(|e| e.node.id == n.node.id) {
                Some(existing) => *existing = n,
                None => entries.push(n),
            }
        }

        Ok(())
    }

    async fn search(&self, query: &[f32], top_k: usize) -> Result<Vec<ScoredNode>> {
        self.check_dim(query.len())?;

        let entries = self
            .entries
            .read()
            .map_err(|_| anyhow::anyhow!("in-memory store lock poisoned"))?;

        let mut scored: Vec<ScoredNode> = entries
            .iter()
            .map(|e| ScoredNode {
                node: e.node.clone(),
                score: cosine_similarity(query, &e.embedding),
            })
            .collect();

        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
        scored.truncate(top_k);

        Ok(scored)
    }

    async fn count(&self) -> Result<u64> {
        let entries = self
            .entries
            .read()
            .map_err(|_| anyhow::anyhow!("in-memory store lock poisoned"))?;
        Ok(entries.len() as u64)
    }
}

/// 余弦相似度，零向量返回 0
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    let denom = norm_a * norm_b;
    if denom <= f32::EPSILON {
        return 0.0;
    }
    dot / denom
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str, text: &str) -> TextNode {
        TextNode {
            id: id.to_string(),
            doc_id: "doc".to_string(),
            file_name: "test.txt".to_string(),
            text: text.to_string(),
            start: 0,
            end: text.len(),
        }
    }

    fn embedded(id: &str, text: &str, embedding: Vec<f32>) -> EmbeddedNode {
        EmbeddedNode {
            node: node(id, text),
            embedding,
        }
    }

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }

    #[tokio::test]
    async fn test_in_memory_search_ranks_by_similarity() {
        let store = InMemoryStore::new();
        store.ensure_collection(2).await.unwrap();
        store
            .upsert(vec![
                embedded("a", "east", vec![1.0, 0.0]),
                embedded("b", "north", vec![0.0, 1.0]),
                embedded("c", "north-east", vec![0.7, 0.7]),
            ])
            .await
            .unwrap();

        let results = store.search(&[1.0, 0.1], 2).await.unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].node.text, "east");
        assert_eq!(results[1].node.text, "north-east");
        assert!(results[0].score >= results[1].score);
    }

    #[tokio::test]
    async fn test_in_memory_upsert_replaces_by_id() {
        let store = InMemoryStore::new();
        store.ensure_collection(2).await.unwrap();

        store
            .upsert(vec![embedded("a", "old", vec![1.0, 0.0])])
            .await
            .unwrap();
        store
            .upsert(vec![embedded("a", "new", vec![1.0, 0.0])])
            .await
            .unwrap();

        assert_eq!(store.count().await.unwrap(), 1);
        let results = store.search(&[1.0, 0.0], 5).await.unwrap();
        assert_eq!(results[0].node.text, "new");
    }

    #[tokio::test]
    async fn test_in_memory_delete_document() {
        let store = InMemoryStore::new();
        store.ensure_collection(2).await.unwrap();

        let mut other = embedded("b", "other doc", vec![0.0, 1.0]);
        other.node.doc_id = "other".to_string();
        store
            .upsert(vec![
                embedded("a1", "first", vec![1.0, 0.0]),
                embedded("a2", "second", vec![1.0, 0.1]),
                other,
            ])
            .await
            .unwrap();

        store.delete_document("doc").await.unwrap();

        assert_eq!(store.count().await.unwrap(), 1);
        let results = store.search(&[1.0, 0.0], 5).await.unwrap();
        assert_eq!(results[0].node.doc_id, "other");
    }

    #[tokio::test]
    async fn test_in_memory_dimension_mismatch() {
        let store = InMemoryStore::new();
        store.ensure_collection(3).await.unwrap();

        assert!(store.ensure_collection(4).await.is_err());
        assert!(store
            .upsert(vec![embedded("a", "x", vec![1.0, 0.0])])
            .await
            .is_err());
        assert!(store.search(&[1.0], 1).await.is_err());
    }

    // 需要 Qdrant 服务运行
    #[tokio::test]
    #[ignore]
    async fn test_qdrant_roundtrip() {
        let settings = QdrantSettings {
            uri: std::env::var("QDRANT_URI").unwrap_or_else(|_| "http://localhost:6334".into()),
            api_key: std::env::var("QDRANT_API_KEY").unwrap_or_default(),
            collection: "test_rag_query_service".to_string(),
        };
        let store = QdrantStore::new(&settings).unwrap();

        store.ensure_collection(2).await.unwrap();
        store
            .upsert(vec![embedded(
                "4f2b8c1e-0d7a-4c3e-9b1a-2f6d8e9a0b1c",
                "east",
                vec![1.0, 0.0],
            )])
            .await
            .unwrap();

        let results = store.search(&[1.0, 0.0], 1).await.unwrap();
        assert_eq!(results[0].node.text, "east");
    }
}
