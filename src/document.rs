use anyhow::{Context, Result};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use uuid::Uuid;
use walkdir::WalkDir;

/// 示例文档文件名
pub const SAMPLE_FILE_NAME: &str = "sample.txt";

/// 启动时写入的示例文档内容
pub const SAMPLE_TEXT: &str = "\
The RAG query service answers questions about the documents stored in its data directory.

At startup the service writes this sample document, splits every document into text nodes, \
embeds the nodes with an Azure OpenAI embedding deployment and stores them in a Qdrant collection.

When a question arrives on the query endpoint, the service embeds the question, retrieves the \
most similar nodes, drops nodes below the similarity cutoff and asks the Azure OpenAI chat \
deployment to answer using only the retrieved context.
";

/// 支持加载的文件扩展名
const SUPPORTED_EXTENSIONS: [&str; 3] = ["txt", "md", "markdown"];

/// 从磁盘加载的文档
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Document {
    /// 文档 ID (由相对路径派生，重复加载保持不变)
    pub id: String,
    /// 相对于数据目录的文件名
    pub file_name: String,
    /// 文档全文
    pub text: String,
}

impl Document {
    pub fn new(file_name: &str, text: &str) -> Self {
        Self {
            id: Uuid::new_v5(&Uuid::NAMESPACE_URL, file_name.as_bytes()).to_string(),
            file_name: file_name.to_string(),
            text: text.to_string(),
        }
    }
}

/// 文档切片 (向量索引中的节点)
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TextNode {
    pub id: String,
    pub doc_id: String,
    pub file_name: String,
    pub text: String,
    /// 在原文中的起始字节位置
    pub start: usize,
    /// 在原文中的结束字节位置
    pub end: usize,
}

/// 检索命中的节点
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ScoredNode {
    pub node: TextNode,
    /// 相似度分数 (越高越相似)
    pub score: f32,
}

/// 在 `dir` 下写入示例文档，返回文件路径
///
/// 目录不存在时自动创建，已有的同名文件会被覆盖。
pub fn write_sample_document(dir: &Path) -> Result<PathBuf> {
    fs::create_dir_all(dir)
        .with_context(|| format!("failed to create data directory {}", dir.display()))?;

    let path = dir.join(SAMPLE_FILE_NAME);
    fs::write(&path, SAMPLE_TEXT)
        .with_context(|| format!("failed to write sample document {}", path.display()))?;

    info!(path = %path.display(), "sample document written");
    Ok(path)
}

/// 递归加载目录下的文本文件
///
/// 跳过隐藏文件、不支持的扩展名和空文件；按路径排序返回。
pub fn load_documents(dir: &Path) -> Result<Vec<Document>> {
    if !dir.is_dir() {
        anyhow::bail!("data directory {} does not exist", dir.display());
    }

    let mut paths = Vec::new();
    for entry in WalkDir::new(dir)
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !is_hidden(e.file_name().to_str()))
    {
        let entry = entry.with_context(|| format!("failed to walk {}", dir.display()))?;
        if entry.file_type().is_file() && is_supported(entry.path()) {
            paths.push(entry.into_path());
        }
    }
    paths.sort();

    let mut documents = Vec::with_capacity(paths.len());
    for path in paths {
        let text = fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;

        if text.trim().is_empty() {
            debug!(path = %path.display(), "skipping empty document");
            continue;
        }

        let file_name = path
            .strip_prefix(dir)
            .unwrap_or(&path)
            .to_string_lossy()
            .replace('\\', "/");

        documents.push(Document::new(&file_name, &text));
    }

    info!(count = documents.len(), dir = %dir.display(), "documents loaded");
    Ok(documents)
}

fn is_hidden(name: Option<&str>) -> bool {
    name.map_or(false, |n| n.starts_with('.'))
}

fn is_supported(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map_or(false, |ext| {
            SUPPORTED_EXTENSIONS
                .iter()
                .any(|s| s.eq_ignore_ascii_case(ext))
        })
}
