//! 配置模块：从环境变量读取服务配置
//!
//! 所有配置在进程启动时读取一次，之后不再修改。
use std::path::PathBuf;
use std::str::FromStr;

use thiserror::Error;

/// 默认 Qdrant 集合名称
pub const DEFAULT_COLLECTION: &str = "rag_documents";

/// 默认 HTTP 端口 (前端默认请求 localhost:8000)
pub const DEFAULT_PORT: u16 = 8000;

/// 默认数据目录
pub const DEFAULT_DATA_DIR: &str = "data";

/// 配置错误
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("invalid value {value:?} for {var}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Qdrant 连接配置
#[derive(Debug, Clone)]
pub struct QdrantSettings {
    pub uri: String,
    pub api_key: String,
    pub collection: String,
}

/// Azure OpenAI 部署配置 (LLM 和 Embedding 各一份)
#[derive(Debug, Clone)]
pub struct AzureDeployment {
    pub model: String,
    pub deployment_name: String,
    pub api_key: String,
    pub endpoint: String,
    pub api_version: String,
}

/// 向量存储后端
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorStoreKind {
    Qdrant,
    Memory,
}

impl FromStr for VectorStoreKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "qdrant" => Ok(VectorStoreKind::Qdrant),
            "memory" | "in-memory" => Ok(VectorStoreKind::Memory),
            other => Err(format!("unknown vector store '{}'", other)),
        }
    }
}

/// Valves: 可在运行前调整的查询参数
#[derive(Debug, Clone, PartialEq)]
pub struct Valves {
    /// 检索返回的节点数
    pub top_k: usize,
    /// 相似度阈值，低于该分数的节点被丢弃
    pub similarity_cutoff: f32,
    /// 是否以流式方式调用 LLM 并拼接结果
    pub streaming: bool,
    /// 切片最大长度 (字节)
    pub chunk_size: usize,
    /// 相邻切片的重叠长度 (字节)
    pub chunk_overlap: usize,
    /// 单次 LLM 调用可容纳的上下文长度 (字节)
    pub context_window: usize,
}

impl Default for Valves {
    fn default() -> Self {
        Self {
            top_k: 3,
            similarity_cutoff: 0.5,
            streaming: true,
            chunk_size: 1024,
            chunk_overlap: 200,
            context_window: 12_000,
        }
    }
}

/// 完整服务配置
#[derive(Debug, Clone)]
pub struct Settings {
    pub qdrant: QdrantSettings,
    pub llm: AzureDeployment,
    pub embedder: AzureDeployment,
    pub valves: Valves,
    pub vector_store: VectorStoreKind,
    pub data_dir: PathBuf,
    pub port: u16,
}

impl Settings {
    /// 从进程环境变量读取配置
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// 从任意 key-value 来源读取配置
    ///
    /// 空字符串视为未设置。
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let required = |key: &'static str| get(key).ok_or(ConfigError::Missing(key));

        let qdrant = QdrantSettings {
            api_key: required("QDRANT_API_KEY")?,
            uri: required("QDRANT_URI")?,
            collection: get("QDRANT_COLLECTION").unwrap_or_else(|| DEFAULT_COLLECTION.to_string()),
        };

        let llm = AzureDeployment {
            model: required("AZURE_LLM_MODEL")?,
            deployment_name: required("AZURE_LLM_DEPLOYMENT_NAME")?,
            api_key: required("AZURE_LLM_API_KEY")?,
            endpoint: required("AZURE_LLM_ENDPOINT")?,
            api_version: required("AZURE_LLM_API_VERSION")?,
        };

        let embedder = AzureDeployment {
            model: required("AZURE_EMBEDDER_MODEL")?,
            deployment_name: required("AZURE_EMBEDDER_DEPLOYMENT_NAME")?,
            api_key: required("AZURE_EMBEDDER_API_KEY")?,
            endpoint: required("AZURE_EMBEDDER_ENDPOINT")?,
            api_version: required("AZURE_EMBEDDER_API_VERSION")?,
        };

        let defaults = Valves::default();
        let valves = Valves {
            top_k: parse_or("RAG_TOP_K", get("RAG_TOP_K"), defaults.top_k)?,
            similarity_cutoff: parse_or(
                "RAG_SIMILARITY_CUTOFF",
                get("RAG_SIMILARITY_CUTOFF"),
                defaults.similarity_cutoff,
            )?,
            streaming: parse_bool("RAG_STREAMING", get("RAG_STREAMING"), defaults.streaming)?,
            chunk_size: parse_or("RAG_CHUNK_SIZE", get("RAG_CHUNK_SIZE"), defaults.chunk_size)?,
            chunk_overlap: parse_or(
                "RAG_CHUNK_OVERLAP",
                get("RAG_CHUNK_OVERLAP"),
                defaults.chunk_overlap,
            )?,
            context_window: parse_or(
                "RAG_CONTEXT_WINDOW",
                get("RAG_CONTEXT_WINDOW"),
                defaults.context_window,
            )?,
        };
        validate_valves(&valves)?;

        let vector_store = parse_or("VECTOR_STORE", get("VECTOR_STORE"), VectorStoreKind::Qdrant)?;
        let data_dir = get("DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR));
        let port = parse_or("PORT", get("PORT"), DEFAULT_PORT)?;

        Ok(Self {
            qdrant,
            llm,
            embedder,
            valves,
            vector_store,
            data_dir,
            port,
        })
    }
}

fn parse_or<T>(var: &'static str, value: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match value {
        None => Ok(default),
        Some(raw) => raw.parse::<T>().map_err(|e| ConfigError::Invalid {
            var,
            value: raw.clone(),
            reason: e.to_string(),
        }),
    }
}

fn parse_bool(var: &'static str, value: Option<String>, default: bool) -> Result<bool, ConfigError> {
    match value.as_deref().map(str::to_ascii_lowercase).as_deref() {
        None => Ok(default),
        Some("1" | "true" | "yes" | "on") => Ok(true),
        Some("0" | "false" | "no" | "off") => Ok(false),
        Some(_) => Err(ConfigError::Invalid {
            var,
            value: value.unwrap_or_default(),
            reason: "expected a boolean".to_string(),
        }),
    }
}

fn validate_valves(valves: &Valves) -> Result<(), ConfigError> {
    let invalid = |var: &'static str, value: String, reason: &str| ConfigError::Invalid {
        var,
        value,
        reason: reason.to_string(),
    };

    if valves.top_k == 0 {
        return Err(invalid("RAG_TOP_K", "0".into(), "must be at least 1"));
    }
    if !(-1.0..=1.0).contains(&valves.similarity_cutoff) {
        return Err(invalid(
            "RAG_SIMILARITY_CUTOFF",
            valves.similarity_cutoff.to_string(),
            "must be between -1 and 1",
        ));
    }
    if valves.chunk_size == 0 {
        return Err(invalid("RAG_CHUNK_SIZE", "0".into(), "must be at least 1"));
    }
    if valves.chunk_overlap >= valves.chunk_size {
        return Err(invalid(
            "RAG_CHUNK_OVERLAP",
            valves.chunk_overlap.to_string(),
            "must be smaller than RAG_CHUNK_SIZE",
        ));
    }
    if valves.context_window == 0 {
        return Err(invalid("RAG_CONTEXT_WINDOW", "0".into(), "must be at least 1"));
    }
    Ok(())
}
