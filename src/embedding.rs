use anyhow::{Context, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::config::AzureDeployment;

/// 单次请求最多携带的输入条数
const MAX_BATCH: usize = 16;

/// Azure OpenAI Embedding 客户端
pub struct AzureEmbedding {
    client: Client,
    url: String,
    api_key: String,
    model: String,
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    input: &'a [&'a str],
    model: &'a str,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    index: usize,
    embedding: Vec<f32>,
}

impl AzureEmbedding {
    /// 根据部署配置创建客户端
    pub fn new(deployment: &AzureDeployment) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .context("failed to build embedding http client")?;

        let url = format!(
            "{}/openai/deployments/{}/embeddings?api-version={}",
            deployment.endpoint.trim_end_matches('/'),
            deployment.deployment_name,
            deployment.api_version
        );

        Ok(Self {
            client,
            url,
            api_key: deployment.api_key.clone(),
            model: deployment.model.clone(),
        })
    }

    /// 将文本转换为向量
    pub async fn encode(&self, text: &str) -> Result<Vec<f32>> {
        let mut embeddings = self.request(&[text]).await?;
        embeddings
            .pop()
            .context("embedding response contained no vectors")
    }

    /// 批量编码，每 16 条合并为一次请求
    pub async fn encode_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        let mut embeddings = Vec::with_capacity(texts.len());

        for batch in texts.chunks(MAX_BATCH) {
            embeddings.extend(self.request(batch).await?);
        }

        Ok(embeddings)
    }

    async fn request(&self, inputs: &[&str]) -> Result<Vec<Vec<f32>>> {
        let body = EmbeddingRequest {
            input: inputs,
            model: &self.model,
        };

        let response = self
            .client
            .post(&self.url)
            .header("api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .context("embedding request failed")?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            anyhow::bail!("Azure embedding API error ({}): {}", status, error_text);
        }

        let mut parsed: EmbeddingResponse = response
            .json()
            .await
            .context("invalid embedding response")?;

        if parsed.data.len() != inputs.len() {
            anyhow::bail!(
                "embedding response returned {} vectors for {} inputs",
                parsed.data.len(),
                inputs.len()
            );
        }

        parsed.data.sort_by_key(|d| d.index);
        debug!(count = inputs.len(), "embeddings generated");

        Ok(parsed.data.into_iter().map(|d| d.embedding).collect())
    }
}
