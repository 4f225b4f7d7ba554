use anyhow::{Context, Result};
use futures_util::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::AzureDeployment;

/// 对话消息
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ChatMessage {
    pub role: &'static str,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system",
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user",
            content: content.into(),
        }
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    messages: &'a [ChatMessage],
    model: &'a str,
    temperature: f32,
    stream: bool,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Deserialize, Default)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

/// Azure OpenAI Chat Completions 客户端
pub struct AzureChat {
    client: Client,
    url: String,
    api_key: String,
    model: String,
}

impl AzureChat {
    /// 根据部署配置创建客户端
    pub fn new(deployment: &AzureDeployment) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .context("failed to build chat http client")?;

        let url = format!(
            "{}/openai/deployments/{}/chat/completions?api-version={}",
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

    /// 同步生成完整回答
    pub async fn complete(&self, messages: &[ChatMessage]) -> Result<String> {
        let response = self.send(messages, false).await?;

        let parsed: ChatResponse = response.json().await.context("invalid chat response")?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .context("chat response contained no content")
    }

    /// 流式生成，并将所有 token 拼接为完整回答
    pub async fn stream_complete(&self, messages: &[ChatMessage]) -> Result<String> {
        let response = self.send(messages, true).await?;

        let mut stream = response.bytes_stream();
        let mut decoder = SseDecoder::default();
        let mut answer = String::new();
        let mut done = false;

        'outer: while let Some(chunk) = stream.next().await {
            let chunk = chunk.context("chat stream interrupted")?;

            for data in decoder.push(&chunk) {
                if apply_event(&data, &mut answer)? {
                    done = true;
                    break 'outer;
                }
            }
        }

        // 连接关闭时缓冲区中可能还有不带换行的最后一行
        if !done {
            if let Some(data) = decoder.finish() {
                done = apply_event(&data, &mut answer)?;
            }
        }
        if !done {
            anyhow::bail!("chat stream ended before [DONE]");
        }

        debug!(len = answer.len(), "chat stream finished");
        Ok(answer)
    }

    async fn send(&self, messages: &[ChatMessage], stream: bool) -> Result<reqwest::Response> {
        let body = ChatRequest {
            messages,
            model: &self.model,
            temperature: 0.1,
            stream,
        };

        let response = self
            .client
            .post(&self.url)
            .header("api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .context("chat request failed")?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            anyhow::bail!("Azure chat API error ({}): {}", status, error_text);
        }

        Ok(response)
    }
}

/// 处理一个流式事件，返回是否已收到 `[DONE]`
fn apply_event(data: &str, answer: &mut String) -> Result<bool> {
    if data == "[DONE]" {
        return Ok(true);
    }

    match serde_json::from_str::<StreamChunk>(data) {
        Ok(event) => {
            if let Some(err) = event.error {
                anyhow::bail!("Azure chat stream error: {}", err);
            }
            // Azure 的首个事件 (prompt filter 结果) choices 为空
            for choice in event.choices {
                if let Some(token) = choice.delta.content {
                    answer.push_str(&token);
                }
            }
        }
        Err(e) => warn!(error = %e, "skipping malformed stream event"),
    }

    Ok(false)
}

/// Server-Sent Events 增量解码器
///
/// 按网络分片喂入字节，返回已完整到达的 `data:` 字段。
#[derive(Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);

        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            events.extend(data_field(&line));
        }

        events
    }

    /// 流结束时取出缓冲区中剩余的最后一行
    pub fn finish(&mut self) -> Option<String> {
        let line = std::mem::take(&mut self.buffer);
        data_field(&line)
    }
}

fn data_field(line: &[u8]) -> Option<String> {
    let line = String::from_utf8_lossy(line);
    let line = line.trim_end_matches(['\n', '\r']);
    line.strip_prefix("data:")
        .map(|data| data.trim_start().to_string())
}
