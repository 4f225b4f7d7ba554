use anyhow::Result;
use tracing::debug;

use crate::document::ScoredNode;
use crate::llm::{AzureChat, ChatMessage};

/// 没有检索到任何节点时的回答
pub const EMPTY_RESPONSE: &str = "Empty Response";

const SYSTEM_PROMPT: &str = "You are a question answering assistant. \
Answer using only the provided context information. \
If the context does not contain the answer, say that you do not know.";

/// 丢弃相似度低于阈值的节点
pub fn similarity_cutoff(nodes: Vec<ScoredNode>, cutoff: f32) -> Vec<ScoredNode> {
    nodes.into_iter().filter(|n| n.score >= cutoff).collect()
}

/// 将节点文本合并为尽可能少的上下文块，每块不超过 `context_window` 字节
///
/// 单个超长节点独占一块。
pub fn pack_context(nodes: &[ScoredNode], context_window: usize) -> Vec<String> {
    const SEPARATOR: &str = "\n\n";

    let mut blocks = Vec::new();
    let mut current = String::new();

    for n in nodes {
        let text = n.node.text.trim();
        if text.is_empty() {
            continue;
        }

        if !current.is_empty() && current.len() + SEPARATOR.len() + text.len() > context_window {
            blocks.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push_str(SEPARATOR);
        }
        current.push_str(text);
    }
    if !current.is_empty() {
        blocks.push(current);
    }

    blocks
}

/// 问答提示词
pub fn qa_prompt(context: &str, query: &str) -> String {
    format!(
        "Context information is below.\n\
         ---------------------\n\
         {context}\n\
         ---------------------\n\
         Given the context information and not prior knowledge, answer the query.\n\
         Query: {query}\n\
         Answer: "
    )
}

/// 在已有回答基础上结合新上下文改进回答
pub fn refine_prompt(query: &str, existing_answer: &str, context: &str) -> String {
    format!(
        "The original query is as follows: {query}\n\
         We have provided an existing answer: {existing_answer}\n\
         We have the opportunity to refine the existing answer (only if needed) with some more context below.\n\
         ------------\n\
         {context}\n\
         ------------\n\
         Given the new context, refine the original answer to better answer the query. \
         If the context isn't useful, return the original answer.\n\
         Refined Answer: "
    )
}

/// 回答合成器 (compact + refine)
pub struct Synthesizer {
    pub context_window: usize,
    pub streaming: bool,
}

impl Synthesizer {
    /// 根据检索到的节点生成回答
    ///
    /// 第一个上下文块使用问答提示词，其余块依次改进已有回答。
    pub async fn synthesize(
        &self,
        llm: &AzureChat,
        query: &str,
        nodes: &[ScoredNode],
    ) -> Result<String> {
        let blocks = pack_context(nodes, self.context_window);
        if blocks.is_empty() {
            return Ok(EMPTY_RESPONSE.to_string());
        }

        let mut answer: Option<String> = None;
        for (i, block) in blocks.iter().enumerate() {
            let prompt = match &answer {
                None => qa_prompt(block, query),
                Some(existing) => refine_prompt(query, existing, block),
            };
            debug!(block = i, prompt_len = prompt.len(), "calling llm");

            let messages = [ChatMessage::system(SYSTEM_PROMPT), ChatMessage::user(prompt)];
            let text = if self.streaming {
                llm.stream_complete(&messages).await?
            } else {
                llm.complete(&messages).await?
            };

            answer = Some(text.trim().to_string());
        }

        Ok(answer.unwrap_or_else(|| EMPTY_RESPONSE.to_string()))
    }
}
