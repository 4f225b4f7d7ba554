use regex::Regex;
use std::sync::OnceLock;
use uuid::Uuid;

use crate::document::{Document, TextNode};

/// 句末标点 (含中文标点) 及其后的空白
fn sentence_end() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"[.!?。！？]+["'”’)\]]*\s+|[。！？]+"#).expect("valid sentence regex")
    })
}

/// 将文档切分为节点
///
/// # 策略
/// 1. 优先按段落 (空行) 切分
/// 2. 超长段落按句子切分
/// 3. 超长句子按字符边界强制切分
/// 4. 贪心合并相邻片段，直到达到 `chunk_size`
/// 5. 相邻节点共享不超过 `chunk_overlap` 字节的尾部片段
///
/// # 参数
/// - `doc`: 待切分文档
/// - `chunk_size`: 节点最大字节数
/// - `chunk_overlap`: 相邻节点的最大重叠字节数 (需小于 `chunk_size`)
pub fn split_document(doc: &Document, chunk_size: usize, chunk_overlap: usize) -> Vec<TextNode> {
    let text = doc.text.as_str();
    if text.trim().is_empty() || chunk_size == 0 {
        return Vec::new();
    }

    let segments = segment(text, chunk_size);
    let overlap = chunk_overlap.min(chunk_size.saturating_sub(1));

    let mut nodes = Vec::new();
    let mut first = 0;
    while first < segments.len() {
        let start = segments[first].0;

        // 贪心扩展
        let mut last = first;
        while last + 1 < segments.len() && segments[last + 1].1 - start <= chunk_size {
            last += 1;
        }
        let end = segments[last].1;

        if let Some((s, e)) = trimmed_range(text, start, end) {
            let ordinal = nodes.len();
            nodes.push(TextNode {
                id: node_id(&doc.id, ordinal),
                doc_id: doc.id.clone(),
                file_name: doc.file_name.clone(),
                text: text[s..e].to_string(),
                start: s,
                end: e,
            });
        }

        let next = last + 1;
        if next >= segments.len() {
            break;
        }

        // 回退到仍在 overlap 范围内的最早片段，同时保证能容纳下一个片段
        let mut restart = next;
        while restart > first + 1 && end - segments[restart - 1].0 <= overlap {
            restart -= 1;
        }
        while restart < next && segments[next].1 - segments[restart].0 > chunk_size {
            restart += 1;
        }
        first = restart;
    }

    nodes
}

/// 节点 ID：由文档 ID 和序号派生，重复索引同一文档会覆盖而不是新增
fn node_id(doc_id: &str, ordinal: usize) -> String {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, format!("{}:{}", doc_id, ordinal).as_bytes()).to_string()
}

/// 去掉首尾空白后的字节范围，全空白时返回 None
fn trimmed_range(text: &str, start: usize, end: usize) -> Option<(usize, usize)> {
    let slice = &text[start..end];
    let trimmed_start = slice.len() - slice.trim_start().len();
    let trimmed_end = slice.trim_end().len();
    if trimmed_end <= trimmed_start {
        None
    } else {
        Some((start + trimmed_start, start + trimmed_end))
    }
}

/// 将全文切成连续、不重叠、且各自不超过 `max_len` 的片段 (字节范围)
fn segment(text: &str, max_len: usize) -> Vec<(usize, usize)> {
    let mut segments = Vec::new();

    for (p_start, p_end) in split_keep(text, 0, text.len(), |s| {
        s.match_indices("\n\n").map(|(i, m)| i + m.len()).collect()
    }) {
        if p_end - p_start <= max_len {
            segments.push((p_start, p_end));
            continue;
        }

        for (s_start, s_end) in split_keep(text, p_start, p_end, |s| {
            sentence_end().find_iter(s).map(|m| m.end()).collect()
        }) {
            if s_end - s_start <= max_len {
                segments.push((s_start, s_end));
            } else {
                segments.extend(hard_split(text, s_start, s_end, max_len));
            }
        }
    }

    segments
}

/// 在 `cuts` 返回的位置切分 `text[start..end]`，分隔符保留在前一段末尾
fn split_keep<F>(text: &str, start: usize, end: usize, cuts: F) -> Vec<(usize, usize)>
where
    F: Fn(&str) -> Vec<usize>,
{
    let mut pieces = Vec::new();
    let mut prev = start;

    for cut in cuts(&text[start..end]) {
        let pos = start + cut;
        if pos > prev && pos < end {
            pieces.push((prev, pos));
            prev = pos;
        }
    }
    if prev < end {
        pieces.push((prev, end));
    }

    pieces
}

/// 按字符边界强制切分，避免 UTF-8 边界错误
fn hard_split(text: &str, start: usize, end: usize, max_len: usize) -> Vec<(usize, usize)> {
    let mut pieces = Vec::new();
    let mut piece_start = start;
    let mut piece_end = start;

    for (offset, ch) in text[start..end].char_indices() {
        let char_end = start + offset + ch.len_utf8();
        if char_end - piece_start > max_len && piece_end > piece_start {
            pieces.push((piece_start, piece_end));
            piece_start = piece_end;
        }
        piece_end = char_end;
    }
    if piece_end > piece_start {
        pieces.push((piece_start, piece_end));
    }

    pieces
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(text: &str) -> Document {
        Document::new("test.txt", text)
    }

    #[test]
    fn test_short_text_single_node() {
        let nodes = split_document(&doc("  Hello world.  \n"), 1024, 200);

        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].text, "Hello world.");
        assert_eq!(nodes[0].start, 2);
        assert_eq!(nodes[0].end, 14);
        assert_eq!(nodes[0].file_name, "test.txt");
    }

    #[test]
    fn test_whitespace_only_yields_nothing() {
        assert!(split_document(&doc(""), 100, 10).is_empty());
        assert!(split_document(&doc(" \n\n \t"), 100, 10).is_empty());
    }

    #[test]
    fn test_nodes_respect_chunk_size() {
        let paragraph = "Rust is a systems language. It is memory safe. It has zero cost abstractions. ";
        let text = format!("{}\n\n{}\n\n{}", paragraph.repeat(4), paragraph.repeat(3), paragraph);

        let nodes = split_document(&doc(&text), 120, 30);

        assert!(nodes.len() > 3, "长文本应该被切成多个节点");
        for node in &nodes {
            assert!(node.text.len() <= 120, "节点长度 {} 超过上限", node.text.len());
            assert_eq!(&text[node.start..node.end], node.text);
        }
    }

    #[test]
    fn test_consecutive_nodes_overlap() {
        let text = "One short sentence. ".repeat(20);

        let nodes = split_document(&doc(&text), 100, 40);

        assert!(nodes.len() > 1);
        for pair in nodes.windows(2) {
            assert!(pair[1].start < pair[0].end, "相邻节点应该有重叠");
            assert!(pair[0].end - pair[1].start <= 40, "重叠不应超过 chunk_overlap");
            assert!(pair[1].end > pair[0].end, "每个节点都应推进");
        }
        assert_eq!(nodes.last().unwrap().end, text.trim_end().len());
    }

    #[test]
    fn test_zero_overlap_covers_text_once() {
        let text = "Alpha beta gamma. Delta epsilon. Zeta eta theta iota. Kappa lambda.";

        let nodes = split_document(&doc(text), 30, 0);

        for pair in nodes.windows(2) {
            assert!(pair[1].start >= pair[0].end);
        }
        let joined: String = nodes.iter().map(|n| n.text.as_str()).collect::<Vec<_>>().join(" ");
        assert_eq!(joined, text);
    }

    #[test]
    fn test_hard_split_keeps_utf8_boundaries() {
        let text = "这是一个没有任何标点的很长的句子".repeat(10);

        let nodes = split_document(&doc(&text), 50, 0);

        assert!(nodes.len() > 1);
        for node in &nodes {
            assert!(node.text.len() <= 50);
        }
        let rebuilt: String = nodes.iter().map(|n| n.text.as_str()).collect();
        assert_eq!(rebuilt, text);
    }

    #[test]
    fn test_node_ids_are_deterministic() {
        let text = "First paragraph.\n\nSecond paragraph.";
        let a = split_document(&doc(text), 20, 0);
        let b = split_document(&doc(text), 20, 0);

        assert_eq!(a.len(), 2);
        assert_eq!(a[0].id, b[0].id);
        assert_ne!(a[0].id, a[1].id);
    }
}
