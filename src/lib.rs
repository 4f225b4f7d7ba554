// 导出模块供测试和外部使用
pub mod api;
pub mod config;
pub mod document;
pub mod embedding;
pub mod engine;
pub mod llm;
pub mod logging;
pub mod splitter;
pub mod store;
pub mod synthesizer;
