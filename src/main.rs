// 使用库 crate
use rag_query_service::api::{start_server, EngineState};
use rag_query_service::config::Settings;
use rag_query_service::document::write_sample_document;
use rag_query_service::engine::RagEngine;
use rag_query_service::logging;

use anyhow::{Context, Result};
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    logging::init();

    info!("RAG query service starting");

    // 缺少必需配置时直接退出
    let settings = Settings::from_env().context("invalid configuration")?;

    write_sample_document(&settings.data_dir)?;

    let engine = match RagEngine::from_settings(&settings) {
        Ok(engine) => match engine.index_directory(&settings.data_dir).await {
            Ok(count) => {
                info!(nodes = count, store = engine.store_name(), "engine ready");
                EngineState::Ready(engine)
            }
            Err(e) => {
                error!(error = ?e, "failed to build index");
                EngineState::Unavailable(format!("failed to build index: {:#}", e))
            }
        },
        Err(e) => {
            error!(error = ?e, "failed to initialise RAG engine");
            EngineState::Unavailable(format!("{:#}", e))
        }
    };

    start_server(engine, settings.port).await?;

    Ok(())
}
