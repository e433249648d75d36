//! courier - demo driver for the forwarding engine.
//!
//! Runs one forwarding task against the in-memory platform, publishes a few
//! messages and prints the dashboard view as JSON.

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use courier_core::domain::{
    ChannelRef, Message, Payload, PipelineConfig, StageConfig, StageKind, TaskId, TaskStatus,
    WatermarkPosition,
};
use courier_core::impls::{InMemoryPlatform, InMemoryTaskStore, LabelTranslator, SqliteTaskStore};
use courier_core::ports::TaskStore;
use courier_core::{Engine, EngineBuilder, EngineConfig};

const SOURCE: &str = "demo-source";
const DEST: &str = "demo-dest";

#[derive(Debug, Parser)]
#[command(name = "courier", version, about = "Forward messages between channels")]
struct Cli {
    /// Engine configuration (TOML). Defaults apply when omitted.
    #[arg(long, env = "COURIER_CONFIG")]
    config: Option<PathBuf>,

    /// SQLite database for task records. In-memory when omitted.
    #[arg(long, env = "COURIER_DB")]
    db: Option<PathBuf>,

    /// Number of demo messages to publish.
    #[arg(long, default_value_t = 5)]
    messages: u32,
}

fn demo_pipeline() -> PipelineConfig {
    PipelineConfig::new(vec![
        StageConfig::Clean {
            remove_usernames: true,
            remove_urls: true,
            remove_hashtags: true,
            remove_links: true,
        },
        StageConfig::Watermark {
            text: "via courier".into(),
            position: WatermarkPosition::default(),
        },
        StageConfig::Translate {
            target_lang: "en".into(),
        },
    ])
}

/// Reuse the demo task from an earlier run, or create it.
async fn demo_task(engine: &Engine) -> Result<TaskId> {
    let existing = engine
        .list_tasks()
        .await
        .into_iter()
        .find(|t| t.source.as_str() == SOURCE && t.status != TaskStatus::Deleted);
    match existing {
        Some(task) if task.status == TaskStatus::Paused => {
            engine.resume_task(task.id).await?;
            Ok(task.id)
        }
        Some(task) => Ok(task.id),
        None => Ok(engine
            .create_task(ChannelRef::new(SOURCE), ChannelRef::new(DEST), demo_pipeline())
            .await?),
    }
}

async fn run(cli: Cli) -> Result<()> {
    // (A) 設定とストア
    let config = match &cli.config {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => EngineConfig::default(),
    };
    let store: Arc<dyn TaskStore> = match &cli.db {
        Some(path) => Arc::new(
            SqliteTaskStore::open(path).with_context(|| format!("opening {}", path.display()))?,
        ),
        None => Arc::new(InMemoryTaskStore::new()),
    };

    // (B) プラットフォームとエンジン
    let platform = Arc::new(InMemoryPlatform::new());
    platform.add_channel(SOURCE);
    platform.add_channel(DEST);
    let engine = EngineBuilder::new()
        .config(config)
        .platform(platform.clone())
        .store(store)
        .register_stage(StageKind::Translate, Arc::new(LabelTranslator))?
        .expect_stages(&[StageKind::Clean, StageKind::Watermark, StageKind::Translate])
        .build()
        .await?;

    // (C) タスクを用意してメッセージを投入
    let id = demo_task(&engine).await?;
    let start = engine.get_task(id).await?.sync_count;
    let run_tag = Utc::now().timestamp_millis();
    for n in 0..cli.messages {
        let text = format!("update #{n} from @newsdesk https://example.com/{n} #breaking");
        platform.publish(
            SOURCE,
            Message::new(format!("{run_tag}-{n}"), Payload::text(text), Utc::now()),
        );
    }
    info!(task_id = %id, published = cli.messages, "demo messages published");

    // (D) 配送完了をポーリングで待つ
    let target = start + u64::from(cli.messages);
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while engine.get_task(id).await?.sync_count < target {
        if tokio::time::Instant::now() >= deadline {
            tracing::warn!(task_id = %id, target, "timed out waiting for deliveries");
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    // (E) ダッシュボード表示
    let status = engine.status().await;
    println!("{}", serde_json::to_string_pretty(&status)?);
    println!("{}", serde_json::to_string_pretty(&engine.snapshot())?);
    for payload in platform.delivered(&ChannelRef::new(DEST)) {
        println!("-> {}", payload.text.replace('\n', " | "));
    }

    engine.shutdown().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    run(Cli::parse()).await
}
