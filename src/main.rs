//! Tinker 命令行入口
//!
//! run：执行一个回合并流式打印节点事件与沙箱日志；resume：从检查点续跑；
//! history：列出检查点；stats：执行成功率；ingest：导入文档到知识库。

use std::future::Future;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use tinker::config::load_config;
use tinker::sandbox::LogKind;
use tinker::store::{DbPool, KnowledgeStore, SqliteKnowledgeStore, SqliteMetrics};
use tinker::workflow::{EngineBuilder, RunOptions, RunOutcome, RunRequest, WorkflowEvent};

#[derive(Parser)]
#[command(name = "tinker", version, about = "Autonomous task-solving agent with a Docker sandbox")]
struct Cli {
    /// 额外的配置文件（覆盖 config/default.toml）
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one turn for a task.
    Run {
        task: String,
        /// Reuse a thread id instead of generating one.
        #[arg(long)]
        thread: Option<String>,
    },
    /// Resume a crashed run from its latest checkpoint.
    Resume {
        #[arg(long)]
        thread: String,
    },
    /// List checkpoints of a thread, newest first.
    History {
        #[arg(long)]
        thread: String,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Print the execution success rate.
    Stats {
        #[arg(long, default_value_t = 100)]
        limit: usize,
    },
    /// Chunk and store documents for search_documents.
    Ingest { files: Vec<PathBuf> },
}

#[tokio::main]
async fn main() -> Result<()> {
    tinker::observability::init();
    let cli = Cli::parse();
    let config = load_config(cli.config).context("Failed to load config")?;

    match cli.command {
        Command::Run { task, thread } => {
            let engine = EngineBuilder::from_config(config)
                .context("Failed to open persistence")?
                .build();
            let mut req = RunRequest::new(task);
            if let Some(id) = thread {
                req = req.with_thread(id);
            }
            println!("thread: {}", req.thread_id);
            let (opts, printer) = streaming_options();
            let outcome = engine.run_with(req, opts).await;
            finish(outcome, printer).await
        }
        Command::Resume { thread } => {
            let engine = EngineBuilder::from_config(config)
                .context("Failed to open persistence")?
                .build();
            let (opts, printer) = streaming_options();
            let outcome = engine
                .resume_with(&thread, opts)
                .await
                .context("Resume failed")?;
            finish(outcome, printer).await
        }
        Command::History { thread, limit } => {
            let engine = EngineBuilder::from_config(config)
                .context("Failed to open persistence")?
                .build();
            let steps = engine.history(&thread, limit).await.context("History failed")?;
            if steps.is_empty() {
                println!("no checkpoints for thread {}", thread);
            }
            for s in steps {
                println!(
                    "{}  step {:>3}  {:<14} -> {:<14} {}",
                    s.ts,
                    s.step,
                    s.node.as_deref().unwrap_or("-"),
                    s.next.as_deref().unwrap_or("-"),
                    s.checkpoint_id
                );
            }
            Ok(())
        }
        Command::Stats { limit } => {
            let pool = DbPool::open(&config.store.database_path, config.store.pool_size)
                .context("Failed to open database")?;
            let rate = SqliteMetrics::new(pool)
                .recovery_rate(limit)
                .await
                .context("Failed to read metrics")?;
            println!("{}", serde_json::to_string_pretty(&rate)?);
            Ok(())
        }
        Command::Ingest { files } => {
            let pool = DbPool::open(&config.store.database_path, config.store.pool_size)
                .context("Failed to open database")?;
            let Some(embedder) = tinker::llm::create_embedder_from_config(&config.llm) else {
                bail!("an embedding API key is required to ingest documents");
            };
            let store = SqliteKnowledgeStore::new(pool, embedder);
            for path in files {
                let content = std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read {}", path.display()))?;
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| path.display().to_string());
                let chunks = store
                    .store_document(&name, &content)
                    .await
                    .with_context(|| format!("Failed to store {}", name))?;
                println!("{}: {} chunks", name, chunks);
            }
            Ok(())
        }
    }
}

/// 第一次中断取消运行（沙箱命令随之放弃，容器删除）；第二次返回 true，由调用方直接退出
async fn watch_interrupts<F, Fut>(cancel: CancellationToken, mut interrupted: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    if !interrupted().await {
        return false;
    }
    cancel.cancel();
    eprintln!("cancelling, press Ctrl-C again to quit immediately");
    interrupted().await
}

/// 事件打印任务 + Ctrl-C 取消
fn streaming_options() -> (RunOptions, tokio::task::JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();
    let on_ctrl_c = cancel.clone();
    tokio::spawn(async move {
        let ctrl_c = || async { tokio::signal::ctrl_c().await.is_ok() };
        if watch_interrupts(on_ctrl_c, ctrl_c).await {
            std::process::exit(130);
        }
    });
    let printer = tokio::spawn(async move {
        while let Some(ev) = rx.recv().await {
            match ev {
                WorkflowEvent::NodeStarted { node, .. } => println!("[{}]", node),
                WorkflowEvent::Log { entry } => match entry.kind {
                    LogKind::Error | LogKind::Stderr => eprintln!("  {}", entry.content),
                    _ => println!("  {}", entry.content),
                },
                WorkflowEvent::ToolResult { tool, preview } => println!("  {} -> {}", tool, preview),
                WorkflowEvent::Failed { error } => eprintln!("failed: {}", error),
                WorkflowEvent::NodeFinished { .. } | WorkflowEvent::Done { .. } => {}
            }
        }
    });
    (RunOptions::default().with_events(tx).with_cancel(cancel), printer)
}

async fn finish(outcome: RunOutcome, printer: tokio::task::JoinHandle<()>) -> Result<()> {
    // 发送端随 RunOptions 一起被丢弃后打印任务自然结束
    let _ = printer.await;
    println!("\n{}", outcome.response());
    for (name, path) in &outcome.state.retrieved_files {
        println!("artifact: {} -> {}", name, path.display());
    }
    if let (false, Some(e)) = (outcome.is_completed(), outcome.error.as_deref()) {
        bail!("run {:?}: {}", outcome.status, e);
    }
    Ok(())
}
