//! 引擎构建器：统一组装协作者、工具、沙箱与存储
//!
//! CLI 与测试共用一条装配路径；未显式注入的部件按配置取默认实现
//! （OpenAI 兼容客户端、docker CLI、无持久化）。

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::AppConfig;
use crate::core::AgentError;
use crate::llm::{create_embedder_from_config, LlmClient, OpenAiClient};
use crate::reasoning::{Coder, Critic, Learner, Planner, QueryExpander, Synthesizer};
use crate::sandbox::{ContainerRuntime, DockerCli, Sandbox};
use crate::store::{
    CheckpointStore, DbPool, KnowledgeStore, MetricsSink, NoopKnowledge, NoopMetrics,
    SqliteCheckpointStore, SqliteKnowledgeStore, SqliteMetrics,
};
use crate::tools::{SearchTools, ShellRunner, ToolDispatcher, Workspace};
use crate::workflow::engine::WorkflowEngine;
use crate::workflow::graph::Bounds;

/// 可单独指定模型的协作者
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collaborator {
    Planner,
    QueryExpander,
    Coder,
    Critic,
    Synthesizer,
    Learner,
}

pub struct EngineBuilder {
    config: AppConfig,
    workspace: PathBuf,
    llm: Option<Arc<dyn LlmClient>>,
    overrides: HashMap<Collaborator, Arc<dyn LlmClient>>,
    runtime: Option<Arc<dyn ContainerRuntime>>,
    pool: Option<DbPool>,
    checkpoints: Option<Arc<dyn CheckpointStore>>,
    knowledge: Option<Arc<dyn KnowledgeStore>>,
    metrics: Option<Arc<dyn MetricsSink>>,
    bounds: Option<Bounds>,
}

impl EngineBuilder {
    pub fn new(config: AppConfig, workspace: PathBuf) -> Self {
        Self {
            config,
            workspace,
            llm: None,
            overrides: HashMap::new(),
            runtime: None,
            pool: None,
            checkpoints: None,
            knowledge: None,
            metrics: None,
            bounds: None,
        }
    }

    /// 按配置打开数据库，启用检查点、指标，以及有嵌入模型时的知识库
    pub fn from_config(config: AppConfig) -> Result<Self, AgentError> {
        let workspace = match &config.app.workspace_root {
            Some(root) => root.clone(),
            None => std::env::current_dir()
                .map_err(|e| AgentError::ConfigError(format!("current dir: {}", e)))?,
        };
        let pool = DbPool::open(&config.store.database_path, config.store.pool_size)?;
        tracing::info!(
            database = %config.store.database_path.display(),
            workspace = %workspace.display(),
            "persistence ready"
        );
        Ok(Self::new(config, workspace).with_persistence(pool))
    }

    /// 所有协作者共用的模型
    pub fn with_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn with_collaborator_llm(mut self, role: Collaborator, llm: Arc<dyn LlmClient>) -> Self {
        self.overrides.insert(role, llm);
        self
    }

    pub fn with_runtime(mut self, runtime: Arc<dyn ContainerRuntime>) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// 同一个池供检查点、指标、sql_db 工具使用；知识库需要嵌入模型
    pub fn with_persistence(mut self, pool: DbPool) -> Self {
        self.checkpoints = Some(Arc::new(SqliteCheckpointStore::new(pool.clone())));
        self.metrics = Some(Arc::new(SqliteMetrics::new(pool.clone())));
        if self.config.store.knowledge_enabled {
            match create_embedder_from_config(&self.config.llm) {
                Some(embedder) => {
                    self.knowledge = Some(Arc::new(SqliteKnowledgeStore::new(pool.clone(), embedder)))
                }
                None => tracing::warn!("no embedding model configured, knowledge store disabled"),
            }
        }
        self.pool = Some(pool);
        self
    }

    /// sql_db 工具查询的数据库
    pub fn with_pool(mut self, pool: DbPool) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn with_checkpoints(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = Some(store);
        self
    }

    pub fn with_knowledge(mut self, store: Arc<dyn KnowledgeStore>) -> Self {
        self.knowledge = Some(store);
        self
    }

    pub fn with_metrics(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.metrics = Some(sink);
        self
    }

    pub fn with_bounds(mut self, bounds: Bounds) -> Self {
        self.bounds = Some(bounds);
        self
    }

    pub fn build(self) -> WorkflowEngine {
        let default_llm: Arc<dyn LlmClient> = match self.llm {
            Some(llm) => llm,
            None => Arc::new(OpenAiClient::from_config(&self.config.llm)),
        };
        let llm_for = |role: Collaborator| {
            self.overrides
                .get(&role)
                .cloned()
                .unwrap_or_else(|| default_llm.clone())
        };

        let knowledge: Arc<dyn KnowledgeStore> = self
            .knowledge
            .unwrap_or_else(|| Arc::new(NoopKnowledge));
        let tools_cfg = &self.config.tools;
        let tools = ToolDispatcher::new(
            Workspace::new(&self.workspace).confined(tools_cfg.confine_to_workspace),
            ShellRunner::new(&self.workspace, tools_cfg.command_timeout_secs),
            SearchTools::new(self.pool, knowledge.clone(), tools_cfg.sql_max_chars),
            tools_cfg.list_max_depth,
        );
        let runtime: Arc<dyn ContainerRuntime> = self
            .runtime
            .unwrap_or_else(|| Arc::new(DockerCli::new(self.config.sandbox.docker_bin.clone())));

        WorkflowEngine {
            planner: Planner::new(llm_for(Collaborator::Planner), self.config.workflow.history_window),
            expander: QueryExpander::new(llm_for(Collaborator::QueryExpander)),
            coder: Coder::new(llm_for(Collaborator::Coder)),
            critic: Critic::new(llm_for(Collaborator::Critic)),
            synthesizer: Synthesizer::new(llm_for(Collaborator::Synthesizer)),
            learner: Learner::new(llm_for(Collaborator::Learner)),
            tools,
            sandbox: Sandbox::new(runtime, self.config.sandbox.clone()),
            checkpoints: self.checkpoints,
            knowledge,
            metrics: self.metrics.unwrap_or_else(|| Arc::new(NoopMetrics)),
            bounds: self
                .bounds
                .unwrap_or_else(|| Bounds::from(&self.config.workflow)),
        }
    }
}
