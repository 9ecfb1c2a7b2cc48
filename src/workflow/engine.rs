//! 工作流引擎：按路由表逐节点推进，每步合并状态并落检查点
//!
//! 每一步先把节点写入作为挂起写入记在当前检查点下，合并后再追加新检查点，
//! 所以进程在两者之间崩溃时，`resume` 能回放挂起写入而不必重跑该节点。
//! 检查点 / 知识库 / 指标的失败只记 warn，不中断运行。

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::core::AgentError;
use crate::reasoning::{
    Coder, Critic, Learner, NextAction, Planner, QueryExpander, SynthesisInput, Synthesizer,
    ThinkInput,
};
use crate::sandbox::{LogCallback, LogEntry, LogKind, Sandbox};
use crate::store::metrics::spawn_record;
use crate::store::{
    format_rag_context, truncate_chars, Checkpoint, CheckpointConfig,
    CheckpointMetadata, CheckpointStore, ExecutionMetrics, KnowledgeStore, LessonRecord,
    MetricsSink, SolutionRecord, StoreError,
};
use crate::tools::{ToolDispatcher, ToolName};
use crate::workflow::events::{send_event, EventSender, WorkflowEvent};
use crate::workflow::graph::{next_node, Bounds};
use crate::workflow::state::{Field, RunState, StatePatch};
use crate::workflow::types::{Node, RunOutcome, RunRequest, RunStatus, StepRecord};

/// 工具调用次数用尽且没有草稿回复时的兜底
pub const TOOL_LIMIT_MESSAGE: &str = "I cannot process further tool requests due to loop limits.";
/// 检索失败时写入 rag_context 的占位
pub const RETRIEVAL_ERROR_CONTEXT: &str = "Error retrieving context.";

const RECENT_MEMORIES: usize = 5;
const PER_QUERY_K: usize = 2;
const MAX_SOLUTIONS: usize = 3;
const MAX_LESSONS: usize = 3;
const TOOL_PREVIEW_CHARS: usize = 200;

/// 调用方可选的事件通道与取消令牌
#[derive(Default)]
pub struct RunOptions {
    pub events: Option<EventSender>,
    pub cancel: Option<CancellationToken>,
}

impl RunOptions {
    pub fn with_events(mut self, tx: EventSender) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// 单次运行的上下文：线程、指向最新检查点的配置、事件与取消
struct RunCtx {
    thread_id: String,
    config: CheckpointConfig,
    /// 最近一次 put 成功；失败后 config 落后于状态，不再往旧检查点追加写入
    synced: bool,
    events: Option<EventSender>,
    cancel: CancellationToken,
}

impl RunCtx {
    fn emit(&self, ev: WorkflowEvent) {
        send_event(self.events.as_ref(), ev);
    }
}

pub struct WorkflowEngine {
    pub(crate) planner: Planner,
    pub(crate) expander: QueryExpander,
    pub(crate) coder: Coder,
    pub(crate) critic: Critic,
    pub(crate) synthesizer: Synthesizer,
    pub(crate) learner: Learner,
    pub(crate) tools: ToolDispatcher,
    pub(crate) sandbox: Sandbox,
    pub(crate) checkpoints: Option<Arc<dyn CheckpointStore>>,
    pub(crate) knowledge: Arc<dyn KnowledgeStore>,
    pub(crate) metrics: Arc<dyn MetricsSink>,
    pub(crate) bounds: Bounds,
}

impl WorkflowEngine {
    pub fn bounds(&self) -> Bounds {
        self.bounds
    }

    pub async fn run(&self, req: RunRequest) -> RunOutcome {
        self.run_with(req, RunOptions::default()).await
    }

    /// 从 think 开始一次新回合；线程已有检查点时接在其后，步数延续
    pub async fn run_with(&self, req: RunRequest, opts: RunOptions) -> RunOutcome {
        info!(thread_id = %req.thread_id, task = %truncate_chars(&req.task, 80), "run started");
        let state = RunState::new(req.task, req.history, req.memory);
        let (config, step) = self.thread_head(&req.thread_id).await;
        let mut ctx = RunCtx {
            config,
            synced: false,
            thread_id: req.thread_id,
            events: opts.events,
            cancel: opts.cancel.unwrap_or_default(),
        };
        let meta = CheckpointMetadata {
            source: "input".into(),
            step,
            node: None,
            next: Some(Node::Think.to_string()),
        };
        self.save_checkpoint(&mut ctx, &state, meta).await;
        self.drive(ctx, state, Node::Think, step).await
    }

    /// 线程最新检查点的配置与下一步数；没有检查点（或读取失败）时从根开始，步数 -1
    async fn thread_head(&self, thread_id: &str) -> (CheckpointConfig, i64) {
        let root = CheckpointConfig::thread(thread_id);
        let Some(store) = &self.checkpoints else {
            return (root, -1);
        };
        match store.get_tuple(&root).await {
            Ok(Some(latest)) => (latest.config, latest.metadata.step + 1),
            Ok(None) => (root, -1),
            Err(e) => {
                warn!(thread_id, error = %e, "latest checkpoint unreadable, starting a new chain");
                (root, -1)
            }
        }
    }

    pub async fn resume(&self, thread_id: &str) -> Result<RunOutcome, AgentError> {
        self.resume_with(thread_id, RunOptions::default()).await
    }

    /// 从最新检查点继续；先回放挂起写入，再从下一节点推进
    pub async fn resume_with(
        &self,
        thread_id: &str,
        opts: RunOptions,
    ) -> Result<RunOutcome, AgentError> {
        let store = self
            .checkpoints
            .as_ref()
            .ok_or_else(|| AgentError::NoCheckpoint(thread_id.to_string()))?;
        let tuple = store
            .get_tuple(&CheckpointConfig::thread(thread_id))
            .await?
            .ok_or_else(|| AgentError::NoCheckpoint(thread_id.to_string()))?;

        let mut state: RunState = serde_json::from_value(tuple.checkpoint.state.clone())?;
        let mut node: Node = tuple
            .metadata
            .next
            .as_deref()
            .ok_or_else(|| AgentError::node_failed("resume", "checkpoint has no next node"))?
            .parse()
            .map_err(|e: String| AgentError::node_failed("resume", e))?;
        let mut step = tuple.metadata.step;
        let mut ctx = RunCtx {
            thread_id: thread_id.to_string(),
            config: tuple.config.clone(),
            synced: true,
            events: opts.events,
            cancel: opts.cancel.unwrap_or_default(),
        };
        info!(thread_id, node = %node, step, "resuming run");

        if !tuple.pending_writes.is_empty() && node != Node::Done {
            let writes: Vec<(String, Value)> = tuple
                .pending_writes
                .iter()
                .map(|w| (w.channel.clone(), w.value.clone()))
                .collect();
            state
                .apply_writes(&writes)
                .map_err(|e| AgentError::node_failed(node.as_str(), e.to_string()))?;
            let next = next_node(node, &state, &self.bounds);
            step += 1;
            info!(thread_id, node = %node, replayed = writes.len(), "replayed pending writes");
            let meta = loop_metadata(step, node, next);
            self.save_checkpoint(&mut ctx, &state, meta).await;
            node = next;
        }

        Ok(self.drive(ctx, state, node, step).await)
    }

    /// 线程的检查点概要，新到旧
    pub async fn history(
        &self,
        thread_id: &str,
        limit: usize,
    ) -> Result<Vec<StepRecord>, AgentError> {
        let Some(store) = &self.checkpoints else {
            return Ok(Vec::new());
        };
        let tuples = store
            .list(&CheckpointConfig::thread(thread_id), None, Some(limit))
            .await?;
        Ok(tuples
            .into_iter()
            .map(|t| StepRecord {
                checkpoint_id: t.checkpoint.id,
                ts: t.checkpoint.ts,
                step: t.metadata.step,
                node: t.metadata.node,
                next: t.metadata.next,
            })
            .collect())
    }

    async fn drive(
        &self,
        mut ctx: RunCtx,
        mut state: RunState,
        mut node: Node,
        mut step: i64,
    ) -> RunOutcome {
        let mut steps = 0usize;
        while node != Node::Done {
            if ctx.cancel.is_cancelled() {
                info!(thread_id = %ctx.thread_id, node = %node, "run cancelled");
                let err = Some(AgentError::Cancelled);
                return self.finish(&ctx, state, steps, RunStatus::Cancelled, err);
            }
            info!(
                thread_id = %ctx.thread_id,
                node = %node,
                iteration = state.iteration,
                tool_usage_count = state.tool_usage_count,
                "node started"
            );
            ctx.emit(WorkflowEvent::NodeStarted { node, step: step + 1 });

            let patch = match self.run_node(node, &state, &ctx).await {
                Ok(p) => p,
                Err(AgentError::Cancelled) => {
                    info!(thread_id = %ctx.thread_id, node = %node, "run cancelled mid-node");
                    let err = Some(AgentError::Cancelled);
                    return self.finish(&ctx, state, steps, RunStatus::Cancelled, err);
                }
                Err(e) => return self.finish(&ctx, state, steps, RunStatus::Failed, Some(e)),
            };
            let writes = patch.into_writes();
            self.record_writes(&ctx, node, &writes).await;
            if let Err(e) = state.apply_writes(&writes) {
                let err = AgentError::node_failed(node.as_str(), e.to_string());
                return self.finish(&ctx, state, steps, RunStatus::Failed, Some(err));
            }

            let next = next_node(node, &state, &self.bounds);
            step += 1;
            steps += 1;
            self.save_checkpoint(&mut ctx, &state, loop_metadata(step, node, next)).await;
            info!(thread_id = %ctx.thread_id, node = %node, next = %next, step, "node finished");
            ctx.emit(WorkflowEvent::NodeFinished { node, next });
            node = next;
        }
        self.finish(&ctx, state, steps, RunStatus::Completed, None)
    }

    fn finish(
        &self,
        ctx: &RunCtx,
        state: RunState,
        steps: usize,
        status: RunStatus,
        error: Option<AgentError>,
    ) -> RunOutcome {
        let error = error.map(|e| e.to_string());
        match &error {
            Some(e) => {
                if status == RunStatus::Failed {
                    warn!(thread_id = %ctx.thread_id, error = %e, "run failed");
                }
                ctx.emit(WorkflowEvent::Failed { error: e.clone() });
            }
            None => {
                info!(thread_id = %ctx.thread_id, steps, solved = state.is_solved, "run completed");
                ctx.emit(WorkflowEvent::Done {
                    response: state.response.clone(),
                });
            }
        }
        RunOutcome {
            thread_id: ctx.thread_id.clone(),
            status,
            state,
            steps,
            error,
        }
    }

    async fn run_node(
        &self,
        node: Node,
        state: &RunState,
        ctx: &RunCtx,
    ) -> Result<StatePatch, AgentError> {
        match node {
            Node::Think => Ok(self.think(state).await),
            Node::Tool => self.tool(state, ctx).await,
            Node::GenerateCode => Ok(self.generate_code(state).await),
            Node::Execute => self.execute(state, ctx).await,
            Node::Reflect => Ok(self.reflect(state).await),
            Node::Synthesize => Ok(self.synthesize(state).await),
            Node::Lesson => Ok(self.lesson(state).await),
            Node::Memory => Ok(self.memory(state).await),
            Node::Done => Ok(StatePatch::new()),
        }
    }

    async fn think(&self, state: &RunState) -> StatePatch {
        let (context, new_memories) = if state.rag_context.is_empty() {
            self.retrieve(state).await
        } else {
            (state.rag_context.clone(), Vec::new())
        };
        let mut memory = state.memory.clone();
        memory.extend(new_memories.iter().cloned());

        let mut decision = self
            .planner
            .decide(ThinkInput {
                message: &state.task,
                history: &state.history,
                memory: &memory,
                rag_context: &context,
            })
            .await;

        if let NextAction::CallTool { tool, .. } = &decision.action {
            if state.tool_usage_count >= self.bounds.max_tool_calls {
                warn!(tool = %tool, count = state.tool_usage_count, "tool limit reached, dropping tool call");
                decision.action = NextAction::Respond;
                if decision.response.is_empty() {
                    decision.response = TOOL_LIMIT_MESSAGE.to_string();
                }
            }
        }

        info!(
            needs_code = decision.needs_code(),
            tool = ?decision.tool(),
            "think decided"
        );
        let answered_directly = !decision.needs_code() && decision.tool().is_none();
        let response = if matches!(decision.action, NextAction::Respond) {
            decision.response.clone()
        } else {
            String::new()
        };
        StatePatch::new()
            .reset_turn()
            .set(Field::Thinking, &decision.thinking)
            .set(Field::NeedsCode, decision.needs_code())
            .set(Field::ToolChoice, decision.tool())
            .set(Field::ToolArgs, decision.tool_args())
            .set(Field::CodePlan, decision.code_plan())
            .set(Field::Citations, &decision.citations)
            .set(Field::Response, response)
            .set(Field::RagContext, context)
            .set(Field::Memory, new_memories)
            .set(Field::IsSolved, answered_directly)
    }

    /// 查询改写 + 多路检索；返回上下文块与尚未在状态中的事实
    async fn retrieve(&self, state: &RunState) -> (String, Vec<String>) {
        let queries = self.expander.expand(&state.task, &state.history).await;
        match self.gather(&queries).await {
            Ok((solutions, memories, lessons)) => {
                let context = format_rag_context(&solutions, &memories, &[], &lessons);
                let fresh = memories
                    .into_iter()
                    .filter(|m| !state.memory.contains(m))
                    .collect();
                (context, fresh)
            }
            Err(e) => {
                warn!(error = %e, "context retrieval skipped");
                (RETRIEVAL_ERROR_CONTEXT.to_string(), Vec::new())
            }
        }
    }

    async fn gather(
        &self,
        queries: &[String],
    ) -> Result<(Vec<SolutionRecord>, Vec<String>, Vec<LessonRecord>), StoreError> {
        let mut solutions = Vec::new();
        let mut memories = self.knowledge.retrieve_recent_memories(RECENT_MEMORIES).await?;
        let mut lessons = Vec::new();
        for q in queries {
            solutions.extend(self.knowledge.retrieve_similar(q, PER_QUERY_K).await?);
            memories.extend(self.knowledge.retrieve_memories(q, PER_QUERY_K).await?);
            lessons.extend(self.knowledge.retrieve_lessons(q, PER_QUERY_K).await?);
        }

        let mut seen = HashSet::new();
        solutions.retain(|s| seen.insert(s.task.clone()));
        solutions.truncate(MAX_SOLUTIONS);
        let mut seen = HashSet::new();
        memories.retain(|m| seen.insert(m.clone()));
        let mut seen = HashSet::new();
        lessons.retain(|l| seen.insert(l.lesson.clone()));
        lessons.truncate(MAX_LESSONS);
        Ok((solutions, memories, lessons))
    }

    async fn tool(&self, state: &RunState, ctx: &RunCtx) -> Result<StatePatch, AgentError> {
        let tool = state
            .tool_choice
            .ok_or_else(|| AgentError::node_failed(Node::Tool.as_str(), "no tool selected"))?;
        let result = self.tools.dispatch(tool, &state.tool_args).await;
        ctx.emit(WorkflowEvent::ToolResult {
            tool,
            preview: truncate_chars(&result, TOOL_PREVIEW_CHARS),
        });
        Ok(StatePatch::new()
            .set(Field::RagContext, format!("Tool '{}' result:\n{}", tool, result))
            .set(Field::ToolChoice, None::<ToolName>)
            .set(Field::ToolUsageCount, state.tool_usage_count + 1))
    }

    async fn generate_code(&self, state: &RunState) -> StatePatch {
        let code = self
            .coder
            .generate(&state.task, &state.thinking, &state.rag_context, &state.reflections)
            .await;
        StatePatch::new()
            .set(Field::Files, code.files)
            .set(Field::Commands, code.commands)
            .set(Field::Iteration, state.iteration + 1)
    }

    async fn execute(&self, state: &RunState, ctx: &RunCtx) -> Result<StatePatch, AgentError> {
        if state.commands.is_empty() {
            let entry = LogEntry::new(LogKind::Error, "No commands generated.");
            ctx.emit(WorkflowEvent::Log { entry: entry.clone() });
            return Ok(StatePatch::new()
                .set(Field::ExecutionLogs, vec![entry])
                .set(Field::ExecutionResult, "")
                .set(Field::ExecutionError, "No commands generated.")
                .set(Field::IsSolved, false));
        }

        let start = Instant::now();
        let forward = ctx.events.clone().map(|tx| {
            move |entry: &LogEntry| {
                let _ = tx.send(WorkflowEvent::Log {
                    entry: entry.clone(),
                });
            }
        });
        let on_log = forward.as_ref().map(|f| f as &LogCallback);
        let run = self
            .sandbox
            .run_until(&state.files, &state.commands, on_log, &ctx.cancel)
            .await;
        // 被中断的执行不写入状态，续跑时重新执行
        if ctx.cancel.is_cancelled() {
            return Err(AgentError::Cancelled);
        }

        let has_errors = run.logs.iter().any(LogEntry::indicates_failure);
        let mut stdout = Vec::new();
        let mut errors = Vec::new();
        for entry in &run.logs {
            match entry.kind {
                LogKind::Stdout => stdout.push(entry.content.as_str()),
                LogKind::Stderr | LogKind::Error => errors.push(entry.content.as_str()),
                _ => {}
            }
        }
        let execution_error = errors.join("\n");
        let duration_ms = start.elapsed().as_secs_f64() * 1000.0;
        info!(
            solved = !has_errors,
            duration_ms = duration_ms as u64,
            artifacts = ?run.artifacts.keys().collect::<Vec<_>>(),
            "execute finished"
        );

        spawn_record(
            self.metrics.clone(),
            ExecutionMetrics {
                thread_id: ctx.thread_id.clone(),
                task: truncate_chars(&state.task, 500),
                success: !has_errors,
                duration_ms,
                error_type: if has_errors { "runtime_error".into() } else { String::new() },
                error_message: truncate_chars(&execution_error, 500),
                iteration_count: state.iteration,
            },
        );

        Ok(StatePatch::new()
            .set(Field::ExecutionLogs, &run.logs)
            .set(Field::ExecutionResult, stdout.join("\n"))
            .set(Field::ExecutionError, execution_error)
            .set(Field::IsSolved, !has_errors)
            .set(Field::RetrievedFiles, &run.artifacts))
    }

    async fn reflect(&self, state: &RunState) -> StatePatch {
        let critique = self
            .critic
            .critique(&state.files, &state.commands, &state.execution_logs)
            .await;
        StatePatch::new().set(Field::Reflections, vec![critique])
    }

    async fn synthesize(&self, state: &RunState) -> StatePatch {
        let response = self
            .synthesizer
            .synthesize(SynthesisInput {
                message: &state.task,
                code_plan: &state.thinking,
                execution_output: &state.execution_result,
                files: &state.files,
                citations: &state.citations,
            })
            .await;

        if state.is_solved && !state.files.is_empty() {
            let code = state
                .files
                .iter()
                .map(|(name, content)| format!("# {}\n{}", name, content))
                .collect::<Vec<_>>()
                .join("\n\n");
            let result = truncate_chars(&state.execution_result, 2000);
            if let Err(e) = self.knowledge.store_solution(&state.task, &code, &result).await {
                warn!(error = %e, "solution store skipped");
            }
        }
        StatePatch::new().set(Field::Response, response)
    }

    async fn lesson(&self, state: &RunState) -> StatePatch {
        if state.task.is_empty() || state.response.is_empty() {
            return StatePatch::new();
        }
        let Some(lesson) = self
            .learner
            .lesson(&state.task, &state.response, &state.execution_result)
            .await
        else {
            return StatePatch::new();
        };
        if let Err(e) = self
            .knowledge
            .store_lesson(&state.task, &state.response, &lesson)
            .await
        {
            warn!(error = %e, "lesson store skipped");
        }
        StatePatch::new().set(Field::Reflection, lesson)
    }

    async fn memory(&self, state: &RunState) -> StatePatch {
        if state.task.is_empty() || state.response.is_empty() {
            return StatePatch::new();
        }
        let facts = self
            .learner
            .extract_facts(&state.task, &state.response, &state.memory)
            .await;
        for fact in &facts {
            match self.knowledge.store_memory(fact).await {
                Ok(true) => info!(fact = %truncate_chars(fact, 80), "memory stored"),
                Ok(false) => {}
                Err(e) => warn!(error = %e, "memory store skipped"),
            }
        }
        StatePatch::new()
    }

    async fn record_writes(&self, ctx: &RunCtx, node: Node, writes: &[(String, Value)]) {
        let Some(store) = &self.checkpoints else {
            return;
        };
        if writes.is_empty() || !ctx.synced || ctx.config.checkpoint_id.is_none() {
            return;
        }
        let task_id = format!("{}:{}", node, Uuid::new_v4());
        if let Err(e) = store.put_writes(&ctx.config, writes, &task_id).await {
            warn!(thread_id = %ctx.thread_id, node = %node, error = %e, "pending writes not saved");
        }
    }

    async fn save_checkpoint(&self, ctx: &mut RunCtx, state: &RunState, meta: CheckpointMetadata) {
        let Some(store) = &self.checkpoints else {
            return;
        };
        let value = match serde_json::to_value(state) {
            Ok(v) => v,
            Err(e) => {
                warn!(thread_id = %ctx.thread_id, error = %e, "state not serializable, checkpoint skipped");
                return;
            }
        };
        match store.put(&ctx.config, &Checkpoint::new(value), &meta).await {
            Ok(config) => {
                ctx.config = config;
                ctx.synced = true;
            }
            Err(e) => {
                ctx.synced = false;
                warn!(thread_id = %ctx.thread_id, error = %e, "checkpoint not saved");
            }
        }
    }
}

fn loop_metadata(step: i64, node: Node, next: Node) -> CheckpointMetadata {
    CheckpointMetadata {
        source: "loop".into(),
        step,
        node: Some(node.to_string()),
        next: Some(next.to_string()),
    }
}
