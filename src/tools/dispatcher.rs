//! 工具分发器
//!
//! `dispatch(tool, args)` 把参数交给对应处理函数，成功返回文本，失败返回 `ERROR: ...` 文本，从不向调用方报错。
//! 每次调用输出一条结构化审计日志（JSON）。

use std::time::Instant;

use serde_json::Value;

use crate::tools::{SearchTools, ShellRunner, ToolName, Workspace};

/// 工具分发器：持有各工具的执行上下文
pub struct ToolDispatcher {
    workspace: Workspace,
    shell: ShellRunner,
    search: SearchTools,
    list_max_depth: usize,
}

impl ToolDispatcher {
    pub fn new(
        workspace: Workspace,
        shell: ShellRunner,
        search: SearchTools,
        list_max_depth: usize,
    ) -> Self {
        Self {
            workspace,
            shell,
            search,
            list_max_depth,
        }
    }

    /// 按名称分发；名称或参数文本无效时同样返回 `ERROR: ...`
    pub async fn dispatch_raw(&self, tool_name: &str, args: &str) -> String {
        let tool = match tool_name.parse::<ToolName>() {
            Ok(t) => t,
            Err(e) => return format!("ERROR: {}", e),
        };
        let args: Value = if args.trim().is_empty() {
            Value::Object(Default::default())
        } else {
            match serde_json::from_str(args) {
                Ok(v) => v,
                Err(_) => return format!("ERROR: Invalid JSON arguments: {}", args),
            }
        };
        self.dispatch(tool, &args).await
    }

    pub async fn dispatch(&self, tool: ToolName, args: &Value) -> String {
        let start = Instant::now();
        let result = if args.is_object() {
            self.execute(tool, args).await
        } else {
            Err(format!("Invalid JSON arguments: {}", args))
        };

        let duration_ms = start.elapsed().as_millis() as u64;
        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": tool.as_str(),
            "ok": result.is_ok(),
            "duration_ms": duration_ms,
            "args_preview": args_preview(args),
        });
        tracing::info!(audit = %audit.to_string(), "tool");

        match result {
            Ok(text) => text,
            Err(e) => format!("ERROR: {}", e),
        }
    }

    async fn execute(&self, tool: ToolName, args: &Value) -> Result<String, String> {
        match tool {
            ToolName::SqlDb => {
                let query = required(args, "query").ok_or("Missing 'query'")?;
                self.search.sql(query).await
            }
            ToolName::RagSearch => {
                let query = required(args, "query").ok_or("Missing 'query'")?;
                self.search.similar_solutions(query).await
            }
            ToolName::SearchDocuments => {
                let query = required(args, "query").ok_or("Missing 'query'")?;
                self.search.documents(query).await
            }
            ToolName::ReadFile => {
                let path = required(args, "path").ok_or("Missing 'path'")?;
                self.workspace.read_file(
                    path,
                    line_number(args, "start_line"),
                    line_number(args, "end_line"),
                )
            }
            ToolName::WriteFile => {
                let (Some(path), Some(content)) = (required(args, "path"), text(args, "content"))
                else {
                    return Err("Missing 'path' or 'content'".to_string());
                };
                self.workspace.write_file(path, content)
            }
            ToolName::EditFile => {
                let (Some(path), Some(old_text), Some(new_text)) = (
                    required(args, "path"),
                    text(args, "old_text"),
                    text(args, "new_text"),
                ) else {
                    return Err("Missing 'path', 'old_text', or 'new_text'".to_string());
                };
                self.workspace.edit_file(path, old_text, new_text)
            }
            ToolName::ListFiles => {
                let path = required(args, "path").unwrap_or(".");
                let depth = line_number(args, "max_depth").unwrap_or(self.list_max_depth);
                self.workspace.list_files(path, depth)
            }
            ToolName::RunCommand => {
                let command = required(args, "command").ok_or("Missing 'command'")?;
                let cwd = match required(args, "cwd") {
                    Some(c) => Some(self.workspace.resolve(c)?),
                    None => None,
                };
                self.shell.run(command, cwd).await
            }
        }
    }
}

/// 非空字符串参数
fn required<'a>(args: &'a Value, key: &str) -> Option<&'a str> {
    args.get(key)
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
}

/// 字符串参数，允许空串
fn text<'a>(args: &'a Value, key: &str) -> Option<&'a str> {
    args.get(key).and_then(|v| v.as_str())
}

/// 正整数参数，数字或数字字符串均可；0 视为未给出
fn line_number(args: &Value, key: &str) -> Option<usize> {
    let v = args.get(key)?;
    let n = v
        .as_u64()
        .or_else(|| v.as_str().and_then(|s| s.trim().parse().ok()))?;
    (n > 0).then_some(n as usize)
}

fn args_preview(args: &Value) -> String {
    let s = args.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}
