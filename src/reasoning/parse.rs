//! 协作者输出解析（纯函数，无 IO）
//!
//! 模型输出不保证结构，这里按级联顺序尝试：严格 JSON → 宽松字面量（单引号 / True / None）
//! → 修复字符串内换行 → 围栏代码块 → 括号匹配扫描，全部失败时返回空但合法的默认值，从不报错。

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;
use serde_json::{Map, Value};

use crate::tools::ToolName;

static FILE_BLOCK_RE: OnceLock<Option<Regex>> = OnceLock::new();
static NAMED_BLOCK_RE: OnceLock<Option<Regex>> = OnceLock::new();
static FENCE_RE: OnceLock<Option<Regex>> = OnceLock::new();
static BACKTICK_RE: OnceLock<Option<Regex>> = OnceLock::new();
static BULLET_RE: OnceLock<Option<Regex>> = OnceLock::new();
static COMMANDS_LABEL_RE: OnceLock<Option<Regex>> = OnceLock::new();

fn cached(cell: &'static OnceLock<Option<Regex>>, pattern: &str) -> Option<&'static Regex> {
    cell.get_or_init(|| Regex::new(pattern).ok()).as_ref()
}

const FILE_BLOCK: &str = r"(?s)---\s*(?:FILE|BEGIN FILE)[:\s]+(\S+)\s*---\s*\n(.*?)---\s*END FILE\s*---";
const NAMED_BLOCK: &str = r"(?s)(?:\*\*|`|#{1,3}\s*)([\w][\w.\-/]*\.(?:py|js|ts|c|cpp|h|java|rb|go|rs|sh|txt|html|css))\s*(?:\*\*|`|)\s*\n\s*```\w*\n(.*?)```";

/// 以这些前缀开头的行视为命令（最后一级兜底）
const COMMAND_PREFIXES: &[&str] = &[
    "apt", "pip", "python", "npm", "node", "gcc", "g++", "sh ", "bash", "cd ", "mkdir", "cat ",
    "echo ", "chmod", "./", "make",
];

/// 期望的 JSON 形状
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expect {
    Object,
    Array,
    Any,
}

impl Expect {
    fn accepts(self, v: &Value) -> bool {
        match self {
            Expect::Object => v.is_object(),
            Expect::Array => v.is_array(),
            Expect::Any => true,
        }
    }
}

/// think 阶段的下一步动作
#[derive(Debug, Clone, PartialEq)]
pub enum NextAction {
    /// 需要生成并执行代码
    GenerateCode { plan: String },
    /// 调用受信工具
    CallTool { tool: ToolName, args: Value },
    /// 直接回复
    Respond,
}

/// 推理协作者的结构化决策
#[derive(Debug, Clone, PartialEq)]
pub struct ThinkDecision {
    pub thinking: String,
    pub action: NextAction,
    pub citations: Vec<String>,
    pub response: String,
}

impl ThinkDecision {
    /// 推理调用失败时的降级决策：直接回复给定文本
    pub fn fallback(thinking: impl Into<String>, response: impl Into<String>) -> Self {
        Self {
            thinking: thinking.into(),
            action: NextAction::Respond,
            citations: Vec::new(),
            response: response.into(),
        }
    }

    pub fn needs_code(&self) -> bool {
        matches!(self.action, NextAction::GenerateCode { .. })
    }

    pub fn tool(&self) -> Option<ToolName> {
        match &self.action {
            NextAction::CallTool { tool, .. } => Some(*tool),
            _ => None,
        }
    }

    pub fn tool_args(&self) -> Value {
        match &self.action {
            NextAction::CallTool { args, .. } => args.clone(),
            _ => Value::Object(Map::new()),
        }
    }

    pub fn code_plan(&self) -> &str {
        match &self.action {
            NextAction::GenerateCode { plan } => plan,
            _ => "N/A",
        }
    }
}

/// 代码生成协作者的输出
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GeneratedCode {
    pub files: BTreeMap<String, String>,
    pub commands: Vec<String>,
}

/// 把 JSON 字符串字面量内的裸换行 / 制表符转义，其余原样保留
pub fn fix_json_newlines(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 16);
    let mut in_string = false;
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c == '\\' && in_string {
            out.push(c);
            if let Some(next) = chars.next() {
                out.push(next);
            }
            continue;
        }
        match c {
            '"' => {
                in_string = !in_string;
                out.push(c);
            }
            '\n' if in_string => out.push_str("\\n"),
            '\t' if in_string => out.push_str("\\t"),
            _ => out.push(c),
        }
    }
    out
}

/// 宽松字面量：单引号字符串转双引号，True/False/None 转 JSON 关键字
fn relax_literal(text: &str) -> String {
    #[derive(PartialEq)]
    enum Quote {
        None,
        Double,
        Single,
    }

    let mut out = String::with_capacity(text.len());
    let mut state = Quote::None;
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        match state {
            Quote::Double => {
                out.push(c);
                if c == '\\' {
                    if let Some(next) = chars.next() {
                        out.push(next);
                    }
                } else if c == '"' {
                    state = Quote::None;
                }
            }
            Quote::Single => match c {
                '\\' => match chars.next() {
                    Some('\'') => out.push('\''),
                    Some(next) => {
                        out.push('\\');
                        out.push(next);
                    }
                    None => out.push('\\'),
                },
                '"' => out.push_str("\\\""),
                '\'' => {
                    out.push('"');
                    state = Quote::None;
                }
                _ => out.push(c),
            },
            Quote::None => {
                if c == '"' {
                    out.push(c);
                    state = Quote::Double;
                } else if c == '\'' {
                    out.push('"');
                    state = Quote::Single;
                } else if c.is_ascii_alphabetic() {
                    let mut word = String::from(c);
                    while let Some(&n) = chars.peek() {
                        if n.is_ascii_alphanumeric() || n == '_' {
                            word.push(n);
                            chars.next();
                        } else {
                            break;
                        }
                    }
                    match word.as_str() {
                        "True" => out.push_str("true"),
                        "False" => out.push_str("false"),
                        "None" => out.push_str("null"),
                        _ => out.push_str(&word),
                    }
                } else {
                    out.push(c);
                }
            }
        }
    }
    out
}

/// 围栏代码块内容（```json / ```python / ``` 均可）
pub fn fenced_blocks(text: &str) -> Vec<String> {
    match cached(&FENCE_RE, r"(?s)```(?:json|python)?\s*(.*?)```") {
        Some(re) => re
            .captures_iter(text)
            .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()))
            .collect(),
        None => Vec::new(),
    }
}

/// 以每个 `{` 为起点按括号深度截取到配对的 `}`
fn brace_spans(text: &str) -> Vec<&str> {
    let bytes = text.as_bytes();
    let mut spans = Vec::new();
    for (start, _) in text.match_indices('{') {
        let mut depth = 0i32;
        for (i, &b) in bytes.iter().enumerate().skip(start) {
            match b {
                b'{' => depth += 1,
                b'}' => depth -= 1,
                _ => {}
            }
            if depth == 0 {
                spans.push(&text[start..=i]);
                break;
            }
        }
    }
    spans
}

fn parse_candidate(block: &str, expect: Expect) -> Option<Value> {
    let attempts = [
        block.to_string(),
        relax_literal(block),
        fix_json_newlines(block),
    ];
    attempts
        .iter()
        .filter_map(|a| serde_json::from_str::<Value>(a).ok())
        .find(|v| expect.accepts(v))
}

/// 级联解析类 JSON 文本；全部失败返回 None
pub fn parse_json_like(text: &str, expect: Expect) -> Option<Value> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }

    let mut candidates = fenced_blocks(text);
    candidates.push(text.to_string());
    for block in &candidates {
        let block = block.trim();
        if block.is_empty() {
            continue;
        }
        if let Some(v) = parse_candidate(block, expect) {
            return Some(v);
        }
    }

    if expect == Expect::Object {
        for span in brace_spans(text) {
            if let Ok(v) = serde_json::from_str::<Value>(&fix_json_newlines(span)) {
                if v.is_object() {
                    return Some(v);
                }
            }
        }
    }

    None
}

fn value_to_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// `--- FILE: name ---` ... `--- END FILE ---` 标记块
pub fn parse_file_blocks(text: &str) -> BTreeMap<String, String> {
    let Some(re) = cached(&FILE_BLOCK_RE, FILE_BLOCK) else {
        return BTreeMap::new();
    };
    re.captures_iter(text)
        .map(|c| {
            (
                c[1].trim().to_string(),
                c[2].trim_end_matches('\n').to_string(),
            )
        })
        .collect()
}

/// 带文件名标题（`**main.py**` / `` `main.py` `` / `### main.py`）的围栏代码块
pub fn parse_named_code_blocks(text: &str) -> BTreeMap<String, String> {
    let Some(re) = cached(&NAMED_BLOCK_RE, NAMED_BLOCK) else {
        return BTreeMap::new();
    };
    re.captures_iter(text)
        .map(|c| {
            (
                c[1].trim().to_string(),
                c[2].trim_end_matches('\n').to_string(),
            )
        })
        .collect()
}

/// 文件级联：标记块 → 命名代码块 → JSON 对象（顶层 `files` 键会被展开）
pub fn parse_generated_files(text: &str) -> BTreeMap<String, String> {
    let files = parse_file_blocks(text);
    if !files.is_empty() {
        return files;
    }
    let files = parse_named_code_blocks(text);
    if !files.is_empty() {
        return files;
    }
    let Some(Value::Object(mut obj)) = parse_json_like(text, Expect::Object) else {
        return BTreeMap::new();
    };
    if let Some(Value::Object(inner)) = obj.remove("files") {
        obj = inner;
    }
    obj.iter()
        .map(|(name, content)| (name.clone(), value_to_text(content)))
        .collect()
}

/// 命令级联：JSON 列表 / 含列表的对象 → 反引号片段 → 列表项行 → 已知命令前缀行
pub fn parse_commands(text: &str) -> Vec<String> {
    let text = text.trim();
    if text.is_empty() {
        return Vec::new();
    }

    match parse_json_like(text, Expect::Any) {
        Some(Value::Array(items)) => return items.iter().map(value_to_text).collect(),
        Some(Value::Object(obj)) => {
            if let Some(items) = obj.values().find_map(|v| v.as_array()) {
                return items.iter().map(value_to_text).collect();
            }
        }
        _ => {}
    }

    if let Some(re) = cached(&BACKTICK_RE, r"`([^`]+)`") {
        let spans: Vec<String> = re
            .captures_iter(text)
            .map(|c| c[1].to_string())
            .collect();
        if !spans.is_empty() {
            return spans;
        }
    }

    if let Some(re) = cached(&BULLET_RE, r"(?m)^\s*(?:[-*]|\d+[.)])\s+(.+)$") {
        let items: Vec<String> = re
            .captures_iter(text)
            .map(|c| {
                c[1].trim()
                    .trim_matches(|ch| ch == '`' || ch == '"' || ch == '\'')
                    .to_string()
            })
            .filter(|s| !s.is_empty())
            .collect();
        if !items.is_empty() {
            return items;
        }
    }

    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && COMMAND_PREFIXES.iter().any(|p| l.starts_with(p)))
        .map(String::from)
        .collect()
}

/// 代码生成输出：文件块 + `COMMANDS:` 段；没有标签时去掉文件块后在剩余文本里找命令
pub fn parse_generated_code(text: &str) -> GeneratedCode {
    let files = parse_generated_files(text);

    let mut commands = Vec::new();
    if let Some(re) = cached(&COMMANDS_LABEL_RE, r"(?i)commands\s*\**\s*:") {
        if let Some(m) = re.find_iter(text).last() {
            commands = parse_commands(&text[m.end()..]);
        }
    }
    if commands.is_empty() {
        let mut rest = text.to_string();
        for re in [
            cached(&FILE_BLOCK_RE, FILE_BLOCK),
            cached(&NAMED_BLOCK_RE, NAMED_BLOCK),
        ]
        .into_iter()
        .flatten()
        {
            rest = re.replace_all(&rest, "").into_owned();
        }
        commands = parse_commands(&rest);
    }

    GeneratedCode { files, commands }
}

fn truthy(v: Option<&Value>) -> bool {
    match v {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_i64() == Some(1),
        Some(Value::String(s)) => matches!(s.trim().to_lowercase().as_str(), "yes" | "true" | "1"),
        _ => false,
    }
}

fn string_field(obj: &Map<String, Value>, key: &str) -> Option<String> {
    obj.get(key).map(value_to_text)
}

fn parse_tool_args(v: Option<&Value>) -> Value {
    match v {
        Some(Value::Object(o)) => Value::Object(o.clone()),
        Some(Value::String(s)) => {
            parse_json_like(s, Expect::Object).unwrap_or_else(|| Value::Object(Map::new()))
        }
        _ => Value::Object(Map::new()),
    }
}

fn parse_citations(v: Option<&Value>) -> Vec<String> {
    let list = match v {
        Some(Value::Array(items)) => items.clone(),
        Some(Value::String(s)) => match parse_json_like(s, Expect::Array) {
            Some(Value::Array(items)) => items,
            _ => Vec::new(),
        },
        _ => Vec::new(),
    };
    list.iter().map(value_to_text).filter(|s| !s.is_empty()).collect()
}

/// 推理输出 → 决策；无法解析为对象时把原文当作直接回复
pub fn parse_think_output(text: &str) -> ThinkDecision {
    let Some(Value::Object(obj)) = parse_json_like(text, Expect::Object) else {
        return ThinkDecision::fallback("", text.trim());
    };

    let thinking = string_field(&obj, "thinking").unwrap_or_default();
    let response = string_field(&obj, "response").unwrap_or_default();
    let citations = parse_citations(obj.get("citations"));

    let tool = match string_field(&obj, "tool_choice") {
        Some(raw) => {
            let name = raw.trim().to_lowercase();
            if name.is_empty() || name == "none" {
                None
            } else {
                match name.parse::<ToolName>() {
                    Ok(t) => Some(t),
                    Err(_) => {
                        tracing::warn!(tool = %name, "unknown tool_choice, treating as none");
                        None
                    }
                }
            }
        }
        None => None,
    };

    let action = if truthy(obj.get("needs_code")) {
        NextAction::GenerateCode {
            plan: string_field(&obj, "code_plan").unwrap_or_else(|| "N/A".to_string()),
        }
    } else if let Some(tool) = tool {
        NextAction::CallTool {
            tool,
            args: parse_tool_args(obj.get("tool_args")),
        }
    } else {
        NextAction::Respond
    };

    ThinkDecision {
        thinking,
        action,
        citations,
        response,
    }
}

/// 记忆抽取输出：逐行事实，`NONE` 表示没有
pub fn parse_fact_lines(raw: &str) -> Vec<String> {
    let raw = raw.trim();
    if raw.is_empty() || raw.eq_ignore_ascii_case("none") {
        return Vec::new();
    }
    raw.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.eq_ignore_ascii_case("none"))
        .map(|l| {
            l.trim_start_matches(|c| matches!(c, '•' | '-' | '*' | ' '))
                .to_string()
        })
        .filter(|l| !l.is_empty())
        .collect()
}

/// 查询扩展输出：最多 3 行，空结果时退回原任务
pub fn parse_query_lines(raw: &str, task: &str) -> Vec<String> {
    let queries: Vec<String> = raw
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| l.trim().trim_matches(|c| matches!(c, '-' | ' ' | '*')).to_string())
        .filter(|q| !q.is_empty())
        .take(3)
        .collect();
    if queries.is_empty() {
        vec![task.to_string()]
    } else {
        queries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_two_marker_blocks() {
        let text = "--- FILE: a.py ---\nprint(1)\n--- END FILE ---\n--- FILE: b.py ---\nprint(2)\n--- END FILE ---";
        let files = parse_file_blocks(text);
        assert_eq!(files.len(), 2);
        assert_eq!(files["a.py"], "print(1)");
        assert_eq!(files["b.py"], "print(2)");
    }

    #[test]
    fn test_named_code_block_fallback() {
        let text = "Here is the script:\n\n**main.py**\n```python\nprint(1+1)\n```\n";
        let files = parse_generated_files(text);
        assert_eq!(files.get("main.py").map(String::as_str), Some("print(1+1)"));
    }

    #[test]
    fn test_json_files_fallback_unnests_files_key() {
        let text = r#"{"files": {"main.py": "print(3)"}}"#;
        let files = parse_generated_files(text);
        assert_eq!(files.get("main.py").map(String::as_str), Some("print(3)"));
    }

    #[test]
    fn test_garbage_yields_empty_files() {
        assert!(parse_generated_files("no code here at all").is_empty());
    }

    #[test]
    fn test_fix_json_newlines_only_inside_strings() {
        let raw = "{\"a\": \"line1\nline2\"}\n";
        let fixed = fix_json_newlines(raw);
        assert_eq!(fixed, "{\"a\": \"line1\\nline2\"}\n");
        let v: Value = serde_json::from_str(&fixed).unwrap();
        assert_eq!(v["a"], "line1\nline2");
    }

    #[test]
    fn test_relaxed_literal_parse() {
        let v = parse_json_like("{'needs_code': 'yes', 'ok': True, 'x': None}", Expect::Object)
            .unwrap();
        assert_eq!(v["needs_code"], "yes");
        assert_eq!(v["ok"], true);
        assert!(v["x"].is_null());
    }

    #[test]
    fn test_brace_scan_inside_prose() {
        let text = "Sure! My decision is {\"tool_choice\": \"none\"} and that's it.";
        let v = parse_json_like(text, Expect::Object).unwrap();
        assert_eq!(v["tool_choice"], "none");
    }

    #[test]
    fn test_commands_json_list() {
        assert_eq!(parse_commands(r#"["python3 main.py"]"#), vec!["python3 main.py"]);
        assert_eq!(
            parse_commands(r#"{"commands": ["pip install numpy", "python3 a.py"]}"#),
            vec!["pip install numpy", "python3 a.py"]
        );
    }

    #[test]
    fn test_commands_backticks_and_bullets() {
        assert_eq!(
            parse_commands("Run `python3 a.py` then `python3 b.py`"),
            vec!["python3 a.py", "python3 b.py"]
        );
        assert_eq!(
            parse_commands("1. python3 a.py\n2. python3 b.py"),
            vec!["python3 a.py", "python3 b.py"]
        );
    }

    #[test]
    fn test_commands_prefix_lines() {
        assert_eq!(
            parse_commands("first we run\npython3 main.py\nand done"),
            vec!["python3 main.py"]
        );
        assert!(parse_commands("nothing runnable").is_empty());
    }

    #[test]
    fn test_generated_code_with_commands_label() {
        let text = "--- FILE: main.py ---\nprint(1+1)\n--- END FILE ---\n\nCOMMANDS:\n[\"python3 main.py\"]\n";
        let code = parse_generated_code(text);
        assert_eq!(code.files["main.py"], "print(1+1)");
        assert_eq!(code.commands, vec!["python3 main.py"]);
    }

    #[test]
    fn test_generated_code_without_label_ignores_file_content() {
        let text = "--- FILE: run.sh ---\necho `date`\n--- END FILE ---\n[\"sh run.sh\"]";
        let code = parse_generated_code(text);
        assert_eq!(code.commands, vec!["sh run.sh"]);
    }

    #[test]
    fn test_think_needs_code() {
        let d = parse_think_output(
            r#"{"thinking": "compute", "needs_code": "yes", "tool_choice": "none", "code_plan": "print 1+1", "response": ""}"#,
        );
        assert!(d.needs_code());
        assert_eq!(d.code_plan(), "print 1+1");
    }

    #[test]
    fn test_think_tool_with_string_args() {
        let d = parse_think_output(
            r#"```json
{"thinking": "look", "needs_code": "no", "tool_choice": "read_file", "tool_args": "{\"path\": \"a.txt\"}", "citations": "[\"doc.pdf\"]"}
```"#,
        );
        assert_eq!(d.tool(), Some(ToolName::ReadFile));
        assert_eq!(d.tool_args()["path"], "a.txt");
        assert_eq!(d.citations, vec!["doc.pdf"]);
    }

    #[test]
    fn test_think_unknown_tool_becomes_respond() {
        let d = parse_think_output(r#"{"needs_code": "no", "tool_choice": "browse_web", "response": "hi"}"#);
        assert_eq!(d.action, NextAction::Respond);
        assert_eq!(d.response, "hi");
    }

    #[test]
    fn test_think_unparseable_is_direct_reply() {
        let d = parse_think_output("Just a plain answer.");
        assert_eq!(d.action, NextAction::Respond);
        assert_eq!(d.response, "Just a plain answer.");
    }

    #[test]
    fn test_fact_lines() {
        assert!(parse_fact_lines("NONE").is_empty());
        assert_eq!(
            parse_fact_lines("• user prefers python\n- result was 2\nNONE\n"),
            vec!["user prefers python", "result was 2"]
        );
    }

    #[test]
    fn test_query_lines_cap_and_fallback() {
        assert_eq!(parse_query_lines("", "task"), vec!["task"]);
        let q = parse_query_lines("- a\n- b\n- c\n- d", "task");
        assert_eq!(q, vec!["a", "b", "c"]);
    }
}
