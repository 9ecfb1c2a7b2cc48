//! 文件工具：read_file / write_file / edit_file / list_files
//!
//! Workspace 绑定根目录，相对路径相对根解析。默认按词法规整后必须仍在根下（禁止 ../ 逃逸）；
//! 关闭限制后可访问宿主机任意路径。

use std::path::{Component, Path, PathBuf};

use walkdir::WalkDir;

/// 工作区：所有文件工具的根
#[derive(Debug, Clone)]
pub struct Workspace {
    root_dir: PathBuf,
    confined: bool,
}

impl Workspace {
    pub fn new(root_dir: impl AsRef<Path>) -> Self {
        let root = root_dir.as_ref().to_path_buf();
        let root_dir = root.canonicalize().unwrap_or(root);
        Self {
            root_dir,
            confined: true,
        }
    }

    /// 是否把路径限制在根目录下
    pub fn confined(mut self, confined: bool) -> Self {
        self.confined = confined;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root_dir
    }

    /// 解析路径（受限时检查在工作区内）；目标可以尚不存在
    pub fn resolve(&self, path: &str) -> Result<PathBuf, String> {
        let raw = Path::new(path);
        let joined = if raw.is_absolute() {
            raw.to_path_buf()
        } else {
            self.root_dir.join(raw)
        };
        let mut normalized = PathBuf::new();
        for comp in joined.components() {
            match comp {
                Component::ParentDir => {
                    normalized.pop();
                }
                Component::CurDir => {}
                other => normalized.push(other.as_os_str()),
            }
        }
        if !self.confined || normalized.starts_with(&self.root_dir) {
            Ok(normalized)
        } else {
            Err(format!("Path '{}' is outside the workspace", path))
        }
    }

    /// 读文件；给出行区间（1 起）时加上 `--- path (a-b/total) ---` 头，区间超界会被收紧
    pub fn read_file(
        &self,
        path: &str,
        start_line: Option<usize>,
        end_line: Option<usize>,
    ) -> Result<String, String> {
        let resolved = self.resolve(path)?;
        if !resolved.is_file() {
            return Err(format!("File '{}' not found.", path));
        }
        let content = std::fs::read_to_string(&resolved)
            .map_err(|e| format!("Error reading file: {}", e))?;

        let lines: Vec<&str> = content.split_inclusive('\n').collect();
        let total = lines.len();
        let start = start_line.map(|s| s.saturating_sub(1)).unwrap_or(0).min(total);
        let end = end_line.unwrap_or(total).min(total).max(start);
        let body = lines[start..end].concat();

        if start_line.is_some() || end_line.is_some() {
            Ok(format!("--- {} ({}-{}/{}) ---\n{}", path, start + 1, end, total, body))
        } else {
            Ok(body)
        }
    }

    pub fn write_file(&self, path: &str, content: &str) -> Result<String, String> {
        let resolved = self.resolve(path)?;
        if let Some(parent) = resolved.parent() {
            std::fs::create_dir_all(parent).map_err(|e| format!("Error writing file: {}", e))?;
        }
        std::fs::write(&resolved, content).map_err(|e| format!("Error writing file: {}", e))?;
        tracing::info!(path = %path, chars = content.chars().count(), "write_file");
        Ok(format!(
            "Successfully wrote {} chars to {}",
            content.chars().count(),
            path
        ))
    }

    /// 精确替换第一处 old_text；找不到时不改动文件
    pub fn edit_file(&self, path: &str, old_text: &str, new_text: &str) -> Result<String, String> {
        let resolved = self.resolve(path)?;
        if !resolved.is_file() {
            return Err(format!("File '{}' not found.", path));
        }
        let content = std::fs::read_to_string(&resolved)
            .map_err(|e| format!("Error editing file: {}", e))?;

        if old_text.is_empty() || !content.contains(old_text) {
            let trimmed = old_text.trim();
            if !trimmed.is_empty() && content.contains(trimmed) {
                return Err("Exact 'old_text' match failed. Be precise with whitespace.".to_string());
            }
            return Err(format!(
                "'old_text' not found in {}. Please check indentation/whitespace exact match.",
                path
            ));
        }

        let updated = content.replacen(old_text, new_text, 1);
        std::fs::write(&resolved, updated).map_err(|e| format!("Error editing file: {}", e))?;
        tracing::info!(path = %path, "edit_file");
        Ok(format!("Successfully edited {}", path))
    }

    /// 递归列出文件（相对路径、排序），跳过隐藏项
    pub fn list_files(&self, path: &str, max_depth: usize) -> Result<String, String> {
        let base = self.resolve(path)?;
        if !base.is_dir() {
            return Err(format!("'{}' is not a directory.", path));
        }
        let mut entries = Vec::new();
        let walker = WalkDir::new(&base)
            .min_depth(1)
            .max_depth(max_depth.max(1))
            .into_iter()
            .filter_entry(|e| !e.file_name().to_string_lossy().starts_with('.'));
        for entry in walker {
            let entry = entry.map_err(|e| format!("Error listing files: {}", e))?;
            if !entry.file_type().is_file() {
                continue;
            }
            if let Ok(rel) = entry.path().strip_prefix(&base) {
                entries.push(rel.to_string_lossy().into_owned());
            }
        }
        entries.sort();
        Ok(entries.join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn workspace() -> (TempDir, Workspace) {
        let dir = TempDir::new().unwrap();
        let ws = Workspace::new(dir.path());
        (dir, ws)
    }

    #[test]
    fn test_read_with_clamped_range() {
        let (_dir, ws) = workspace();
        ws.write_file("a.txt", "one\ntwo\nthree\n").unwrap();
        assert_eq!(ws.read_file("a.txt", None, None).unwrap(), "one\ntwo\nthree\n");
        assert_eq!(
            ws.read_file("a.txt", Some(2), Some(99)).unwrap(),
            "--- a.txt (2-3/3) ---\ntwo\nthree\n"
        );
        assert_eq!(
            ws.read_file("a.txt", Some(10), None).unwrap(),
            "--- a.txt (4-3/3) ---\n"
        );
        assert_eq!(
            ws.read_file("missing.txt", None, None).unwrap_err(),
            "File 'missing.txt' not found."
        );
    }

    #[test]
    fn test_write_creates_parents() {
        let (dir, ws) = workspace();
        let msg = ws.write_file("deep/nested/f.py", "x = 1").unwrap();
        assert_eq!(msg, "Successfully wrote 5 chars to deep/nested/f.py");
        assert!(dir.path().join("deep/nested/f.py").exists());
    }

    #[test]
    fn test_edit_first_occurrence_only() {
        let (_dir, ws) = workspace();
        ws.write_file("f.py", "a = 1\na = 1\n").unwrap();
        ws.edit_file("f.py", "a = 1", "a = 2").unwrap();
        assert_eq!(ws.read_file("f.py", None, None).unwrap(), "a = 2\na = 1\n");
    }

    #[test]
    fn test_edit_requires_verbatim_match() {
        let (_dir, ws) = workspace();
        ws.write_file("f.py", "def f():\n    return 1\n").unwrap();

        let err = ws.edit_file("f.py", "  return 1  ", "return 2").unwrap_err();
        assert_eq!(err, "Exact 'old_text' match failed. Be precise with whitespace.");

        let err = ws.edit_file("f.py", "return 3", "return 2").unwrap_err();
        assert!(err.starts_with("'old_text' not found in f.py."));

        // 文件未被改动
        assert_eq!(
            ws.read_file("f.py", None, None).unwrap(),
            "def f():\n    return 1\n"
        );
    }

    #[test]
    fn test_list_files_depth_and_hidden() {
        let (_dir, ws) = workspace();
        ws.write_file("a.py", "").unwrap();
        ws.write_file(".secret", "").unwrap();
        ws.write_file("pkg/b.py", "").unwrap();
        ws.write_file("pkg/deeper/c.py", "").unwrap();
        ws.write_file(".git/config", "").unwrap();

        assert_eq!(ws.list_files(".", 2).unwrap(), "a.py\npkg/b.py");
        assert_eq!(
            ws.list_files(".", 3).unwrap(),
            "a.py\npkg/b.py\npkg/deeper/c.py"
        );
        assert_eq!(
            ws.list_files("a.py", 2).unwrap_err(),
            "'a.py' is not a directory."
        );
    }

    #[test]
    fn test_escape_rejected() {
        let (_dir, ws) = workspace();
        assert!(ws.read_file("../../etc/passwd", None, None).is_err());
        assert!(ws.write_file("/tmp/outside.txt", "x").is_err());
    }

    #[test]
    fn test_unconfined_reaches_host_paths() {
        let (_dir, ws) = workspace();
        let outside = tempfile::tempdir().unwrap();
        let ws = ws.confined(false);
        let target = outside.path().join("notes").join("a.txt");
        let target = target.to_string_lossy().into_owned();

        ws.write_file(&target, "hello").unwrap();
        assert_eq!(ws.read_file(&target, None, None).unwrap(), "hello");
        // 相对路径仍相对根解析
        assert_eq!(ws.resolve("x.txt").unwrap(), ws.root().join("x.txt"));
    }
}
