//! Sandboxed workspace file tools.
//!
//! Both tools resolve paths strictly relative to the configured workspace
//! root. Absolute paths and any path containing a `..` component are
//! rejected with a path-escape error before touching the filesystem.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::{Component, Path, PathBuf};

use super::{parse_args, Tool};
use crate::error::{Error, Result};

/// File reads beyond this are truncated so a single tool call cannot blow
/// up the prompt.
const MAX_READ_BYTES: usize = 64 * 1024;

/// Resolve `relative` inside `root`, or fail with a path-escape error.
fn resolve_sandboxed(root: &Path, relative: &str) -> Result<PathBuf> {
    let rel = Path::new(relative);
    if rel.is_absolute() {
        return Err(Error::PathEscape(relative.to_string()));
    }
    if rel
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(Error::PathEscape(relative.to_string()));
    }
    let joined = root.join(rel);
    // A symlink inside the workspace may still point out of it.
    if let Ok(resolved) = joined.canonicalize() {
        if !resolved.starts_with(root) {
            return Err(Error::PathEscape(relative.to_string()));
        }
        return Ok(resolved);
    }
    Ok(joined)
}

fn truncate_on_char_boundary(mut text: String, max: usize) -> (String, bool) {
    if text.len() <= max {
        return (text, false);
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text.truncate(end);
    (text, true)
}

#[derive(Debug, Deserialize)]
struct ReadArgs {
    path: String,
    #[serde(rename = "maxBytes", default)]
    max_bytes: Option<usize>,
}

/// Read one file from the workspace.
pub struct FsReadTool {
    root: PathBuf,
}

impl FsReadTool {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }
}

#[async_trait]
impl Tool for FsReadTool {
    fn name(&self) -> &str {
        "fs.read"
    }

    fn description(&self) -> &str {
        "Read a text file from the workspace (workspace-relative path)."
    }

    fn args_hint(&self) -> &str {
        r#"{"path": "src/main.rs"}"#
    }

    fn validate_args(&self, args: &Value) -> Result<()> {
        parse_args::<ReadArgs>(args).map(|_| ())
    }

    async fn execute(&self, args: &Value) -> Result<Value> {
        let args: ReadArgs = parse_args(args)?;
        let path = resolve_sandboxed(&self.root, &args.path)?;
        let limit = args.max_bytes.unwrap_or(MAX_READ_BYTES).min(MAX_READ_BYTES);
        let content = tokio::fs::read_to_string(&path).await?;
        let (content, truncated) = truncate_on_char_boundary(content, limit);
        Ok(json!({
            "path": args.path,
            "content": content,
            "truncated": truncated,
        }))
    }
}

#[derive(Debug, Default, Deserialize)]
struct ListArgs {
    #[serde(default)]
    path: Option<String>,
}

/// List one workspace directory.
pub struct FsListTool {
    root: PathBuf,
}

impl FsListTool {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }
}

#[async_trait]
impl Tool for FsListTool {
    fn name(&self) -> &str {
        "fs.list"
    }

    fn description(&self) -> &str {
        "List a workspace directory (default: the workspace root)."
    }

    fn args_hint(&self) -> &str {
        r#"{"path": "src"}"#
    }

    fn validate_args(&self, args: &Value) -> Result<()> {
        parse_args::<ListArgs>(args).map(|_| ())
    }

    async fn execute(&self, args: &Value) -> Result<Value> {
        let args: ListArgs = parse_args(args)?;
        let relative = args.path.unwrap_or_else(|| ".".to_string());
        let path = resolve_sandboxed(&self.root, &relative)?;

        let mut entries = Vec::new();
        let mut dir = tokio::fs::read_dir(&path).await?;
        while let Some(entry) = dir.next_entry().await? {
            let kind = match entry.file_type().await {
                Ok(t) if t.is_dir() => "dir",
                Ok(_) => "file",
                Err(_) => "file",
            };
            entries.push(json!({
                "name": entry.file_name().to_string_lossy(),
                "kind": kind,
            }));
        }
        entries.sort_by(|a, b| {
            a["name"]
                .as_str()
                .unwrap_or("")
                .cmp(b["name"].as_str().unwrap_or(""))
        });

        Ok(json!({
            "path": relative,
            "entries": entries,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn workspace() -> TempDir {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/lib.rs"), "pub fn answer() -> u32 { 42 }\n").unwrap();
        std::fs::write(dir.path().join("README.md"), "# demo\n").unwrap();
        dir
    }

    fn canonical_root(dir: &TempDir) -> PathBuf {
        dir.path().canonicalize().unwrap()
    }

    #[tokio::test]
    async fn test_read_inside_workspace() {
        let dir = workspace();
        let tool = FsReadTool::new(canonical_root(&dir));
        let value = tool
            .execute(&json!({"path": "src/lib.rs"}))
            .await
            .unwrap();
        assert!(value["content"].as_str().unwrap().contains("answer"));
        assert_eq!(value["truncated"], false);
    }

    #[tokio::test]
    async fn test_read_rejects_parent_components() {
        let dir = workspace();
        let tool = FsReadTool::new(canonical_root(&dir));
        for path in ["../secrets", "src/../../etc/passwd", "a/../../b", ".."] {
            let err = tool.execute(&json!({ "path": path })).await.unwrap_err();
            assert!(matches!(err, Error::PathEscape(_)), "{path} should escape");
        }
    }

    #[tokio::test]
    async fn test_read_rejects_absolute_path() {
        let dir = workspace();
        let tool = FsReadTool::new(canonical_root(&dir));
        let err = tool
            .execute(&json!({"path": "/etc/hostname"}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PathEscape(_)));
    }

    #[tokio::test]
    async fn test_read_honors_max_bytes() {
        let dir = workspace();
        let tool = FsReadTool::new(canonical_root(&dir));
        let value = tool
            .execute(&json!({"path": "src/lib.rs", "maxBytes": 6}))
            .await
            .unwrap();
        assert_eq!(value["content"], "pub fn");
        assert_eq!(value["truncated"], true);
    }

    #[tokio::test]
    async fn test_read_missing_file_is_io_error() {
        let dir = workspace();
        let tool = FsReadTool::new(canonical_root(&dir));
        let err = tool
            .execute(&json!({"path": "nope.txt"}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }

    #[tokio::test]
    async fn test_read_requires_path_arg() {
        let dir = workspace();
        let tool = FsReadTool::new(canonical_root(&dir));
        let err = tool.execute(&Value::Null).await.unwrap_err();
        assert!(matches!(err, Error::Tool(_)));
    }

    #[tokio::test]
    async fn test_list_root_and_subdir() {
        let dir = workspace();
        let tool = FsListTool::new(canonical_root(&dir));

        let value = tool.execute(&Value::Null).await.unwrap();
        let names: Vec<&str> = value["entries"]
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["README.md", "src"]);

        let value = tool.execute(&json!({"path": "src"})).await.unwrap();
        assert_eq!(value["entries"][0]["name"], "lib.rs");
        assert_eq!(value["entries"][0]["kind"], "file");
    }

    #[tokio::test]
    async fn test_list_rejects_traversal() {
        let dir = workspace();
        let tool = FsListTool::new(canonical_root(&dir));
        let err = tool.execute(&json!({"path": "../"})).await.unwrap_err();
        assert!(matches!(err, Error::PathEscape(_)));
    }

    #[test]
    fn test_truncation_respects_char_boundaries() {
        let text = "héllo".repeat(3);
        let (out, truncated) = truncate_on_char_boundary(text, 7);
        assert!(truncated);
        assert!(out.len() <= 7);
        assert!(out.starts_with("héllo"));
    }
}
