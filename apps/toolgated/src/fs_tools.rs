//! Filesystem connector: `fs.readFile` and `fs.listDir`.
//!
//! Every caller-supplied path is resolved through the OS resolver before any
//! comparison, so `..` segments and symlinks cannot escape the allowlist.
//! Confinement is default-deny: an empty allowlist rejects everything.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine as _;
use serde_json::{Value, json};
use toolgate_core::{
    FieldType, GatewayError, InputSchema, Tool, ToolContext, ToolHandler,
};

use crate::config::FsConfig;

pub fn tools(config: FsConfig) -> Vec<Tool> {
    let config = Arc::new(config);
    vec![
        Tool::new(
            "fs.readFile",
            "Read a file from the allowed filesystem roots",
            InputSchema::new()
                .required("path", FieldType::string_len(Some(1), None), "Path to read")
                .with_default(
                    "encoding",
                    FieldType::enumeration(&["utf-8", "utf8", "base64", "hex"]),
                    "Content encoding for the result",
                    json!("utf-8"),
                ),
            Arc::new(ReadFile {
                config: Arc::clone(&config),
            }),
        ),
        Tool::new(
            "fs.listDir",
            "List a directory inside the allowed filesystem roots",
            InputSchema::new()
                .required("path", FieldType::string_len(Some(1), None), "Directory to list")
                .with_default(
                    "recursive",
                    FieldType::boolean(),
                    "Descend into subdirectories",
                    json!(false),
                )
                .with_default(
                    "max_depth",
                    FieldType::integer_range(1, 10),
                    "Recursion depth limit",
                    json!(3),
                ),
            Arc::new(ListDir { config }),
        ),
    ]
}

/// Allow/deny roots resolved once per invocation so every child comparison
/// uses the same canonical bases.
struct ResolvedRoots {
    allowed: Vec<PathBuf>,
    denied: Vec<PathBuf>,
}

impl ResolvedRoots {
    async fn resolve(config: &FsConfig) -> Self {
        Self {
            allowed: resolve_all(&config.allowed_paths).await,
            denied: resolve_all(&config.denied_paths).await,
        }
    }

    /// `canonical` must already be symlink-free. `Path::starts_with`
    /// compares whole segments, so `/allow/foo` never matches `/all`.
    fn confine(&self, canonical: &Path) -> Result<(), GatewayError> {
        for denied in &self.denied {
            if canonical.starts_with(denied) {
                return Err(GatewayError::security(format!(
                    "path {} is under denied path {}",
                    canonical.display(),
                    denied.display()
                )));
            }
        }
        if self.allowed.is_empty() {
            return Err(GatewayError::security("no allowed paths configured"));
        }
        if !self.allowed.iter().any(|root| canonical.starts_with(root)) {
            return Err(GatewayError::security(format!(
                "path {} is outside the allowed paths",
                canonical.display()
            )));
        }
        Ok(())
    }
}

async fn resolve_all(paths: &[PathBuf]) -> Vec<PathBuf> {
    let mut out = Vec::with_capacity(paths.len());
    for path in paths {
        // A configured root that does not exist cannot be canonicalized;
        // fall back to the literal so a denied path still denies.
        match tokio::fs::canonicalize(path).await {
            Ok(resolved) => out.push(resolved),
            Err(_) => out.push(path.clone()),
        }
    }
    out
}

async fn canonicalize_target(raw: &str) -> Result<PathBuf, GatewayError> {
    tokio::fs::canonicalize(raw)
        .await
        .map_err(|e| GatewayError::connector(format!("{raw}: {e}")))
}

fn required_str<'a>(args: &'a Value, key: &str) -> Result<&'a str, GatewayError> {
    args.get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| GatewayError::internal(format!("argument {key} missing after validation")))
}

struct ReadFile {
    config: Arc<FsConfig>,
}

#[async_trait]
impl ToolHandler for ReadFile {
    async fn call(&self, args: Value, _ctx: ToolContext) -> Result<Value, GatewayError> {
        let raw_path = required_str(&args, "path")?;
        let encoding = required_str(&args, "encoding")?;

        let roots = ResolvedRoots::resolve(&self.config).await;
        let path = canonicalize_target(raw_path).await?;
        roots.confine(&path)?;

        let meta = tokio::fs::metadata(&path)
            .await
            .map_err(|e| GatewayError::connector(format!("stat {}: {e}", path.display())))?;
        if !meta.is_file() {
            return Err(GatewayError::connector(format!(
                "{} is not a regular file",
                path.display()
            )));
        }
        if meta.len() > self.config.max_file_size {
            return Err(GatewayError::security(format!(
                "{} is {} bytes, max_file_size is {}",
                path.display(),
                meta.len(),
                self.config.max_file_size
            )));
        }

        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| GatewayError::connector(format!("read {}: {e}", path.display())))?;
        let content = match encoding {
            "base64" => base64::engine::general_purpose::STANDARD.encode(&bytes),
            "hex" => hex::encode(&bytes),
            _ => String::from_utf8_lossy(&bytes).into_owned(),
        };

        Ok(json!({
            "path": path,
            "content": content,
            "size": meta.len(),
            "encoding": encoding,
        }))
    }
}

struct ListDir {
    config: Arc<FsConfig>,
}

#[async_trait]
impl ToolHandler for ListDir {
    async fn call(&self, args: Value, _ctx: ToolContext) -> Result<Value, GatewayError> {
        let raw_path = required_str(&args, "path")?;
        let recursive = args.get("recursive").and_then(|v| v.as_bool()).unwrap_or(false);
        let max_depth = args.get("max_depth").and_then(|v| v.as_u64()).unwrap_or(3);

        let roots = ResolvedRoots::resolve(&self.config).await;
        let root = canonicalize_target(raw_path).await?;
        roots.confine(&root)?;

        let meta = tokio::fs::metadata(&root)
            .await
            .map_err(|e| GatewayError::connector(format!("stat {}: {e}", root.display())))?;
        if !meta.is_dir() {
            return Err(GatewayError::connector(format!(
                "{} is not a directory",
                root.display()
            )));
        }

        let mut entries = Vec::new();
        let mut stack = vec![(root.clone(), 1u64)];
        while let Some((dir, depth)) = stack.pop() {
            let mut read_dir = tokio::fs::read_dir(&dir)
                .await
                .map_err(|e| GatewayError::connector(format!("list {}: {e}", dir.display())))?;
            while let Some(entry) = read_dir
                .next_entry()
                .await
                .map_err(|e| GatewayError::connector(format!("list {}: {e}", dir.display())))?
            {
                let child = entry.path();
                // Children are re-confined through their resolved form so a
                // symlink pointing outside the allowlist is skipped, not
                // surfaced as an error.
                let Ok(resolved) = tokio::fs::canonicalize(&child).await else {
                    continue;
                };
                if roots.confine(&resolved).is_err() {
                    continue;
                }
                let Ok(meta) = tokio::fs::metadata(&child).await else {
                    continue;
                };
                let kind = if meta.is_dir() {
                    "directory"
                } else if meta.is_file() {
                    "file"
                } else {
                    "other"
                };
                let mut item = json!({
                    "name": entry.file_name().to_string_lossy(),
                    "path": child,
                    "type": kind,
                });
                if meta.is_file() {
                    item["size"] = json!(meta.len());
                }
                entries.push(item);
                if recursive && meta.is_dir() && depth < max_depth {
                    stack.push((child, depth + 1));
                }
            }
        }
        entries.sort_by(|a, b| {
            a["path"]
                .as_str()
                .unwrap_or_default()
                .cmp(b["path"].as_str().unwrap_or_default())
        });

        Ok(json!({
            "path": root,
            "entries": entries,
            "count": entries.len(),
        }))
    }
}
