//! File operation step - one filesystem operation per invocation.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Instant, SystemTime};

use async_trait::async_trait;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use regex_lite::Regex;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use super::template::{resolve_template, resolve_value};
use super::types::{ConfigValidation, Step, StepBase, StepExecutionContext, StepResult};
use crate::error::{Error, Result};

/// errno for a rename across filesystems
const EXDEV: i32 = 18;

const OPERATIONS: [&str; 10] = [
    "read", "write", "copy", "move", "delete", "mkdir", "rmdir", "exists", "stat", "list",
];

/// Filesystem step.
pub struct FileOperationStep {
    base: StepBase,
}

impl FileOperationStep {
    pub fn new(base: StepBase) -> Self {
        Self { base }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum Operation {
    Read,
    Write,
    Copy,
    Move,
    Delete,
    Mkdir,
    Rmdir,
    Exists,
    Stat,
    List,
}

impl Operation {
    fn as_str(&self) -> &'static str {
        match self {
            Operation::Read => "read",
            Operation::Write => "write",
            Operation::Copy => "copy",
            Operation::Move => "move",
            Operation::Delete => "delete",
            Operation::Mkdir => "mkdir",
            Operation::Rmdir => "rmdir",
            Operation::Exists => "exists",
            Operation::Stat => "stat",
            Operation::List => "list",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum Encoding {
    #[default]
    Utf8,
    Base64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileOperationConfig {
    operation: Operation,

    path: String,

    /// Target for copy/move
    #[serde(default)]
    destination: Option<String>,

    /// Payload for write; non-strings are written as pretty JSON
    #[serde(default)]
    content: Option<Value>,

    #[serde(default)]
    encoding: Encoding,

    #[serde(default)]
    overwrite: bool,

    #[serde(default)]
    append: bool,

    /// Create missing parent directories on write/copy/move
    #[serde(default = "default_true")]
    create_directories: bool,

    #[serde(default)]
    recursive: bool,

    /// Glob on entry names for list (`*`, `?`, `[abc]`)
    #[serde(default)]
    pattern: Option<String>,

    /// Read size cap in bytes
    #[serde(default)]
    max_size: Option<u64>,
}

fn default_true() -> bool {
    true
}

fn io_error(action: &str, path: &Path, e: std::io::Error) -> Error {
    Error::Io(std::io::Error::new(
        e.kind(),
        format!("{} '{}': {}", action, path.display(), e),
    ))
}

fn timestamp(time: std::io::Result<SystemTime>) -> Value {
    time.ok()
        .map(|t| Value::String(DateTime::<Utc>::from(t).to_rfc3339()))
        .unwrap_or(Value::Null)
}

#[cfg(unix)]
fn mode_of(metadata: &std::fs::Metadata) -> Value {
    use std::os::unix::fs::PermissionsExt;
    json!(format!("{:o}", metadata.permissions().mode() & 0o7777))
}

#[cfg(not(unix))]
fn mode_of(metadata: &std::fs::Metadata) -> Value {
    json!(if metadata.permissions().readonly() { "r" } else { "rw" })
}

async fn path_type(path: &Path) -> &'static str {
    match fs::metadata(path).await {
        Ok(m) if m.is_dir() => "directory",
        Ok(_) => "file",
        Err(_) => "nonexistent",
    }
}

/// Translate a glob into an anchored regex.
pub fn glob_to_regex(glob: &str) -> Result<Regex> {
    let mut pattern = String::from("^");
    let mut in_class = false;
    for c in glob.chars() {
        match c {
            '*' if !in_class => pattern.push_str(".*"),
            '?' if !in_class => pattern.push('.'),
            '[' if !in_class => {
                in_class = true;
                pattern.push('[');
            }
            ']' if in_class => {
                in_class = false;
                pattern.push(']');
            }
            '!' if in_class && pattern.ends_with('[') => pattern.push('^'),
            '\\' | '.' | '+' | '(' | ')' | '|' | '^' | '$' | '{' | '}' if !in_class => {
                pattern.push('\\');
                pattern.push(c);
            }
            other => pattern.push(other),
        }
    }
    pattern.push('$');
    Regex::new(&pattern)
        .map_err(|e| Error::StepConfig(format!("Invalid pattern '{}': {}", glob, e)))
}

/// Canonicalize the longest existing prefix of `path` and re-attach the rest.
async fn resolve_existing(path: &Path) -> PathBuf {
    let mut rest = Vec::new();
    let mut current = path;
    loop {
        if let Ok(real) = fs::canonicalize(current).await {
            return rest.iter().rev().fold(real, |acc, part| acc.join(part));
        }
        match (current.parent(), current.file_name()) {
            (Some(parent), Some(name)) => {
                rest.push(name.to_os_string());
                current = if parent.as_os_str().is_empty() {
                    Path::new(".")
                } else {
                    parent
                };
            }
            _ => return path.to_path_buf(),
        }
    }
}

async fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| io_error("Failed to create directory", parent, e))?;
    }
    Ok(())
}

/// Copy a directory tree. Returns (files, bytes).
async fn copy_dir(src: &Path, dst: &Path) -> Result<(u64, u64)> {
    let mut files = 0;
    let mut bytes = 0;
    let mut pending = vec![(src.to_path_buf(), dst.to_path_buf())];

    while let Some((from, to)) = pending.pop() {
        fs::create_dir_all(&to)
            .await
            .map_err(|e| io_error("Failed to create directory", &to, e))?;
        let mut entries = fs::read_dir(&from)
            .await
            .map_err(|e| io_error("Failed to read directory", &from, e))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| io_error("Failed to read directory", &from, e))?
        {
            let target = to.join(entry.file_name());
            let kind = entry
                .file_type()
                .await
                .map_err(|e| io_error("Failed to inspect", &entry.path(), e))?;
            if kind.is_dir() {
                pending.push((entry.path(), target));
            } else {
                bytes += fs::copy(entry.path(), &target)
                    .await
                    .map_err(|e| io_error("Failed to copy", &entry.path(), e))?;
                files += 1;
            }
        }
    }
    Ok((files, bytes))
}

async fn list_entries(root: &Path, recursive: bool, pattern: Option<&Regex>) -> Result<Vec<Value>> {
    let mut found = Vec::new();
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let mut entries = fs::read_dir(&dir)
            .await
            .map_err(|e| io_error("Failed to list", &dir, e))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| io_error("Failed to list", &dir, e))?
        {
            let path = entry.path();
            let metadata = entry
                .metadata()
                .await
                .map_err(|e| io_error("Failed to inspect", &path, e))?;
            if metadata.is_dir() && recursive {
                pending.push(path.clone());
            }

            let name = entry.file_name().to_string_lossy().into_owned();
            if pattern.is_some_and(|re| !re.is_match(&name)) {
                continue;
            }
            let relative = path.strip_prefix(root).unwrap_or(&path);
            found.push(json!({
                "name": name,
                "path": path.to_string_lossy(),
                "relativePath": relative.to_string_lossy(),
                "type": if metadata.is_dir() { "directory" } else { "file" },
                "size": metadata.len(),
                "modified": timestamp(metadata.modified()),
            }));
        }
    }

    found.sort_by(|a, b| {
        a["relativePath"]
            .as_str()
            .unwrap_or("")
            .cmp(b["relativePath"].as_str().unwrap_or(""))
    });
    Ok(found)
}

impl FileOperationStep {
    async fn read(&self, config: &FileOperationConfig, path: &Path) -> Result<Map<String, Value>> {
        let metadata = fs::metadata(path)
            .await
            .map_err(|e| io_error("Failed to read", path, e))?;
        if metadata.is_dir() {
            return Err(Error::Execution(format!(
                "Cannot read '{}': it is a directory",
                path.display()
            )));
        }
        let max = config.max_size.unwrap_or(self.base.settings.files.max_read_bytes);
        if metadata.len() > max {
            return Err(Error::Execution(format!(
                "File '{}' is {} bytes, larger than the {} byte limit",
                path.display(),
                metadata.len(),
                max
            )));
        }

        let bytes = fs::read(path)
            .await
            .map_err(|e| io_error("Failed to read", path, e))?;
        let content = match config.encoding {
            Encoding::Utf8 => String::from_utf8(bytes).map_err(|_| {
                Error::Execution(format!(
                    "File '{}' is not valid UTF-8 (use encoding: base64)",
                    path.display()
                ))
            })?,
            Encoding::Base64 => base64::engine::general_purpose::STANDARD.encode(bytes),
        };

        let mut outputs = Map::new();
        outputs.insert("content".into(), json!(content));
        outputs.insert("size".into(), json!(metadata.len()));
        outputs.insert("modified".into(), timestamp(metadata.modified()));
        Ok(outputs)
    }

    async fn write(
        &self,
        config: &FileOperationConfig,
        path: &Path,
        content: &Value,
    ) -> Result<Map<String, Value>> {
        let existed = fs::try_exists(path).await.unwrap_or(false);
        if existed && !config.overwrite && !config.append {
            return Err(Error::Execution(format!(
                "File '{}' already exists (set overwrite: true to replace it)",
                path.display()
            )));
        }

        let bytes = match (content, config.encoding) {
            (Value::String(text), Encoding::Base64) => base64::engine::general_purpose::STANDARD
                .decode(text.trim())
                .map_err(|e| Error::Execution(format!("content is not valid base64: {}", e)))?,
            (Value::String(text), Encoding::Utf8) => text.clone().into_bytes(),
            (other, _) => serde_json::to_vec_pretty(other)?,
        };

        if config.create_directories {
            ensure_parent(path).await?;
        }

        if config.append {
            let mut file = fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .await
                .map_err(|e| io_error("Failed to open", path, e))?;
            file.write_all(&bytes)
                .await
                .map_err(|e| io_error("Failed to write", path, e))?;
            file.flush()
                .await
                .map_err(|e| io_error("Failed to write", path, e))?;
        } else {
            fs::write(path, &bytes)
                .await
                .map_err(|e| io_error("Failed to write", path, e))?;
        }

        let mut outputs = Map::new();
        outputs.insert("bytesWritten".into(), json!(bytes.len()));
        outputs.insert("created".into(), json!(!existed));
        outputs.insert("appended".into(), json!(config.append));
        Ok(outputs)
    }

    async fn transfer(
        &self,
        config: &FileOperationConfig,
        op: Operation,
        src: &Path,
        dst: &Path,
    ) -> Result<Map<String, Value>> {
        let metadata = fs::metadata(src)
            .await
            .map_err(|e| io_error("Source not found", src, e))?;
        let is_dir = metadata.is_dir();
        if is_dir && !config.recursive {
            return Err(Error::Execution(format!(
                "'{}' is a directory (set recursive: true to {} it)",
                src.display(),
                op.as_str()
            )));
        }

        let real_src = resolve_existing(src).await;
        let real_dst = resolve_existing(dst).await;
        if real_src == real_dst || (is_dir && real_dst.starts_with(&real_src)) {
            return Err(Error::Execution(format!(
                "Cannot {} '{}' onto itself or into its own subtree ('{}')",
                op.as_str(),
                src.display(),
                dst.display()
            )));
        }

        if fs::try_exists(dst).await.unwrap_or(false) {
            if !config.overwrite {
                return Err(Error::Execution(format!(
                    "Destination '{}' already exists (set overwrite: true to replace it)",
                    dst.display()
                )));
            }
            if path_type(dst).await == "directory" {
                fs::remove_dir_all(dst)
                    .await
                    .map_err(|e| io_error("Failed to replace", dst, e))?;
            }
        }
        if config.create_directories {
            ensure_parent(dst).await?;
        }

        let mut fell_back = false;
        let (files, bytes) = match op {
            Operation::Move => match fs::rename(src, dst).await {
                Ok(()) => (if is_dir { 0 } else { 1 }, metadata.len()),
                Err(e) if e.raw_os_error() == Some(EXDEV) => {
                    debug!(
                        src = %src.display(),
                        dst = %dst.display(),
                        "Cross-device move, copying"
                    );
                    fell_back = true;
                    let copied = self.copy_any(src, dst, is_dir).await?;
                    let removed = if is_dir {
                        fs::remove_dir_all(src).await
                    } else {
                        fs::remove_file(src).await
                    };
                    removed.map_err(|e| io_error("Failed to remove source", src, e))?;
                    copied
                }
                Err(e) => return Err(io_error("Failed to move", src, e)),
            },
            _ => self.copy_any(src, dst, is_dir).await?,
        };

        let mut outputs = Map::new();
        outputs.insert("source".into(), json!(src.to_string_lossy()));
        outputs.insert("destination".into(), json!(dst.to_string_lossy()));
        outputs.insert("files".into(), json!(files));
        outputs.insert("bytes".into(), json!(bytes));
        if op == Operation::Move {
            outputs.insert("copiedAcrossDevices".into(), json!(fell_back));
        }
        Ok(outputs)
    }

    async fn copy_any(&self, src: &Path, dst: &Path, is_dir: bool) -> Result<(u64, u64)> {
        if is_dir {
            copy_dir(src, dst).await
        } else {
            let bytes = fs::copy(src, dst)
                .await
                .map_err(|e| io_error("Failed to copy", src, e))?;
            Ok((1, bytes))
        }
    }

    async fn remove(
        &self,
        config: &FileOperationConfig,
        op: Operation,
        path: &Path,
    ) -> Result<Map<String, Value>> {
        let kind = path_type(path).await;
        let result = match (kind, op) {
            ("nonexistent", _) => {
                return Err(Error::Execution(format!("'{}' does not exist", path.display())))
            }
            ("file", Operation::Rmdir) => {
                return Err(Error::Execution(format!(
                    "'{}' is not a directory",
                    path.display()
                )))
            }
            ("file", _) => fs::remove_file(path).await,
            (_, _) if config.recursive => fs::remove_dir_all(path).await,
            _ => fs::remove_dir(path).await,
        };
        result.map_err(|e| {
            if e.kind() != ErrorKind::NotFound && kind == "directory" && !config.recursive {
                Error::Execution(format!(
                    "Failed to remove '{}': {} (set recursive: true for non-empty directories)",
                    path.display(),
                    e
                ))
            } else {
                io_error("Failed to remove", path, e)
            }
        })?;

        let mut outputs = Map::new();
        outputs.insert("deleted".into(), json!(true));
        outputs.insert("type".into(), json!(kind));
        Ok(outputs)
    }

    async fn mkdir(&self, config: &FileOperationConfig, path: &Path) -> Result<Map<String, Value>> {
        let existed = path_type(path).await == "directory";
        if !existed {
            let created = if config.recursive || config.create_directories {
                fs::create_dir_all(path).await
            } else {
                fs::create_dir(path).await
            };
            created.map_err(|e| io_error("Failed to create directory", path, e))?;
        }
        let mut outputs = Map::new();
        outputs.insert("created".into(), json!(!existed));
        Ok(outputs)
    }

    async fn stat(&self, path: &Path) -> Result<Map<String, Value>> {
        let metadata = fs::metadata(path)
            .await
            .map_err(|e| io_error("Failed to stat", path, e))?;
        let mut outputs = Map::new();
        outputs.insert("size".into(), json!(metadata.len()));
        outputs.insert("isFile".into(), json!(metadata.is_file()));
        outputs.insert("isDirectory".into(), json!(metadata.is_dir()));
        outputs.insert("readonly".into(), json!(metadata.permissions().readonly()));
        outputs.insert("mode".into(), mode_of(&metadata));
        outputs.insert("modified".into(), timestamp(metadata.modified()));
        outputs.insert("accessed".into(), timestamp(metadata.accessed()));
        outputs.insert("created".into(), timestamp(metadata.created()));
        Ok(outputs)
    }
}

#[async_trait]
impl Step for FileOperationStep {
    fn base(&self) -> &StepBase {
        &self.base
    }

    fn step_type(&self) -> &str {
        "fileOperation"
    }

    fn description(&self) -> &str {
        "Perform a filesystem operation"
    }

    fn validate_config(&self) -> ConfigValidation {
        let mut result = ConfigValidation::ok();

        let operation = self.base.get("operation").and_then(Value::as_str);
        match operation {
            None => result.error("operation is required"),
            Some(op) if !OPERATIONS.contains(&op) => result.error(format!(
                "operation must be one of: {}",
                OPERATIONS.join(", ")
            )),
            Some(_) => {}
        }

        match self.base.get("path") {
            Some(Value::String(p)) if !p.trim().is_empty() => {}
            Some(_) => result.error("path must be a non-empty string"),
            None => result.error("path is required"),
        }

        if matches!(operation, Some("copy" | "move"))
            && !self.base.get("destination").is_some_and(Value::is_string)
        {
            result.error(format!(
                "destination is required for {}",
                operation.unwrap_or_default()
            ));
        }

        if operation == Some("write") && self.base.get("content").is_none() {
            result.error("content is required for write");
        }

        if let Some(encoding) = self.base.get("encoding") {
            if serde_json::from_value::<Encoding>(encoding.clone()).is_err() {
                result.error("encoding must be utf8 or base64");
            }
        }

        if let Some(pattern) = self.base.get("pattern") {
            match pattern.as_str() {
                Some(glob) => {
                    if let Err(e) = glob_to_regex(glob) {
                        result.error(e.to_string());
                    }
                }
                None => result.error("pattern must be a string"),
            }
            if operation != Some("list") {
                result.warn("pattern only applies to list");
            }
        }

        if let Some(max) = self.base.get("maxSize") {
            if !max.as_u64().is_some_and(|n| n > 0) {
                result.error("maxSize must be a positive number of bytes");
            }
        }

        result
    }

    async fn execute_step(&self, ctx: &mut StepExecutionContext) -> Result<StepResult> {
        let config: FileOperationConfig = self.base.parse_config("fileOperation")?;
        let op = config.operation;
        let path = PathBuf::from(resolve_template(&config.path, ctx));
        let destination = config
            .destination
            .as_deref()
            .map(|d| PathBuf::from(resolve_template(d, ctx)));

        debug!(
            step_id = %self.base.id,
            operation = op.as_str(),
            path = %path.display(),
            "File operation"
        );
        let start = Instant::now();

        let mut outputs = match op {
            Operation::Read => self.read(&config, &path).await?,
            Operation::Write => {
                let content = config
                    .content
                    .as_ref()
                    .map(|c| resolve_value(c, ctx))
                    .ok_or_else(|| Error::StepConfig("content is required for write".to_string()))?;
                self.write(&config, &path, &content).await?
            }
            Operation::Copy | Operation::Move => {
                let destination = destination.as_deref().ok_or_else(|| {
                    Error::StepConfig(format!("destination is required for {}", op.as_str()))
                })?;
                self.transfer(&config, op, &path, destination).await?
            }
            Operation::Delete | Operation::Rmdir => self.remove(&config, op, &path).await?,
            Operation::Mkdir => self.mkdir(&config, &path).await?,
            Operation::Exists => {
                let kind = path_type(&path).await;
                let mut outputs = Map::new();
                outputs.insert("exists".into(), json!(kind != "nonexistent"));
                outputs.insert("type".into(), json!(kind));
                outputs
            }
            Operation::Stat => self.stat(&path).await?,
            Operation::List => {
                if path_type(&path).await != "directory" {
                    return Err(Error::Execution(format!(
                        "'{}' is not a directory",
                        path.display()
                    )));
                }
                let pattern = config.pattern.as_deref().map(glob_to_regex).transpose()?;
                let entries = list_entries(&path, config.recursive, pattern.as_ref()).await?;
                let mut outputs = Map::new();
                outputs.insert("count".into(), json!(entries.len()));
                outputs.insert("entries".into(), Value::Array(entries));
                outputs
            }
        };

        outputs.insert("path".into(), json!(path.to_string_lossy()));
        if op == Operation::Read {
            let encoding = match config.encoding {
                Encoding::Utf8 => "utf8",
                Encoding::Base64 => "base64",
            };
            outputs.insert("encoding".into(), json!(encoding));
        }

        let kind = path_type(&path).await;
        Ok(StepResult::success(outputs).with_metadata_map(json!({
            "operation": op.as_str(),
            "path": path.to_string_lossy(),
            "pathType": kind,
            "duration": start.elapsed().as_millis() as u64,
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::steps::types::test_support::{base, context};

    async fn run(config: Value) -> StepResult {
        FileOperationStep::new(base("fs", config))
            .execute(&mut context())
            .await
    }

    fn p(dir: &tempfile::TempDir, name: &str) -> String {
        dir.path().join(name).to_string_lossy().into_owned()
    }

    #[test]
    fn test_glob_to_regex() {
        let re = glob_to_regex("*.json").unwrap();
        assert!(re.is_match("config.json"));
        assert!(!re.is_match("config.json.bak"));
        assert!(!re.is_match("configxjson"));

        let re = glob_to_regex("log-?.[tc]sv").unwrap();
        assert!(re.is_match("log-1.tsv"));
        assert!(re.is_match("log-2.csv"));
        assert!(!re.is_match("log-10.csv"));
    }

    #[tokio::test]
    async fn test_write_then_read_with_template_path() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context();
        ctx.variables.insert("dir".into(), json!(dir.path().to_string_lossy()));
        ctx.variables.insert("who".into(), json!("Ada"));

        let write = FileOperationStep::new(base(
            "w",
            json!({"operation": "write", "path": "${dir}/nested/hello.txt", "content": "hi ${who}"}),
        ));
        let result = write.execute(&mut ctx).await;
        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.outputs["bytesWritten"], 6);
        assert_eq!(result.outputs["created"], true);
        assert_eq!(result.metadata["pathType"], "file");

        let read = FileOperationStep::new(base(
            "r",
            json!({"operation": "read", "path": "${dir}/nested/hello.txt"}),
        ));
        let result = read.execute(&mut ctx).await;
        assert_eq!(result.outputs["content"], "hi Ada");
        assert_eq!(result.outputs["size"], 6);
    }

    #[tokio::test]
    async fn test_write_refuses_to_clobber() {
        let dir = tempfile::tempdir().unwrap();
        let path = p(&dir, "a.txt");
        std::fs::write(&path, "original").unwrap();

        let refused = run(json!({"operation": "write", "path": path, "content": "new"})).await;
        assert!(!refused.success);
        assert!(refused.error.unwrap().contains("overwrite"));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "original");

        let replaced = run(json!({"operation": "write", "path": path, "content": "new", "overwrite": true})).await;
        assert!(replaced.success);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "new");

        let appended = run(json!({"operation": "write", "path": path, "content": "+", "append": true})).await;
        assert!(appended.success);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "new+");
    }

    #[tokio::test]
    async fn test_read_enforces_max_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = p(&dir, "big.txt");
        std::fs::write(&path, "x".repeat(64)).unwrap();

        let result = run(json!({"operation": "read", "path": path, "maxSize": 10})).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("limit"));
    }

    #[tokio::test]
    async fn test_base64_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = p(&dir, "bin");
        let written = run(json!({"operation": "write", "path": path, "content": "AAEC", "encoding": "base64"})).await;
        assert!(written.success);
        assert_eq!(std::fs::read(&path).unwrap(), vec![0u8, 1, 2]);

        let read = run(json!({"operation": "read", "path": path, "encoding": "base64"})).await;
        assert_eq!(read.outputs["content"], "AAEC");
    }

    #[tokio::test]
    async fn test_copy_and_move_directories_need_recursive() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src/inner")).unwrap();
        std::fs::write(dir.path().join("src/a.txt"), "a").unwrap();
        std::fs::write(dir.path().join("src/inner/b.txt"), "bb").unwrap();

        let refused = run(json!({"operation": "copy", "path": p(&dir, "src"), "destination": p(&dir, "copy")})).await;
        assert!(!refused.success);
        assert!(refused.error.unwrap().contains("recursive"));

        let copied = run(json!({
            "operation": "copy", "path": p(&dir, "src"), "destination": p(&dir, "copy"), "recursive": true
        }))
        .await;
        assert!(copied.success, "{:?}", copied.error);
        assert_eq!(copied.outputs["files"], 2);
        assert_eq!(copied.outputs["bytes"], 3);
        assert_eq!(std::fs::read_to_string(dir.path().join("copy/inner/b.txt")).unwrap(), "bb");

        let moved = run(json!({
            "operation": "move", "path": p(&dir, "copy"), "destination": p(&dir, "moved"), "recursive": true
        }))
        .await;
        assert!(moved.success, "{:?}", moved.error);
        assert!(!dir.path().join("copy").exists());
        assert!(dir.path().join("moved/a.txt").exists());
        assert_eq!(moved.metadata["pathType"], "nonexistent");
    }

    #[tokio::test]
    async fn test_delete_and_rmdir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("full")).unwrap();
        std::fs::write(dir.path().join("full/x"), "x").unwrap();

        let refused = run(json!({"operation": "rmdir", "path": p(&dir, "full")})).await;
        assert!(!refused.success);

        let removed = run(json!({"operation": "rmdir", "path": p(&dir, "full"), "recursive": true})).await;
        assert!(removed.success);
        assert!(!dir.path().join("full").exists());

        let missing = run(json!({"operation": "delete", "path": p(&dir, "ghost")})).await;
        assert!(!missing.success);
        assert!(missing.error.unwrap().contains("does not exist"));
    }

    #[tokio::test]
    async fn test_transfer_onto_itself_keeps_source() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("tree/sub")).unwrap();
        std::fs::write(dir.path().join("tree/keep.txt"), "keep").unwrap();
        let tree = p(&dir, "tree");
        let aliased = format!("{}/sub/..", tree);

        for (op, destination) in [
            ("copy", tree.clone()),
            ("copy", aliased),
            ("copy", p(&dir, "tree/sub/nested")),
            ("move", p(&dir, "tree/sub")),
        ] {
            let result = run(json!({
                "operation": op,
                "path": tree,
                "destination": destination,
                "recursive": true,
                "overwrite": true
            }))
            .await;
            assert!(!result.success, "{} -> {}", op, destination);
            assert!(result.error.unwrap().contains("onto itself"));
        }

        std::fs::write(dir.path().join("single.txt"), "one").unwrap();
        let file = run(json!({
            "operation": "copy",
            "path": p(&dir, "single.txt"),
            "destination": p(&dir, "./single.txt"),
            "overwrite": true
        }))
        .await;
        assert!(!file.success);

        assert_eq!(std::fs::read_to_string(dir.path().join("tree/keep.txt")).unwrap(), "keep");
        assert_eq!(std::fs::read_to_string(dir.path().join("single.txt")).unwrap(), "one");
        assert!(!dir.path().join("tree/sub/nested").exists());
    }

    #[tokio::test]
    async fn test_exists_stat_mkdir_and_list() {
        let dir = tempfile::tempdir().unwrap();

        let made = run(json!({"operation": "mkdir", "path": p(&dir, "a/b")})).await;
        assert_eq!(made.outputs["created"], true);
        std::fs::write(dir.path().join("a/one.json"), "{}").unwrap();
        std::fs::write(dir.path().join("a/b/two.json"), "{}").unwrap();
        std::fs::write(dir.path().join("a/notes.txt"), "n").unwrap();

        let exists = run(json!({"operation": "exists", "path": p(&dir, "a/b")})).await;
        assert_eq!(exists.outputs["exists"], true);
        assert_eq!(exists.outputs["type"], "directory");

        let stat = run(json!({"operation": "stat", "path": p(&dir, "a/notes.txt")})).await;
        assert_eq!(stat.outputs["size"], 1);
        assert_eq!(stat.outputs["isFile"], true);

        let flat = run(json!({"operation": "list", "path": p(&dir, "a"), "pattern": "*.json"})).await;
        assert_eq!(flat.outputs["count"], 1);

        let deep = run(json!({
            "operation": "list",
            "path": p(&dir, "a"),
            "pattern": "*.json",
            "recursive": true
        }))
        .await;
        let names: Vec<&str> = deep.outputs["entries"]
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["two.json", "one.json"]);
    }

    #[test]
    fn test_config_validation() {
        let step = FileOperationStep::new(base("f", json!({"operation": "copy", "path": "/tmp/x"})));
        assert!(!step.validate_config().is_valid());

        let step = FileOperationStep::new(base("f", json!({"operation": "shred", "path": "/tmp/x"})));
        assert!(!step.validate_config().is_valid());

        let step = FileOperationStep::new(base("f", json!({"operation": "write", "path": "/tmp/x"})));
        assert!(!step.validate_config().is_valid());

        let step = FileOperationStep::new(base("f", json!({"operation": "read", "path": "/tmp/x"})));
        assert!(step.validate_config().is_valid());
    }
}
