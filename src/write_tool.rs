//! The `write` tool: argument handling, backup, generation, and response
//! assembly.
//!
//! This is the single entry point between the protocol shell and the
//! routing engine. Argument-shape problems surface before any side effect;
//! a backup of non-empty prior content is taken before the file changes;
//! the response is either a diff or a terse summary depending on
//! `write_only`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::diff::render_diff;
use crate::error::WriteError;
use crate::router::{Router, WarningSink};

/// Parsed and validated `write` arguments.
#[derive(Debug, Clone)]
pub struct WriteArgs {
    pub file_path: PathBuf,
    pub prompt: String,
    pub context_files: Vec<PathBuf>,
    pub write_only: bool,
    pub validate: bool,
    pub restore_previous: bool,
}

impl WriteArgs {
    /// Extract fields with typed accessors; any mismatch is an
    /// argument-shape error raised before I/O happens.
    pub fn from_value(args: &Value) -> Result<Self, WriteError> {
        let object = args
            .as_object()
            .ok_or_else(|| WriteError::InvalidArgument("arguments must be an object".into()))?;

        let file_path = required_string(object, "file_path")?;
        let file_path = PathBuf::from(file_path);
        if !file_path.is_absolute() {
            return Err(WriteError::InvalidArgument(
                "file_path must be an absolute path".into(),
            ));
        }

        let prompt = required_string(object, "prompt")?.to_string();
        let context_files = optional_string_array(object, "context_files")?
            .into_iter()
            .map(PathBuf::from)
            .collect();
        let write_only = optional_bool(object, "write_only")?.unwrap_or(false);
        // Validation defaults on for fire-and-forget writes, where nobody
        // reads a diff that would reveal broken output.
        let validate = optional_bool(object, "validate")?.unwrap_or(write_only);
        let restore_previous = optional_bool(object, "restore_previous")?.unwrap_or(false);

        Ok(Self {
            file_path,
            prompt,
            context_files,
            write_only,
            validate,
            restore_previous,
        })
    }
}

fn required_string<'a>(
    object: &'a serde_json::Map<String, Value>,
    key: &str,
) -> Result<&'a str, WriteError> {
    match object.get(key) {
        Some(Value::String(value)) if !value.is_empty() => Ok(value),
        Some(Value::String(_)) => Err(WriteError::InvalidArgument(format!(
            "'{key}' must not be empty"
        ))),
        Some(other) => Err(WriteError::InvalidArgument(format!(
            "'{key}' must be a string, got {}",
            json_type_name(other)
        ))),
        None => Err(WriteError::InvalidArgument(format!("'{key}' is required"))),
    }
}

fn optional_bool(
    object: &serde_json::Map<String, Value>,
    key: &str,
) -> Result<Option<bool>, WriteError> {
    match object.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(value)) => Ok(Some(*value)),
        Some(other) => Err(WriteError::InvalidArgument(format!(
            "'{key}' must be a boolean, got {}",
            json_type_name(other)
        ))),
    }
}

fn optional_string_array(
    object: &serde_json::Map<String, Value>,
    key: &str,
) -> Result<Vec<String>, WriteError> {
    match object.get(key) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| match item {
                Value::String(value) => Ok(value.clone()),
                other => Err(WriteError::InvalidArgument(format!(
                    "'{key}' entries must be strings, got {}",
                    json_type_name(other)
                ))),
            })
            .collect(),
        Some(other) => Err(WriteError::InvalidArgument(format!(
            "'{key}' must be an array of strings, got {}",
            json_type_name(other)
        ))),
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Mediates between the dispatch shell and the router.
pub struct WriteController {
    router: Arc<Router>,
}

impl WriteController {
    pub fn new(router: Arc<Router>) -> Self {
        Self { router }
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    /// Handle one `write` call and produce the response text.
    pub async fn write(
        &self,
        args: &Value,
        cancel: &CancellationToken,
    ) -> Result<String, WriteError> {
        let args = WriteArgs::from_value(args)?;

        if args.restore_previous {
            return self.restore_previous(&args.file_path).await;
        }

        let prior = match std::fs::read_to_string(&args.file_path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(source) => {
                return Err(WriteError::Filesystem {
                    path: args.file_path.display().to_string(),
                    source,
                })
            }
        };
        let file_existed = args.file_path.exists();
        if !prior.is_empty() {
            self.router.backups().store(&args.file_path, prior.clone()).await;
        }

        let warnings = WarningSink::new();
        let code = self
            .router
            .generate_with_validation(
                &args.prompt,
                &args.file_path,
                &args.context_files,
                None,
                args.validate,
                &warnings,
                cancel,
            )
            .await
            .map_err(|source| WriteError::Routing {
                source,
                warnings: warnings.snapshot(),
            })?;

        let mut code = code;
        if !code.ends_with('\n') {
            code.push('\n');
        }
        write_file(&args.file_path, &code)?;

        let warnings = warnings.snapshot();
        if args.write_only {
            Ok(terse_summary(
                &args.file_path,
                file_existed,
                &code,
                &warnings,
            ))
        } else {
            let mut response = render_diff(&args.file_path.display().to_string(), &prior, &code);
            response.push_str(&render_warning_block(&warnings));
            Ok(response)
        }
    }

    /// Put the pre-write snapshot back on disk and drop it.
    async fn restore_previous(&self, path: &Path) -> Result<String, WriteError> {
        let backup = self
            .router
            .backups()
            .get(path)
            .await
            .map_err(|_| WriteError::BackupMissing(path.display().to_string()))?;

        write_file(path, &backup)?;
        self.router.backups().clear(path).await;
        Ok(format!("Restored {} from backup", path.display()))
    }
}

fn terse_summary(path: &Path, existed: bool, code: &str, warnings: &[String]) -> String {
    let verb = if existed { "Updated" } else { "Created" };
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string());
    let lines = code.lines().count();
    format!(
        "{verb} {name} ({lines} line{}){}",
        if lines == 1 { "" } else { "s" },
        render_warning_block(warnings)
    )
}

fn render_warning_block(warnings: &[String]) -> String {
    if warnings.is_empty() {
        return String::new();
    }
    let mut out = String::from("\n\nwarnings:");
    for warning in warnings {
        out.push_str(&format!("\n- {warning}"));
    }
    out
}

/// Write `contents` to `path`, creating parent directories (0755) and the
/// file itself (0644).
fn write_file(path: &Path, contents: &str) -> Result<(), WriteError> {
    let filesystem = |source: std::io::Error| WriteError::Filesystem {
        path: path.display().to_string(),
        source,
    };

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            let mut builder = std::fs::DirBuilder::new();
            builder.recursive(true);
            #[cfg(unix)]
            {
                use std::os::unix::fs::DirBuilderExt;
                builder.mode(0o755);
            }
            builder.create(parent).map_err(filesystem)?;
        }
    }

    use std::io::Write;
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o644);
    }
    let mut file = options.open(path).map_err(filesystem)?;
    file.write_all(contents.as_bytes()).map_err(filesystem)?;
    Ok(())
}
