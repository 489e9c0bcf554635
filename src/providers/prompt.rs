//! Shared prompt composition for all provider adapters.
//!
//! The full prompt is assembled in a fixed order: context-file blocks,
//! the existing output-file block (if the file already has content), then
//! the generation instruction. The output path itself is never included as
//! context, and unreadable context files are skipped with a warning rather
//! than failing the request.

use std::path::{Component, Path, PathBuf};

use crate::language::language_for_path;

/// Inputs to prompt composition.
#[derive(Debug)]
pub struct PromptInput<'a> {
    /// The generation instruction from the client.
    pub instruction: &'a str,
    /// File the generated code will be written to.
    pub output_path: &'a Path,
    /// Explicit language override; extension detection applies otherwise.
    pub language: Option<&'a str>,
    /// Auxiliary files to ground the model.
    pub context_paths: &'a [PathBuf],
    /// Current contents of the output file, when it exists.
    pub existing_content: Option<&'a str>,
}

/// A composed prompt ready for any adapter.
#[derive(Debug, Clone)]
pub struct BuiltPrompt {
    pub system: String,
    pub user: String,
    /// Resolved target language name.
    pub language: String,
    /// Non-fatal notes gathered while reading context files.
    pub warnings: Vec<String>,
}

const SYSTEM_PROMPT: &str = "You are a code generation engine. Respond with only the source code \
for the requested file. Do not wrap the code in markdown fences, do not add a language tag, and \
do not include any explanation or commentary.";

/// Normalize a path for comparison without touching the filesystem:
/// resolve `.` and `..` components lexically.
pub fn clean_path(path: &Path) -> PathBuf {
    let mut cleaned = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                cleaned.pop();
            }
            other => cleaned.push(other.as_os_str()),
        }
    }
    cleaned
}

/// Compose the system and user prompts for one generation attempt.
pub fn build_prompt(input: &PromptInput<'_>) -> BuiltPrompt {
    let language = input
        .language
        .map(|l| l.to_string())
        .unwrap_or_else(|| language_for_path(input.output_path).to_string());

    let mut warnings = Vec::new();
    let mut user = String::new();
    let output_clean = clean_path(input.output_path);

    for context_path in input.context_paths {
        if clean_path(context_path) == output_clean {
            continue;
        }
        match std::fs::read_to_string(context_path) {
            Ok(contents) => {
                let tag = language_for_path(context_path);
                user.push_str(&format!(
                    "Context file {}:\n```{}\n{}\n```\n\n",
                    context_path.display(),
                    tag,
                    contents.trim_end()
                ));
            }
            Err(err) => {
                warnings.push(format!(
                    "skipped unreadable context file {}: {}",
                    context_path.display(),
                    err
                ));
            }
        }
    }

    if let Some(existing) = input.existing_content.filter(|c| !c.is_empty()) {
        user.push_str(&format!(
            "Current contents of {}:\n```{}\n{}\n```\n\n",
            input.output_path.display(),
            language,
            existing.trim_end()
        ));
    }

    user.push_str(&format!(
        "Generate {} code for: {}",
        language, input.instruction
    ));

    BuiltPrompt {
        system: SYSTEM_PROMPT.to_string(),
        user,
        language,
        warnings,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn clean_path_resolves_dots() {
        assert_eq!(
            clean_path(Path::new("/a/b/../c/./d.rs")),
            PathBuf::from("/a/c/d.rs")
        );
        assert_eq!(clean_path(Path::new("/x/y.go")), PathBuf::from("/x/y.go"));
    }

    #[test]
    fn instruction_line_uses_detected_language() {
        let built = build_prompt(&PromptInput {
            instruction: "a hello world",
            output_path: Path::new("/tmp/main.go"),
            language: None,
            context_paths: &[],
            existing_content: None,
        });
        assert_eq!(built.language, "go");
        assert!(built.user.ends_with("Generate go code for: a hello world"));
    }

    #[test]
    fn explicit_language_overrides_extension() {
        let built = build_prompt(&PromptInput {
            instruction: "x",
            output_path: Path::new("/tmp/script.weird"),
            language: Some("python"),
            context_paths: &[],
            existing_content: None,
        });
        assert_eq!(built.language, "python");
    }

    #[test]
    fn output_path_never_appears_as_context() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("main.py");
        std::fs::write(&output, "print('old')").unwrap();
        let helper = dir.path().join("helper.py");
        std::fs::write(&helper, "def help(): pass").unwrap();

        // Reference the output via a dotted path so only cleaned comparison
        // catches it.
        let dotted = dir.path().join(".").join("main.py");
        let context = vec![dotted, helper.clone()];
        let built = build_prompt(&PromptInput {
            instruction: "extend it",
            output_path: &output,
            language: None,
            context_paths: &context,
            existing_content: Some("print('old')"),
        });

        assert!(!built
            .user
            .contains(&format!("Context file {}", output.display())));
        assert!(built
            .user
            .contains(&format!("Context file {}", helper.display())));
        // The existing-file block still carries the output contents.
        assert!(built.user.contains("print('old')"));
    }

    #[test]
    fn unreadable_context_becomes_a_warning() {
        let built = build_prompt(&PromptInput {
            instruction: "x",
            output_path: Path::new("/tmp/out.rs"),
            language: None,
            context_paths: &[PathBuf::from("/no/such/file.rs")],
            existing_content: None,
        });
        assert_eq!(built.warnings.len(), 1);
        assert!(built.warnings[0].contains("/no/such/file.rs"));
    }

    #[test]
    fn block_order_is_context_then_existing_then_instruction() {
        let dir = tempfile::tempdir().unwrap();
        let helper = dir.path().join("lib.rs");
        let mut f = std::fs::File::create(&helper).unwrap();
        writeln!(f, "pub fn util() {{}}").unwrap();

        let context = vec![helper.clone()];
        let built = build_prompt(&PromptInput {
            instruction: "add a main",
            output_path: Path::new("/tmp/main.rs"),
            language: None,
            context_paths: &context,
            existing_content: Some("fn main() {}"),
        });

        let context_at = built.user.find("Context file").unwrap();
        let existing_at = built.user.find("Current contents").unwrap();
        let instruction_at = built.user.find("Generate rust code for:").unwrap();
        assert!(context_at < existing_at);
        assert!(existing_at < instruction_at);
    }
}
