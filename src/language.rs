//! Target-language detection and model-output cleanup.

use std::path::Path;

/// Map a file extension to the language name used in prompts, fenced blocks
/// and validator selection. Unknown extensions map to `text`.
pub fn language_for_path(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("rs") => "rust",
        Some("go") => "go",
        Some("py") => "python",
        Some("js") | Some("mjs") | Some("cjs") => "javascript",
        Some("ts") => "typescript",
        Some("jsx") => "jsx",
        Some("tsx") => "tsx",
        Some("java") => "java",
        Some("c") | Some("h") => "c",
        Some("cc") | Some("cpp") | Some("cxx") | Some("hpp") => "cpp",
        Some("cs") => "csharp",
        Some("rb") => "ruby",
        Some("php") => "php",
        Some("swift") => "swift",
        Some("kt") | Some("kts") => "kotlin",
        Some("sh") | Some("bash") => "bash",
        Some("sql") => "sql",
        Some("html") | Some("htm") => "html",
        Some("css") => "css",
        Some("json") => "json",
        Some("yaml") | Some("yml") => "yaml",
        Some("toml") => "toml",
        Some("xml") => "xml",
        Some("md") | Some("markdown") => "markdown",
        _ => "text",
    }
}

/// Remove markdown code fences wrapping a model response.
///
/// Strips the outermost fence pair (with any language tag on the opening
/// fence) and repeats until the text no longer changes, so nested
/// fences-in-fences are flattened and the function is idempotent:
/// `strip(strip(x)) == strip(x)`.
pub fn strip_code_fences(text: &str) -> String {
    let mut current = text.trim().to_string();
    loop {
        let stripped = strip_once(&current);
        if stripped == current {
            return current;
        }
        current = stripped;
    }
}

fn strip_once(text: &str) -> String {
    let trimmed = text.trim();
    if !trimmed.starts_with("```") {
        return trimmed.to_string();
    }

    let mut lines: Vec<&str> = trimmed.lines().collect();
    if lines.len() < 2 {
        // A lone fence marker carries no code.
        return trimmed.trim_matches('`').trim().to_string();
    }

    // Opening fence, with or without a language tag.
    lines.remove(0);
    // Closing fence, if present.
    if lines
        .last()
        .map(|l| l.trim().chars().all(|c| c == '`') && l.trim().starts_with("```"))
        .unwrap_or(false)
    {
        lines.pop();
    }
    lines.join("\n").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn extension_table() {
        assert_eq!(language_for_path(&PathBuf::from("/a/b/main.go")), "go");
        assert_eq!(language_for_path(&PathBuf::from("lib.rs")), "rust");
        assert_eq!(language_for_path(&PathBuf::from("x.PY")), "python");
        assert_eq!(language_for_path(&PathBuf::from("notes.weird")), "text");
        assert_eq!(language_for_path(&PathBuf::from("Makefile")), "text");
    }

    #[test]
    fn strips_plain_fence() {
        assert_eq!(strip_code_fences("```\nprint('hi')\n```"), "print('hi')");
    }

    #[test]
    fn strips_fence_with_language_tag() {
        assert_eq!(
            strip_code_fences("```python\nprint('hi')\n```"),
            "print('hi')"
        );
    }

    #[test]
    fn unfenced_text_passes_through() {
        assert_eq!(strip_code_fences("package main\n"), "package main");
    }

    #[test]
    fn flattens_nested_fences() {
        let nested = "```\n```go\npackage main\n```\n```";
        assert_eq!(strip_code_fences(nested), "package main");
    }

    #[test]
    fn stripping_is_idempotent() {
        let cases = [
            "```rust\nfn main() {}\n```",
            "no fences at all",
            "```\n```\n",
            "  ```js\nlet x = 1;\n```  ",
            "```",
        ];
        for case in cases {
            let once = strip_code_fences(case);
            let twice = strip_code_fences(&once);
            assert_eq!(once, twice, "not idempotent for {case:?}");
        }
    }

    #[test]
    fn interior_fences_survive_when_not_wrapping() {
        let text = "let s = \"x\";\n```\nnot a wrapper";
        assert_eq!(strip_code_fences(text), text.trim());
    }
}
