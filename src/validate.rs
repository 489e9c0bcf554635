//! Per-language syntax validation for generated code.
//!
//! Validators are intentionally structural: they catch the failure modes
//! models actually produce (truncated output, unbalanced delimiters, a
//! mangled package/import header, markdown remnants) rather than attempting
//! a full parse. JSON and YAML get real parses since the serde parsers are
//! already on hand. Diagnostics are formatted into a block that the router
//! feeds back to the model on retry.

use std::path::Path;

use crate::language::language_for_path;

/// Outcome of a validation pass.
#[derive(Debug, Clone)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<String>,
}

impl ValidationReport {
    pub fn ok() -> Self {
        Self {
            valid: true,
            errors: Vec::new(),
        }
    }

    pub fn fail(errors: Vec<String>) -> Self {
        Self {
            valid: false,
            errors,
        }
    }
}

/// A language-specific syntax checker with an optional auto-fixer.
pub trait Validator: Send + Sync {
    fn validate(&self, code: &str, path: &Path) -> ValidationReport;

    fn can_auto_fix(&self) -> bool {
        false
    }

    /// Attempt a mechanical repair. Returns `None` when nothing applies.
    fn auto_fix(&self, _code: &str) -> Option<String> {
        None
    }
}

/// Look up the validator for the language a path maps to. Unknown languages
/// bypass validation entirely.
pub fn validator_for_path(path: &Path) -> Option<&'static dyn Validator> {
    validator_for_language(language_for_path(path))
}

pub fn validator_for_language(language: &str) -> Option<&'static dyn Validator> {
    static GO: GoValidator = GoValidator;
    static PYTHON: PythonValidator = PythonValidator;
    static RUST: BracedValidator = BracedValidator {
        quotes: &['"'],
        strip_char_literals: true,
    };
    static C_LIKE: BracedValidator = BracedValidator {
        quotes: &['"', '\'', '`'],
        strip_char_literals: false,
    };
    static JSON: JsonValidator = JsonValidator;
    static YAML: YamlValidator = YamlValidator;
    match language {
        "go" => Some(&GO),
        "python" => Some(&PYTHON),
        "rust" => Some(&RUST),
        "javascript" | "typescript" | "jsx" | "tsx" | "java" | "c" | "cpp" | "csharp" => {
            Some(&C_LIKE)
        }
        "json" => Some(&JSON),
        "yaml" => Some(&YAML),
        _ => None,
    }
}

/// Render diagnostics into the block appended to retry prompts.
pub fn format_errors(language: &str, errors: &[String]) -> String {
    let mut out = format!("The {language} code has syntax problems:");
    for error in errors {
        out.push_str(&format!("\n- {error}"));
    }
    out
}

// ---------------------------------------------------------------------------
// Shared structural checks
// ---------------------------------------------------------------------------

/// Check (), [] and {} balance, skipping string literals and line comments.
/// `line_comment` is the comment introducer; `quotes` lists the string
/// delimiters recognised for the language. String tracking is per-line, so
/// delimiters inside multi-line strings can slip through; the check errs
/// toward missing problems rather than inventing them.
fn check_delimiters(code: &str, line_comment: &str, quotes: &[char]) -> Vec<String> {
    let mut errors = Vec::new();
    let mut stack: Vec<(char, usize)> = Vec::new();

    for (line_no, line) in code.lines().enumerate() {
        let mut chars = line.char_indices().peekable();
        let mut in_string: Option<char> = None;
        while let Some((col, ch)) = chars.next() {
            if let Some(quote) = in_string {
                if ch == '\\' {
                    chars.next();
                } else if ch == quote {
                    in_string = None;
                }
                continue;
            }
            if !line_comment.is_empty() && line[col..].starts_with(line_comment) {
                break;
            }
            match ch {
                c if quotes.contains(&c) => in_string = Some(c),
                '(' | '[' | '{' => stack.push((ch, line_no + 1)),
                ')' | ']' | '}' => {
                    let expected = match ch {
                        ')' => '(',
                        ']' => '[',
                        _ => '{',
                    };
                    match stack.pop() {
                        Some((open, _)) if open == expected => {}
                        Some((open, opened_at)) => errors.push(format!(
                            "line {}: found '{}' closing '{}' opened on line {}",
                            line_no + 1,
                            ch,
                            open,
                            opened_at
                        )),
                        None => errors
                            .push(format!("line {}: unmatched closing '{}'", line_no + 1, ch)),
                    }
                }
                _ => {}
            }
        }
    }

    for (open, line_no) in stack {
        errors.push(format!("line {line_no}: '{open}' is never closed"));
    }
    errors
}

fn check_markdown_remnants(code: &str) -> Vec<String> {
    if code.contains("```") {
        vec!["output still contains markdown code fences".to_string()]
    } else {
        Vec::new()
    }
}

/// Remove Rust character literals (`'a'`, `'\n'`, `'{'`) so apostrophes in
/// lifetimes are not mistaken for string openers and bracket characters in
/// char literals do not unbalance the check.
fn strip_rust_char_literals(code: &str) -> String {
    use std::sync::OnceLock;
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    let re = RE.get_or_init(|| regex::Regex::new(r"'(\\.|[^'\\])'").expect("char literal regex"));
    re.replace_all(code, "' '").to_string()
}

// ---------------------------------------------------------------------------
// Go
// ---------------------------------------------------------------------------

struct GoValidator;

impl Validator for GoValidator {
    fn validate(&self, code: &str, _path: &Path) -> ValidationReport {
        let mut errors = check_markdown_remnants(code);

        // A Go source file must open with a package clause.
        let first_code_line = code
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty() && !l.starts_with("//"));
        match first_code_line {
            Some(line) if line.starts_with("package ") => {}
            Some(line) => errors.push(format!(
                "file must begin with a package clause, found: {line}"
            )),
            None => errors.push("file is empty".to_string()),
        }

        errors.extend(check_delimiters(code, "//", &['"', '\'', '`']));
        if errors.is_empty() {
            ValidationReport::ok()
        } else {
            ValidationReport::fail(errors)
        }
    }
}

// ---------------------------------------------------------------------------
// Python
// ---------------------------------------------------------------------------

struct PythonValidator;

impl Validator for PythonValidator {
    fn validate(&self, code: &str, _path: &Path) -> ValidationReport {
        let mut errors = check_markdown_remnants(code);
        errors.extend(check_delimiters(code, "#", &['"', '\'']));

        let uses_tabs = code.lines().any(|l| l.starts_with('\t'));
        let uses_spaces = code.lines().any(|l| l.starts_with(' '));
        if uses_tabs && uses_spaces {
            errors.push("indentation mixes tabs and spaces".to_string());
        }

        // Block headers must end with a colon.
        let block_re = regex_for_python_blocks();
        for (line_no, line) in code.lines().enumerate() {
            let trimmed = line.trim();
            if block_re.is_match(trimmed)
                && !trimmed.ends_with(':')
                && !trimmed.ends_with('\\')
                && !trimmed.ends_with('(')
                && !trimmed.ends_with(',')
            {
                errors.push(format!(
                    "line {}: block statement is missing a trailing ':'",
                    line_no + 1
                ));
            }
        }

        if errors.is_empty() {
            ValidationReport::ok()
        } else {
            ValidationReport::fail(errors)
        }
    }

    fn can_auto_fix(&self) -> bool {
        true
    }

    /// Replace tab indentation with four spaces when the file mixes both.
    fn auto_fix(&self, code: &str) -> Option<String> {
        let uses_tabs = code.lines().any(|l| l.starts_with('\t'));
        let uses_spaces = code.lines().any(|l| l.starts_with(' '));
        if !(uses_tabs && uses_spaces) {
            return None;
        }
        let fixed: Vec<String> = code
            .lines()
            .map(|line| {
                let stripped = line.trim_start_matches('\t');
                let tabs = line.len() - stripped.len();
                format!("{}{}", "    ".repeat(tabs), stripped)
            })
            .collect();
        let mut out = fixed.join("\n");
        if code.ends_with('\n') {
            out.push('\n');
        }
        Some(out)
    }
}

fn regex_for_python_blocks() -> &'static regex::Regex {
    use std::sync::OnceLock;
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| {
        regex::Regex::new(r"^(def |class |if |elif |else\b|for |while |try\b|except|finally\b|with )")
            .expect("python block regex")
    })
}

// ---------------------------------------------------------------------------
// Brace-delimited languages (Rust, JS/TS, Java, C family)
// ---------------------------------------------------------------------------

struct BracedValidator {
    quotes: &'static [char],
    strip_char_literals: bool,
}

impl Validator for BracedValidator {
    fn validate(&self, code: &str, _path: &Path) -> ValidationReport {
        let mut errors = check_markdown_remnants(code);
        if code.trim().is_empty() {
            errors.push("file is empty".to_string());
        }
        let checked;
        let code = if self.strip_char_literals {
            checked = strip_rust_char_literals(code);
            checked.as_str()
        } else {
            code
        };
        errors.extend(check_delimiters(code, "//", self.quotes));
        if errors.is_empty() {
            ValidationReport::ok()
        } else {
            ValidationReport::fail(errors)
        }
    }
}

// ---------------------------------------------------------------------------
// JSON / YAML — full parses via the serde parsers
// ---------------------------------------------------------------------------

struct JsonValidator;

impl Validator for JsonValidator {
    fn validate(&self, code: &str, _path: &Path) -> ValidationReport {
        match serde_json::from_str::<serde_json::Value>(code) {
            Ok(_) => ValidationReport::ok(),
            Err(err) => ValidationReport::fail(vec![format!("invalid JSON: {err}")]),
        }
    }

    fn can_auto_fix(&self) -> bool {
        true
    }

    /// Drop trailing commas, the most common model slip in JSON output.
    fn auto_fix(&self, code: &str) -> Option<String> {
        use std::sync::OnceLock;
        static RE: OnceLock<regex::Regex> = OnceLock::new();
        let re = RE.get_or_init(|| regex::Regex::new(r",(\s*[}\]])").expect("trailing comma regex"));
        let fixed = re.replace_all(code, "$1").to_string();
        if fixed == code {
            None
        } else {
            Some(fixed)
        }
    }
}

struct YamlValidator;

impl Validator for YamlValidator {
    fn validate(&self, code: &str, _path: &Path) -> ValidationReport {
        match serde_yaml::from_str::<serde_yaml::Value>(code) {
            Ok(_) => ValidationReport::ok(),
            Err(err) => ValidationReport::fail(vec![format!("invalid YAML: {err}")]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn validate(language: &str, code: &str) -> ValidationReport {
        validator_for_language(language)
            .unwrap()
            .validate(code, &PathBuf::from("/tmp/x"))
    }

    #[test]
    fn go_requires_package_clause() {
        let report = validate("go", "pakage main\n\nfunc main() {}\n");
        assert!(!report.valid);
        assert!(report.errors[0].contains("package clause"));

        let report = validate("go", "// comment\npackage main\n\nfunc main() {}\n");
        assert!(report.valid);
    }

    #[test]
    fn unbalanced_braces_are_reported() {
        let report = validate("rust", "fn main() {\n    let x = 1;\n");
        assert!(!report.valid);
        assert!(report.errors.iter().any(|e| e.contains("never closed")));
    }

    #[test]
    fn braces_inside_strings_and_comments_are_ignored() {
        let report = validate(
            "rust",
            "fn main() {\n    let s = \"{\"; // also { here\n}\n",
        );
        assert!(report.valid, "errors: {:?}", report.errors);
    }

    #[test]
    fn rust_lifetimes_and_char_literals_do_not_confuse_the_check() {
        let code = "fn first(v: &[&'static str]) -> Vec<&'static str> {\n    \
                    v.iter().filter(|s| s.starts_with('{')).cloned().collect()\n}\n";
        let report = validate("rust", code);
        assert!(report.valid, "errors: {:?}", report.errors);
    }

    #[test]
    fn leftover_fences_fail_validation() {
        let report = validate("go", "```go\npackage main\n```\n");
        assert!(!report.valid);
    }

    #[test]
    fn python_mixed_indentation_is_auto_fixable() {
        let validator = validator_for_language("python").unwrap();
        let code = "def f():\n\treturn 1\n\ndef g():\n    return 2\n";
        let report = validator.validate(code, &PathBuf::from("/tmp/x.py"));
        assert!(!report.valid);
        assert!(validator.can_auto_fix());
        let fixed = validator.auto_fix(code).unwrap();
        let report = validator.validate(&fixed, &PathBuf::from("/tmp/x.py"));
        assert!(report.valid, "errors: {:?}", report.errors);
    }

    #[test]
    fn python_block_without_colon() {
        let report = validate("python", "def broken()\n    return 1\n");
        assert!(!report.valid);
        assert!(report.errors.iter().any(|e| e.contains("':'")));
    }

    #[test]
    fn json_parse_and_trailing_comma_fix() {
        let validator = validator_for_language("json").unwrap();
        let code = "{\"a\": 1, \"b\": [1, 2,],}";
        assert!(!validator.validate(code, &PathBuf::from("/x.json")).valid);
        let fixed = validator.auto_fix(code).unwrap();
        assert!(validator.validate(&fixed, &PathBuf::from("/x.json")).valid);
    }

    #[test]
    fn yaml_parse() {
        assert!(validate("yaml", "a: 1\nb:\n  - x\n").valid);
        assert!(!validate("yaml", "a: [unclosed\nb: }{\n").valid);
    }

    #[test]
    fn unknown_language_has_no_validator() {
        assert!(validator_for_language("text").is_none());
        assert!(validator_for_path(&PathBuf::from("/tmp/notes.txt")).is_none());
    }

    #[test]
    fn error_block_formatting() {
        let block = format_errors("go", &["line 3: '(' is never closed".to_string()]);
        assert!(block.starts_with("The go code has syntax problems:"));
        assert!(block.contains("- line 3"));
    }
}
