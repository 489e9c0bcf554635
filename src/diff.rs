//! Line-based diff used in write responses.
//!
//! Renders a compact unified-style diff: a header naming the file, `-` lines
//! for removals, `+` lines for additions, and up to three lines of unchanged
//! context around each change. Very large inputs fall back to a plain
//! removed-block/added-block rendering instead of the LCS walk.

/// Cell budget for the LCS table; beyond this the fallback rendering is used.
const MAX_LCS_CELLS: usize = 4_000_000;

/// Lines of unchanged context shown around each change.
const CONTEXT_LINES: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Keep,
    Remove,
    Add,
}

/// Render a diff between `old` and `new` for display to the client.
pub fn render_diff(path: &str, old: &str, new: &str) -> String {
    if old == new {
        return format!("--- {path}\n(no changes)");
    }

    let old_lines: Vec<&str> = old.lines().collect();
    let new_lines: Vec<&str> = new.lines().collect();

    let mut out = format!("--- {path} (previous)\n+++ {path} (new)\n");

    if old_lines.len().saturating_mul(new_lines.len()) > MAX_LCS_CELLS {
        for line in &old_lines {
            out.push_str(&format!("-{line}\n"));
        }
        for line in &new_lines {
            out.push_str(&format!("+{line}\n"));
        }
        return out.trim_end().to_string();
    }

    let script = edit_script(&old_lines, &new_lines);
    out.push_str(&render_script(&script, &old_lines, &new_lines));
    out.trim_end().to_string()
}

/// Standard LCS dynamic program, walked back into an edit script.
fn edit_script(old: &[&str], new: &[&str]) -> Vec<Op> {
    let n = old.len();
    let m = new.len();
    let mut table = vec![0u32; (n + 1) * (m + 1)];
    let idx = |i: usize, j: usize| i * (m + 1) + j;

    for i in (0..n).rev() {
        for j in (0..m).rev() {
            table[idx(i, j)] = if old[i] == new[j] {
                table[idx(i + 1, j + 1)] + 1
            } else {
                table[idx(i + 1, j)].max(table[idx(i, j + 1)])
            };
        }
    }

    let mut script = Vec::with_capacity(n + m);
    let (mut i, mut j) = (0, 0);
    while i < n && j < m {
        if old[i] == new[j] {
            script.push(Op::Keep);
            i += 1;
            j += 1;
        } else if table[idx(i + 1, j)] >= table[idx(i, j + 1)] {
            script.push(Op::Remove);
            i += 1;
        } else {
            script.push(Op::Add);
            j += 1;
        }
    }
    script.extend(std::iter::repeat(Op::Remove).take(n - i));
    script.extend(std::iter::repeat(Op::Add).take(m - j));
    script
}

fn render_script(script: &[Op], old: &[&str], new: &[&str]) -> String {
    // Mark which Keep positions are close enough to a change to show.
    let mut visible = vec![false; script.len()];
    for (pos, op) in script.iter().enumerate() {
        if *op != Op::Keep {
            let from = pos.saturating_sub(CONTEXT_LINES);
            let to = (pos + CONTEXT_LINES + 1).min(script.len());
            for slot in visible.iter_mut().take(to).skip(from) {
                *slot = true;
            }
        }
    }

    let mut out = String::new();
    let (mut i, mut j) = (0, 0);
    let mut in_gap = false;
    for (pos, op) in script.iter().enumerate() {
        match op {
            Op::Keep => {
                if visible[pos] {
                    out.push_str(&format!(" {}\n", old[i]));
                    in_gap = false;
                } else if !in_gap {
                    out.push_str("...\n");
                    in_gap = true;
                }
                i += 1;
                j += 1;
            }
            Op::Remove => {
                out.push_str(&format!("-{}\n", old[i]));
                i += 1;
                in_gap = false;
            }
            Op::Add => {
                out.push_str(&format!("+{}\n", new[j]));
                j += 1;
                in_gap = false;
            }
        }
    }
    out
}
