//! Shared helpers for the built-in tools: diffs, structure extraction, and
//! output shaping.

use imara_diff::intern::InternedInput;
use imara_diff::{Algorithm, UnifiedDiffBuilder, diff};

/// Compact unified diff for display in tool output, capped at `max_lines`.
pub fn compact_diff(old: &str, new: &str, path: &str, max_lines: usize) -> String {
    if old == new {
        return String::new();
    }
    let input = InternedInput::new(old, new);
    let body = diff(
        Algorithm::Histogram,
        &input,
        UnifiedDiffBuilder::new(&input),
    );
    if body.is_empty() {
        return String::new();
    }
    let header = format!("--- {}\n+++ {}\n", path, path);
    let mut lines: Vec<&str> = body.lines().collect();
    let total = lines.len();
    if total > max_lines {
        lines.truncate(max_lines);
        let mut out = header;
        out.push_str(&lines.join("\n"));
        out.push_str(&format!("\n... ({} more diff lines)", total - max_lines));
        return out;
    }
    format!("{}{}", header, body.trim_end())
}

const IMPORT_PREFIXES: &[&str] = &["import ", "from ", "use "];

/// Declaration prefixes across the languages the agent touches.
const DECLARATION_PREFIXES: &[&str] = &[
    "class ",
    "def ",
    "async def ",
    "function ",
    "export ",
    "const ",
    "let ",
    "var ",
    "pub fn ",
    "fn ",
    "pub struct ",
    "struct ",
    "pub enum ",
    "enum ",
    "impl ",
    "trait ",
    "pub trait ",
    "type ",
    "interface ",
    "mod ",
    "pub mod ",
];

/// True if a stripped line opens a structural declaration.
pub fn is_structural_line(stripped: &str) -> bool {
    IMPORT_PREFIXES.iter().any(|p| stripped.starts_with(p))
        || DECLARATION_PREFIXES.iter().any(|p| stripped.starts_with(p))
}

/// Extract a line-numbered structural summary: imports (near the top of the
/// file) plus class/function/type headings. Used for large-file overviews and
/// cold tool-result compression.
pub fn extract_structure(lines: &[&str]) -> String {
    let mut structure = Vec::new();
    for (i, line) in lines.iter().enumerate() {
        let stripped = line.trim_start();
        let is_import = IMPORT_PREFIXES.iter().any(|p| stripped.starts_with(p)) && i < 50;
        let is_decl = DECLARATION_PREFIXES.iter().any(|p| stripped.starts_with(p));
        let is_decorator = stripped.starts_with('@')
            && lines
                .get(i + 1)
                .map(|next| {
                    let n = next.trim_start();
                    DECLARATION_PREFIXES.iter().any(|p| n.starts_with(p))
                })
                .unwrap_or(false);
        if is_import || is_decl || is_decorator {
            structure.push(format!("{:6}|{}", i + 1, line.trim_end()));
        }
    }
    structure.join("\n")
}

/// Cap command output at roughly `max_chars`, preserving head and tail.
pub fn shape_command_output(output: &str, max_chars: usize) -> String {
    if output.len() <= max_chars {
        return output.to_string();
    }
    let lines: Vec<&str> = output.lines().collect();
    if lines.len() > 200 {
        let head = lines[..100].join("\n");
        let tail = lines[lines.len() - 50..].join("\n");
        format!(
            "{}\n\n... [{} lines truncated] ...\n\n{}",
            head,
            lines.len() - 150,
            tail
        )
    } else {
        let head_end = output
            .char_indices()
            .nth(max_chars / 2)
            .map(|(i, _)| i)
            .unwrap_or(output.len());
        let tail_chars = max_chars / 4;
        let tail_start = output
            .char_indices()
            .rev()
            .nth(tail_chars)
            .map(|(i, _)| i)
            .unwrap_or(0);
        format!(
            "{}\n\n... [truncated] ...\n\n{}",
            &output[..head_end],
            &output[tail_start..]
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diff_identical_is_empty() {
        assert_eq!(compact_diff("same\n", "same\n", "f.txt", 60), "");
    }

    #[test]
    fn diff_shows_change() {
        let d = compact_diff("a\nb\nc\n", "a\nX\nc\n", "f.txt", 60);
        assert!(d.contains("--- f.txt"));
        assert!(d.contains("-b"));
        assert!(d.contains("+X"));
    }

    #[test]
    fn diff_caps_lines() {
        let old: String = (0..200).map(|i| format!("line{}\n", i)).collect();
        let new: String = (0..200).map(|i| format!("changed{}\n", i)).collect();
        let d = compact_diff(&old, &new, "big.txt", 20);
        assert!(d.contains("more diff lines"));
    }

    #[test]
    fn structure_picks_declarations() {
        let source = "use std::fmt;\n\npub struct Thing {\n    x: u32,\n}\n\nimpl Thing {\n    pub fn new() -> Self {\n        Self { x: 0 }\n    }\n}\n";
        let lines: Vec<&str> = source.lines().collect();
        let s = extract_structure(&lines);
        assert!(s.contains("pub struct Thing"));
        assert!(s.contains("pub fn new"));
        assert!(!s.contains("x: u32"));
    }

    #[test]
    fn shape_output_preserves_head_and_tail() {
        let big: String = (0..500).map(|i| format!("row {}\n", i)).collect();
        let shaped = shape_command_output(&big, 1000);
        assert!(shaped.contains("row 0"));
        assert!(shaped.contains("row 499"));
        assert!(shaped.contains("truncated"));
    }
}
