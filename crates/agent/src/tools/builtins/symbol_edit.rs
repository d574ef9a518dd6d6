//! Symbol-scoped edit tool.
//!
//! Locates a function/class/type definition block by name — tree-sitter for
//! the grammars we ship, indentation-bounded regex for everything else — and
//! replaces the whole block.

use super::helpers::compact_diff;
use crate::tools::{Tool, ToolContext, ToolKind, ToolResult, require_str};
use async_trait::async_trait;
use codex::ToolDefinition;
use regex::Regex;
use serde_json::{Value, json};
use tree_sitter::{Language, Node, Parser};

/// 1-based inclusive line span of a symbol definition.
type Span = (usize, usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SymbolKind {
    All,
    Function,
    Class,
}

impl SymbolKind {
    fn parse(s: &str) -> Self {
        match s {
            "function" => SymbolKind::Function,
            "class" => SymbolKind::Class,
            _ => SymbolKind::All,
        }
    }

    fn accepts(&self, node_kind: &str) -> bool {
        let is_function = matches!(
            node_kind,
            "function_definition"
                | "function_declaration"
                | "function_item"
                | "method_definition"
                | "lexical_declaration"
                | "variable_declaration"
        );
        let is_type = matches!(
            node_kind,
            "class_definition"
                | "class_declaration"
                | "struct_item"
                | "enum_item"
                | "trait_item"
                | "impl_item"
                | "type_item"
                | "interface_declaration"
                | "type_alias_declaration"
                | "enum_declaration"
        );
        match self {
            SymbolKind::All => is_function || is_type,
            SymbolKind::Function => is_function,
            SymbolKind::Class => is_type,
        }
    }
}

fn language_for(path: &str) -> Option<Language> {
    let ext = path.rsplit('.').next()?.to_lowercase();
    match ext.as_str() {
        "py" | "pyi" => Some(tree_sitter_python::LANGUAGE.into()),
        "rs" => Some(tree_sitter_rust::LANGUAGE.into()),
        "ts" => Some(tree_sitter_typescript::LANGUAGE_TYPESCRIPT.into()),
        "tsx" => Some(tree_sitter_typescript::LANGUAGE_TSX.into()),
        _ => None,
    }
}

fn node_matches_symbol(node: Node<'_>, source: &str, symbol: &str) -> bool {
    if let Some(name) = node.child_by_field_name("name") {
        if let Ok(text) = name.utf8_text(source.as_bytes()) {
            return text == symbol;
        }
    }
    // Declarations without a direct name field (e.g. `const f = () => {}`):
    // fall back to a word-boundary match in the node's first line.
    let text = &source[node.start_byte()..node.end_byte()];
    let first_line = text.lines().next().unwrap_or("");
    Regex::new(&format!(r"\b{}\b", regex::escape(symbol)))
        .map(|re| re.is_match(first_line))
        .unwrap_or(false)
}

fn tree_sitter_spans(content: &str, symbol: &str, kind: SymbolKind, lang: Language) -> Vec<Span> {
    let mut parser = Parser::new();
    if parser.set_language(&lang).is_err() {
        return Vec::new();
    }
    let Some(tree) = parser.parse(content, None) else {
        return Vec::new();
    };
    let mut spans = Vec::new();
    let mut stack = vec![tree.root_node()];
    while let Some(node) = stack.pop() {
        if kind.accepts(node.kind()) && node_matches_symbol(node, content, symbol) {
            // Include a python decorated_definition wrapper when present so
            // decorators are replaced along with the body.
            let target = match node.parent() {
                Some(parent) if parent.kind() == "decorated_definition" => parent,
                _ => node,
            };
            spans.push((
                target.start_position().row + 1,
                target.end_position().row + 1,
            ));
        }
        let mut cursor = node.walk();
        let children: Vec<Node<'_>> = node.children(&mut cursor).collect();
        stack.extend(children);
    }
    spans.sort();
    spans.dedup();
    spans
}

/// Regex fallback: anchor on a declaration line, extend while indentation is
/// deeper than the anchor.
fn regex_spans(content: &str, symbol: &str, kind: SymbolKind) -> Vec<Span> {
    let sym = regex::escape(symbol);
    let mut patterns: Vec<String> = Vec::new();
    if matches!(kind, SymbolKind::All | SymbolKind::Function) {
        patterns.push(format!(r"^\s*(?:export\s+)?(?:async\s+)?function\s+{}\s*\(", sym));
        patterns.push(format!(
            r"^\s*(?:export\s+)?(?:const|let|var)\s+{}\s*=\s*(?:async\s*)?\(",
            sym
        ));
        patterns.push(format!(r"^\s*(?:async\s+)?def\s+{}\s*\(", sym));
        patterns.push(format!(r"^\s*(?:pub(?:\([^)]*\))?\s+)?(?:async\s+)?fn\s+{}\b", sym));
    }
    if matches!(kind, SymbolKind::All | SymbolKind::Class) {
        for anchor in ["class", "interface", "type", "struct", "enum", "trait"] {
            patterns.push(format!(r"^\s*(?:export\s+)?(?:pub(?:\([^)]*\))?\s+)?{}\s+{}\b", anchor, sym));
        }
    }
    let compiled: Vec<Regex> = patterns.iter().filter_map(|p| Regex::new(p).ok()).collect();

    let lines: Vec<&str> = content.lines().collect();
    let mut spans = Vec::new();
    for (i, line) in lines.iter().enumerate() {
        if !compiled.iter().any(|re| re.is_match(line)) {
            continue;
        }
        let base_indent = line.len() - line.trim_start_matches(' ').len();
        let mut end = i + 1;
        let mut j = i + 1;
        while j < lines.len() {
            let ln = lines[j];
            if ln.trim().is_empty() {
                end = j + 1;
                j += 1;
                continue;
            }
            let indent = ln.len() - ln.trim_start_matches(' ').len();
            if indent <= base_indent && !ln.trim_start().starts_with(['@', '#', '}']) {
                break;
            }
            end = j + 1;
            j += 1;
            if indent <= base_indent && ln.trim_start().starts_with('}') {
                break;
            }
        }
        spans.push((i + 1, end));
    }
    spans
}

pub struct SymbolEditTool;

#[async_trait]
impl Tool for SymbolEditTool {
    fn name(&self) -> &str {
        "symbol_edit"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            self.name(),
            "Replace an entire function/class/type definition block by symbol \
             name. More robust than edit_file for whole-symbol rewrites.",
            json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string"},
                    "symbol": {"type": "string"},
                    "new_string": {"type": "string", "description": "Full replacement for the symbol block"},
                    "kind": {"type": "string", "enum": ["all", "function", "class"], "default": "all"},
                    "occurrence": {"type": "integer", "default": 1}
                },
                "required": ["path", "symbol", "new_string"]
            }),
        )
    }

    fn kind(&self) -> ToolKind {
        ToolKind::FileMutating
    }

    async fn execute(&self, input: Value, ctx: &ToolContext) -> ToolResult {
        let path = match require_str(&input, "path") {
            Ok(p) => p,
            Err(e) => return e,
        };
        let symbol = match require_str(&input, "symbol") {
            Ok(s) => s.trim(),
            Err(e) => return e,
        };
        let new_string = match input.get("new_string").and_then(Value::as_str) {
            Some(s) => s,
            None => return ToolResult::err("new_string is required"),
        };
        let kind = SymbolKind::parse(
            input.get("kind").and_then(Value::as_str).unwrap_or("all"),
        );
        let occurrence = input
            .get("occurrence")
            .and_then(Value::as_u64)
            .map(|v| v.max(1) as usize)
            .unwrap_or(1);

        if !ctx.backend.file_exists(path).await {
            return ToolResult::err(format!("File not found: {}", path));
        }
        let content = match ctx.backend.read_file(path).await {
            Ok(c) => c,
            Err(e) => return ToolResult::err(format!("Failed to read {}: {}", path, e)),
        };

        let mut spans = match language_for(path) {
            Some(lang) => tree_sitter_spans(&content, symbol, kind, lang),
            None => Vec::new(),
        };
        if spans.is_empty() {
            spans = regex_spans(&content, symbol, kind);
        }
        if spans.is_empty() {
            return ToolResult::err(format!("Symbol '{}' not found in {}", symbol, path));
        }
        if occurrence > spans.len() {
            return ToolResult::err(format!(
                "occurrence {} out of range (found {} matches)",
                occurrence,
                spans.len()
            ));
        }

        let (start, end) = spans[occurrence - 1];
        let lines: Vec<&str> = content.lines().collect();
        let mut replacement = new_string.to_string();
        if !replacement.is_empty() && !replacement.ends_with('\n') {
            replacement.push('\n');
        }
        let mut new_content = String::new();
        for line in &lines[..start - 1] {
            new_content.push_str(line);
            new_content.push('\n');
        }
        new_content.push_str(&replacement);
        for line in &lines[end.min(lines.len())..] {
            new_content.push_str(line);
            new_content.push('\n');
        }

        if let Err(e) = ctx.backend.write_file(path, &new_content).await {
            return ToolResult::err(format!("Failed to write {}: {}", path, e));
        }

        let summary = format!(
            "Applied symbol_edit to {} ({}, lines {}-{})",
            path, symbol, start, end
        );
        let diff_text = compact_diff(&content, &new_content, path, 60);
        if diff_text.is_empty() {
            ToolResult::ok(summary)
        } else {
            ToolResult::ok(format!("{}\n{}", summary, diff_text))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Backend, LocalBackend};
    use std::sync::Arc;
    use tempfile::TempDir;

    #[test]
    fn python_span_via_tree_sitter() {
        let source = "import os\n\ndef keep():\n    pass\n\ndef target(x):\n    return x + 1\n\ndef after():\n    pass\n";
        let spans = tree_sitter_spans(
            source,
            "target",
            SymbolKind::Function,
            tree_sitter_python::LANGUAGE.into(),
        );
        assert_eq!(spans, vec![(6, 7)]);
    }

    #[test]
    fn rust_struct_span() {
        let source = "pub struct Keep;\n\npub struct Target {\n    pub x: u32,\n}\n";
        let spans = tree_sitter_spans(
            source,
            "Target",
            SymbolKind::Class,
            tree_sitter_rust::LANGUAGE.into(),
        );
        assert_eq!(spans, vec![(3, 5)]);
    }

    #[test]
    fn regex_fallback_bounds_by_indent() {
        let source = "def other():\n    pass\n\ndef target():\n    a = 1\n    return a\n\ndef next_fn():\n    pass\n";
        let spans = regex_spans(source, "target", SymbolKind::Function);
        assert_eq!(spans, vec![(4, 7)]);
    }

    #[tokio::test]
    async fn replaces_whole_block() {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(LocalBackend::new(dir.path()));
        backend
            .write_file(
                "m.py",
                "def alpha():\n    return 1\n\ndef beta():\n    return 2\n",
            )
            .await
            .unwrap();
        let ctx = ToolContext::new(backend.clone());
        let result = SymbolEditTool
            .execute(
                json!({
                    "path": "m.py",
                    "symbol": "beta",
                    "new_string": "def beta():\n    return 20"
                }),
                &ctx,
            )
            .await;
        assert!(result.success, "{:?}", result);
        let content = backend.read_file("m.py").await.unwrap();
        assert!(content.contains("return 20"));
        assert!(content.contains("return 1"));
        assert!(!content.contains("return 2\n\n"));
    }

    #[tokio::test]
    async fn missing_symbol_errors() {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(LocalBackend::new(dir.path()));
        backend.write_file("m.py", "x = 1\n").await.unwrap();
        let ctx = ToolContext::new(backend);
        let result = SymbolEditTool
            .execute(
                json!({"path": "m.py", "symbol": "ghost", "new_string": "y = 2"}),
                &ctx,
            )
            .await;
        assert!(!result.success);
        assert!(result.text().contains("not found"));
    }
}
