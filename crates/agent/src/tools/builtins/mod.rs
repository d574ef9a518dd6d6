//! Built-in tool implementations.

mod edit;
mod find_symbol;
pub mod helpers;
mod lint;
mod read_file;
mod search;
mod semantic_retrieve;
mod shell;
mod symbol_edit;
mod web_fetch;
mod write_file;

pub use edit::EditFileTool;
pub use find_symbol::FindSymbolTool;
pub use lint::LintTool;
pub use read_file::ReadFileTool;
pub use search::{GlobTool, ListDirTool, ProjectTreeTool, SearchTool};
pub use semantic_retrieve::SemanticRetrieveTool;
pub use shell::ShellTool;
pub use symbol_edit::SymbolEditTool;
pub use web_fetch::WebFetchTool;
pub use write_file::WriteFileTool;

use super::Tool;
use std::sync::Arc;

/// The full built-in tool set, in registry order.
pub fn all() -> Vec<Arc<dyn Tool>> {
    vec![
        Arc::new(ReadFileTool),
        Arc::new(WriteFileTool),
        Arc::new(EditFileTool),
        Arc::new(SymbolEditTool),
        Arc::new(ShellTool),
        Arc::new(SearchTool),
        Arc::new(GlobTool),
        Arc::new(ListDirTool),
        Arc::new(ProjectTreeTool),
        Arc::new(FindSymbolTool),
        Arc::new(LintTool),
        Arc::new(SemanticRetrieveTool),
        Arc::new(WebFetchTool::new()),
    ]
}
