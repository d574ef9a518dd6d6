//! Plan document model and parsing.
//!
//! The plan document contract: an H1 title (boilerplate prefixes stripped), a
//! `## Steps` section of numbered items naming file paths in backticks, and a
//! verification section for high-complexity tasks. `<plan>` envelopes are
//! stripped before parsing.

use crate::decompose::Phase;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// A generated plan: the parsed steps, the source document, and metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub steps: Vec<String>,
    pub text: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    pub decomposition: Vec<Phase>,
}

/// Strip a `<plan>…</plan>` or `<updated_plan>…</updated_plan>` envelope.
pub fn extract_plan(text: &str) -> Option<String> {
    static ENVELOPE: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r"(?s)<(plan|updated_plan)>\s*(.*?)\s*</(plan|updated_plan)>").unwrap()
    });
    ENVELOPE
        .captures(text)
        .map(|c| c.get(2).unwrap().as_str().to_string())
}

/// Drop conversational preamble before the first markdown heading.
pub fn strip_plan_preamble(text: &str) -> String {
    let lines: Vec<&str> = text.lines().collect();
    for (i, line) in lines.iter().enumerate() {
        if line.trim_start().starts_with('#') {
            return lines[i..].join("\n");
        }
    }
    text.to_string()
}

/// Extract a human-readable title from the plan's first heading.
pub fn extract_plan_title(plan_text: &str) -> String {
    const PREFIXES: &[&str] = &[
        "Implementation Plan:",
        "Implementation Plan —",
        "Implementation Plan for",
        "Implementation Plan",
        "Plan:",
        "Plan —",
        "Plan for",
        "Audit Findings:",
        "Audit:",
        "Phase 1:",
        "Step 1:",
        "Summary:",
        "Overview:",
    ];
    for line in plan_text.lines().take(10) {
        let stripped = line.trim();
        if !stripped.starts_with('#') {
            continue;
        }
        let mut title = stripped.trim_start_matches('#').trim().to_string();
        for prefix in PREFIXES {
            if title.to_lowercase().starts_with(&prefix.to_lowercase()) {
                title = title[prefix.len()..]
                    .trim()
                    .trim_start_matches(['—', '-', ':'])
                    .trim()
                    .to_string();
                break;
            }
        }
        let title = title.trim_matches(['"', '\'', '`']).to_string();
        if !title.is_empty() {
            return crate::history::take_chars(&title, 80).to_string();
        }
    }
    // Fallback: first non-empty, non-tag line.
    for line in plan_text.lines().take(5) {
        let stripped = line.trim();
        if !stripped.is_empty() && !stripped.starts_with('<') && !stripped.starts_with("```") {
            let cleaned = stripped
                .trim_start_matches('#')
                .trim()
                .trim_matches(['"', '\'', '`']);
            if !cleaned.is_empty() {
                return crate::history::take_chars(cleaned, 60).to_string();
            }
        }
    }
    "Plan".to_string()
}

static NUMBERED: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d+[.)]\s+").unwrap());
static TABLE_ROW: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\|.*\|$").unwrap());
static ACTION_TAG: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^[-*]\s+\*\*\[(EDIT|CREATE|RUN|VERIFY|DELETE)\]\*\*").unwrap()
});

/// Parse the ordered step list out of a plan document.
///
/// Prefers a `## Steps` section; numbered lines start steps, indented or
/// bullet continuation lines join the current step; explicit action tags are
/// the last resort.
pub fn parse_plan_steps(plan_text: &str) -> Vec<String> {
    static SECTION: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r"(?im)^##\s*(?:implementation\s+steps|steps)\s*$\n").unwrap()
    });
    static NEXT_HEADER: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^##\s+").unwrap());
    let steps_section = SECTION.find(plan_text).map(|m| {
        let rest = &plan_text[m.end()..];
        let end = NEXT_HEADER.find(rest).map(|nm| nm.start()).unwrap_or(rest.len());
        rest[..end].trim().to_string()
    });
    let target = steps_section.as_deref().unwrap_or(plan_text);

    let mut steps: Vec<String> = Vec::new();
    for raw_line in target.lines() {
        let line = raw_line.trim();
        if line.is_empty() {
            continue;
        }
        if NUMBERED.is_match(line) {
            steps.push(line.to_string());
        } else if !steps.is_empty() && !line.starts_with('#') && !TABLE_ROW.is_match(line) {
            let is_continuation = raw_line.starts_with(' ')
                || raw_line.starts_with('\t')
                || line.starts_with('-')
                || line.starts_with('*');
            if is_continuation {
                let last = steps.last_mut().unwrap();
                last.push(' ');
                last.push_str(line);
            }
        }
    }

    if steps.is_empty() {
        for raw_line in target.lines() {
            let line = raw_line.trim();
            if ACTION_TAG.is_match(line) {
                steps.push(line.to_string());
            }
        }
    }

    if steps.is_empty() {
        for raw_line in plan_text.lines() {
            let line = raw_line.trim();
            if NUMBERED.is_match(line) {
                steps.push(line.to_string());
            }
        }
    }

    steps
}

/// Render a step list back into a minimal `## Steps` document.
pub fn render_steps(steps: &[String]) -> String {
    let mut out = String::from("## Steps\n");
    for step in steps {
        out.push_str(step);
        out.push('\n');
    }
    out
}

/// Filter out weak/meta steps like "let me check X".
pub fn is_actionable_plan_step(step: &str) -> bool {
    let s = step.trim();
    if s.len() < 10 {
        return false;
    }
    let low = s.to_lowercase();
    const WEAK_PREFIXES: &[&str] = &["ok", "okay", "let me", "now let me", "i will check", "check line", "todo"];
    if WEAK_PREFIXES.iter().any(|p| low.starts_with(p)) {
        return false;
    }
    const VERBS: &[&str] = &[
        "edit", "update", "change", "replace", "add", "remove", "create", "run", "test", "lint",
        "verify", "refactor", "fix", "inject",
    ];
    VERBS.iter().any(|v| low.contains(v))
}

/// Does the request likely contain multiple distinct items?
pub fn task_looks_multi_item(task: &str) -> bool {
    if task.is_empty() {
        return false;
    }
    let t = task.to_lowercase();
    static LIST_MARKERS: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"\n\s*(?:[-*]|\d+[.)])\s+").unwrap());
    if LIST_MARKERS.is_match(&t) {
        return true;
    }
    const MARKERS: &[&str] = &[
        " also ",
        " then ",
        " next ",
        " in addition ",
        " as well ",
        " after that ",
        " plus ",
    ];
    if MARKERS.iter().any(|m| t.contains(m)) {
        return true;
    }
    t.matches(" and ").count() >= 2
}

#[cfg(test)]
mod tests {
    use super::*;

    const PLAN: &str = "# Implementation Plan: Split utils module\n\n\
        Why: the module is too large.\n\n\
        ## Steps\n\
        1. Create `utils/strings.py` with the string helpers from `utils.py`\n\
        2. Create `utils/numbers.py` with the numeric helpers\n\
           - carry the doctests over\n\
        3. Update all importers of `utils.py` and run tests to verify\n\n\
        ## Verification\n\
        Run `pytest -q`.\n";

    #[test]
    fn parses_steps_with_continuations() {
        let steps = parse_plan_steps(PLAN);
        assert_eq!(steps.len(), 3);
        assert!(steps[0].starts_with("1. Create `utils/strings.py`"));
        assert!(steps[1].contains("carry the doctests over"));
        assert!(steps[2].contains("run tests"));
    }

    #[test]
    fn parse_render_round_trip() {
        let steps = parse_plan_steps(PLAN);
        let rendered = render_steps(&steps);
        assert_eq!(parse_plan_steps(&rendered), steps);
    }

    #[test]
    fn title_strips_boilerplate() {
        assert_eq!(extract_plan_title(PLAN), "Split utils module");
        assert_eq!(
            extract_plan_title("# Audit Findings: Session handling\n"),
            "Session handling"
        );
        assert_eq!(extract_plan_title("no heading here"), "no heading here");
    }

    #[test]
    fn envelope_is_stripped() {
        let wrapped = format!("preamble\n<plan>\n{}\n</plan>\ntrailer", PLAN);
        let inner = extract_plan(&wrapped).unwrap();
        assert!(inner.starts_with("# Implementation Plan"));
        assert!(!inner.contains("trailer"));
        assert!(extract_plan("no envelope").is_none());
    }

    #[test]
    fn action_tags_as_fallback() {
        let doc = "Notes only.\n- **[EDIT]** `src/a.rs`: rename the struct\n- **[RUN]** cargo test\n";
        let steps = parse_plan_steps(doc);
        assert_eq!(steps.len(), 2);
        assert!(steps[0].contains("[EDIT]"));
    }

    #[test]
    fn actionable_step_filter() {
        assert!(is_actionable_plan_step(
            "1. Update `src/auth.rs` to use the new token type"
        ));
        assert!(!is_actionable_plan_step("Let me check the file first"));
        assert!(!is_actionable_plan_step("1. ok"));
    }

    #[test]
    fn multi_item_detection() {
        assert!(task_looks_multi_item(
            "Add the button and update the tests and fix the docs"
        ));
        assert!(task_looks_multi_item("Do these:\n- first\n- second"));
        assert!(!task_looks_multi_item("Fix the login bug"));
    }
}
