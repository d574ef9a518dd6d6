//! Plan decomposition: dependency-ordered phases with strategy hints.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Estimated implementation complexity of a task. Distinct from the intent
/// classifier's labels: this scale drives plan quality bars, phased builds,
/// and scripted-transform escalation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskComplexity {
    #[default]
    Low,
    Medium,
    High,
}

impl TaskComplexity {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskComplexity::Low => "low",
            TaskComplexity::Medium => "medium",
            TaskComplexity::High => "high",
        }
    }
}

/// Execution shape of a phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseType {
    FileBatch,
    CommandBatch,
    ScriptedTransform,
}

/// How the phase's edits should be carried out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    DirectEdit,
    ScriptedTransform,
    GenerateNew,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::DirectEdit => "direct_edit",
            Strategy::ScriptedTransform => "scripted_transform",
            Strategy::GenerateNew => "generate_new",
        }
    }
}

impl PhaseType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseType::FileBatch => "file_batch",
            PhaseType::CommandBatch => "command_batch",
            PhaseType::ScriptedTransform => "scripted_transform",
        }
    }
}

/// One plan step with extraction metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepItem {
    /// 1-based index in the original step list.
    pub index: usize,
    pub step: String,
    pub targets: Vec<String>,
    pub is_run: bool,
    pub is_scripted: bool,
    pub creates: Vec<String>,
}

/// One dependency-ordered phase of the build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Phase {
    pub number: usize,
    #[serde(rename = "type")]
    pub phase_type: PhaseType,
    pub strategy: Strategy,
    pub steps: Vec<StepItem>,
    pub targets: Vec<String>,
    pub depends_on: Vec<usize>,
}

static BACKTICKED: Lazy<Regex> = Lazy::new(|| Regex::new(r"`([^`]+)`").unwrap());
static PATH_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[A-Za-z0-9_\-./]+\.[A-Za-z0-9]+").unwrap());
static RUN_KEYWORDS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\[run\]|\brun\b|\bverify\b|\btest\b|\blint\b").unwrap());
static SCRIPTED_KEYWORDS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bscript\b|\bgenerate\b|\bbulk\b|\bbatch\b|\bextract.*into\b|\bsplit.*into\b")
        .unwrap()
});
static CREATE_KEYWORDS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(create|write|generate|new file|add file)\b").unwrap());

/// Likely file paths mentioned in a step: backticked identifiers containing a
/// separator or extension, else bare `name.ext` tokens.
pub fn extract_step_targets(step: &str) -> Vec<String> {
    if step.is_empty() {
        return Vec::new();
    }
    let quoted: Vec<String> = BACKTICKED
        .captures_iter(step)
        .map(|c| c.get(1).unwrap().as_str().to_string())
        .filter(|q| {
            q.contains('/')
                || q.rsplit('/')
                    .next()
                    .map(|base| base.contains('.'))
                    .unwrap_or(false)
        })
        .collect();
    if !quoted.is_empty() {
        return quoted.into_iter().take(3).collect();
    }
    PATH_TOKEN
        .find_iter(step)
        .map(|m| m.as_str().to_string())
        .take(3)
        .collect()
}

/// Files a step creates, when it uses create/write/generate phrasing.
fn step_creates_files(step: &str) -> Vec<String> {
    if !CREATE_KEYWORDS.is_match(step) {
        return Vec::new();
    }
    BACKTICKED
        .captures_iter(step)
        .map(|c| c.get(1).unwrap().as_str().to_string())
        .filter(|q| {
            q.contains('/')
                || q.rsplit('/')
                    .next()
                    .map(|base| base.contains('.'))
                    .unwrap_or(false)
        })
        .take(3)
        .collect()
}

/// Group ordered plan steps into dependency-ordered phases.
///
/// Run/verify steps isolate into their own `command_batch`; otherwise the
/// current `file_batch` extends until the next step's target set is disjoint.
/// Scripted-transform keywords, or more than 4 targets on a high-complexity
/// task, escalate a phase's strategy.
pub fn decompose_plan_steps(steps: &[String], complexity: TaskComplexity) -> Vec<Phase> {
    if steps.is_empty() {
        return Vec::new();
    }

    let items: Vec<StepItem> = steps
        .iter()
        .enumerate()
        .map(|(idx, step)| {
            let s = step.trim().to_string();
            StepItem {
                index: idx + 1,
                targets: extract_step_targets(&s),
                is_run: RUN_KEYWORDS.is_match(&s),
                is_scripted: SCRIPTED_KEYWORDS.is_match(&s),
                creates: step_creates_files(&s),
                step: s,
            }
        })
        .collect();

    // Group into raw phases: split at command steps and at target-set
    // boundaries.
    struct RawPhase {
        phase_type: PhaseType,
        steps: Vec<StepItem>,
        targets: Vec<String>,
    }
    let mut phases: Vec<RawPhase> = Vec::new();
    let mut current = RawPhase {
        phase_type: PhaseType::FileBatch,
        steps: Vec::new(),
        targets: Vec::new(),
    };

    for item in items {
        if item.is_run {
            if !current.steps.is_empty() {
                phases.push(current);
                current = RawPhase {
                    phase_type: PhaseType::FileBatch,
                    steps: Vec::new(),
                    targets: Vec::new(),
                };
            }
            phases.push(RawPhase {
                phase_type: PhaseType::CommandBatch,
                targets: item.targets.clone(),
                steps: vec![item],
            });
            continue;
        }

        let disjoint = !current.steps.is_empty()
            && !item.targets.is_empty()
            && !current.targets.is_empty()
            && !item
                .targets
                .iter()
                .any(|t| current.targets.contains(t));
        if disjoint {
            phases.push(current);
            current = RawPhase {
                phase_type: PhaseType::FileBatch,
                steps: Vec::new(),
                targets: Vec::new(),
            };
        }
        current.targets.extend(item.targets.clone());
        current.steps.push(item);
    }
    if !current.steps.is_empty() {
        phases.push(current);
    }

    // Number phases, dedup targets, assign strategy, build the creator map.
    let mut creates_map: HashMap<String, usize> = HashMap::new();
    let mut result: Vec<Phase> = Vec::new();
    for (idx, raw) in phases.into_iter().enumerate() {
        let number = idx + 1;
        let mut targets: Vec<String> = Vec::new();
        for t in &raw.targets {
            if !targets.contains(t) {
                targets.push(t.clone());
            }
        }
        targets.sort();
        targets.truncate(20);

        for item in &raw.steps {
            for f in &item.creates {
                creates_map.entry(f.clone()).or_insert(number);
            }
        }

        let has_scripted = raw.steps.iter().any(|s| s.is_scripted);
        let many_targets = targets.len() > 4;
        let (phase_type, strategy) = if raw.phase_type == PhaseType::CommandBatch {
            (PhaseType::CommandBatch, Strategy::DirectEdit)
        } else if has_scripted || (many_targets && complexity == TaskComplexity::High) {
            (PhaseType::ScriptedTransform, Strategy::ScriptedTransform)
        } else {
            (PhaseType::FileBatch, Strategy::DirectEdit)
        };

        result.push(Phase {
            number,
            phase_type,
            strategy,
            steps: raw.steps,
            targets,
            depends_on: Vec::new(),
        });
    }

    // A phase depends on every earlier phase that creates one of its targets.
    for phase in result.iter_mut() {
        for target in &phase.targets {
            if let Some(&creator) = creates_map.get(target) {
                if creator < phase.number && !phase.depends_on.contains(&creator) {
                    phase.depends_on.push(creator);
                }
            }
        }
        phase.depends_on.sort();
    }

    result
}

/// Human-readable decomposition summary for build prompts.
pub fn format_decomposition_summary(decomposition: &[Phase]) -> String {
    if decomposition.is_empty() {
        return "- Single phase".to_string();
    }
    decomposition
        .iter()
        .map(|phase| {
            let step_ids: Vec<String> =
                phase.steps.iter().map(|s| s.index.to_string()).collect();
            let targets = if phase.targets.is_empty() {
                "n/a".to_string()
            } else {
                phase.targets[..phase.targets.len().min(5)].join(", ")
            };
            let deps = if phase.depends_on.is_empty() {
                String::new()
            } else {
                format!(
                    " (depends on phase {})",
                    phase
                        .depends_on
                        .iter()
                        .map(|d| d.to_string())
                        .collect::<Vec<_>>()
                        .join(", ")
                )
            };
            format!(
                "- Phase {} [{}] strategy={}: steps {} | targets: {}{}",
                phase.number,
                phase.phase_type.as_str(),
                phase.strategy.as_str(),
                step_ids.join(", "),
                targets,
                deps
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_backticked_paths_first() {
        let targets =
            extract_step_targets("1. Update `src/auth.rs` and `README.md` for the new flow");
        assert_eq!(targets, vec!["src/auth.rs", "README.md"]);
        let bare = extract_step_targets("2. Fix the bug in utils.py quickly");
        assert_eq!(bare, vec!["utils.py"]);
        assert!(extract_step_targets("3. Think about the design").is_empty());
    }

    #[test]
    fn split_scenario_creates_dependent_phases() {
        let steps = vec![
            "1. Create `utils/strings.py` with the string helpers".to_string(),
            "2. Create `utils/numbers.py` with the numeric helpers".to_string(),
            "3. Update imports of `utils/strings.py` and `utils/numbers.py` in `app.py`"
                .to_string(),
            "4. Run the test suite to verify".to_string(),
        ];
        let phases = decompose_plan_steps(&steps, TaskComplexity::High);
        assert!(phases.len() >= 3);

        // Steps 1-2 share no targets, so they land in separate file batches;
        // the importer phase depends on both creators.
        let import_phase = phases
            .iter()
            .find(|p| p.steps.iter().any(|s| s.index == 3))
            .unwrap();
        assert!(!import_phase.depends_on.is_empty());
        for dep in &import_phase.depends_on {
            assert!(*dep < import_phase.number);
        }

        let run_phase = phases.last().unwrap();
        assert_eq!(run_phase.phase_type, PhaseType::CommandBatch);
    }

    #[test]
    fn scripted_keywords_escalate_strategy() {
        let steps = vec![
            "1. Write a script to generate boilerplate into `gen/a.py` `gen/b.py`".to_string(),
        ];
        let phases = decompose_plan_steps(&steps, TaskComplexity::Low);
        assert_eq!(phases[0].strategy, Strategy::ScriptedTransform);
        assert_eq!(phases[0].phase_type, PhaseType::ScriptedTransform);
    }

    #[test]
    fn many_targets_escalate_only_when_complex() {
        let step = "1. Edit `a.py` `b.py` `c.py` `d.py` `e.py` `f.py` consistently".to_string();
        // Target extraction caps at 3 per step, so pad with more steps
        // sharing a target to grow the phase.
        let steps = vec![
            step,
            "2. Also edit `a.py` `g.py` `h.py` together".to_string(),
        ];
        let complex = decompose_plan_steps(&steps, TaskComplexity::High);
        assert_eq!(complex[0].strategy, Strategy::ScriptedTransform);
        let simple = decompose_plan_steps(&steps, TaskComplexity::Low);
        assert_eq!(simple[0].strategy, Strategy::DirectEdit);
    }

    #[test]
    fn summary_renders_dependencies() {
        let steps = vec![
            "1. Create `m/x.py` with the parser".to_string(),
            "2. Update `m/x.py` imports in `main.py`".to_string(),
        ];
        let phases = decompose_plan_steps(&steps, TaskComplexity::High);
        let summary = format_decomposition_summary(&phases);
        assert!(summary.contains("Phase 1"));
        assert!(format_decomposition_summary(&[]).contains("Single phase"));
    }
}
