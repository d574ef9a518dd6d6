//! Policy engine: per-call allow / require-approval / block decisions.

use crate::config::AgentConfig;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Decision for one proposed tool call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicyDecision {
    pub require_approval: bool,
    pub blocked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl PolicyDecision {
    pub fn allow() -> Self {
        Self::default()
    }

    pub fn require_approval(reason: impl Into<String>) -> Self {
        Self {
            require_approval: true,
            blocked: false,
            reason: Some(reason.into()),
        }
    }

    pub fn blocked(reason: impl Into<String>) -> Self {
        Self {
            require_approval: false,
            blocked: true,
            reason: Some(reason.into()),
        }
    }
}

/// Commands that can destroy data or disable systems.
const DESTRUCTIVE_PATTERNS: &[&str] = &[
    "rm -rf",
    "rm -fr",
    "rm -r",
    "rm -f",
    "rmdir",
    "dd if=",
    "mkfs.",
    "fdisk",
    "parted",
    "fsck",
    "iptables -F",
    "ufw --force",
    "systemctl stop",
    "service stop",
    "docker system prune",
    "docker volume rm",
    "docker network rm",
    "git reset --hard",
    "git clean -fd",
    "git checkout -- .",
    "DROP TABLE",
    "DROP DATABASE",
    "TRUNCATE",
    "DELETE FROM",
    "kubectl delete",
    "helm uninstall",
];

/// Commands that touch shared systems beyond the working copy.
const SHARED_IMPACT_PATTERNS: &[&str] = &[
    "git push",
    "git pull",
    "git fetch",
    "git merge",
    "git rebase",
    "npm publish",
    "pip install --global",
    "sudo",
    "chmod +x",
    "docker push",
    "gcloud",
    "aws ",
    "kubectl apply",
    "terraform apply",
    "ansible-playbook",
];

pub struct PolicyEngine;

impl PolicyEngine {
    /// Decide for a `(tool, input)` pair. Only shell commands carry pattern
    /// risk; everything else is allowed here and gated by the dispatcher's
    /// own approval flow for mutations.
    pub fn decide(tool_name: &str, input: &Value, config: &AgentConfig) -> PolicyDecision {
        if !config.policy_engine_enabled {
            return PolicyDecision::allow();
        }
        if tool_name != "shell" {
            return PolicyDecision::allow();
        }
        let command = input.get("command").and_then(Value::as_str).unwrap_or("");

        if DESTRUCTIVE_PATTERNS.iter().any(|p| command.contains(p)) {
            if config.block_destructive_commands {
                return PolicyDecision::blocked("Blocked destructive command by policy engine.");
            }
            return PolicyDecision::require_approval(
                "Destructive command requires explicit approval.",
            );
        }
        if SHARED_IMPACT_PATTERNS.iter().any(|p| command.contains(p)) {
            return PolicyDecision::require_approval(
                "Shared-impact command requires explicit approval.",
            );
        }
        PolicyDecision::allow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config(block: bool) -> AgentConfig {
        AgentConfig {
            block_destructive_commands: block,
            ..AgentConfig::default()
        }
    }

    #[test]
    fn destructive_blocked_when_configured() {
        let d = PolicyEngine::decide("shell", &json!({"command": "rm -rf build/"}), &config(true));
        assert!(d.blocked);
        assert!(!d.require_approval);
    }

    #[test]
    fn destructive_downgrades_to_approval() {
        let d = PolicyEngine::decide("shell", &json!({"command": "rm -rf build/"}), &config(false));
        assert!(!d.blocked);
        assert!(d.require_approval);
    }

    #[test]
    fn shared_impact_requires_approval() {
        for cmd in ["git push origin main", "sudo apt install x", "terraform apply"] {
            let d = PolicyEngine::decide("shell", &json!({"command": cmd}), &config(true));
            assert!(d.require_approval, "expected approval for {}", cmd);
            assert!(!d.blocked);
        }
    }

    #[test]
    fn ordinary_commands_allowed() {
        let d = PolicyEngine::decide("shell", &json!({"command": "cargo build"}), &config(true));
        assert_eq!(d, PolicyDecision::allow());
    }

    #[test]
    fn non_shell_tools_pass_through() {
        let d = PolicyEngine::decide(
            "edit_file",
            &json!({"path": "x", "old_string": "rm -rf", "new_string": "y"}),
            &config(true),
        );
        assert_eq!(d, PolicyDecision::allow());
    }

    #[test]
    fn disabled_engine_allows_everything() {
        let mut c = config(true);
        c.policy_engine_enabled = false;
        let d = PolicyEngine::decide("shell", &json!({"command": "rm -rf /"}), &c);
        assert_eq!(d, PolicyDecision::allow());
    }
}
