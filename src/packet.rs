//! Task packet and artifact bundle value types.
//!
//! A [`TaskPacket`] is an immutable unit of work produced upstream by the
//! task compiler; this crate only reads it. An [`ArtifactBundle`] is what a
//! provider hands back on a successful run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An atomic unit of work, immutable once created.
///
/// Unknown fields are rejected at deserialization time rather than silently
/// dropped, so a packet produced by a newer compiler version fails loudly.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskPacket {
    pub id: Uuid,
    /// Task-type tag used for routing diagnostics (e.g. "code", "docs").
    pub task_type: String,
    pub title: String,
    pub description: String,
    /// What the downstream judge will test the artifact against.
    pub success_criteria: Vec<String>,
    #[serde(default)]
    pub constraints: TaskConstraints,
    /// Feedback carried over from a prior judged rejection; rendered into
    /// the prompt on re-dispatch.
    #[serde(default)]
    pub retry_guidance: Vec<String>,
    /// Execution-failure budget for this task. Provider failures never
    /// count against it.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

fn default_max_attempts() -> u32 {
    3
}

/// Hard constraints the packet carries into the provider prompt.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskConstraints {
    /// Files the provider may touch; empty means unconstrained.
    #[serde(default)]
    pub file_scope: Vec<String>,
    #[serde(default)]
    pub style_rules: Vec<String>,
    /// Things the provider must not do.
    #[serde(default)]
    pub forbidden: Vec<String>,
}

impl TaskPacket {
    pub fn new(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_type: "code".to_string(),
            title: title.into(),
            description: description.into(),
            success_criteria: Vec::new(),
            constraints: TaskConstraints::default(),
            retry_guidance: Vec::new(),
            max_attempts: default_max_attempts(),
            created_at: Utc::now(),
        }
    }

    pub fn with_criteria(mut self, criteria: Vec<String>) -> Self {
        self.success_criteria = criteria;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Render the packet as a backend-agnostic prompt.
    ///
    /// Shared by the CLI and HTTP adapters so every backend sees the same
    /// goal, constraints and accumulated retry guidance.
    pub fn render_prompt(&self, extra_guidance: &[String]) -> String {
        let mut prompt = format!("# Task: {}\n\n{}\n", self.title, self.description);

        if !self.success_criteria.is_empty() {
            prompt.push_str("\n## Success Criteria\n");
            for criterion in &self.success_criteria {
                prompt.push_str(&format!("- {}\n", criterion));
            }
        }

        if !self.constraints.file_scope.is_empty() {
            prompt.push_str("\n## File Scope\n");
            for file in &self.constraints.file_scope {
                prompt.push_str(&format!("- {}\n", file));
            }
        }

        if !self.constraints.style_rules.is_empty() {
            prompt.push_str("\n## Style Rules\n");
            for rule in &self.constraints.style_rules {
                prompt.push_str(&format!("- {}\n", rule));
            }
        }

        if !self.constraints.forbidden.is_empty() {
            prompt.push_str("\n## Forbidden\n");
            for item in &self.constraints.forbidden {
                prompt.push_str(&format!("- {}\n", item));
            }
        }

        let guidance: Vec<&String> = self
            .retry_guidance
            .iter()
            .chain(extra_guidance.iter())
            .collect();
        if !guidance.is_empty() {
            prompt.push_str("\n## Previous Attempt Feedback\n");
            for item in guidance {
                prompt.push_str(&format!("- {}\n", item));
            }
        }

        prompt
    }
}

/// Result of a successful provider execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactBundle {
    pub task_id: Uuid,
    /// Name of the provider that produced this bundle.
    pub provider: String,
    pub files_modified: Vec<String>,
    pub diff_summary: Option<String>,
    pub logs: Option<String>,
    pub duration_ms: u64,
    pub artifacts_path: Option<String>,
}

impl ArtifactBundle {
    pub fn new(task_id: Uuid, provider: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            task_id,
            provider: provider.into(),
            files_modified: Vec::new(),
            diff_summary: None,
            logs: None,
            duration_ms,
            artifacts_path: None,
        }
    }
}
