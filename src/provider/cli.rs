//! CLI-backed provider adapter.
//!
//! Spawns a configured executable with the rendered task prompt, captures
//! stdout/stderr, and bounds the call with a per-provider timeout. Rate
//! limiting is detected by scanning combined output against a compiled
//! pattern set, since CLI backends rarely expose structured errors.

use crate::error::{ConfigError, ProviderError};
use crate::packet::{ArtifactBundle, TaskPacket};
use crate::provider::{ProviderAdapter, ProviderDescriptor, RateLimitStrategy};
use async_trait::async_trait;
use regex::RegexSet;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::{debug, warn};

const DEFAULT_TIMEOUT_SECS: u64 = 300;

/// Patterns most CLI backends emit when throttled.
const DEFAULT_RATE_LIMIT_PATTERNS: &[&str] = &[
    "rate limit",
    "too many requests",
    "quota exceeded",
    "429",
    "overloaded",
];

pub struct CliAdapter {
    name: String,
    executable: String,
    args: Vec<String>,
    timeout: Duration,
    strategy: RateLimitStrategy,
    patterns: RegexSet,
}

impl CliAdapter {
    pub fn new(descriptor: &ProviderDescriptor) -> Result<Self, ConfigError> {
        let executable = descriptor.settings.executable.clone().ok_or_else(|| {
            ConfigError::InvalidProvider {
                name: descriptor.name.clone(),
                reason: "cli provider requires settings.executable".to_string(),
            }
        })?;

        let raw_patterns: Vec<String> = if descriptor.settings.rate_limit_patterns.is_empty() {
            DEFAULT_RATE_LIMIT_PATTERNS
                .iter()
                .map(|p| p.to_string())
                .collect()
        } else {
            descriptor.settings.rate_limit_patterns.clone()
        };

        let patterns = RegexSet::new(raw_patterns.iter().map(|p| format!("(?i){}", p))).map_err(
            |e| ConfigError::InvalidProvider {
                name: descriptor.name.clone(),
                reason: format!("invalid rate limit pattern: {}", e),
            },
        )?;

        Ok(Self {
            name: descriptor.name.clone(),
            executable,
            args: descriptor.settings.args.clone(),
            timeout: Duration::from_secs(
                descriptor.settings.timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS),
            ),
            strategy: descriptor.rate_limit_strategy,
            patterns,
        })
    }

    fn output_looks_rate_limited(&self, output: &str) -> bool {
        self.strategy == RateLimitStrategy::Pattern && self.patterns.is_match(output)
    }
}

#[async_trait]
impl ProviderAdapter for CliAdapter {
    async fn generate(
        &self,
        packet: &TaskPacket,
        guidance: &[String],
    ) -> Result<ArtifactBundle, ProviderError> {
        let prompt = packet.render_prompt(guidance);
        let started = Instant::now();

        let mut command = Command::new(&self.executable);
        command
            .args(&self.args)
            .arg(&prompt)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(provider = %self.name, task_id = %packet.id, "spawning backend process");

        let output = match tokio::time::timeout(self.timeout, command.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(ProviderError::Unavailable(format!(
                    "failed to spawn {}: {}",
                    self.executable, e
                )));
            }
            Err(_) => {
                warn!(provider = %self.name, task_id = %packet.id, "backend call timed out");
                return Err(ProviderError::Timeout {
                    secs: self.timeout.as_secs(),
                });
            }
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        let combined = format!("{}{}", stdout, stderr);

        // A throttled CLI often exits zero with the refusal in its output,
        // so the scan runs before the status check.
        if self.output_looks_rate_limited(&combined) {
            return Err(ProviderError::RateLimited {
                message: first_line(&combined),
                retry_after: None,
            });
        }

        if output.status.success() {
            let mut bundle = ArtifactBundle::new(packet.id, &self.name, duration_ms);
            bundle.logs = Some(stdout);
            Ok(bundle)
        } else {
            Err(ProviderError::ProcessFailed {
                status: output.status.code().unwrap_or(-1),
                stderr,
            })
        }
    }

    async fn is_available(&self) -> bool {
        which::which(&self.executable).is_ok()
    }

    fn detect_rate_limit(&self, err: &ProviderError) -> bool {
        // A backend declared rate-limit-free classifies nothing as a rate
        // limit, matching its "none" strategy.
        if self.strategy == RateLimitStrategy::None {
            return false;
        }
        if err.is_definitely_provider_fault() {
            return true;
        }
        match err {
            ProviderError::ProcessFailed { stderr, .. } => self.patterns.is_match(stderr),
            ProviderError::ExecutionFailed { detail, logs } => {
                self.patterns.is_match(detail)
                    || logs.as_deref().is_some_and(|l| self.patterns.is_match(l))
            }
            _ => false,
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

fn first_line(text: &str) -> String {
    text.lines()
        .find(|l| !l.trim().is_empty())
        .unwrap_or("rate limited")
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ProviderKind;

    fn cli_descriptor(patterns: Vec<String>) -> ProviderDescriptor {
        let mut descriptor = ProviderDescriptor::new("claude-cli", ProviderKind::Cli)
            .with_strategy(RateLimitStrategy::Pattern);
        descriptor.settings.executable = Some("claude".to_string());
        descriptor.settings.rate_limit_patterns = patterns;
        descriptor
    }

    #[test]
    fn pattern_strategy_classifies_process_failure_output() {
        let adapter = CliAdapter::new(&cli_descriptor(vec![])).unwrap();

        let throttled = ProviderError::ProcessFailed {
            status: 1,
            stderr: "Error: 429 Too Many Requests".to_string(),
        };
        assert!(adapter.detect_rate_limit(&throttled));

        let real_failure = ProviderError::ProcessFailed {
            status: 1,
            stderr: "tests failed: expected 4, got 5".to_string(),
        };
        assert!(!adapter.detect_rate_limit(&real_failure));
    }

    #[test]
    fn structured_variants_classify_without_patterns() {
        let adapter = CliAdapter::new(&cli_descriptor(vec!["never-matches".to_string()])).unwrap();

        assert!(adapter.detect_rate_limit(&ProviderError::Timeout { secs: 10 }));
        assert!(adapter.detect_rate_limit(&ProviderError::Unavailable("down".to_string())));
        assert!(!adapter.detect_rate_limit(&ProviderError::ExecutionFailed {
            detail: "bad output".to_string(),
            logs: None,
        }));
    }

    #[test]
    fn custom_patterns_are_case_insensitive() {
        let adapter =
            CliAdapter::new(&cli_descriptor(vec!["capacity exceeded".to_string()])).unwrap();
        assert!(adapter.output_looks_rate_limited("ERROR: Capacity Exceeded, retry later"));
        assert!(!adapter.output_looks_rate_limited("rate limit")); // default set replaced
    }

    #[tokio::test]
    async fn generate_fails_with_unavailable_for_missing_executable() {
        let mut descriptor = cli_descriptor(vec![]);
        descriptor.settings.executable = Some("definitely-not-a-real-binary-xyz".to_string());
        let adapter = CliAdapter::new(&descriptor).unwrap();

        assert!(!adapter.is_available().await);

        let packet = TaskPacket::new("t", "d");
        let err = adapter.generate(&packet, &[]).await.unwrap_err();
        assert!(matches!(err, ProviderError::Unavailable(_)));
    }
}
