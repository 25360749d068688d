//! The sandbox wrapper contract: transforms a command into a sandboxed one.
//! The engine treats this as an opaque transform (spec.md §6).

use serde::{Deserialize, Serialize};

/// Sandbox mode, mirroring spec.md §6's `mode ∈ {auto, bwrap, sandbox-exec, off}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SandboxMode {
    Auto,
    Bwrap,
    SandboxExec,
    Off,
}

/// Sandbox configuration read from `EngineConfig`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxConfig {
    pub enabled: bool,
    pub mode: SandboxMode,
    pub network: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            mode: SandboxMode::Auto,
            network: true,
        }
    }
}

/// An unwrapped command: a binary plus argv, ready for a sandbox wrapper (or
/// the engine itself, if sandboxing is disabled) to turn into a spawnable
/// subprocess invocation.
#[derive(Debug, Clone)]
pub struct Command {
    pub program: String,
    pub args: Vec<String>,
}

/// Wraps commands according to [`SandboxConfig`] and a plugin's declared
/// [`crate::plugins::agent::SandboxRequirements`].
pub trait SandboxWrapper: Send + Sync {
    fn wrap(
        &self,
        command: Command,
        requirements: &crate::plugins::agent::SandboxRequirements,
        config: &SandboxConfig,
    ) -> Command;
}

/// A wrapper that passes every command through unchanged. Used when
/// `SandboxConfig::enabled` is `false`, and as the default test double.
pub struct NoopSandboxWrapper;

impl SandboxWrapper for NoopSandboxWrapper {
    fn wrap(
        &self,
        command: Command,
        _requirements: &crate::plugins::agent::SandboxRequirements,
        _config: &SandboxConfig,
    ) -> Command {
        command
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::agent::SandboxRequirements;

    #[test]
    fn noop_wrapper_passes_command_through() {
        let wrapper = NoopSandboxWrapper;
        let cmd = Command {
            program: "agent-cli".to_string(),
            args: vec!["--flag".to_string()],
        };
        let wrapped = wrapper.wrap(
            cmd.clone(),
            &SandboxRequirements::default(),
            &SandboxConfig::default(),
        );
        assert_eq!(wrapped.program, cmd.program);
        assert_eq!(wrapped.args, cmd.args);
    }
}
