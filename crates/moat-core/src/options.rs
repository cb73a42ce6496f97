//! Options accepted by `Manager::create`

use moat_config::AgentConfig;
use std::collections::HashMap;
use std::path::PathBuf;

/// Default command when none is given
pub const DEFAULT_CMD: &str = "/bin/bash";

/// Everything needed to create a run
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    /// Explicit run name; conflicts are rejected
    pub name: Option<String>,
    /// Host path mounted read-write into the container
    pub workspace: PathBuf,
    /// Grant strings (`<provider>[:<scope>]`, `ssh:<host>`, `mcp-<name>`)
    pub grants: Vec<String>,
    /// Command override; defaults to `/bin/bash`
    pub cmd: Option<Vec<String>>,
    /// Parsed agent configuration (moat.toml)
    pub config: AgentConfig,
    /// Explicit environment, highest priority
    pub env: HashMap<String, String>,
    /// Force image rebuild
    pub rebuild: bool,
    /// Skip auto-remove of the container on exit
    pub keep_container: bool,
    /// Keep stdin open and allocate a TTY when the host stdin is a terminal
    pub interactive: bool,
    /// Which agent this run hosts (informational, persisted)
    pub agent_kind: Option<String>,
}

impl CreateOptions {
    pub fn new(workspace: impl Into<PathBuf>) -> Self {
        Self {
            workspace: workspace.into(),
            ..Self::default()
        }
    }

    /// The effective command for the container
    pub fn effective_cmd(&self) -> Vec<String> {
        match &self.cmd {
            Some(cmd) if !cmd.is_empty() => cmd.clone(),
            _ => vec![DEFAULT_CMD.to_string()],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_cmd() {
        let opts = CreateOptions::new("/ws");
        assert_eq!(opts.effective_cmd(), vec!["/bin/bash".to_string()]);
    }

    #[test]
    fn test_cmd_override() {
        let mut opts = CreateOptions::new("/ws");
        opts.cmd = Some(vec!["true".to_string()]);
        assert_eq!(opts.effective_cmd(), vec!["true".to_string()]);
    }
}
