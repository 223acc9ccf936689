//! Implementation of the `dlmcore config` commands.

use crate::cli::ConfigCheckArgs;
use crate::config::Config;
use crate::error::Result;

/// Load and validate a node config, then summarize it.
pub fn cmd_config_check(args: ConfigCheckArgs) -> Result<()> {
    let config = Config::load(&args.path)?;
    println!("{}", describe(&config));
    Ok(())
}

/// Print the default config as YAML.
pub fn cmd_config_defaults() -> Result<()> {
    print!("{}", Config::default().to_yaml()?);
    Ok(())
}

fn describe(config: &Config) -> String {
    let mut lines = vec![format!(
        "Config OK: node {} ({}), cluster {:?}",
        config.node_id,
        config.node_name,
        config.members()
    )];
    lines.push(format!("  master wait:     {} ms", config.master_wait_ms));
    match config.default_timeout_ms {
        Some(ms) => lines.push(format!("  default timeout: {} ms", ms)),
        None => lines.push("  default timeout: none".to_string()),
    }
    for (resource, node) in &config.masters {
        lines.push(format!("  master of {}: node {}", resource, node));
    }
    if let Some(path) = &config.event_log {
        lines.push(format!("  event log:       {}", path.display()));
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DlmError;
    use crate::test_support::{DirGuard, write_file};
    use serial_test::serial;
    use std::path::PathBuf;
    use tempfile::TempDir;

    #[test]
    #[serial]
    fn check_accepts_relative_path() {
        let temp_dir = TempDir::new().unwrap();
        write_file(
            temp_dir.path(),
            "node.yaml",
            "node_id: 2\ncluster: [1, 2]\nmasters:\n  journal: 1\n",
        );
        let _guard = DirGuard::new(temp_dir.path());

        cmd_config_check(ConfigCheckArgs {
            path: PathBuf::from("node.yaml"),
        })
        .unwrap();
    }

    #[test]
    #[serial]
    fn check_rejects_master_outside_cluster() {
        let temp_dir = TempDir::new().unwrap();
        write_file(
            temp_dir.path(),
            "node.yaml",
            "node_id: 1\ncluster: [1, 2]\nmasters:\n  journal: 7\n",
        );
        let _guard = DirGuard::new(temp_dir.path());

        let err = cmd_config_check(ConfigCheckArgs {
            path: PathBuf::from("node.yaml"),
        })
        .unwrap_err();
        assert!(matches!(err, DlmError::UserError(_)));
    }

    #[test]
    fn describe_lists_overrides() {
        let mut config = Config::for_node(1, &[1, 2]);
        config.masters.insert("journal".to_string(), 2);
        config.default_timeout_ms = Some(250);

        let text = describe(&config);

        assert!(text.starts_with("Config OK: node 1 (node1), cluster [1, 2]"));
        assert!(text.contains("master of journal: node 2"));
        assert!(text.contains("default timeout: 250 ms"));
    }
}
