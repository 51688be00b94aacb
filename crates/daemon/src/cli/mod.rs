pub mod config;

use clap::{Parser, Subcommand};

use pk_domain::config::Config;

/// presence-keeper: keeps one presence session per group alive.
#[derive(Debug, Parser)]
#[command(name = "presence-keeper", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the session supervisor and status server (default when no
    /// subcommand is given).
    Serve,
    /// Configuration utilities.
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Print version information.
    Version,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Parse the config file and report any errors.
    Validate,
    /// Dump the resolved configuration (with defaults) as TOML.
    Show,
}

// ── Config loading helper ─────────────────────────────────────────────

/// A parsed config plus where it came from.
#[derive(Debug)]
pub struct LoadedConfig {
    pub config: Config,
    pub path: String,
    /// `PK_*` environment variables that overrode file values.
    pub overrides: Vec<&'static str>,
}

/// Load the configuration from the path in `PK_CONFIG` (or `config.toml`)
/// and apply environment overrides.  A missing file yields the defaults.
pub fn load_config() -> anyhow::Result<LoadedConfig> {
    let path = std::env::var("PK_CONFIG").unwrap_or_else(|_| "config.toml".into());
    load_config_from(&path, |key| std::env::var(key).ok())
}

pub fn load_config_from<F>(path: &str, lookup: F) -> anyhow::Result<LoadedConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config: Config = if std::path::Path::new(path).exists() {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("reading {path}: {e}"))?;
        toml::from_str(&raw).map_err(|e| anyhow::anyhow!("parsing {path}: {e}"))?
    } else {
        Config::default()
    };
    let overrides = config.apply_overrides(lookup);

    Ok(LoadedConfig {
        config,
        path: path.to_owned(),
        overrides,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        let loaded = load_config_from(path.to_str().unwrap(), |_| None).unwrap();
        assert_eq!(loaded.config.server.port, 11186);
        assert!(loaded.overrides.is_empty());
    }

    #[test]
    fn file_values_then_env_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[supervisor]\nidentity = \"keeper\"\n\n[server]\nport = 9000\n",
        )
        .unwrap();

        let loaded = load_config_from(path.to_str().unwrap(), |key| match key {
            "PK_PORT" => Some("9100".into()),
            _ => None,
        })
        .unwrap();
        assert_eq!(loaded.config.supervisor.identity, "keeper");
        assert_eq!(loaded.config.server.port, 9100);
        assert_eq!(loaded.overrides, vec!["PK_PORT"]);
    }

    #[test]
    fn malformed_file_names_the_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[server\nport = ").unwrap();

        let err = load_config_from(path.to_str().unwrap(), |_| None).unwrap_err();
        assert!(err.to_string().contains("parsing"));
    }

    #[test]
    fn cli_defaults_to_no_subcommand() {
        let cli = Cli::parse_from(["presence-keeper"]);
        assert!(cli.command.is_none());

        let cli = Cli::parse_from(["presence-keeper", "config", "validate"]);
        assert!(matches!(
            cli.command,
            Some(Command::Config(ConfigCommand::Validate))
        ));
    }
}
