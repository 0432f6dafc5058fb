//! `~/.omnilink/config.toml` loading.

use std::path::{Path, PathBuf};
use std::{env, fs, io};

use omnilink_server::ServerOptions;
use serde::Deserialize;
use toml::de;

#[derive(Debug, Default, Deserialize)]
pub struct OmnilinkConfig {
    pub server: Option<ServerOptions>,
    pub logging: Option<LoggingConfig>,
}

#[derive(Debug, Default, Deserialize)]
pub struct LoggingConfig {
    /// `tracing` filter directive, e.g. `info` or `omnilink_server=debug`.
    pub level: Option<String>,
    /// Log file location. `${VAR}` references are expanded.
    pub file: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse {}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: de::Error,
    },
}

impl ConfigError {
    #[must_use]
    pub fn path(&self) -> &PathBuf {
        match self {
            ConfigError::Read { path, .. } | ConfigError::Parse { path, .. } => path,
        }
    }
}

/// Replace `${VAR}` with the variable's value. Unset variables become empty;
/// an unclosed `${` is kept as written.
#[must_use]
pub fn expand_env_vars(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;

    while let Some(start) = rest.find("${") {
        let Some(len) = rest[start + 2..].find('}') else {
            break;
        };
        out.push_str(&rest[..start]);
        let var = &rest[start + 2..start + 2 + len];
        if !var.is_empty() {
            out.push_str(&env::var(var).unwrap_or_default());
        }
        rest = &rest[start + 2 + len + 1..];
    }

    out.push_str(rest);
    out
}

impl OmnilinkConfig {
    /// Load the user's config file. `Ok(None)` when there is none.
    pub fn load() -> Result<Option<Self>, ConfigError> {
        match config_path() {
            Some(path) => Self::load_from(&path),
            None => Ok(None),
        }
    }

    pub fn load_from(path: &Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }

        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) => {
                tracing::warn!("Failed to read config at {:?}: {}", path, err);
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: err,
                });
            }
        };

        match toml::from_str(&content) {
            Ok(config) => Ok(Some(config)),
            Err(err) => {
                tracing::warn!("Failed to parse config at {:?}: {}", path, err);
                Err(ConfigError::Parse {
                    path: path.to_path_buf(),
                    source: err,
                })
            }
        }
    }

    /// Server options with defaults filled in and environment references
    /// in the server path, extra arguments and env values expanded.
    #[must_use]
    pub fn server_options(&self) -> ServerOptions {
        let mut options = self.server.clone().unwrap_or_default();
        options.path = options.path.as_deref().map(expand_env_vars);
        for arg in &mut options.extra_args {
            *arg = expand_env_vars(arg);
        }
        for value in options.env.values_mut() {
            *value = expand_env_vars(value);
        }
        options
    }

    #[must_use]
    pub fn log_filter(&self) -> Option<&str> {
        self.logging.as_ref()?.level.as_deref()
    }

    #[must_use]
    pub fn log_file(&self) -> Option<PathBuf> {
        let file = self.logging.as_ref()?.file.as_deref()?;
        Some(PathBuf::from(expand_env_vars(file)))
    }
}

#[must_use]
pub fn config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".omnilink").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use omnilink_server::{EngineKind, HostKind};

    #[test]
    fn expand_env_vars_no_vars() {
        assert_eq!(expand_env_vars("hello world"), "hello world");
    }

    #[test]
    fn expand_env_vars_single_var() {
        unsafe {
            env::set_var("OMNILINK_TEST_VAR", "replaced");
        }
        assert_eq!(
            expand_env_vars("prefix ${OMNILINK_TEST_VAR} suffix"),
            "prefix replaced suffix"
        );
        unsafe {
            env::remove_var("OMNILINK_TEST_VAR");
        }
    }

    #[test]
    fn expand_env_vars_missing_var_becomes_empty() {
        unsafe {
            env::remove_var("OMNILINK_MISSING_VAR");
        }
        assert_eq!(
            expand_env_vars("before ${OMNILINK_MISSING_VAR} after"),
            "before  after"
        );
    }

    #[test]
    fn expand_env_vars_unclosed_brace_preserved() {
        assert_eq!(expand_env_vars("test ${UNCLOSED"), "test ${UNCLOSED");
    }

    #[test]
    fn expand_env_vars_empty_var_name_dropped() {
        assert_eq!(expand_env_vars("test ${} more"), "test  more");
    }

    #[test]
    fn expand_env_vars_adjacent_vars() {
        unsafe {
            env::set_var("OMNILINK_ADJ_A", "X");
            env::set_var("OMNILINK_ADJ_B", "Y");
        }
        assert_eq!(expand_env_vars("${OMNILINK_ADJ_A}${OMNILINK_ADJ_B}é"), "XYé");
        unsafe {
            env::remove_var("OMNILINK_ADJ_A");
            env::remove_var("OMNILINK_ADJ_B");
        }
    }

    #[test]
    fn parse_empty_config() {
        let config: OmnilinkConfig = toml::from_str("").unwrap();
        assert!(config.server.is_none());
        assert!(config.logging.is_none());
        assert_eq!(config.server_options().concurrency, 8);
    }

    #[test]
    fn parse_server_config() {
        let toml_str = r#"
[server]
engine = "lsp"
path = "/opt/omnisharp/OmniSharp.dll"
host = "dotnet"
concurrency = 4
project_load_timeout = 120
extra_args = ["--loglevel", "debug"]

[server.env]
DOTNET_ROOT = "/usr/share/dotnet"

[logging]
level = "debug"
"#;
        let config: OmnilinkConfig = toml::from_str(toml_str).unwrap();
        let options = config.server_options();
        assert_eq!(options.engine, EngineKind::Lsp);
        assert_eq!(options.host, HostKind::Dotnet);
        assert_eq!(options.concurrency, 4);
        assert_eq!(options.project_load_timeout, 120);
        assert_eq!(options.min_mono_version, "6.4.0");
        assert_eq!(options.extra_args, ["--loglevel", "debug"]);
        assert_eq!(
            options.env.get("DOTNET_ROOT").map(String::as_str),
            Some("/usr/share/dotnet")
        );
        assert_eq!(config.log_filter(), Some("debug"));
    }

    #[test]
    fn server_path_expands_env() {
        unsafe {
            env::set_var("OMNILINK_TEST_HOME", "/srv");
        }
        let config: OmnilinkConfig =
            toml::from_str("[server]\npath = \"${OMNILINK_TEST_HOME}/OmniSharp\"\n").unwrap();
        assert_eq!(
            config.server_options().path.as_deref(),
            Some("/srv/OmniSharp")
        );
        unsafe {
            env::remove_var("OMNILINK_TEST_HOME");
        }
    }

    #[test]
    fn load_from_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let result = OmnilinkConfig::load_from(&dir.path().join("config.toml")).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn load_from_invalid_file_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[server\nengine = ").unwrap();
        let err = OmnilinkConfig::load_from(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert_eq!(err.path(), &path);
    }

    #[test]
    fn unknown_engine_rejected() {
        let result: Result<OmnilinkConfig, _> = toml::from_str("[server]\nengine = \"grpc\"\n");
        assert!(result.is_err());
    }
}
