//! Resolving how to run the server and spawning it.
//!
//! The server is either a native executable or an assembly that needs a
//! host (`mono` or `dotnet`). Host lookup goes through [`HostResolver`] so
//! callers and tests can substitute their own runtime discovery.

use std::collections::HashMap;
use std::future::Future;
use std::{env, fmt};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::Stdio;
use std::sync::{Arc, LazyLock};

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use regex::Regex;
use tokio::process::{Child, Command};

use crate::error::LaunchError;
use crate::launch_target::LaunchTarget;
use crate::types::{HostKind, Platform, ServerOptions};

/// Variables never passed on to the server process.
const ENV_SECRET_DENYLIST: &[&str] = &[
    "*_API_KEY",
    "*_SECRET_KEY",
    "*_ACCESS_TOKEN",
    "AWS_SECRET_ACCESS_KEY",
    "AWS_SESSION_TOKEN",
    "*_PASSWORD*",
];

static SECRET_ENV: LazyLock<GlobSet> =
    LazyLock::new(|| build_secret_env_matcher().expect("denylist patterns are valid"));

static VERSION_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+)\.(\d+)\.(\d+)").expect("version pattern is valid"));

/// A host runtime ready to run the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostInfo {
    pub path: PathBuf,
    pub version: Option<String>,
    /// Extra environment the host needs.
    pub env: HashMap<String, String>,
}

pub type ResolveFut<'a> = Pin<Box<dyn Future<Output = Result<HostInfo, LaunchError>> + Send + 'a>>;

/// Locates a host runtime.
pub trait HostResolver: Send + Sync {
    fn resolve<'a>(&'a self, options: &'a ServerOptions) -> ResolveFut<'a>;
}

/// Resolvers for the hosts an assembly can run under.
#[derive(Clone)]
pub struct HostResolvers {
    pub mono: Arc<dyn HostResolver>,
    pub dotnet: Arc<dyn HostResolver>,
}

impl fmt::Debug for HostResolvers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostResolvers").finish_non_exhaustive()
    }
}

impl Default for HostResolvers {
    fn default() -> Self {
        Self {
            mono: Arc::new(PathHostResolver::mono()),
            dotnet: Arc::new(PathHostResolver::dotnet()),
        }
    }
}

/// Finds a host on `PATH` and checks its `--version` output.
#[derive(Debug, Clone)]
pub struct PathHostResolver {
    program: &'static str,
    check_mono_version: bool,
}

impl PathHostResolver {
    #[must_use]
    pub fn mono() -> Self {
        Self {
            program: "mono",
            check_mono_version: true,
        }
    }

    #[must_use]
    pub fn dotnet() -> Self {
        Self {
            program: "dotnet",
            check_mono_version: false,
        }
    }

    async fn probe_version(&self, path: &Path) -> Result<Option<String>, LaunchError> {
        let output = Command::new(path)
            .arg("--version")
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| LaunchError::HostProbe {
                host: self.program.to_string(),
                source,
            })?;
        let text = String::from_utf8_lossy(&output.stdout);
        Ok(parse_version(&text).map(|v| format!("{}.{}.{}", v.0, v.1, v.2)))
    }
}

impl HostResolver for PathHostResolver {
    fn resolve<'a>(&'a self, options: &'a ServerOptions) -> ResolveFut<'a> {
        Box::pin(async move {
            let path = which::which(self.program).map_err(|source| LaunchError::HostNotFound {
                name: self.program.to_string(),
                source,
            })?;
            let version = self.probe_version(&path).await?;

            if self.check_mono_version {
                let found = version.as_deref().and_then(parse_version);
                let required = parse_version(&options.min_mono_version);
                if let (Some(required), found) = (required, found)
                    && found.is_none_or(|found| found < required)
                {
                    return Err(LaunchError::HostVersion {
                        host: self.program.to_string(),
                        required: options.min_mono_version.clone(),
                        found: version.unwrap_or_else(|| String::from("unknown")),
                    });
                }
            }

            Ok(HostInfo {
                path,
                version,
                env: HashMap::new(),
            })
        })
    }
}

/// Extract the first `major.minor.patch` triple from `text`.
pub(crate) fn parse_version(text: &str) -> Option<(u32, u32, u32)> {
    let caps = VERSION_PATTERN.captures(text)?;
    let part = |i: usize| caps.get(i)?.as_str().parse::<u32>().ok();
    Some((part(1)?, part(2)?, part(3)?))
}

/// How the server ends up being invoked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchHost {
    Direct,
    Mono { version: Option<String> },
    Dotnet { version: Option<String> },
}

/// Fully resolved command line and environment for the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchPlan {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub server_path: PathBuf,
    pub host: LaunchHost,
    pub env: HashMap<String, String>,
}

impl LaunchPlan {
    #[must_use]
    pub fn host_version(&self) -> Option<&str> {
        match &self.host {
            LaunchHost::Direct => None,
            LaunchHost::Mono { version } | LaunchHost::Dotnet { version } => version.as_deref(),
        }
    }
}

/// Arguments every engine passes, in order: caller args, target, host pid,
/// encoding, then configured extras.
pub(crate) fn server_args(
    caller_args: &[String],
    target: &LaunchTarget,
    host_pid: u32,
    options: &ServerOptions,
) -> Vec<String> {
    let mut args = caller_args.to_vec();
    args.push(String::from("-s"));
    args.push(target.target.display().to_string());
    args.push(String::from("--hostPID"));
    args.push(host_pid.to_string());
    args.push(String::from("--encoding"));
    args.push(String::from("utf-8"));
    args.extend(options.extra_args.iter().cloned());
    args
}

fn resolve_server_path(options: &ServerOptions) -> Result<PathBuf, LaunchError> {
    let Some(raw) = options.path.as_deref().filter(|p| !p.is_empty()) else {
        return which::which("OmniSharp")
            .or_else(|_| which::which("omnisharp"))
            .map_err(|_| LaunchError::NoServerPath);
    };

    let path = PathBuf::from(raw);
    if path.components().count() > 1 || path.is_absolute() {
        return if path.exists() {
            Ok(path)
        } else {
            Err(LaunchError::ServerNotFound { path })
        };
    }
    which::which(&path).map_err(|_| LaunchError::ServerNotFound { path })
}

fn has_extension(path: &Path, ext: &str) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case(ext))
}

/// Choose the host from configuration, falling back to the server's file
/// type and the platform.
pub(crate) fn choose_host(options: &ServerOptions, server_path: &Path, platform: Platform) -> HostKind {
    match options.host {
        HostKind::Auto if has_extension(server_path, "dll") => HostKind::Dotnet,
        HostKind::Auto if has_extension(server_path, "exe") && platform == Platform::Posix => {
            HostKind::Mono
        }
        HostKind::Auto => HostKind::Direct,
        explicit => explicit,
    }
}

/// Resolve the server, pick a host and build the final command line.
pub(crate) async fn plan_launch(
    options: &ServerOptions,
    args: Vec<String>,
    resolvers: &HostResolvers,
    platform: Platform,
) -> Result<LaunchPlan, LaunchError> {
    let server_path = resolve_server_path(options)?;
    let mut env = options.env.clone();

    let plan = match choose_host(options, &server_path, platform) {
        HostKind::Mono => {
            let host = resolvers.mono.resolve(options).await?;
            env.extend(host.env);
            let mut full = vec![
                String::from("--assembly-loader=strict"),
                server_path.display().to_string(),
            ];
            full.extend(args);
            LaunchPlan {
                program: host.path,
                args: full,
                server_path,
                host: LaunchHost::Mono {
                    version: host.version,
                },
                env,
            }
        }
        HostKind::Dotnet => {
            let host = resolvers.dotnet.resolve(options).await?;
            env.extend(host.env);
            let mut full = vec![server_path.display().to_string()];
            full.extend(args);
            LaunchPlan {
                program: host.path,
                args: full,
                server_path,
                host: LaunchHost::Dotnet {
                    version: host.version,
                },
                env,
            }
        }
        HostKind::Direct | HostKind::Auto => LaunchPlan {
            program: server_path.clone(),
            args,
            server_path,
            host: LaunchHost::Direct,
            env,
        },
    };
    Ok(plan)
}

fn build_secret_env_matcher() -> Result<GlobSet, globset::Error> {
    let mut builder = GlobSetBuilder::new();
    for pattern in ENV_SECRET_DENYLIST {
        builder.add(GlobBuilder::new(pattern).case_insensitive(true).build()?);
    }
    builder.build()
}

fn is_secret_env(key: &str) -> bool {
    SECRET_ENV.is_match(key)
}

/// Spawn the planned command with all three stdio streams piped.
pub(crate) fn spawn(plan: &LaunchPlan, cwd: &Path) -> Result<Child, LaunchError> {
    let mut cmd = Command::new(&plan.program);
    cmd.args(&plan.args)
        .current_dir(cwd)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    for (key, _) in env::vars_os() {
        if let Some(key) = key.to_str()
            && is_secret_env(key)
        {
            cmd.env_remove(key);
        }
    }
    cmd.envs(&plan.env);

    cmd.spawn().map_err(|source| LaunchError::Spawn {
        program: plan.program.clone(),
        source,
    })
}
