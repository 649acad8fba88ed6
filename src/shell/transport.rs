//! Endpoints, connection parameters and the launchers that turn them into a
//! spawnable shell command.
//!
//! The scheme of an endpoint URL picks a [`ShellLauncher`] from a
//! [`LauncherRegistry`] once, when a session is opened.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use portable_pty::CommandBuilder;

use crate::error::{Error, Result};

/// How the shell process reaches its host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    /// local `fork`/`exec` of the shell
    Fork,
    Ssh,
    GsiSsh,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Fork => write!(f, "fork"),
            Transport::Ssh => write!(f, "ssh"),
            Transport::GsiSsh => write!(f, "gsissh"),
        }
    }
}

/// `scheme://[user@]host[:port][/path]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub scheme: String,
    pub user: Option<String>,
    pub host: String,
    pub port: Option<u16>,
    pub path: Option<String>,
}

impl Endpoint {
    pub fn parse(url: &str) -> Result<Self> {
        let (scheme, rest) = url
            .split_once("://")
            .ok_or_else(|| Error::BadParameter(format!("'{}' is not a URL (missing scheme)", url)))?;
        if scheme.is_empty() {
            return Err(Error::BadParameter(format!("'{}' has an empty scheme", url)));
        }

        let (authority, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], Some(rest[idx..].to_string())),
            None => (rest, None),
        };

        let (user, hostport) = match authority.rsplit_once('@') {
            Some((user, hostport)) => (Some(user.to_string()), hostport),
            None => (None, authority),
        };

        let (host, port) = match hostport.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| Error::BadParameter(format!("invalid port '{}' in '{}'", port, url)))?;
                (host.to_string(), Some(port))
            }
            None => (hostport.to_string(), None),
        };

        let host = if host.is_empty() { "localhost".to_string() } else { host };

        Ok(Self {
            scheme: scheme.to_ascii_lowercase(),
            user,
            host,
            port,
            path: path.filter(|p| p != "/"),
        })
    }

    /// The local host, reached by forking a shell.
    pub fn local() -> Self {
        Self {
            scheme: "fork".to_string(),
            user: None,
            host: "localhost".to_string(),
            port: None,
            path: None,
        }
    }

    /// `user@host` as understood by ssh/scp.
    pub fn destination(&self, params: &ConnectParams) -> String {
        match params.user.as_ref().or(self.user.as_ref()) {
            Some(user) => format!("{}@{}", user, self.host),
            None => self.host.clone(),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://", self.scheme)?;
        if let Some(user) = &self.user {
            write!(f, "{}@", user)?;
        }
        write!(f, "{}", self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        if let Some(path) = &self.path {
            write!(f, "{}", path)?;
        }
        Ok(())
    }
}

/// Connection/authentication parameters supplied by the caller's context.
/// They only shape the spawn command line.
#[derive(Debug, Clone, Default)]
pub struct ConnectParams {
    /// Overrides the user from the URL.
    pub user: Option<String>,
    pub identity: Option<PathBuf>,
    /// Passed to `-J`.
    pub proxy_jump: Option<String>,
    /// Extra `-o key=value` options.
    pub options: Vec<String>,
}

/// Builds the command that starts an interactive shell for one transport.
pub trait ShellLauncher: Send + Sync {
    fn transport(&self) -> Transport;

    /// Command spawning an interactive `shell` on `endpoint`.
    fn shell_command(&self, endpoint: &Endpoint, params: &ConnectParams, shell: &str) -> CommandBuilder;

    /// argv of an out-of-band copy of `sources` to `target`, where remote
    /// paths are marked by [`CopyPath::Remote`]. `None` when the transport
    /// has no such tool.
    fn copy_command(
        &self,
        endpoint: &Endpoint,
        params: &ConnectParams,
        source: CopyPath<'_>,
        target: CopyPath<'_>,
        recursive: bool,
    ) -> Option<Vec<String>>;
}

#[derive(Debug, Clone, Copy)]
pub enum CopyPath<'a> {
    Local(&'a str),
    Remote(&'a str),
}

pub struct ForkLauncher;

impl ShellLauncher for ForkLauncher {
    fn transport(&self) -> Transport {
        Transport::Fork
    }

    fn shell_command(&self, _endpoint: &Endpoint, _params: &ConnectParams, shell: &str) -> CommandBuilder {
        let mut cmd = CommandBuilder::new(shell);
        cmd.arg("-i");
        cmd.env("TERM", "dumb");
        // keep user rc files from reshaping the prompt
        cmd.env_remove("ENV");
        if let Some(home) = dirs::home_dir() {
            cmd.cwd(home);
        }
        cmd
    }

    fn copy_command(
        &self,
        _endpoint: &Endpoint,
        _params: &ConnectParams,
        _source: CopyPath<'_>,
        _target: CopyPath<'_>,
        _recursive: bool,
    ) -> Option<Vec<String>> {
        None
    }
}

/// `ssh` and `gsissh` share everything but the program names.
pub struct SshLauncher {
    transport: Transport,
    program: &'static str,
    copy_program: &'static str,
}

impl SshLauncher {
    pub fn ssh() -> Self {
        Self {
            transport: Transport::Ssh,
            program: "ssh",
            copy_program: "scp",
        }
    }

    pub fn gsissh() -> Self {
        Self {
            transport: Transport::GsiSsh,
            program: "gsissh",
            copy_program: "gsiscp",
        }
    }

    fn common_options(&self, params: &ConnectParams, port_flag: &str, endpoint: &Endpoint) -> Vec<String> {
        // never stop at an interactive password prompt
        let mut args = vec!["-o".to_string(), "BatchMode=yes".to_string()];
        if let Some(port) = endpoint.port {
            args.push(port_flag.to_string());
            args.push(port.to_string());
        }
        if let Some(identity) = &params.identity {
            args.push("-i".to_string());
            args.push(identity.to_string_lossy().to_string());
        }
        if let Some(proxy) = &params.proxy_jump {
            args.push("-J".to_string());
            args.push(proxy.clone());
        }
        for option in &params.options {
            args.push("-o".to_string());
            args.push(option.clone());
        }
        args
    }
}

impl ShellLauncher for SshLauncher {
    fn transport(&self) -> Transport {
        self.transport
    }

    fn shell_command(&self, endpoint: &Endpoint, params: &ConnectParams, shell: &str) -> CommandBuilder {
        let mut cmd = CommandBuilder::new(self.program);
        cmd.env("TERM", "dumb");
        // force a remote pty, no escape character
        cmd.args(["-tt", "-e", "none"]);
        cmd.args(self.common_options(params, "-p", endpoint));
        cmd.arg(endpoint.destination(params));
        cmd.arg(shell);
        cmd.arg("-i");
        cmd
    }

    fn copy_command(
        &self,
        endpoint: &Endpoint,
        params: &ConnectParams,
        source: CopyPath<'_>,
        target: CopyPath<'_>,
        recursive: bool,
    ) -> Option<Vec<String>> {
        let destination = endpoint.destination(params);
        let render = |path: CopyPath<'_>| match path {
            CopyPath::Local(p) => p.to_string(),
            CopyPath::Remote(p) => format!("{}:{}", destination, p),
        };

        let mut argv = vec![self.copy_program.to_string(), "-q".to_string()];
        argv.extend(self.common_options(params, "-P", endpoint));
        if recursive {
            argv.push("-r".to_string());
        }
        argv.push(render(source));
        argv.push(render(target));
        Some(argv)
    }
}

/// Launchers keyed by URL scheme.
#[derive(Clone)]
pub struct LauncherRegistry {
    launchers: HashMap<String, Arc<dyn ShellLauncher>>,
}

impl Default for LauncherRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        let fork: Arc<dyn ShellLauncher> = Arc::new(ForkLauncher);
        registry.register("fork", fork.clone());
        registry.register("local", fork);
        registry.register("ssh", Arc::new(SshLauncher::ssh()));
        registry.register("gsissh", Arc::new(SshLauncher::gsissh()));
        registry
    }
}

impl LauncherRegistry {
    pub fn empty() -> Self {
        Self {
            launchers: HashMap::new(),
        }
    }

    pub fn register(&mut self, scheme: &str, launcher: Arc<dyn ShellLauncher>) {
        self.launchers.insert(scheme.to_ascii_lowercase(), launcher);
    }

    pub fn resolve(&self, scheme: &str) -> Result<Arc<dyn ShellLauncher>> {
        self.launchers
            .get(&scheme.to_ascii_lowercase())
            .cloned()
            .ok_or_else(|| Error::BadParameter(format!("unsupported URL scheme '{}'", scheme)))
    }

    pub fn schemes(&self) -> Vec<String> {
        let mut schemes: Vec<String> = self.launchers.keys().cloned().collect();
        schemes.sort();
        schemes
    }
}
