//! # Service Launcher
//!
//! Starts the image's service as the single foreground process-of-record
//! and turns its exit into the launcher's exit.
//!
//! ## Process Lifecycle
//!
//! ```text
//!   ┌──────────┐  spawn   ┌─────────┐  exit 0          ┌─────────────┐
//!   │ Starting │ ───────► │ Running │ ───────────────► │ ExitedClean │
//!   └──────────┘          └────┬────┘                  └─────────────┘
//!                              │ exit N / signal S     ┌──────────────┐
//!                              └─────────────────────► │ ExitedFailed │
//!                                                      └──────────────┘
//! ```
//!
//! There is no restart path: supervision belongs to whatever runs the
//! launcher. SIGTERM, SIGINT, SIGHUP and SIGQUIT received by the launcher
//! are forwarded to the child, which runs in its own process group so each
//! signal arrives exactly once. The handlers are installed before the child
//! is spawned.
//!
//! ## Exit Codes
//!
//! | Child outcome        | Launcher exit code |
//! |----------------------|--------------------|
//! | exit status N        | N                  |
//! | killed by signal S   | 128 + S            |

use crate::buildfile::BuildFile;
use crate::config::RuntimeConfig;
use crate::constants::{
    DEFAULT_ADDRESS_FLAG, DEFAULT_PORT, DEFAULT_PORT_FLAG, LABEL_ADDRESS, LABEL_ADDRESS_FLAG,
    LABEL_PORT, LABEL_PORT_FLAG,
};
use crate::error::{Error, Result};
use crate::image::ImageConfig;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use tracing::{debug, info, warn};

/// Launch-time overrides of the bind endpoint.
#[derive(Debug, Clone, Copy, Default)]
pub struct LaunchOverrides {
    /// Replaces the bind port.
    pub port: Option<u16>,
    /// Replaces the bind address.
    pub address: Option<IpAddr>,
}

/// Everything needed to start the service.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    program: Vec<String>,
    port: u16,
    address: IpAddr,
    port_flag: String,
    address_flag: String,
    working_dir: Option<PathBuf>,
    env: RuntimeConfig,
    exposed_port: Option<u16>,
    isolated_env: bool,
    root: Option<PathBuf>,
}

impl LaunchSpec {
    /// Creates a spec for `program` bound to `0.0.0.0:8501`.
    pub fn new(program: Vec<String>, env: RuntimeConfig) -> Result<Self> {
        if program.is_empty() || program[0].is_empty() {
            return Err(Error::InvalidLaunchSpec("empty service command".to_string()));
        }
        Ok(Self {
            program,
            port: DEFAULT_PORT,
            address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port_flag: DEFAULT_PORT_FLAG.to_string(),
            address_flag: DEFAULT_ADDRESS_FLAG.to_string(),
            working_dir: None,
            env,
            exposed_port: None,
            isolated_env: false,
            root: None,
        })
    }

    /// Builds a spec from a stored image config.
    ///
    /// The environment is exactly the recorded one; the ambient
    /// environment of the launcher is not inherited.
    pub fn from_image(config: &ImageConfig, overrides: LaunchOverrides) -> Result<Self> {
        let c = &config.config;
        let labels = &c.labels;

        let port = match labels.get(LABEL_PORT) {
            Some(p) => p
                .parse::<u16>()
                .map_err(|_| Error::InvalidLaunchSpec(format!("bad port label '{}'", p)))?,
            None => DEFAULT_PORT,
        };
        let address = match labels.get(LABEL_ADDRESS) {
            Some(a) => a
                .parse::<IpAddr>()
                .map_err(|_| Error::InvalidLaunchSpec(format!("bad address label '{}'", a)))?,
            None => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        };
        let exposed_port = c
            .exposed_ports
            .keys()
            .filter_map(|k| k.strip_suffix("/tcp"))
            .find_map(|p| p.parse::<u16>().ok());

        let mut spec = Self::new(c.entrypoint.clone(), RuntimeConfig::from_env_list(&c.env))?;
        spec.port = overrides.port.unwrap_or(port);
        spec.address = overrides.address.unwrap_or(address);
        if let Some(flag) = labels.get(LABEL_PORT_FLAG) {
            spec.port_flag = flag.clone();
        }
        if let Some(flag) = labels.get(LABEL_ADDRESS_FLAG) {
            spec.address_flag = flag.clone();
        }
        if !c.working_dir.is_empty() {
            spec.working_dir = Some(PathBuf::from(&c.working_dir));
        }
        spec.exposed_port = exposed_port;
        spec.isolated_env = true;
        Ok(spec)
    }

    /// Builds a spec for running in place from a build file.
    ///
    /// The launcher's ambient environment is inherited and the build
    /// environment is applied over it.
    pub fn from_build_file(file: &BuildFile, context: &Path, overrides: LaunchOverrides) -> Result<Self> {
        let launch = &file.launch;
        let address = launch.address.parse::<IpAddr>().map_err(|_| {
            Error::InvalidLaunchSpec(format!("'{}' is not an IP address", launch.address))
        })?;

        let mut spec = Self::new(launch.command.clone(), RuntimeConfig::from(file.build_env()))?;
        spec.port = overrides.port.unwrap_or(launch.port);
        spec.address = overrides.address.unwrap_or(address);
        spec.port_flag = launch.port_flag.clone();
        spec.address_flag = launch.address_flag.clone();
        spec.working_dir = Some(context.to_path_buf());
        spec.exposed_port = Some(launch.port);
        Ok(spec)
    }

    /// Sets the bind port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Sets the bind address.
    pub fn with_address(mut self, address: IpAddr) -> Self {
        self.address = address;
        self
    }

    /// Sets the flag names carrying port and address.
    pub fn with_flags(mut self, port_flag: impl Into<String>, address_flag: impl Into<String>) -> Self {
        self.port_flag = port_flag.into();
        self.address_flag = address_flag.into();
        self
    }

    /// Sets the working directory (inside the root, when one is set).
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Records the port the image advertises.
    pub fn with_exposed_port(mut self, port: u16) -> Self {
        self.exposed_port = Some(port);
        self
    }

    /// Starts the child with only the runtime configuration as environment.
    pub fn isolated(mut self) -> Self {
        self.isolated_env = true;
        self
    }

    /// Runs the child chrooted into `rootfs`.
    pub fn with_root(mut self, rootfs: impl Into<PathBuf>) -> Self {
        self.root = Some(rootfs.into());
        self
    }

    /// Returns the full argument vector.
    pub fn argv(&self) -> Vec<String> {
        let mut argv = self.program.clone();
        argv.push(format!("{}={}", self.port_flag, self.port));
        argv.push(format!("{}={}", self.address_flag, self.address));
        argv
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn address(&self) -> IpAddr {
        self.address
    }

    /// Returns the runtime configuration applied to the child.
    pub fn env(&self) -> &RuntimeConfig {
        &self.env
    }

    /// Returns the chroot directory, if any.
    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }
}

/// Lifecycle state of the service process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Not yet spawned.
    Starting,
    /// Spawned and not yet reaped.
    Running {
        /// Child process id.
        pid: u32,
    },
    /// Exited with status 0.
    ExitedClean,
    /// Exited non-zero or was killed.
    ExitedFailed {
        /// Exit code the launcher reports.
        code: i32,
    },
}

/// Final result of a launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchOutcome {
    /// Exit code to report.
    pub exit_code: i32,
    /// Terminating signal, if the child was killed.
    pub signal: Option<i32>,
}

/// Runs one service process to completion.
pub struct Launcher {
    spec: LaunchSpec,
    state: ProcessState,
}

impl Launcher {
    pub fn new(spec: LaunchSpec) -> Self {
        Self {
            spec,
            state: ProcessState::Starting,
        }
    }

    /// Returns the current lifecycle state.
    pub fn state(&self) -> ProcessState {
        self.state
    }

    /// Spawns the child, forwards signals until it exits and reports its
    /// exit.
    ///
    /// # Errors
    ///
    /// [`Error::SpawnFailed`] if the process cannot be started. There is no
    /// retry. [`Error::InvalidLaunchSpec`] if the working directory is
    /// missing from the root filesystem; nothing is spawned then.
    pub async fn run(&mut self) -> Result<LaunchOutcome> {
        let spec = &self.spec;
        if let Some(exposed) = spec.exposed_port
            && exposed != spec.port
        {
            warn!(
                "Binding port {} but the image exposes {}; published port mappings may not reach the service",
                spec.port, exposed
            );
        }

        let argv = spec.argv();
        let mut cmd = tokio::process::Command::new(&argv[0]);
        cmd.args(&argv[1..]);
        if spec.isolated_env {
            cmd.env_clear();
        }
        cmd.envs(spec.env.iter());

        match &spec.root {
            Some(root) => {
                let workdir = spec.working_dir.clone().unwrap_or_else(|| PathBuf::from("/"));
                check_working_dir(root, &workdir)?;
                confine(&mut cmd, root, &workdir, &[])
                    .map_err(|e| Error::InvalidLaunchSpec(e.to_string()))?;
            }
            None => {
                if let Some(dir) = &spec.working_dir {
                    cmd.current_dir(dir);
                }
            }
        }
        #[cfg(unix)]
        cmd.process_group(0);

        // The child leaves our process group, so a signal arriving before the
        // handlers exist would kill the launcher and orphan it.
        let mut signals = ForwardedSignals::install()?;

        info!("Starting {}", argv.join(" "));
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(source) => {
                let err = Error::SpawnFailed {
                    program: argv[0].clone(),
                    source,
                };
                self.state = ProcessState::ExitedFailed {
                    code: spawn_failure_code(&err),
                };
                return Err(err);
            }
        };

        let pid = child.id().unwrap_or(0);
        self.state = ProcessState::Running { pid };
        debug!("Service running as pid {}", pid);

        let status = signals.wait_forwarding(&mut child, pid).await?;
        let outcome = outcome_of(status);
        self.state = if outcome.exit_code == 0 {
            ProcessState::ExitedClean
        } else {
            ProcessState::ExitedFailed {
                code: outcome.exit_code,
            }
        };

        match outcome.signal {
            Some(sig) => info!("Service killed by signal {} (exit {})", sig, outcome.exit_code),
            None => info!("Service exited with status {}", outcome.exit_code),
        }
        Ok(outcome)
    }
}

fn check_working_dir(root: &Path, workdir: &Path) -> Result<()> {
    let rel = workdir.strip_prefix("/").unwrap_or(workdir);
    if root.join(rel).is_dir() {
        return Ok(());
    }
    Err(Error::InvalidLaunchSpec(format!(
        "working directory {} does not exist in {}",
        workdir.display(),
        root.display()
    )))
}

/// Confines `cmd` to `root` between fork and exec.
///
/// Each host path in `binds` is first bind-mounted to the same place under
/// `root` inside a private mount namespace. The mounts live and die with
/// the child's namespace and never show up on the host.
#[cfg(unix)]
pub(crate) fn confine(
    cmd: &mut tokio::process::Command,
    root: &Path,
    workdir: &Path,
    binds: &[&str],
) -> std::io::Result<()> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let to_cstring = |p: &Path| {
        CString::new(p.as_os_str().as_bytes()).map_err(|_| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("path contains NUL: {}", p.display()),
            )
        })
    };
    let root_c = to_cstring(root)?;
    let dir_c = to_cstring(workdir)?;
    let mounts = binds
        .iter()
        .map(|b| Ok((to_cstring(Path::new(b))?, to_cstring(&root.join(b.trim_start_matches('/')))?)))
        .collect::<std::io::Result<Vec<_>>>()?;

    // SAFETY: the closure runs between fork and exec and only issues raw
    // syscalls on pre-allocated strings.
    unsafe {
        cmd.pre_exec(move || {
            if !mounts.is_empty() {
                bind_private(&mounts)?;
            }
            if libc::chroot(root_c.as_ptr()) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            if libc::chdir(dir_c.as_ptr()) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
    Ok(())
}

#[cfg(not(unix))]
pub(crate) fn confine(
    _cmd: &mut tokio::process::Command,
    root: &Path,
    _workdir: &Path,
    _binds: &[&str],
) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        format!("running from a root filesystem ({}) requires a Unix host", root.display()),
    ))
}

#[cfg(target_os = "linux")]
fn bind_private(mounts: &[(std::ffi::CString, std::ffi::CString)]) -> std::io::Result<()> {
    // SAFETY: plain syscalls on valid NUL-terminated strings.
    unsafe {
        if libc::unshare(libc::CLONE_NEWNS) != 0 {
            return Err(std::io::Error::last_os_error());
        }
        if libc::mount(
            std::ptr::null(),
            c"/".as_ptr(),
            std::ptr::null(),
            libc::MS_REC | libc::MS_PRIVATE,
            std::ptr::null(),
        ) != 0
        {
            return Err(std::io::Error::last_os_error());
        }
        for (source, target) in mounts {
            if libc::mount(
                source.as_ptr(),
                target.as_ptr(),
                std::ptr::null(),
                libc::MS_BIND | libc::MS_REC,
                std::ptr::null(),
            ) != 0
            {
                return Err(std::io::Error::last_os_error());
            }
        }
    }
    Ok(())
}

#[cfg(all(unix, not(target_os = "linux")))]
fn bind_private(_mounts: &[(std::ffi::CString, std::ffi::CString)]) -> std::io::Result<()> {
    Err(std::io::Error::from(std::io::ErrorKind::Unsupported))
}

/// Handlers for the signals forwarded to the child.
#[cfg(unix)]
struct ForwardedSignals {
    term: tokio::signal::unix::Signal,
    int: tokio::signal::unix::Signal,
    hup: tokio::signal::unix::Signal,
    quit: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl ForwardedSignals {
    fn install() -> Result<Self> {
        use tokio::signal::unix::{SignalKind, signal};
        Ok(Self {
            term: signal(SignalKind::terminate())?,
            int: signal(SignalKind::interrupt())?,
            hup: signal(SignalKind::hangup())?,
            quit: signal(SignalKind::quit())?,
        })
    }

    async fn wait_forwarding(&mut self, child: &mut tokio::process::Child, pid: u32) -> Result<ExitStatus> {
        loop {
            tokio::select! {
                status = child.wait() => return Ok(status?),
                Some(()) = self.term.recv() => forward(pid, libc::SIGTERM),
                Some(()) = self.int.recv() => forward(pid, libc::SIGINT),
                Some(()) = self.hup.recv() => forward(pid, libc::SIGHUP),
                Some(()) = self.quit.recv() => forward(pid, libc::SIGQUIT),
            }
        }
    }
}

#[cfg(not(unix))]
struct ForwardedSignals;

#[cfg(not(unix))]
impl ForwardedSignals {
    fn install() -> Result<Self> {
        Ok(Self)
    }

    async fn wait_forwarding(&mut self, child: &mut tokio::process::Child, _pid: u32) -> Result<ExitStatus> {
        Ok(child.wait().await?)
    }
}

#[cfg(unix)]
fn forward(pid: u32, signal: i32) {
    if pid == 0 {
        return;
    }
    debug!("Forwarding signal {} to pid {}", signal, pid);
    // SAFETY: kill(2) has no memory-safety preconditions.
    let rc = unsafe { libc::kill(pid as libc::pid_t, signal) };
    if rc != 0 {
        warn!(
            "Failed to forward signal {}: {}",
            signal,
            std::io::Error::last_os_error()
        );
    }
}

/// Maps a child exit status to the launcher's exit code.
pub fn outcome_of(status: ExitStatus) -> LaunchOutcome {
    if let Some(code) = status.code() {
        return LaunchOutcome {
            exit_code: code,
            signal: None,
        };
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(sig) = status.signal() {
            return LaunchOutcome {
                exit_code: 128 + sig,
                signal: Some(sig),
            };
        }
    }
    LaunchOutcome {
        exit_code: 1,
        signal: None,
    }
}

/// Maps a spawn failure to the conventional shell exit code.
pub fn spawn_failure_code(error: &Error) -> i32 {
    match error {
        Error::SpawnFailed { source, .. } if source.kind() == std::io::ErrorKind::NotFound => 127,
        _ => 126,
    }
}
