use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::output::{pump_lines, OutputChunk, StreamKind};
use crate::{CommandSpec, Language, ResourceLimits, SandboxError, SandboxPolicy, StepKind};

/// How a terminate request ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The process had already exited before the request
    AlreadyExited(ExitStatus),
    /// The process exited within the grace period after SIGTERM
    Graceful(ExitStatus),
    /// The process had to be SIGKILLed
    Forced(ExitStatus),
}

impl Termination {
    pub fn status(&self) -> ExitStatus {
        match self {
            Termination::AlreadyExited(s) | Termination::Graceful(s) | Termination::Forced(s) => *s,
        }
    }

    pub fn was_forced(&self) -> bool {
        matches!(self, Termination::Forced(_))
    }
}

/// One running step of a sandboxed run.
///
/// The process leads its own process group so that terminating it also takes
/// down anything it forked. Output is forwarded line by line to the channel
/// given at spawn time; the channel closes once both pipes hit EOF.
pub struct SandboxProcess {
    child: Child,
    pid: Option<u32>,
    step: StepKind,
    started_at: Instant,
}

impl SandboxProcess {
    pub(crate) fn spawn(
        language: Language,
        spec: &CommandSpec,
        step: StepKind,
        scratch: &Path,
        policy: &SandboxPolicy,
        limits: &ResourceLimits,
        output: mpsc::UnboundedSender<OutputChunk>,
    ) -> Result<Self, SandboxError> {
        debug!(
            program = %spec.program.display(),
            args = ?spec.args,
            scratch = %scratch.display(),
            ?step,
            "Spawning sandboxed process"
        );

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .current_dir(scratch)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .env_clear();

        for key in &policy.env_passthrough {
            if let Some(value) = std::env::var_os(key) {
                cmd.env(key, value);
            }
        }
        cmd.env("HOME", scratch).env("TMPDIR", scratch);
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        #[cfg(unix)]
        isolation::IsolationPlan::new(spec, scratch, policy, limits).apply(&mut cmd);
        #[cfg(not(unix))]
        let _ = limits;

        let mut child = cmd.spawn().map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => SandboxError::ToolchainUnavailable {
                language,
                binary: spec.program.display().to_string(),
            },
            _ => SandboxError::SpawnFailed(e),
        })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SandboxError::SpawnFailed(std::io::Error::other("stdout not captured")))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| SandboxError::SpawnFailed(std::io::Error::other("stderr not captured")))?;

        tokio::spawn(pump_lines(stdout, StreamKind::Stdout, output.clone()));
        tokio::spawn(pump_lines(stderr, StreamKind::Stderr, output));

        let pid = child.id();
        debug!(?pid, "Sandboxed process started");

        Ok(Self {
            child,
            pid,
            step,
            started_at: Instant::now(),
        })
    }

    pub fn id(&self) -> Option<u32> {
        self.pid
    }

    pub fn step(&self) -> StepKind {
        self.step
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Wait for the process to exit
    pub async fn wait(&mut self) -> Result<ExitStatus, SandboxError> {
        Ok(self.child.wait().await?)
    }

    /// SIGTERM the process group, then SIGKILL it if it outlives `grace`
    pub async fn terminate(&mut self, grace: Duration) -> Result<Termination, SandboxError> {
        if let Some(status) = self.child.try_wait()? {
            self.reap_group();
            return Ok(Termination::AlreadyExited(status));
        }

        self.signal_group(false);

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(status) => {
                let status = status?;
                self.reap_group();
                Ok(Termination::Graceful(status))
            }
            Err(_) => {
                debug!(pid = ?self.pid, grace_ms = grace.as_millis(), "Grace period elapsed, killing");
                self.signal_group(true);
                if let Err(e) = self.child.start_kill() {
                    debug!(error = %e, "Process already gone");
                }
                let status = self
                    .child
                    .wait()
                    .await
                    .map_err(|e| SandboxError::TerminateFailed(e.to_string()))?;
                Ok(Termination::Forced(status))
            }
        }
    }

    /// Kill anything the process left behind in its group after it exited
    pub fn reap_group(&mut self) {
        self.signal_group(true);
    }

    #[cfg(unix)]
    fn signal_group(&mut self, kill: bool) {
        use nix::errno::Errno;
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        let Some(pid) = self.pid else {
            return;
        };
        let signal = if kill { Signal::SIGKILL } else { Signal::SIGTERM };
        match killpg(Pid::from_raw(pid as i32), signal) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => warn!(pid, ?signal, error = %e, "Failed to signal process group"),
        }
    }

    #[cfg(not(unix))]
    fn signal_group(&mut self, _kill: bool) {
        if let Err(e) = self.child.start_kill() {
            warn!(error = %e, "Failed to kill process");
        }
    }
}

/// Signal that terminated the process, if any
pub fn exit_signal(status: &ExitStatus) -> Option<i32> {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        status.signal()
    }
    #[cfg(not(unix))]
    {
        let _ = status;
        None
    }
}

/// Exit code in shell convention: the real code, or 128 + signal number
pub fn shell_exit_code(status: &ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| exit_signal(status).map(|sig| 128 + sig))
        .unwrap_or(-1)
}

#[cfg(unix)]
mod isolation {
    use std::path::Path;

    use nix::sys::resource::{getrlimit, setrlimit, Resource};
    use tokio::process::Command;

    use crate::{CommandSpec, IsolationMode, MemoryStrategy, ResourceLimits, SandboxPolicy};

    /// Everything the child applies to itself between fork and exec.
    ///
    /// All strings are built before fork: the closure runs in the child,
    /// where allocating or taking locks is not allowed.
    #[derive(Debug)]
    pub(super) struct IsolationPlan {
        address_space: Option<u64>,
        file_size: u64,
        open_files: u64,
        cpu_seconds: u64,
        namespaces: bool,
        network: bool,
        strict: bool,
        #[cfg(target_os = "linux")]
        filesystem: Option<linux::FilesystemScope>,
    }

    impl IsolationPlan {
        pub(super) fn new(
            spec: &CommandSpec,
            scratch: &Path,
            policy: &SandboxPolicy,
            limits: &ResourceLimits,
        ) -> Self {
            #[cfg(not(target_os = "linux"))]
            let _ = scratch;

            Self {
                address_space: match spec.memory {
                    MemoryStrategy::AddressSpace => Some(limits.max_memory),
                    MemoryStrategy::InterpreterFlag | MemoryStrategy::Unbounded => None,
                },
                file_size: policy.max_scratch_bytes,
                open_files: policy.max_open_files,
                // CPU time can never exceed wall time; this only backs up the timer
                cpu_seconds: limits.timeout.as_secs().saturating_add(1),
                namespaces: policy.wants_namespaces(),
                network: policy.network,
                strict: policy.isolation == IsolationMode::Strict,
                #[cfg(target_os = "linux")]
                filesystem: if policy.confines_filesystem() {
                    linux::FilesystemScope::new(scratch)
                } else {
                    None
                },
            }
        }

        pub(super) fn apply(self, cmd: &mut Command) {
            cmd.process_group(0);
            // SAFETY: `enter` only issues setrlimit/unshare/mount syscalls and
            // reads data prepared before fork; it does not allocate or lock.
            unsafe {
                cmd.pre_exec(move || self.enter());
            }
        }

        fn enter(&self) -> std::io::Result<()> {
            lower(Resource::RLIMIT_CORE, 0)?;
            lower(Resource::RLIMIT_NOFILE, self.open_files)?;
            lower(Resource::RLIMIT_FSIZE, self.file_size)?;
            lower(Resource::RLIMIT_CPU, self.cpu_seconds)?;
            if let Some(bytes) = self.address_space {
                lower(Resource::RLIMIT_AS, bytes)?;
            }

            #[cfg(target_os = "linux")]
            if self.namespaces {
                self.enter_namespaces()?;
            }
            #[cfg(not(target_os = "linux"))]
            let _ = (self.namespaces, self.network, self.strict);
            Ok(())
        }

        #[cfg(target_os = "linux")]
        fn enter_namespaces(&self) -> std::io::Result<()> {
            use nix::sched::{unshare, CloneFlags};

            let mut flags = CloneFlags::CLONE_NEWUSER;
            if !self.network {
                flags |= CloneFlags::CLONE_NEWNET;
            }
            if self.filesystem.is_some() {
                flags |= CloneFlags::CLONE_NEWNS;
            }

            // Unprivileged user namespaces are often disabled in containers
            if let Err(e) = unshare(flags) {
                return if self.strict { Err(e.into()) } else { Ok(()) };
            }

            if let Some(scope) = &self.filesystem {
                scope.map_ids();
                if let Err(e) = scope.enter() {
                    if self.strict {
                        return Err(e.into());
                    }
                }
            }
            Ok(())
        }
    }

    fn lower(resource: Resource, value: u64) -> std::io::Result<()> {
        let (_, hard) = getrlimit(resource)?;
        let value = (value as nix::libc::rlim_t).min(hard);
        setrlimit(resource, value, value)?;
        Ok(())
    }

    #[cfg(target_os = "linux")]
    mod linux {
        use std::ffi::{CStr, CString};
        use std::os::unix::ffi::OsStrExt;
        use std::path::Path;

        use nix::errno::Errno;
        use nix::libc;
        use nix::mount::{mount, MsFlags};
        use nix::unistd::{getgid, getuid};

        const SYS_MOUNT_SETATTR: libc::c_long = 442;
        const AT_RECURSIVE: libc::c_uint = 0x8000;
        const MOUNT_ATTR_RDONLY: u64 = 0x1;

        /// `struct mount_attr` from `<linux/mount.h>`
        #[repr(C)]
        struct MountAttr {
            attr_set: u64,
            attr_clr: u64,
            propagation: u64,
            userns_fd: u64,
        }

        /// A private mount namespace where `/` is read-only and only the
        /// scratch directory stays writable
        #[derive(Debug)]
        pub(super) struct FilesystemScope {
            scratch: CString,
            uid_map: CString,
            gid_map: CString,
        }

        impl FilesystemScope {
            /// `None` when the scratch path cannot be passed to the kernel
            pub(super) fn new(scratch: &Path) -> Option<Self> {
                let uid = getuid();
                let gid = getgid();
                Some(Self {
                    scratch: CString::new(scratch.as_os_str().as_bytes()).ok()?,
                    uid_map: CString::new(format!("{} {} 1", uid, uid)).ok()?,
                    gid_map: CString::new(format!("{} {} 1", gid, gid)).ok()?,
                })
            }

            /// Keep the caller's ids inside the new user namespace. Failure
            /// only means the process sees itself as `nobody`.
            pub(super) fn map_ids(&self) {
                let _ = write_proc(c"/proc/self/setgroups", c"deny");
                let _ = write_proc(c"/proc/self/uid_map", &self.uid_map);
                let _ = write_proc(c"/proc/self/gid_map", &self.gid_map);
            }

            pub(super) fn enter(&self) -> nix::Result<()> {
                mount(
                    None::<&CStr>,
                    c"/",
                    None::<&CStr>,
                    MsFlags::MS_REC | MsFlags::MS_PRIVATE,
                    None::<&CStr>,
                )?;
                mount(
                    Some(self.scratch.as_c_str()),
                    self.scratch.as_c_str(),
                    None::<&CStr>,
                    MsFlags::MS_BIND | MsFlags::MS_REC,
                    None::<&CStr>,
                )?;
                set_read_only(c"/", true)?;
                set_read_only(&self.scratch, false)
            }
        }

        fn write_proc(path: &CStr, contents: &CStr) -> nix::Result<()> {
            let bytes = contents.to_bytes();
            // SAFETY: `path` is NUL-terminated and `bytes` outlives the write
            unsafe {
                let fd = Errno::result(libc::open(path.as_ptr(), libc::O_WRONLY | libc::O_CLOEXEC))?;
                let written = Errno::result(libc::write(fd, bytes.as_ptr().cast(), bytes.len()));
                libc::close(fd);
                written.map(drop)
            }
        }

        /// Set or clear the read-only flag on `path` and every mount below it
        fn set_read_only(path: &CStr, read_only: bool) -> nix::Result<()> {
            let attr = MountAttr {
                attr_set: if read_only { MOUNT_ATTR_RDONLY } else { 0 },
                attr_clr: if read_only { 0 } else { MOUNT_ATTR_RDONLY },
                propagation: 0,
                userns_fd: 0,
            };
            // SAFETY: `path` is NUL-terminated and `attr` outlives the call
            let rc = unsafe {
                libc::syscall(
                    SYS_MOUNT_SETATTR,
                    libc::AT_FDCWD,
                    path.as_ptr(),
                    AT_RECURSIVE,
                    &attr as *const MountAttr,
                    std::mem::size_of::<MountAttr>(),
                )
            };
            Errno::result(rc).map(drop)
        }
    }
}
