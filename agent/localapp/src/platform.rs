//! OS-specific helpers: pid liveness, termination, executable bits and the
//! helper binary's platform name.

use std::io;
use std::net::{Ipv4Addr, TcpListener};
use std::path::Path;

use tokio::process::Command;

const BINARY_PREFIX: &str = "local-companion";

/// Whether a process with this pid currently exists.
///
/// A process we are not allowed to signal still counts as alive.
#[cfg(unix)]
pub fn is_pid_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    if pid == 0 {
        return false;
    }
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(windows)]
pub fn is_pid_alive(pid: u32) -> bool {
    use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

    if pid == 0 {
        return false;
    }
    let pid = Pid::from_u32(pid);
    let mut sys = System::new();
    sys.refresh_processes_specifics(
        ProcessesToUpdate::Some(&[pid]),
        true,
        ProcessRefreshKind::nothing(),
    );
    sys.process(pid).is_some()
}

/// Ask a process to exit. A process that is already gone is not an error.
#[cfg(unix)]
pub fn terminate(pid: u32) -> io::Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let raw = i32::try_from(pid)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
    if raw == 0 {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "pid 0"));
    }
    match kill(Pid::from_raw(raw), Signal::SIGTERM) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(errno) => Err(io::Error::from(errno)),
    }
}

#[cfg(windows)]
pub fn terminate(pid: u32) -> io::Result<()> {
    use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

    let pid = Pid::from_u32(pid);
    let mut sys = System::new();
    sys.refresh_processes_specifics(
        ProcessesToUpdate::Some(&[pid]),
        true,
        ProcessRefreshKind::nothing(),
    );
    match sys.process(pid) {
        None => Ok(()),
        Some(process) if process.kill() => Ok(()),
        Some(_) => Err(io::Error::new(
            io::ErrorKind::PermissionDenied,
            format!("failed to terminate process {pid}"),
        )),
    }
}

/// Start the child outside our process group so it outlives this process and
/// does not receive terminal signals aimed at it.
pub fn detach(command: &mut Command) {
    #[cfg(unix)]
    {
        command.process_group(0);
    }
    #[cfg(windows)]
    {
        const DETACHED_PROCESS: u32 = 0x0000_0008;
        const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
        const CREATE_NO_WINDOW: u32 = 0x0800_0000;
        command.creation_flags(DETACHED_PROCESS | CREATE_NEW_PROCESS_GROUP | CREATE_NO_WINDOW);
    }
    command.kill_on_drop(false);
}

/// Reserve an ephemeral loopback port. The listener is closed before
/// returning, so the port is only very likely to still be free.
pub fn allocate_port() -> io::Result<u16> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;
    Ok(listener.local_addr()?.port())
}

pub async fn is_executable(path: &Path) -> bool {
    let Ok(metadata) = tokio::fs::metadata(path).await else {
        return false;
    };
    if !metadata.is_file() {
        return false;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        metadata.permissions().mode() & 0o111 != 0
    }
    #[cfg(not(unix))]
    {
        true
    }
}

pub async fn make_executable(path: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).await?;
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
    Ok(())
}

/// File name of the helper binary published for the running platform.
pub fn helper_binary_name() -> String {
    binary_name_for(std::env::consts::OS, std::env::consts::ARCH)
}

fn binary_name_for(os: &str, arch: &str) -> String {
    let platform = match os {
        "windows" => "windows",
        "macos" => "darwin",
        _ => "linux",
    };
    let variant = match (platform, arch) {
        (_, "aarch64") => "-arm64",
        ("windows", "x86") => "-386",
        _ => "",
    };
    let extension = if platform == "windows" { ".exe" } else { "" };
    format!("{BINARY_PREFIX}-{platform}{variant}{extension}")
}
