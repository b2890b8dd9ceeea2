//! Primitivas de processo: spawn com socket herdado, sinais e parada graciosa

use super::descriptor::{LaunchDescriptor, INHERITED_LISTENER_FD};
use super::LaunchError;
use std::io;
use std::net::TcpListener;
use std::os::unix::io::RawFd;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::process::{Child, Command};

/// Faz bind do endereço público; o socket fica com o launcher e é passado
/// aos workers no FD 3.
pub fn bind_listener(addr: &str) -> Result<TcpListener, LaunchError> {
    TcpListener::bind(addr).map_err(|source| LaunchError::Bind {
        addr: addr.to_string(),
        source,
    })
}

/// Inicia um processo a partir do descritor. stdout/stderr são herdados:
/// o destino dos logs é o do próprio contêiner.
pub fn spawn(
    descriptor: &LaunchDescriptor,
    slot: usize,
    listener: Option<RawFd>,
) -> io::Result<Child> {
    let mut command = Command::new(&descriptor.program);
    command
        .args(&descriptor.args)
        .envs(descriptor.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .env("ESTALEIRO_WORKER_SLOT", slot.to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);

    if let Some(fd) = listener {
        // SAFETY: entre fork e exec só chamamos funções async-signal-safe
        unsafe {
            command.pre_exec(move || inherit_listener(fd));
        }
    }

    command.spawn()
}

/// Coloca o socket no FD 3 do filho sem `FD_CLOEXEC`
fn inherit_listener(fd: RawFd) -> io::Result<()> {
    unsafe {
        if fd == INHERITED_LISTENER_FD {
            let flags = libc::fcntl(fd, libc::F_GETFD);
            if flags < 0 || libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) < 0 {
                return Err(io::Error::last_os_error());
            }
        } else if libc::dup2(fd, INHERITED_LISTENER_FD) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Envia um sinal; processo que já sumiu não é erro
pub fn send_signal(pid: u32, signal: i32) -> io::Result<()> {
    let rc = unsafe { libc::kill(pid as libc::pid_t, signal) };
    if rc == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        Ok(())
    } else {
        Err(err)
    }
}

/// Para um processo: SIGTERM, espera até `graceful`, depois SIGKILL
pub async fn stop_child(child: &mut Child, graceful: Duration) -> io::Result<ExitStatus> {
    if let Some(status) = child.try_wait()? {
        return Ok(status);
    }

    if let Some(pid) = child.id() {
        send_signal(pid, libc::SIGTERM)?;
    }

    match tokio::time::timeout(graceful, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            tracing::warn!(
                pid = child.id(),
                graceful_secs = graceful.as_secs(),
                "processo não encerrou no prazo; enviando SIGKILL"
            );
            child.kill().await?;
            child.wait().await
        }
    }
}

/// Código de saída no formato do shell: morte por sinal vira 128 + sinal
pub fn exit_code(status: ExitStatus) -> i32 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => 128 + signal,
        (None, None) => 1,
    }
}

pub fn effective_uid() -> u32 {
    unsafe { libc::geteuid() }
}

/// A porta já aceita conexões? `0.0.0.0`/`::` são testados via loopback
pub async fn port_accepts(host: &str, port: u16, timeout: Duration) -> bool {
    let target = match host {
        "0.0.0.0" | "" => "127.0.0.1",
        "::" | "[::]" => "::1",
        other => other,
    };
    let connect = tokio::net::TcpStream::connect((target, port));
    matches!(tokio::time::timeout(timeout, connect).await, Ok(Ok(_)))
}
