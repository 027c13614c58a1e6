use std::{
    io,
    process::{Command, Stdio},
    thread,
};

use nix::{
    errno::Errno,
    sys::signal::{kill, Signal},
    unistd::Pid,
};
use tracing::debug;

/// `sh -c <cmd>`
pub fn shell(cmd: &str) -> Command {
    let mut c = Command::new("sh");
    c.arg("-c").arg(cmd);
    c
}

/// Lanza sin esperar. Un hilo aparte recoge al hijo cuando termine para
/// no dejar zombies.
pub fn spawn_detached(mut cmd: Command) -> io::Result<u32> {
    let mut child = cmd.stdin(Stdio::null()).spawn()?;
    let pid = child.id();
    thread::spawn(move || match child.wait() {
        Ok(status) => debug!("proceso {} terminó con {}", pid, status),
        Err(e) => debug!("no se pudo esperar al proceso {}: {}", pid, e),
    });
    Ok(pid)
}

/// Sonda con señal nula. EPERM significa que existe pero es de otro usuario.
pub fn process_alive(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

pub fn send_hangup(pid: u32) -> io::Result<()> {
    let raw = i32::try_from(pid).map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
    kill(Pid::from_raw(raw), Signal::SIGHUP).map_err(io::Error::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn el_proceso_actual_esta_vivo() {
        assert!(process_alive(std::process::id()));
    }

    #[test]
    fn proceso_lanzado_muere_y_deja_de_estar_vivo() {
        let pid = spawn_detached(shell("exit 0")).unwrap();
        let mut alive = true;
        for _ in 0..100 {
            if !process_alive(pid) {
                alive = false;
                break;
            }
            thread::sleep(std::time::Duration::from_millis(20));
        }
        assert!(!alive);
    }
}
