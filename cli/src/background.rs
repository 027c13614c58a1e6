//! Arranque en segundo plano, parada y limpieza de un proceso supervisado
//! (daemon de proyecto o lair). Todo se apoya en los archivos de
//! `SupervisionPaths`.

use std::{
    env,
    ffi::OsString,
    fs::{self, OpenOptions},
    os::unix::process::CommandExt,
    process::Command,
    time::{Duration, Instant},
};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use common::{process, SupervisionPaths};
use tokio::time::sleep;
use tracing::{debug, info};

pub const STOP_WAIT: Duration = Duration::from_secs(90);

/// PID registrado que además sigue vivo.
pub fn live_pid(paths: &SupervisionPaths) -> Option<u32> {
    paths.read_pid().filter(|pid| process::process_alive(*pid))
}

/// Relanza este binario con `args`, salida a `<dir>/<log_name>`.
pub fn spawn_background(
    paths: &SupervisionPaths,
    log_name: &str,
    args: &[OsString],
) -> Result<u32> {
    if let Some(pid) = live_pid(paths) {
        bail!("ya corre en {} con pid {}", paths.dir().display(), pid);
    }
    if paths.is_active() {
        bail!("hay un heartbeat activo en {}", paths.dir().display());
    }

    fs::create_dir_all(paths.dir())
        .with_context(|| format!("creando {}", paths.dir().display()))?;
    let log_path = paths.dir().join(log_name);
    let log = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("abriendo {}", log_path.display()))?;

    let exe = env::current_exe().context("no se encontró el ejecutable actual")?;
    let mut cmd = Command::new(exe);
    cmd.args(args)
        .stdout(log.try_clone()?)
        .stderr(log)
        .process_group(0);

    let pid = process::spawn_detached(cmd).context("lanzando en segundo plano")?;
    paths.write_pid(pid)?;
    info!("lanzado con pid {} (log en {})", pid, log_path.display());
    Ok(pid)
}

/// Pide terminar y espera a que desaparezca el heartbeat. `false` si no
/// había nada corriendo.
pub async fn stop(paths: &SupervisionPaths, wait: Duration) -> Result<bool> {
    if !paths.is_active() && live_pid(paths).is_none() {
        info!("nada corriendo en {}", paths.dir().display());
        return Ok(false);
    }

    paths.request_termination()?;
    let deadline = Instant::now() + wait;
    while Instant::now() < deadline {
        if !paths.alive().exists() && live_pid(paths).is_none() {
            paths.clear_pid();
            info!("terminado {}", paths.dir().display());
            return Ok(true);
        }
        debug!("esperando a {}", paths.dir().display());
        sleep(Duration::from_millis(250)).await;
    }
    bail!(
        "{} no terminó después de {:?}",
        paths.dir().display(),
        wait
    )
}

/// Borra restos de un proceso que murió sin limpiar.
pub fn zap(paths: &SupervisionPaths) -> Result<()> {
    if let Some(pid) = live_pid(paths) {
        bail!("el proceso {} sigue vivo, usar stop", pid);
    }
    if paths.is_active() {
        bail!("el heartbeat de {} está activo, usar stop", paths.dir().display());
    }
    paths.terminate()?;
    if paths.take_termination_request() {
        debug!("marcador de terminación borrado");
    }
    paths.clear_pid();
    info!("limpio {}", paths.dir().display());
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report {
    pub active: bool,
    pub last_alive: Option<DateTime<Utc>>,
    pub pid: Option<u32>,
    pub pid_alive: bool,
}

impl Report {
    pub fn of(paths: &SupervisionPaths, now: DateTime<Utc>) -> Self {
        let pid = paths.read_pid();
        Self {
            active: paths.is_active_at(now),
            last_alive: paths.last_alive(),
            pid,
            pid_alive: pid.is_some_and(process::process_alive),
        }
    }

    pub fn print(&self, now: DateTime<Utc>) {
        println!("  activo   : {}", if self.active { "sí" } else { "no" });
        match self.last_alive {
            Some(t) => println!(
                "  heartbeat: {} (hace {} s)",
                t.to_rfc3339(),
                (now - t).num_seconds()
            ),
            None => println!("  heartbeat: (nunca)"),
        }
        match self.pid {
            Some(pid) if self.pid_alive => println!("  pid      : {}", pid),
            Some(pid) => println!("  pid      : {} (muerto)", pid),
            None => println!("  pid      : (primer plano o sin lanzar)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{fixtures::scratch_dir, DeclareAlive};
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn stop_sin_nada_corriendo_no_espera() {
        let paths = SupervisionPaths::new(scratch_dir("cli_tests", "idle"));
        assert!(!stop(&paths, Duration::from_secs(1)).await.unwrap());
        assert!(!paths.termination_requested());
    }

    #[tokio::test]
    async fn stop_espera_a_que_el_heartbeat_se_apague() {
        let paths = SupervisionPaths::new(scratch_dir("cli_tests", "stop"));
        let token = CancellationToken::new();
        let alive = DeclareAlive::new(paths.clone())
            .with_tick(Duration::from_millis(10))
            .spawn(token.clone());
        while !paths.is_active() {
            sleep(Duration::from_millis(5)).await;
        }

        assert!(stop(&paths, Duration::from_secs(5)).await.unwrap());
        alive.await.unwrap().unwrap();
        assert!(token.is_cancelled());
        assert!(paths.terminated().is_file());
    }

    #[test]
    fn zap_limpia_restos_pero_no_toca_lo_activo() {
        let paths = SupervisionPaths::new(scratch_dir("cli_tests", "zap"));
        paths.declare_alive().unwrap();
        assert!(zap(&paths).is_err());

        // heartbeat viejo, pid que ya no existe y marcador colgado
        paths
            .declare_alive_at(Utc::now() - chrono::Duration::hours(1))
            .unwrap();
        paths.write_pid(u32::MAX - 1).unwrap();
        paths.request_termination().unwrap();

        zap(&paths).unwrap();
        assert!(!paths.alive().exists());
        assert!(paths.terminated().is_file());
        assert!(!paths.termination_requested());
        assert_eq!(paths.read_pid(), None);
    }

    #[test]
    fn reporte_distingue_pid_muerto() {
        let paths = SupervisionPaths::new(scratch_dir("cli_tests", "report"));
        let now = Utc::now();
        assert_eq!(
            Report::of(&paths, now),
            Report {
                active: false,
                last_alive: None,
                pid: None,
                pid_alive: false
            }
        );

        paths.declare_alive_at(now).unwrap();
        paths.write_pid(std::process::id()).unwrap();
        let r = Report::of(&paths, now);
        assert!(r.active);
        assert!(r.pid_alive);

        paths.write_pid(u32::MAX - 1).unwrap();
        assert!(!Report::of(&paths, now).pid_alive);
    }
}
