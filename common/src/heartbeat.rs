//! Heartbeat y pedido de terminación compartidos por daemon y lair.
//!
//! Todo pasa por archivos dentro de un directorio de supervisión:
//! `alive` (timestamp legible), `terminated` (último `alive` tras una
//! salida limpia), `terminate-daemon` (marcador de terminación) y
//! `daemon.pid` cuando el proceso corre en segundo plano.

use std::{
    fs, io,
    path::{Path, PathBuf},
    time::Duration,
};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::{task::JoinHandle, time::sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Un heartbeat más viejo que esto se considera muerto.
pub const ACTIVE_GRACE: Duration = Duration::from_secs(60);

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S %z";

#[derive(Debug, Error)]
pub enum SupervisionError {
    #[error("supervision file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

fn io_err(path: &Path, source: io::Error) -> SupervisionError {
    SupervisionError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisionPaths {
    dir: PathBuf,
}

impl SupervisionPaths {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn for_daemon(project: &Path) -> Self {
        Self::new(project.join("daemon"))
    }

    pub fn for_lair(root: &Path) -> Self {
        Self::new(root.join(".lair"))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn alive(&self) -> PathBuf {
        self.dir.join("alive")
    }

    pub fn terminated(&self) -> PathBuf {
        self.dir.join("terminated")
    }

    pub fn termination_marker(&self) -> PathBuf {
        self.dir.join("terminate-daemon")
    }

    pub fn pid_file(&self) -> PathBuf {
        self.dir.join("daemon.pid")
    }

    pub fn declare_alive(&self) -> Result<(), SupervisionError> {
        self.declare_alive_at(Utc::now())
    }

    /// Escribe a un temporal y renombra sobre `alive`.
    pub fn declare_alive_at(&self, at: DateTime<Utc>) -> Result<(), SupervisionError> {
        fs::create_dir_all(&self.dir).map_err(|e| io_err(&self.dir, e))?;
        let alive = self.alive();
        let tmp = self.dir.join(".alive.tmp");
        fs::write(&tmp, format!("{}\n", at.format(TIME_FORMAT))).map_err(|e| io_err(&tmp, e))?;
        fs::rename(&tmp, &alive).map_err(|e| io_err(&alive, e))?;
        debug!("heartbeat {}", alive.display());
        Ok(())
    }

    fn read_time(path: &Path) -> Option<DateTime<Utc>> {
        let raw = fs::read_to_string(path).ok()?;
        DateTime::parse_from_str(raw.trim(), TIME_FORMAT)
            .ok()
            .map(|t| t.with_timezone(&Utc))
    }

    /// Último heartbeat conocido: `alive`, o si no `terminated`.
    pub fn last_alive(&self) -> Option<DateTime<Utc>> {
        Self::read_time(&self.alive()).or_else(|| Self::read_time(&self.terminated()))
    }

    pub fn is_active(&self) -> bool {
        self.is_active_at(Utc::now())
    }

    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        let Some(t) = Self::read_time(&self.alive()) else {
            return false;
        };
        let grace = chrono::Duration::from_std(ACTIVE_GRACE).unwrap_or(chrono::Duration::zero());
        now - t < grace
    }

    pub fn request_termination(&self) -> Result<(), SupervisionError> {
        fs::create_dir_all(&self.dir).map_err(|e| io_err(&self.dir, e))?;
        let marker = self.termination_marker();
        fs::write(&marker, b"").map_err(|e| io_err(&marker, e))
    }

    pub fn termination_requested(&self) -> bool {
        self.termination_marker().exists()
    }

    /// Si hay pedido de terminación lo consume y devuelve `true`.
    pub fn take_termination_request(&self) -> bool {
        let marker = self.termination_marker();
        match fs::remove_file(&marker) {
            Ok(()) => true,
            Err(e) if e.kind() == io::ErrorKind::NotFound => false,
            Err(e) => {
                warn!("no se pudo borrar {}: {}", marker.display(), e);
                true
            }
        }
    }

    /// `alive` pasa a `terminated`, conservando la última hora vista.
    pub fn terminate(&self) -> Result<(), SupervisionError> {
        let alive = self.alive();
        if !alive.exists() {
            return Ok(());
        }
        let terminated = self.terminated();
        fs::rename(&alive, &terminated).map_err(|e| io_err(&terminated, e))
    }

    pub fn write_pid(&self, pid: u32) -> Result<(), SupervisionError> {
        fs::create_dir_all(&self.dir).map_err(|e| io_err(&self.dir, e))?;
        let path = self.pid_file();
        fs::write(&path, format!("{pid}\n")).map_err(|e| io_err(&path, e))
    }

    pub fn read_pid(&self) -> Option<u32> {
        fs::read_to_string(self.pid_file())
            .ok()
            .and_then(|s| s.trim().parse().ok())
    }

    pub fn clear_pid(&self) {
        let _ = fs::remove_file(self.pid_file());
    }
}

/// Tarea de fondo que mantiene vivo el heartbeat y atiende el pedido de
/// terminación. Al salir, por la razón que sea, cancela el token.
#[derive(Debug, Clone)]
pub struct DeclareAlive {
    paths: SupervisionPaths,
    tick: Duration,
    heartbeat_every: u32,
}

impl DeclareAlive {
    pub fn new(paths: SupervisionPaths) -> Self {
        Self {
            paths,
            tick: Duration::from_secs(1),
            heartbeat_every: 30,
        }
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    pub fn with_heartbeat_every(mut self, every: u32) -> Self {
        self.heartbeat_every = every.max(1);
        self
    }

    pub fn spawn(self, token: CancellationToken) -> JoinHandle<Result<(), SupervisionError>> {
        tokio::spawn(async move {
            let _cancel_on_exit = token.clone().drop_guard();
            let mut n: u32 = 0;

            let outcome = loop {
                if n % self.heartbeat_every == 0 {
                    if let Err(e) = self.paths.declare_alive() {
                        warn!("heartbeat falló: {}", e);
                        break Err(e);
                    }
                }
                if self.paths.take_termination_request() {
                    info!("pedido de terminación en {}", self.paths.dir().display());
                    break Ok(());
                }
                n = n.wrapping_add(1);

                tokio::select! {
                    _ = token.cancelled() => break Ok(()),
                    _ = sleep(self.tick) => {}
                }
            };

            if let Err(e) = self.paths.terminate() {
                warn!("no se pudo marcar terminated: {}", e);
            }
            outcome
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::scratch_dir;

    #[test]
    fn heartbeat_fresco_viejo_o_terminado() {
        let dir = scratch_dir("heartbeat_tests", "active");
        let paths = SupervisionPaths::new(&dir);
        assert!(!paths.is_active());
        assert_eq!(paths.last_alive(), None);

        paths.declare_alive().unwrap();
        assert!(paths.is_active());

        let old = Utc::now() - chrono::Duration::seconds(120);
        paths.declare_alive_at(old).unwrap();
        assert!(!paths.is_active());

        paths.declare_alive().unwrap();
        paths.terminate().unwrap();
        assert!(!paths.is_active());
        assert!(paths.terminated().is_file());
        // se conserva la última hora vista
        assert!(paths.last_alive().is_some());
    }

    #[test]
    fn pedido_de_terminacion_se_consume_una_vez() {
        let dir = scratch_dir("heartbeat_tests", "marker");
        let paths = SupervisionPaths::new(&dir);
        assert!(!paths.take_termination_request());
        paths.request_termination().unwrap();
        assert!(paths.termination_requested());
        assert!(paths.take_termination_request());
        assert!(!paths.take_termination_request());
    }

    #[test]
    fn pid_file_ida_y_vuelta() {
        let dir = scratch_dir("heartbeat_tests", "pid");
        let paths = SupervisionPaths::for_daemon(&dir);
        assert_eq!(paths.read_pid(), None);
        paths.write_pid(4321).unwrap();
        assert_eq!(paths.read_pid(), Some(4321));
        paths.clear_pid();
        assert_eq!(paths.read_pid(), None);
    }

    #[tokio::test]
    async fn declare_alive_cancela_al_ver_el_marcador() {
        let dir = scratch_dir("heartbeat_tests", "task");
        let paths = SupervisionPaths::new(&dir);
        let token = CancellationToken::new();

        let handle = DeclareAlive::new(paths.clone())
            .with_tick(Duration::from_millis(10))
            .spawn(token.clone());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(paths.is_active());

        paths.request_termination().unwrap();
        tokio::time::timeout(Duration::from_secs(2), token.cancelled())
            .await
            .unwrap();
        handle.await.unwrap().unwrap();

        assert!(!paths.alive().exists());
        assert!(paths.terminated().is_file());
        assert!(!paths.termination_requested());
    }

    #[tokio::test]
    async fn cancelar_el_token_detiene_la_tarea() {
        let dir = scratch_dir("heartbeat_tests", "cancel");
        let paths = SupervisionPaths::new(&dir);
        let token = CancellationToken::new();
        let handle = DeclareAlive::new(paths.clone())
            .with_tick(Duration::from_millis(10))
            .spawn(token.clone());

        tokio::time::sleep(Duration::from_millis(30)).await;
        token.cancel();
        handle.await.unwrap().unwrap();
        assert!(!paths.is_active());
    }
}
