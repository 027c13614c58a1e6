use std::{
    env,
    fs::{self, OpenOptions},
    os::unix::process::CommandExt,
    path::{Path, PathBuf},
    process::Command,
};

use anyhow::{Context, Result};
use common::{process, SupervisionPaths};
use tracing::info;

/// Cómo se arranca el daemon de un proyecto.
pub trait DaemonSpawner: Send {
    /// Devuelve el PID del daemon lanzado.
    fn spawn(&mut self, project: &Path) -> Result<u32>;
}

/// Relanza este mismo binario como `daemon run --shutdown-when-idle`.
pub struct ProcessSpawner {
    exe: PathBuf,
}

impl ProcessSpawner {
    pub fn new(exe: PathBuf) -> Self {
        Self { exe }
    }

    pub fn current() -> Result<Self> {
        Ok(Self::new(
            env::current_exe().context("no se encontró el ejecutable actual")?,
        ))
    }
}

impl DaemonSpawner for ProcessSpawner {
    fn spawn(&mut self, project: &Path) -> Result<u32> {
        let paths = SupervisionPaths::for_daemon(project);
        fs::create_dir_all(paths.dir())
            .with_context(|| format!("creando {}", paths.dir().display()))?;

        let log_path = paths.dir().join("daemon.log");
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .with_context(|| format!("abriendo {}", log_path.display()))?;

        let mut cmd = Command::new(&self.exe);
        cmd.arg("daemon")
            .arg("run")
            .arg("-P")
            .arg(project)
            .arg("--shutdown-when-idle")
            .stdout(log.try_clone()?)
            .stderr(log)
            .process_group(0);

        let pid = process::spawn_detached(cmd)
            .with_context(|| format!("lanzando daemon de {}", project.display()))?;
        paths.write_pid(pid)?;
        info!("daemon de {} lanzado (pid {})", project.display(), pid);
        Ok(pid)
    }
}
