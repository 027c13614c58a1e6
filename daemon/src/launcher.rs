use anyhow::{bail, Context, Result};
use common::{process, BackendConfig, Job};
use tracing::{debug, info};

/// Punto de contacto con el backend de ejecución.
pub trait Launcher: Send {
    /// Lanza el comando ya renderizado. `None` = el backend no devolvió
    /// handle (el job vuelve a la cola).
    fn launch(&mut self, job: &Job, command: &str) -> Result<Option<String>>;

    fn is_alive(&mut self, handle: &str) -> Result<bool>;

    fn terminate(&mut self, handle: &str) -> Result<()>;

    /// Nueva configuración tras un reload.
    fn reconfigure(&mut self, _backend: &BackendConfig) {}
}

/// Backend por plantillas de shell (bash, ssh, qsub, msub, slurm).
pub struct ShellLauncher {
    backend: BackendConfig,
}

impl ShellLauncher {
    pub fn new(backend: BackendConfig) -> Self {
        Self { backend }
    }

    fn capture(cmd: &str) -> Result<String> {
        let out = process::shell(cmd)
            .output()
            .with_context(|| format!("ejecutando `{cmd}`"))?;
        if !out.status.success() {
            bail!(
                "`{}` terminó con {}: {}",
                cmd,
                out.status,
                String::from_utf8_lossy(&out.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
    }
}

impl Launcher for ShellLauncher {
    fn launch(&mut self, job: &Job, command: &str) -> Result<Option<String>> {
        debug!("lanzando {}: {}", job.label, command);

        let handle = if self.backend.kind.handle_from_stdout() {
            // el id del batch scheduler sale por stdout
            Self::capture(command)?
        } else {
            process::spawn_detached(process::shell(command))
                .with_context(|| format!("lanzando {}", job.label))?
                .to_string()
        };

        if handle.is_empty() {
            return Ok(None);
        }
        info!("job {} lanzado con handle {}", job.label, handle);
        Ok(Some(handle))
    }

    fn is_alive(&mut self, handle: &str) -> Result<bool> {
        let cmd = self.backend.render_alive(handle)?;
        Ok(Self::capture(&cmd)? == "1")
    }

    fn terminate(&mut self, handle: &str) -> Result<()> {
        let cmd = self.backend.render_kill(handle)?;
        info!("terminando handle {}", handle);
        Self::capture(&cmd).map(|_| ())
    }

    fn reconfigure(&mut self, backend: &BackendConfig) {
        self.backend = backend.clone();
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use std::{
        collections::HashSet,
        sync::{Arc, Mutex},
    };

    #[derive(Debug, Default)]
    pub struct Shared {
        pub launched: Vec<(String, String)>,
        pub killed: Vec<String>,
        pub dead: HashSet<String>,
        pub all_dead: bool,
        pub refuse: bool,
        next: u32,
    }

    /// Launcher en memoria; el estado se comparte para inspeccionarlo.
    #[derive(Debug, Clone, Default)]
    pub struct FakeLauncher(pub Arc<Mutex<Shared>>);

    impl FakeLauncher {
        pub fn with<R>(&self, f: impl FnOnce(&mut Shared) -> R) -> R {
            f(&mut self.0.lock().unwrap())
        }
    }

    impl Launcher for FakeLauncher {
        fn launch(&mut self, job: &Job, command: &str) -> Result<Option<String>> {
            self.with(|s| {
                if s.refuse {
                    return Ok(None);
                }
                s.next += 1;
                s.launched.push((job.label.clone(), command.to_string()));
                Ok(Some(format!("{}", 1000 + s.next)))
            })
        }

        fn is_alive(&mut self, handle: &str) -> Result<bool> {
            self.with(|s| Ok(!s.all_dead && !s.dead.contains(handle)))
        }

        fn terminate(&mut self, handle: &str) -> Result<()> {
            self.with(|s| {
                s.killed.push(handle.to_string());
                Ok(())
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{BackendType, EntityId, Task};

    fn job() -> Job {
        Job::new(EntityId::Project, Task::ProjectStats, String::new(), "p:project_stats:-".into())
    }

    #[test]
    fn batch_toma_el_handle_de_stdout() {
        let mut l = ShellLauncher::new(BackendConfig {
            kind: BackendType::Slurm,
            ..BackendConfig::default()
        });
        assert_eq!(l.launch(&job(), "echo '  9876 '").unwrap(), Some("9876".into()));
        assert_eq!(l.launch(&job(), "true").unwrap(), None);
        assert!(l.launch(&job(), "exit 3").is_err());
    }

    #[test]
    fn bash_usa_el_pid_y_la_sonda_de_vida() {
        let mut l = ShellLauncher::new(BackendConfig {
            alive: "kill -0 {{pid}} 2>/dev/null && echo 1 || echo 0".into(),
            ..BackendConfig::default()
        });
        let handle = l.launch(&job(), "sleep 5").unwrap().unwrap();
        assert!(l.is_alive(&handle).unwrap());
        l.terminate(&handle).unwrap();

        let mut alive = true;
        for _ in 0..100 {
            if !l.is_alive(&handle).unwrap() {
                alive = false;
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(20));
        }
        assert!(!alive);
    }
}
