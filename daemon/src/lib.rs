//! Daemon por proyecto: loop de planificación con heartbeat en segundo plano.

mod launcher;
mod monitor;
mod recovery;
mod scheduler;
mod state;

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use common::{config, BackendConfig, DeclareAlive, StoreError, SupervisionError, SupervisionPaths};
use thiserror::Error;
use tokio::signal::unix::{signal, SignalKind};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub use launcher::{Launcher, ShellLauncher};
pub use scheduler::{status_path, Scheduler, Tick};
pub use state::{DaemonState, Slot};

pub const DEFAULT_PROBE_EVERY: u64 = 10;

#[derive(Debug, Clone, PartialEq)]
pub struct DaemonOptions {
    pub max_concurrent_jobs: usize,
    pub node_list: Option<Vec<String>>,
    pub cpus_per_job: u32,
    pub poll_interval: Duration,
    pub shutdown_when_idle: bool,
    /// Cada cuántas iteraciones se sondean los jobs en vuelo.
    pub probe_every: u64,
    pub max_iterations: Option<u64>,
}

impl Default for DaemonOptions {
    fn default() -> Self {
        let backend = BackendConfig::default();
        Self {
            max_concurrent_jobs: backend.maxjobs,
            node_list: None,
            cpus_per_job: backend.ppn,
            poll_interval: Duration::from_secs(backend.latency),
            shutdown_when_idle: false,
            probe_every: DEFAULT_PROBE_EVERY,
            max_iterations: None,
        }
    }
}

impl DaemonOptions {
    pub fn from_backend(backend: &BackendConfig) -> anyhow::Result<Self> {
        let node_list = match backend.nodelist.as_deref() {
            Some(path) if !path.trim().is_empty() => {
                let nodes = config::read_node_list(Path::new(path))?;
                anyhow::ensure!(!nodes.is_empty(), "la lista de nodos {} está vacía", path);
                Some(nodes)
            }
            _ => None,
        };
        backend.validate(node_list.is_some())?;
        Ok(Self {
            max_concurrent_jobs: backend.maxjobs.max(1),
            node_list,
            cpus_per_job: backend.ppn,
            poll_interval: Duration::from_secs(backend.latency),
            ..Self::default()
        })
    }
}

/// Lo que llega desde la línea de comandos.
#[derive(Debug, Clone, Default)]
pub struct DaemonArgs {
    pub json: Option<PathBuf>,
    pub max_jobs: Option<usize>,
    pub shutdown_when_idle: bool,
    pub max_iterations: Option<u64>,
}

impl DaemonArgs {
    pub fn backend(&self, project: &Path) -> anyhow::Result<BackendConfig> {
        config::load_backend(project, self.json.as_deref())
    }

    pub fn options(&self, backend: &BackendConfig) -> anyhow::Result<DaemonOptions> {
        let mut options = DaemonOptions::from_backend(backend)?;
        if let Some(n) = self.max_jobs {
            options.max_concurrent_jobs = n.max(1);
        }
        options.shutdown_when_idle = self.shutdown_when_idle;
        options.max_iterations = self.max_iterations;
        Ok(options)
    }
}

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error(transparent)]
    Supervision(#[from] SupervisionError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl DaemonError {
    /// Heartbeat o lock vencido: el proceso sale y el lair lo relanza.
    pub fn is_fatal(&self) -> bool {
        match self {
            DaemonError::Supervision(_) => true,
            DaemonError::Store(e) => e.is_lock_timeout(),
            DaemonError::Other(_) => false,
        }
    }
}

/// Loop del daemon en primer plano hasta quedar ocioso, recibir pedido de
/// terminación o Ctrl-C.
pub async fn run(project: &Path, args: DaemonArgs) -> anyhow::Result<()> {
    let backend = args.backend(project)?;
    let options = args.options(&backend)?;
    info!(
        "daemon de {} (backend {}, max {} jobs, cada {:?})",
        project.display(),
        backend.kind.as_str(),
        options.max_concurrent_jobs,
        options.poll_interval
    );

    let paths = SupervisionPaths::for_daemon(project);
    let token = CancellationToken::new();
    let alive = DeclareAlive::new(paths.clone()).spawn(token.clone());

    let mut scheduler = Scheduler::new(
        project.to_path_buf(),
        backend.clone(),
        options,
        ShellLauncher::new(backend),
    );
    scheduler.recover();

    let mut hangup = signal(SignalKind::hangup()).context("instalando handler de SIGHUP")?;

    let result: anyhow::Result<()> = loop {
        let (back, outcome) = tokio::task::spawn_blocking(move || {
            let outcome = scheduler.tick();
            (scheduler, outcome)
        })
        .await
        .context("la iteración del scheduler entró en pánico")?;
        scheduler = back;

        match outcome {
            Ok(Tick::Continue) => {}
            Ok(Tick::Idle) => {
                info!("sin trabajo pendiente, saliendo");
                break Ok(());
            }
            Ok(Tick::MaxIterations) => break Ok(()),
            Err(e) if e.is_fatal() => {
                error!("error fatal: {}", e);
                break Err(e.into());
            }
            Err(e) => error!("error en la iteración {}: {:?}", scheduler.state().iteration, e),
        }

        tokio::select! {
            _ = token.cancelled() => {
                info!("terminación pedida");
                break Ok(());
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl-C recibido");
                break Ok(());
            }
            _ = hangup.recv() => {
                match args.backend(project).and_then(|b| Ok((args.options(&b)?, b))) {
                    Ok((options, backend)) => scheduler.reload(backend, options),
                    Err(e) => warn!("reload falló, se mantiene la config actual: {:?}", e),
                }
            }
            _ = sleep(scheduler.options().poll_interval) => {}
        }
    };

    token.cancel();
    let heartbeat = alive.await.context("la tarea de heartbeat entró en pánico")?;
    paths.terminate()?;
    result?;
    heartbeat?;
    Ok(())
}
