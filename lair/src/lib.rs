//! Lair: supervisa los daemons de todos los proyectos bajo una raíz.

mod spawner;

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use common::{DeclareAlive, MetadataStore, Project, SupervisionPaths};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use walkdir::{DirEntry, WalkDir};

pub use spawner::{DaemonSpawner, ProcessSpawner};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LairOptions {
    /// Pausa entre pasadas.
    pub latency: Duration,
    /// Un heartbeat más nuevo que esto no se relanza.
    pub wait_for: Duration,
    /// Si el proyecto no cambió desde el último heartbeat, no se relanza.
    pub trust_timestamp: bool,
    /// Decide pero nunca lanza.
    pub dry: bool,
    pub max_iterations: Option<u64>,
}

impl Default for LairOptions {
    fn default() -> Self {
        Self {
            latency: Duration::from_secs(120),
            wait_for: Duration::from_secs(1800),
            trust_timestamp: true,
            dry: false,
            max_iterations: None,
        }
    }
}

/// Qué hacer con el daemon de un proyecto.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Active,
    RecentHeartbeat,
    Unchanged,
    Launch,
}

/// Proyectos bajo `root`. No se desciende dentro de un proyecto ni en
/// directorios ocultos, y los symlinks no se siguen.
pub fn discover(root: &Path) -> Vec<PathBuf> {
    let mut found = Vec::new();
    let mut entries = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !is_hidden(e));

    while let Some(entry) = entries.next() {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                debug!("no se pudo recorrer: {}", e);
                continue;
            }
        };
        if !entry.file_type().is_dir() {
            continue;
        }
        if Project::is_project_dir(entry.path()) {
            found.push(entry.into_path());
            entries.skip_current_dir();
        }
    }
    found
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry.file_name().to_string_lossy().starts_with('.')
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::seconds(d.as_secs().min(u64::from(u32::MAX)) as i64)
}

pub fn verdict(
    store: &MetadataStore,
    project: &Path,
    options: &LairOptions,
    now: DateTime<Utc>,
) -> Result<Verdict> {
    let paths = SupervisionPaths::for_daemon(project);
    if paths.is_active_at(now) {
        return Ok(Verdict::Active);
    }

    if let Some(last) = paths.last_alive() {
        if now - last < to_chrono(options.wait_for) {
            return Ok(Verdict::RecentHeartbeat);
        }
        if options.trust_timestamp {
            let updated = Project::load(store, project)?.updated();
            if updated.map_or(true, |u| u < last) {
                return Ok(Verdict::Unchanged);
            }
        }
    }
    Ok(Verdict::Launch)
}

/// Una pasada sobre todos los proyectos.
pub fn check_projects<S: DaemonSpawner + ?Sized>(
    store: &MetadataStore,
    root: &Path,
    options: &LairOptions,
    spawner: &mut S,
    now: DateTime<Utc>,
) -> Vec<(PathBuf, Verdict)> {
    let mut out = Vec::new();
    for project in discover(root) {
        let v = match verdict(store, &project, options, now) {
            Ok(v) => v,
            Err(e) => {
                warn!("no se pudo evaluar {}: {:?}", project.display(), e);
                continue;
            }
        };
        debug!("{}: {:?}", project.display(), v);

        if v == Verdict::Launch {
            if options.dry {
                info!("[dry] se lanzaría el daemon de {}", project.display());
            } else if let Err(e) = spawner.spawn(&project) {
                warn!("no se pudo lanzar {}: {:?}", project.display(), e);
            }
        }
        out.push((project, v));
    }
    out
}

/// Pide terminar al lair y a cada daemon. Devuelve cuántos daemons.
pub fn terminate_daemons(root: &Path) -> Result<usize> {
    SupervisionPaths::for_lair(root).request_termination()?;
    let projects = discover(root);
    for p in &projects {
        SupervisionPaths::for_daemon(p)
            .request_termination()
            .with_context(|| format!("pidiendo terminar {}", p.display()))?;
    }
    info!("terminación pedida a {} daemons", projects.len());
    Ok(projects.len())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonStatus {
    pub project: PathBuf,
    pub active: bool,
    pub last_alive: Option<DateTime<Utc>>,
    pub pid: Option<u32>,
}

pub fn list(root: &Path) -> Vec<DaemonStatus> {
    discover(root)
        .into_iter()
        .map(|project| {
            let paths = SupervisionPaths::for_daemon(&project);
            DaemonStatus {
                active: paths.is_active(),
                last_alive: paths.last_alive(),
                pid: paths.read_pid(),
                project,
            }
        })
        .collect()
}

/// Loop del lair en primer plano.
pub async fn run<S>(root: &Path, options: LairOptions, spawner: S) -> Result<()>
where
    S: DaemonSpawner + 'static,
{
    let paths = SupervisionPaths::for_lair(root);
    let token = CancellationToken::new();
    let alive = DeclareAlive::new(paths.clone()).spawn(token.clone());
    info!(
        "lair sobre {} (cada {:?}, espera {:?})",
        root.display(),
        options.latency,
        options.wait_for
    );

    let store = MetadataStore::default();
    let mut spawner = spawner;
    let mut iteration: u64 = 0;

    loop {
        let root_owned = root.to_path_buf();
        let opts = options.clone();
        let st = store.clone();
        let joined = tokio::task::spawn_blocking(move || {
            let verdicts = check_projects(&st, &root_owned, &opts, &mut spawner, Utc::now());
            (spawner, verdicts)
        })
        .await;
        match joined {
            Ok((back, verdicts)) => {
                spawner = back;
                let launched = verdicts.iter().filter(|(_, v)| *v == Verdict::Launch).count();
                info!("{} proyectos, {} a lanzar", verdicts.len(), launched);
            }
            Err(e) => {
                error!("la pasada del lair entró en pánico: {:?}", e);
                break;
            }
        }

        iteration += 1;
        if options.max_iterations.is_some_and(|max| iteration >= max) {
            break;
        }

        tokio::select! {
            _ = token.cancelled() => {
                info!("lair: terminación pedida");
                break;
            }
            _ = tokio::signal::ctrl_c() => break,
            _ = sleep(options.latency) => {}
        }
    }

    token.cancel();
    let heartbeat = alive.await.context("la tarea de heartbeat entró en pánico")?;
    paths.terminate()?;
    heartbeat?;
    Ok(())
}
