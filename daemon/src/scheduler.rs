use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::Context;
use common::{
    bind_host, config::miga_home, dispatch, BackendConfig, Decision, EntityEvent, EntityId,
    EntityRef, Job, LaunchContext, MetadataStore, Project, SupervisionPaths, TaskGate,
};
use rand::Rng;
use tracing::{debug, error, info, warn};

use crate::launcher::Launcher;
use crate::monitor::probe_running;
use crate::recovery::recover;
use crate::state::{DaemonState, Slot};
use crate::{DaemonError, DaemonOptions};

/// Cómo terminó una iteración.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    Continue,
    /// Sin cola ni jobs en vuelo y `shutdown_when_idle`.
    Idle,
    MaxIterations,
}

/// El loop de un proyecto: descubre trabajo, cosecha, despacha.
pub struct Scheduler<L: Launcher> {
    project_path: PathBuf,
    store: MetadataStore,
    gate: TaskGate,
    backend: BackendConfig,
    options: DaemonOptions,
    launcher: L,
    state: DaemonState,
    paths: SupervisionPaths,
    miga: PathBuf,
}

impl<L: Launcher> Scheduler<L> {
    pub fn new(
        project_path: PathBuf,
        backend: BackendConfig,
        options: DaemonOptions,
        launcher: L,
    ) -> Self {
        let paths = SupervisionPaths::for_daemon(&project_path);
        Self {
            project_path,
            store: MetadataStore::default(),
            gate: TaskGate::miga(),
            backend,
            options,
            launcher,
            state: DaemonState::default(),
            paths,
            miga: miga_home(),
        }
    }

    pub fn with_store(mut self, store: MetadataStore) -> Self {
        self.store = store;
        self
    }

    pub fn options(&self) -> &DaemonOptions {
        &self.options
    }

    pub fn state(&self) -> &DaemonState {
        &self.state
    }

    pub fn status_path(&self) -> PathBuf {
        status_path(&self.project_path)
    }

    /// Arranque tras una caída: status file + sonda inmediata.
    pub fn recover(&mut self) {
        self.state = recover(&self.status_path(), &mut self.launcher);
    }

    pub fn reload(&mut self, backend: BackendConfig, options: DaemonOptions) {
        info!("recargando configuración del backend ({})", backend.kind.as_str());
        self.launcher.reconfigure(&backend);
        self.backend = backend;
        self.options = options;
    }

    /// Una iteración completa del loop.
    pub fn tick(&mut self) -> Result<Tick, DaemonError> {
        // 1) heartbeat
        self.paths.declare_alive()?;

        // 2) el proyecto puede haber cambiado en disco
        let mut project = Project::load(&self.store, &self.project_path)?;
        self.invalidate_stale(&project)?;

        // 3) trabajo nuevo
        self.discover(&mut project)?;

        // 4) nada que hacer
        if self.options.shutdown_when_idle && self.state.is_idle() {
            info!("{}: sin trabajo pendiente", project.name());
            return Ok(Tick::Idle);
        }

        // 5) cosechar antes de despachar
        self.reap(&mut project)?;

        // 6) despachar
        self.dispatch_queued();

        // 7) sonda periódica
        if self.state.iteration % self.options.probe_every.max(1) == 0 {
            probe_running(&mut self.state, &mut self.launcher);
        }

        // 8) persistir
        self.state
            .to_status()
            .save(&self.status_path())
            .with_context(|| format!("guardando {}", self.status_path().display()))?;

        self.state.iteration += 1;
        if let Some(max) = self.options.max_iterations {
            if self.state.iteration >= max {
                return Ok(Tick::MaxIterations);
            }
        }
        Ok(Tick::Continue)
    }

    fn invalidate_stale(&self, project: &Project) -> Result<(), DaemonError> {
        let results = self.gate.results();
        let mut entities: Vec<EntityRef<'_>> = project
            .datasets
            .iter()
            .map(|dataset| EntityRef::Dataset { project, dataset })
            .collect();
        entities.push(EntityRef::Project(project));

        for e in entities {
            for task in results.invalidate_stale(&e)? {
                info!("{}: resultado {} invalidado", e.base(), task);
            }
        }
        Ok(())
    }

    /* ---------------- descubrimiento ---------------- */

    fn discover(&mut self, project: &mut Project) -> Result<(), DaemonError> {
        let names: Vec<String> = project.datasets.iter().map(|d| d.name.clone()).collect();
        for name in names {
            self.offer(project, EntityId::Dataset(name))?;
        }

        // las tareas de proyecto esperan a todos los datasets de referencia
        let refs_pending = {
            let shared: &Project = project;
            shared.reference_datasets().any(|dataset| {
                let e = EntityRef::Dataset {
                    project: shared,
                    dataset,
                };
                self.gate.next_task(&e).is_some()
            })
        };
        if !refs_pending {
            self.offer(project, EntityId::Project)?;
        }
        Ok(())
    }

    fn offer(&mut self, project: &mut Project, id: EntityId) -> Result<(), DaemonError> {
        let task = {
            let Some(e) = project.entity(&id) else {
                return Ok(());
            };
            match self.gate.next_task(&e) {
                Some(t) => t,
                None => return Ok(()),
            }
        };
        if self.state.has_job(&id, task) {
            return Ok(());
        }

        // se renderiza antes de contar el intento
        let project_name = project.name();
        let ctx = LaunchContext {
            project_path: &project.path,
            project_name: &project_name,
            entity: &id,
            task,
            cpus: self.options.cpus_per_job,
            miga: &self.miga,
        };
        let command = match self.backend.render_launch(&ctx) {
            Ok(c) => c,
            Err(e) => {
                // solo esta entidad queda afuera; el resto de la iteración sigue
                error!("{}: no se puede preparar {}: {}", id, task, e);
                return Ok(());
            }
        };
        let label = ctx.label();
        let log_dir = ctx.log_path();
        ensure_parent(&log_dir)?;

        match self.gate.claim_next_task(&self.store, project, &id)? {
            Some(claimed) if claimed == task => {
                info!("encolando {}", label);
                self.state.enqueue(Job::new(id, task, command, label));
            }
            Some(other) => debug!("{}: la tarea cambió a {} entre lecturas", id, other),
            None => debug!("{}: sin tarea tras contar intentos", id),
        }
        Ok(())
    }

    /* ---------------- cosecha ---------------- */

    fn decision(&self, project: &Project, job: &Job) -> Decision {
        match project.entity(&job.entity) {
            Some(e) => self.gate.why_ignore(&e, job.task),
            None => Decision::NotApplicable,
        }
    }

    fn reap(&mut self, project: &mut Project) -> Result<(), DaemonError> {
        let running = std::mem::take(&mut self.state.running);
        let mut completed = Vec::new();
        let mut dropped = Vec::new();

        for job in running {
            match self.decision(project, &job) {
                Decision::Execute => self.state.running.push(job),
                Decision::Complete => completed.push(job),
                other => dropped.push((job, other)),
            }
        }

        for (job, why) in dropped {
            info!("job {} ya no aplica ({}), terminando", job.label, why);
            if let Some(handle) = job.handle.as_deref() {
                if let Err(e) = self.launcher.terminate(handle) {
                    warn!("no se pudo terminar {}: {:?}", handle, e);
                }
            }
        }
        for job in completed {
            info!("job {} completado", job.label);
            self.complete(project, &job)?;
        }

        // lo encolado que dejó de ser ejecutable se descarta
        let project: &Project = project;
        let gate = &self.gate;
        self.state.queue.retain(|job| {
            let runnable = project
                .entity(&job.entity)
                .map(|e| gate.why_ignore(&e, job.task).should_run())
                .unwrap_or(false);
            if !runnable {
                debug!("descartando {} de la cola", job.label);
            }
            runnable
        });
        Ok(())
    }

    fn complete(&self, project: &mut Project, job: &Job) -> Result<(), DaemonError> {
        {
            let Some(e) = project.entity(&job.entity) else {
                return Ok(());
            };
            self.gate.results().materialize(&self.store, &e, job.task)?;
        }
        dispatch(
            &self.store,
            project,
            &job.entity,
            EntityEvent::ResultReady(job.task),
        )?;
        Ok(())
    }

    /* ---------------- despacho ---------------- */

    fn dispatch_queued(&mut self) {
        let len = self.state.queue.len();
        if len > 1 {
            let offset = rand::rng().random_range(0..len);
            self.state.queue.rotate_left(offset);
        }

        let nodes = self.options.node_list.as_ref().map(|n| n.len());
        while let Some(slot) = self
            .state
            .free_slot(self.options.max_concurrent_jobs, nodes)
        {
            let Some(mut job) = self.state.queue.pop_front() else {
                break;
            };

            let host = match slot {
                Slot::Node(i) => self
                    .options
                    .node_list
                    .as_ref()
                    .and_then(|n| n.get(i))
                    .map(|h| h.as_str()),
                Slot::Local => None,
            };
            let command = match bind_host(&job.command, host) {
                Ok(c) => c,
                Err(e) => {
                    warn!("no se puede despachar {}: {}", job.label, e);
                    self.state.queue.push_front(job);
                    break;
                }
            };

            match self.launcher.launch(&job, &command) {
                Ok(Some(handle)) => {
                    job.handle = Some(handle);
                    job.node_index = slot.node_index();
                    job.command = command;
                    self.state.running.push(job);
                }
                Ok(None) => {
                    warn!("{} sin handle, vuelve a la cola", job.label);
                    self.state.queue.push_front(job);
                    break;
                }
                Err(e) => {
                    warn!("falló el lanzamiento de {}: {:?}", job.label, e);
                    self.state.queue.push_front(job);
                    break;
                }
            }
        }
    }
}

pub fn status_path(project: &Path) -> PathBuf {
    project.join("daemon").join("status.json")
}

fn ensure_parent(path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("creando {}", parent.display()))?;
    }
    Ok(())
}
