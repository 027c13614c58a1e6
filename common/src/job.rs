use std::{fs, io, path::Path};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::entity::EntityId;
use crate::task::{Task, UnknownTask};

/// Una unidad pendiente o en ejecución.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub entity: EntityId,
    pub task: Task,
    /// Comando de la primera fase (puede contener `{{host}}`).
    pub command: String,
    /// PID o id del batch scheduler, una vez lanzado.
    pub handle: Option<String>,
    pub label: String,
    pub node_index: Option<usize>,
}

impl Job {
    pub fn new(entity: EntityId, task: Task, command: String, label: String) -> Self {
        Self {
            entity,
            task,
            command,
            handle: None,
            label,
            node_index: None,
        }
    }

    pub fn same_work(&self, entity: &EntityId, task: Task) -> bool {
        &self.entity == entity && self.task == task
    }
}

/// Forma persistida de un `Job` en el status file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    pub entity_name: Option<String>,
    pub task: String,
    pub handle: Option<String>,
    pub rendered_command: String,
    pub label: String,
    pub node_index: Option<usize>,
}

impl From<&Job> for JobRecord {
    fn from(job: &Job) -> Self {
        Self {
            entity_name: job.entity.name().map(|s| s.to_string()),
            task: job.task.to_string(),
            handle: job.handle.clone(),
            rendered_command: job.command.clone(),
            label: job.label.clone(),
            node_index: job.node_index,
        }
    }
}

impl TryFrom<JobRecord> for Job {
    type Error = UnknownTask;

    fn try_from(r: JobRecord) -> Result<Self, Self::Error> {
        Ok(Job {
            entity: EntityId::from_name(r.entity_name),
            task: r.task.parse()?,
            command: r.rendered_command,
            handle: r.handle,
            label: r.label,
            node_index: r.node_index,
        })
    }
}

/// `daemon/status.json`: cola y jobs en vuelo.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusFile {
    pub jobs_running: Vec<JobRecord>,
    pub jobs_to_run: Vec<JobRecord>,
}

impl StatusFile {
    /// `None` si no existe o no se puede leer; un archivo corrupto se
    /// descarta y el daemon arranca vacío.
    pub fn load(path: &Path) -> Option<StatusFile> {
        let raw = fs::read(path).ok()?;
        match serde_json::from_slice(&raw) {
            Ok(status) => Some(status),
            Err(e) => {
                warn!("status file {} ilegible, se descarta: {}", path.display(), e);
                let _ = fs::remove_file(path);
                None
            }
        }
    }

    /// Escribe a un temporal y renombra.
    pub fn save(&self, path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_vec_pretty(self).map_err(io::Error::other)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, path)
    }
}
