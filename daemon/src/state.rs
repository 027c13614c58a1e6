// daemon/src/state.rs

use std::collections::VecDeque;

use common::{EntityId, Job, JobRecord, StatusFile, Task};
use tracing::warn;

/// Dónde puede correr el próximo job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Local,
    Node(usize),
}

impl Slot {
    pub fn node_index(self) -> Option<usize> {
        match self {
            Slot::Local => None,
            Slot::Node(i) => Some(i),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DaemonState {
    // jobs pendientes de lanzar
    pub queue: VecDeque<Job>,
    // jobs lanzados, con handle
    pub running: Vec<Job>,
    pub iteration: u64,
}

impl DaemonState {
    pub fn has_job(&self, entity: &EntityId, task: Task) -> bool {
        self.queue.iter().any(|j| j.same_work(entity, task))
            || self.running.iter().any(|j| j.same_work(entity, task))
    }

    /// `false` si ya había un job para el mismo (entidad, tarea).
    pub fn enqueue(&mut self, job: Job) -> bool {
        if self.has_job(&job.entity, job.task) {
            return false;
        }
        self.queue.push_back(job);
        true
    }

    pub fn is_idle(&self) -> bool {
        self.queue.is_empty() && self.running.is_empty()
    }

    /// Sin lista de nodos: hay slot mientras `running < max_jobs`.
    /// Con lista: el primer índice de nodo que no esté en uso.
    pub fn free_slot(&self, max_jobs: usize, nodes: Option<usize>) -> Option<Slot> {
        match nodes {
            None => (self.running.len() < max_jobs).then_some(Slot::Local),
            Some(n) => (0..n)
                .find(|i| !self.running.iter().any(|j| j.node_index == Some(*i)))
                .map(Slot::Node),
        }
    }

    pub fn to_status(&self) -> StatusFile {
        StatusFile {
            jobs_running: self.running.iter().map(JobRecord::from).collect(),
            jobs_to_run: self.queue.iter().map(JobRecord::from).collect(),
        }
    }

    /// Registros con tareas desconocidas se descartan.
    pub fn from_status(status: StatusFile) -> Self {
        fn convert(records: Vec<JobRecord>) -> Vec<Job> {
            records
                .into_iter()
                .filter_map(|r| match Job::try_from(r) {
                    Ok(job) => Some(job),
                    Err(e) => {
                        warn!("job descartado del status file: {}", e);
                        None
                    }
                })
                .collect()
        }

        let mut state = DaemonState {
            queue: convert(status.jobs_to_run).into(),
            running: Vec::new(),
            iteration: 0,
        };
        // un job "running" sin handle no se puede vigilar: vuelve a la cola
        for job in convert(status.jobs_running) {
            if job.handle.is_some() {
                state.running.push(job);
            } else {
                state.queue.push_back(job);
            }
        }
        state
    }
}
