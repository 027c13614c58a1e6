use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

use crate::entity::EntityKind;

/// Una etapa del pipeline. El orden dentro de cada tabla es la precedencia.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Task {
    // datasets
    RawReads,
    TrimmedReads,
    ReadQuality,
    TrimmedFasta,
    Assembly,
    Cds,
    EssentialGenes,
    Mytaxa,
    MytaxaScan,
    Ssu,
    Distances,
    Taxonomy,
    Stats,
    // proyecto
    ProjectStats,
    HaaiDistances,
    AaiDistances,
    AniDistances,
    CladeFinding,
    Subclades,
    Ogs,
}

impl Task {
    pub const ALL: [Task; 20] = [
        Task::RawReads,
        Task::TrimmedReads,
        Task::ReadQuality,
        Task::TrimmedFasta,
        Task::Assembly,
        Task::Cds,
        Task::EssentialGenes,
        Task::Mytaxa,
        Task::MytaxaScan,
        Task::Ssu,
        Task::Distances,
        Task::Taxonomy,
        Task::Stats,
        Task::ProjectStats,
        Task::HaaiDistances,
        Task::AaiDistances,
        Task::AniDistances,
        Task::CladeFinding,
        Task::Subclades,
        Task::Ogs,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Task::RawReads => "raw_reads",
            Task::TrimmedReads => "trimmed_reads",
            Task::ReadQuality => "read_quality",
            Task::TrimmedFasta => "trimmed_fasta",
            Task::Assembly => "assembly",
            Task::Cds => "cds",
            Task::EssentialGenes => "essential_genes",
            Task::Mytaxa => "mytaxa",
            Task::MytaxaScan => "mytaxa_scan",
            Task::Ssu => "ssu",
            Task::Distances => "distances",
            Task::Taxonomy => "taxonomy",
            Task::Stats => "stats",
            Task::ProjectStats => "project_stats",
            Task::HaaiDistances => "haai_distances",
            Task::AaiDistances => "aai_distances",
            Task::AniDistances => "ani_distances",
            Task::CladeFinding => "clade_finding",
            Task::Subclades => "subclades",
            Task::Ogs => "ogs",
        }
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown task: {0}")]
pub struct UnknownTask(pub String);

impl FromStr for Task {
    type Err = UnknownTask;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Task::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| UnknownTask(s.to_string()))
    }
}

/// Restricción estructural de una tarea sobre la entidad.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskRule {
    ReferenceOnly,
    QueryOnly,
    MultiOnly,
    NonMultiOnly,
    /// El proyecto debe tener `ref_project` configurado.
    RequiresRefProject,
    CladeProjectOnly,
}

#[derive(Debug, Clone)]
pub struct TaskDef {
    pub task: Task,
    /// Directorio de resultados relativo a `<proyecto>/data`.
    pub dir: &'static str,
    pub rules: Vec<TaskRule>,
}

impl TaskDef {
    fn new(task: Task, dir: &'static str, rules: &[TaskRule]) -> Self {
        Self {
            task,
            dir,
            rules: rules.to_vec(),
        }
    }
}

/// Tablas de tareas por tipo de entidad. Se cargan una vez y se pasan
/// explícitamente al gate.
#[derive(Debug, Clone)]
pub struct TaskTable {
    dataset: Vec<TaskDef>,
    project: Vec<TaskDef>,
}

impl TaskTable {
    pub fn new(dataset: Vec<TaskDef>, project: Vec<TaskDef>) -> Self {
        Self { dataset, project }
    }

    pub fn miga() -> Self {
        use TaskRule::*;

        let dataset = vec![
            TaskDef::new(Task::RawReads, "01.raw_reads", &[]),
            TaskDef::new(Task::TrimmedReads, "02.trimmed_reads", &[]),
            TaskDef::new(Task::ReadQuality, "03.read_quality", &[]),
            TaskDef::new(Task::TrimmedFasta, "04.trimmed_fasta", &[]),
            TaskDef::new(Task::Assembly, "05.assembly", &[]),
            TaskDef::new(Task::Cds, "06.cds", &[]),
            TaskDef::new(Task::EssentialGenes, "07.annotation/01.function/01.essential", &[]),
            TaskDef::new(Task::Mytaxa, "07.annotation/02.taxonomy/01.mytaxa", &[MultiOnly]),
            TaskDef::new(
                Task::MytaxaScan,
                "07.annotation/03.qa/02.mytaxa_scan",
                &[NonMultiOnly, ReferenceOnly],
            ),
            TaskDef::new(Task::Ssu, "07.annotation/01.function/02.ssu", &[]),
            TaskDef::new(Task::Distances, "09.distances", &[NonMultiOnly]),
            TaskDef::new(
                Task::Taxonomy,
                "09.distances/05.taxonomy",
                &[NonMultiOnly, ReferenceOnly, RequiresRefProject],
            ),
            TaskDef::new(Task::Stats, "90.stats", &[]),
        ];

        let project = vec![
            TaskDef::new(Task::ProjectStats, "90.stats", &[]),
            TaskDef::new(Task::HaaiDistances, "09.distances/01.haai", &[NonMultiOnly]),
            TaskDef::new(Task::AaiDistances, "09.distances/02.aai", &[NonMultiOnly]),
            TaskDef::new(Task::AniDistances, "09.distances/03.ani", &[NonMultiOnly]),
            TaskDef::new(Task::CladeFinding, "10.clades/01.find", &[NonMultiOnly]),
            TaskDef::new(Task::Subclades, "10.clades/02.ani", &[NonMultiOnly, CladeProjectOnly]),
            TaskDef::new(Task::Ogs, "10.clades/03.ogs", &[NonMultiOnly, CladeProjectOnly]),
        ];

        Self { dataset, project }
    }

    pub fn defs(&self, kind: EntityKind) -> &[TaskDef] {
        match kind {
            EntityKind::Dataset => &self.dataset,
            EntityKind::Project => &self.project,
        }
    }

    pub fn tasks(&self, kind: EntityKind) -> impl Iterator<Item = Task> + '_ {
        self.defs(kind).iter().map(|d| d.task)
    }

    pub fn position(&self, kind: EntityKind, task: Task) -> Option<usize> {
        self.defs(kind).iter().position(|d| d.task == task)
    }

    pub fn def(&self, task: Task) -> Option<&TaskDef> {
        self.dataset
            .iter()
            .chain(self.project.iter())
            .find(|d| d.task == task)
    }

    pub fn kind_of(&self, task: Task) -> Option<EntityKind> {
        if self.dataset.iter().any(|d| d.task == task) {
            Some(EntityKind::Dataset)
        } else if self.project.iter().any(|d| d.task == task) {
            Some(EntityKind::Project)
        } else {
            None
        }
    }
}
