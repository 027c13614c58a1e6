use std::fmt;

use crate::entity::{EntityId, EntityKind, EntityRef, Project, DEFAULT_MAX_TRY};
use crate::events::{dispatch, EntityEvent};
use crate::metadata::{Metadata, MetadataStore, StoreError};
use crate::results::{ResultIndex, ResultRegistry};
use crate::task::{Task, TaskTable};

/// Por qué una tarea se ignora (o `Execute` si no).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Complete,
    Inactive,
    Empty,
    Upstream,
    ForcedSkip,
    NotApplicable,
    Execute,
}

impl Decision {
    pub fn should_run(self) -> bool {
        self == Decision::Execute
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Decision::Complete => "complete",
            Decision::Inactive => "inactive",
            Decision::Empty => "empty",
            Decision::Upstream => "upstream",
            Decision::ForcedSkip => "force",
            Decision::NotApplicable => "not_applicable",
            Decision::Execute => "execute",
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decide qué tarea toca para cada entidad. Solo lee el disco, salvo
/// `claim_next_task`, que lleva la cuenta de intentos.
#[derive(Debug, Clone)]
pub struct TaskGate {
    table: TaskTable,
    registry: ResultRegistry,
    default_max_try: u64,
}

impl TaskGate {
    pub fn new(table: TaskTable, registry: ResultRegistry) -> Self {
        Self {
            table,
            registry,
            default_max_try: DEFAULT_MAX_TRY,
        }
    }

    pub fn miga() -> Self {
        Self::new(TaskTable::miga(), ResultRegistry::miga())
    }

    pub fn with_default_max_try(mut self, max_try: u64) -> Self {
        self.default_max_try = max_try;
        self
    }

    pub fn table(&self) -> &TaskTable {
        &self.table
    }

    pub fn results(&self) -> ResultIndex<'_> {
        ResultIndex::new(&self.table, &self.registry)
    }

    /// Posición de la primera tarea con resultado.
    fn first_result(&self, entity: &EntityRef<'_>) -> Option<usize> {
        let results = self.results();
        self.table
            .tasks(entity.kind())
            .position(|t| results.find(entity, t).is_some())
    }

    fn is_empty(&self, entity: &EntityRef<'_>) -> bool {
        match entity {
            EntityRef::Dataset { .. } => self.first_result(entity).is_none(),
            EntityRef::Project(project) => project.reference_datasets().next().is_none(),
        }
    }

    pub fn why_ignore(&self, entity: &EntityRef<'_>, task: Task) -> Decision {
        let kind = entity.kind();
        let Some(position) = self.table.position(kind, task) else {
            return Decision::NotApplicable;
        };

        if self.results().find(entity, task).is_some() {
            return Decision::Complete;
        }
        if !entity.is_active() {
            return Decision::Inactive;
        }
        if self.is_empty(entity) {
            return Decision::Empty;
        }
        if kind == EntityKind::Dataset {
            if let Some(first) = self.first_result(entity) {
                if position < first {
                    return Decision::Upstream;
                }
            }
        }
        match entity.task_override(task) {
            Some(false) => return Decision::ForcedSkip,
            Some(true) => return Decision::Execute,
            None => {}
        }
        let applies = self
            .table
            .defs(kind)
            .get(position)
            .map(|def| def.rules.iter().all(|r| entity.satisfies(*r)))
            .unwrap_or(false);
        if !applies {
            return Decision::NotApplicable;
        }
        Decision::Execute
    }

    pub fn next_task(&self, entity: &EntityRef<'_>) -> Option<Task> {
        self.table
            .tasks(entity.kind())
            .find(|t| self.why_ignore(entity, *t).should_run())
    }

    /// Como `next_task`, pero cuenta el intento en `_try_<task>`. Pasado
    /// el tope de intentos la entidad queda inactiva y no hay tarea.
    pub fn claim_next_task(
        &self,
        store: &MetadataStore,
        project: &mut Project,
        id: &EntityId,
    ) -> Result<Option<Task>, StoreError> {
        let (task, tries) = {
            let Some(entity) = project.entity(id) else {
                return Ok(None);
            };
            let Some(task) = self.next_task(&entity) else {
                return Ok(None);
            };
            let tries = entity
                .metadata()
                .get_u64(&format!("_try_{task}"))
                .unwrap_or(0);
            (task, tries)
        };

        let max_try = project.max_try().unwrap_or(self.default_max_try);
        if tries >= max_try {
            dispatch(
                store,
                project,
                id,
                EntityEvent::Inactivated {
                    reason: format!("Too many errors in step {task}"),
                },
            )?;
            return Ok(None);
        }

        let key = format!("_try_{task}");
        let fresh: Metadata = store.update(&project.record_of(id), |md: &mut Metadata| {
            let n = md.get_u64(&key).unwrap_or(0);
            md.set(key.clone(), n + 1);
        })?;
        if let Some(md) = project.metadata_of_mut(id) {
            *md = fresh;
        }
        Ok(Some(task))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{scratch_dir, write_result, ProjectBuilder};

    fn ds(name: &str) -> EntityId {
        EntityId::Dataset(name.to_string())
    }

    #[test]
    fn dataset_con_lecturas_crudas_pide_recorte() {
        let dir = scratch_dir("gate_tests", "raw");
        let store = MetadataStore::default();
        let p = ProjectBuilder::new(&dir).dataset("ds1").build(&store);
        write_result(&dir, "01.raw_reads", "ds1", &[".1.fastq"]);

        let gate = TaskGate::miga();
        let e = p.entity(&ds("ds1")).unwrap();
        assert_eq!(gate.why_ignore(&e, Task::RawReads), Decision::Complete);
        assert_eq!(gate.why_ignore(&e, Task::TrimmedReads), Decision::Execute);
        assert_eq!(gate.next_task(&e), Some(Task::TrimmedReads));
    }

    #[test]
    fn decidir_dos_veces_da_lo_mismo_y_no_escribe() {
        let dir = scratch_dir("gate_tests", "pure");
        let store = MetadataStore::default();
        let p = ProjectBuilder::new(&dir).dataset("ds1").build(&store);
        write_result(&dir, "01.raw_reads", "ds1", &[".1.fastq"]);
        let record = Project::dataset_record_path(&dir, "ds1");
        let before = std::fs::read(&record).unwrap();

        let gate = TaskGate::miga();
        let e = p.entity(&ds("ds1")).unwrap();
        let first: Vec<Decision> = Task::ALL.iter().map(|t| gate.why_ignore(&e, *t)).collect();
        let second: Vec<Decision> = Task::ALL.iter().map(|t| gate.why_ignore(&e, *t)).collect();
        assert_eq!(first, second);
        assert_eq!(gate.next_task(&e), gate.next_task(&e));
        assert_eq!(std::fs::read(&record).unwrap(), before);
        assert!(!dir.join("data/01.raw_reads/ds1.json").exists());
    }

    #[test]
    fn dataset_sin_resultados_es_vacio() {
        let dir = scratch_dir("gate_tests", "empty");
        let store = MetadataStore::default();
        let p = ProjectBuilder::new(&dir).dataset("ds1").build(&store);

        let gate = TaskGate::miga();
        let e = p.entity(&ds("ds1")).unwrap();
        assert_eq!(gate.why_ignore(&e, Task::RawReads), Decision::Empty);
        assert_eq!(gate.next_task(&e), None);
    }

    #[test]
    fn tareas_anteriores_al_primer_resultado_son_upstream() {
        let dir = scratch_dir("gate_tests", "upstream");
        let store = MetadataStore::default();
        let p = ProjectBuilder::new(&dir).dataset("ds1").build(&store);
        write_result(&dir, "05.assembly", "ds1", &[".LargeContigs.fna"]);

        let gate = TaskGate::miga();
        let e = p.entity(&ds("ds1")).unwrap();
        assert_eq!(gate.why_ignore(&e, Task::RawReads), Decision::Upstream);
        assert_eq!(gate.why_ignore(&e, Task::TrimmedFasta), Decision::Upstream);
        assert_eq!(gate.next_task(&e), Some(Task::Cds));
    }

    #[test]
    fn inactivo_gana_sobre_todo_menos_completo() {
        let dir = scratch_dir("gate_tests", "inactive");
        let store = MetadataStore::default();
        let p = ProjectBuilder::new(&dir)
            .dataset_with("ds1", |md| md.set("active", false))
            .build(&store);
        write_result(&dir, "05.assembly", "ds1", &[".LargeContigs.fna"]);

        let gate = TaskGate::miga();
        let e = p.entity(&ds("ds1")).unwrap();
        assert_eq!(gate.why_ignore(&e, Task::Assembly), Decision::Complete);
        assert_eq!(gate.why_ignore(&e, Task::Cds), Decision::Inactive);
        assert_eq!(gate.next_task(&e), None);
    }

    #[test]
    fn overrides_por_tarea() {
        let dir = scratch_dir("gate_tests", "override");
        let store = MetadataStore::default();
        let p = ProjectBuilder::new(&dir)
            .dataset_with("ds1", |md| {
                md.set("run_cds", false);
                md.set("run_mytaxa", true);
            })
            .build(&store);
        write_result(&dir, "05.assembly", "ds1", &[".LargeContigs.fna"]);

        let gate = TaskGate::miga();
        let e = p.entity(&ds("ds1")).unwrap();
        assert_eq!(gate.why_ignore(&e, Task::Cds), Decision::ForcedSkip);
        // mytaxa es solo para metagenomas, pero el override manda
        assert_eq!(gate.why_ignore(&e, Task::Mytaxa), Decision::Execute);
        assert_eq!(gate.next_task(&e), Some(Task::EssentialGenes));
    }

    #[test]
    fn reglas_estructurales_por_tipo_de_dataset() {
        let dir = scratch_dir("gate_tests", "rules");
        let store = MetadataStore::default();
        let p = ProjectBuilder::new(&dir)
            .dataset_with("mg", |md| md.set("type", "metagenome"))
            .query_dataset("q1")
            .build(&store);
        write_result(&dir, "05.assembly", "mg", &[".LargeContigs.fna"]);
        write_result(&dir, "05.assembly", "q1", &[".LargeContigs.fna"]);

        let gate = TaskGate::miga();
        let mg = p.entity(&ds("mg")).unwrap();
        assert_eq!(gate.why_ignore(&mg, Task::Mytaxa), Decision::Execute);
        assert_eq!(gate.why_ignore(&mg, Task::MytaxaScan), Decision::NotApplicable);
        assert_eq!(gate.why_ignore(&mg, Task::Distances), Decision::NotApplicable);

        let q1 = p.entity(&ds("q1")).unwrap();
        assert_eq!(gate.why_ignore(&q1, Task::Mytaxa), Decision::NotApplicable);
        assert_eq!(gate.why_ignore(&q1, Task::MytaxaScan), Decision::NotApplicable);
        // sin ref_project no hay taxonomía
        assert_eq!(gate.why_ignore(&q1, Task::Taxonomy), Decision::NotApplicable);
    }

    #[test]
    fn next_task_avanza_sin_retroceder() {
        let dir = scratch_dir("gate_tests", "monotonic");
        let store = MetadataStore::default();
        let p = ProjectBuilder::new(&dir).dataset("ds1").build(&store);
        write_result(&dir, "04.trimmed_fasta", "ds1", &[".SingleReads.fa"]);

        let gate = TaskGate::miga();
        let table = gate.table().clone();
        let e = p.entity(&ds("ds1")).unwrap();

        let outputs: [(Task, &[&str]); 5] = [
            (Task::Assembly, &[".LargeContigs.fna"]),
            (Task::Cds, &[".faa"]),
            (Task::EssentialGenes, &[".ess.faa", ".ess"]),
            (Task::MytaxaScan, &[".pdf"]),
            (Task::Ssu, &[".ssu.fa"]),
        ];
        let mut last = table.position(EntityKind::Dataset, Task::TrimmedFasta);
        for (task, suffixes) in outputs {
            let next = gate.next_task(&e).unwrap();
            assert_eq!(next, task);
            let pos = table.position(EntityKind::Dataset, next);
            assert!(pos > last);
            last = pos;
            let dir_name = table.def(task).unwrap().dir;
            write_result(&dir, dir_name, "ds1", suffixes);
        }
        assert_eq!(gate.next_task(&e), Some(Task::Distances));
    }

    #[test]
    fn demasiados_intentos_inactivan_el_dataset() {
        let dir = scratch_dir("gate_tests", "maxtry");
        let store = MetadataStore::default();
        let mut p = ProjectBuilder::new(&dir)
            .set("max_try", 2)
            .dataset("ds1")
            .build(&store);
        write_result(&dir, "01.raw_reads", "ds1", &[".1.fastq"]);

        let gate = TaskGate::miga();
        let id = ds("ds1");
        assert_eq!(
            gate.claim_next_task(&store, &mut p, &id).unwrap(),
            Some(Task::TrimmedReads)
        );
        assert_eq!(
            gate.claim_next_task(&store, &mut p, &id).unwrap(),
            Some(Task::TrimmedReads)
        );
        assert_eq!(gate.claim_next_task(&store, &mut p, &id).unwrap(), None);

        let ds1 = p.dataset("ds1").unwrap();
        assert!(!ds1.is_active());
        assert_eq!(
            ds1.inactive_reason(),
            Some("Too many errors in step trimmed_reads")
        );
        let reloaded = Project::load(&store, &dir).unwrap();
        assert!(!reloaded.dataset("ds1").unwrap().is_active());
    }

    #[test]
    fn proyecto_sin_referencias_es_vacio() {
        let dir = scratch_dir("gate_tests", "project");
        let store = MetadataStore::default();
        let p = ProjectBuilder::new(&dir).query_dataset("q1").build(&store);
        let gate = TaskGate::miga();
        let e = EntityRef::Project(&p);
        assert_eq!(gate.why_ignore(&e, Task::ProjectStats), Decision::Empty);

        let dir = scratch_dir("gate_tests", "project_ref");
        let p = ProjectBuilder::new(&dir).dataset("r1").build(&store);
        let e = EntityRef::Project(&p);
        assert_eq!(gate.next_task(&e), Some(Task::ProjectStats));
        // subclades solo en proyectos clade
        assert_eq!(gate.why_ignore(&e, Task::Subclades), Decision::NotApplicable);
    }

    #[test]
    fn tarea_de_otro_tipo_no_aplica() {
        let dir = scratch_dir("gate_tests", "wrongkind");
        let store = MetadataStore::default();
        let p = ProjectBuilder::new(&dir).dataset("ds1").build(&store);
        let gate = TaskGate::miga();
        let e = p.entity(&ds("ds1")).unwrap();
        assert_eq!(gate.why_ignore(&e, Task::Ogs), Decision::NotApplicable);
    }
}
