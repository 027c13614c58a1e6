use std::{
    fmt, fs,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::metadata::{Loaded, Metadata, MetadataStore, StoreError};
use crate::task::{Task, TaskRule};

pub const PROJECT_RECORD: &str = "miga.project.json";
/// Nombre base de los resultados de proyecto.
pub const PROJECT_BASE: &str = "miga-project";
pub const DEFAULT_MAX_TRY: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Dataset,
    Project,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatasetKind {
    Genome,
    Scgenome,
    Popgenome,
    Metagenome,
    Virome,
    Plasmid,
}

impl DatasetKind {
    pub fn is_multi(self) -> bool {
        matches!(self, DatasetKind::Metagenome | DatasetKind::Virome)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectKind {
    Genomes,
    Clade,
    Mixed,
    Metagenomes,
    Plasmids,
}

impl ProjectKind {
    pub fn is_multi(self) -> bool {
        matches!(self, ProjectKind::Metagenomes)
    }
}

fn parse_kind<T: serde::de::DeserializeOwned>(md: &Metadata) -> Option<T> {
    md.get("type")
        .and_then(|v| serde_json::from_value::<T>(v.clone()).ok())
}

/// Identifica una entidad dentro de un proyecto.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntityId {
    Project,
    Dataset(String),
}

impl EntityId {
    /// `None` representa al proyecto (formato del status file).
    pub fn from_name(name: Option<String>) -> Self {
        match name {
            Some(n) => EntityId::Dataset(n),
            None => EntityId::Project,
        }
    }

    pub fn name(&self) -> Option<&str> {
        match self {
            EntityId::Project => None,
            EntityId::Dataset(n) => Some(n),
        }
    }

    pub fn kind(&self) -> EntityKind {
        match self {
            EntityId::Project => EntityKind::Project,
            EntityId::Dataset(_) => EntityKind::Dataset,
        }
    }

    /// Nombre base para archivos de resultados y logs.
    pub fn base(&self) -> &str {
        self.name().unwrap_or(PROJECT_BASE)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.base())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    pub name: String,
    pub metadata: Metadata,
}

impl Dataset {
    /// Registro mínimo para un dataset cuyo archivo se perdió.
    pub fn fresh_metadata(name: &str) -> Metadata {
        let mut md = Metadata::new();
        md.set("name", name);
        md.set("ref", true);
        md.set("type", "genome");
        md.set("active", true);
        md.touch("created");
        md
    }

    pub fn kind(&self) -> DatasetKind {
        parse_kind(&self.metadata).unwrap_or(DatasetKind::Genome)
    }

    pub fn is_ref(&self) -> bool {
        self.metadata.get_bool("ref").unwrap_or(true)
    }

    pub fn is_active(&self) -> bool {
        self.metadata.get_bool("active").unwrap_or(true)
    }

    pub fn inactive_reason(&self) -> Option<&str> {
        self.metadata.get_str("inactive_reason")
    }
}

#[derive(Debug, Clone)]
pub struct Project {
    pub path: PathBuf,
    pub metadata: Metadata,
    pub datasets: Vec<Dataset>,
}

impl Project {
    pub fn record_path(path: &Path) -> PathBuf {
        path.join(PROJECT_RECORD)
    }

    pub fn is_project_dir(path: &Path) -> bool {
        Self::record_path(path).is_file()
    }

    pub fn dataset_record_path(path: &Path, name: &str) -> PathBuf {
        path.join("metadata").join(format!("{name}.json"))
    }

    /// Lee el proyecto y sus datasets. Registros corruptos se reconstruyen
    /// a partir de lo que hay en disco.
    pub fn load(store: &MetadataStore, path: &Path) -> Result<Project, StoreError> {
        let record = Self::record_path(path);
        let metadata = match store.load::<Metadata>(&record)? {
            Loaded::Found(md) => md,
            Loaded::Missing => {
                return Err(StoreError::Io {
                    path: record,
                    source: std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        "not a project directory",
                    ),
                })
            }
            Loaded::Discarded => store.repair(&record, || Self::rebuild_metadata(path))?,
        };

        let names: Vec<String> = metadata
            .get("datasets")
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(|s| s.to_string()))
                    .collect()
            })
            .unwrap_or_default();

        let mut datasets = Vec::with_capacity(names.len());
        for name in names {
            let ds_path = Self::dataset_record_path(path, &name);
            let md = match store.load::<Metadata>(&ds_path)? {
                Loaded::Found(md) => md,
                Loaded::Missing | Loaded::Discarded => store.repair(&ds_path, || {
                    warn!("reconstruyendo registro del dataset {}", name);
                    Dataset::fresh_metadata(&name)
                })?,
            };
            datasets.push(Dataset { name, metadata: md });
        }

        Ok(Project {
            path: path.to_path_buf(),
            metadata,
            datasets,
        })
    }

    /// Nombre = directorio, datasets = lo que haya en `metadata/*.json`.
    fn rebuild_metadata(path: &Path) -> Metadata {
        warn!("reconstruyendo registro del proyecto {}", path.display());

        let mut names: Vec<String> = fs::read_dir(path.join("metadata"))
            .map(|entries| {
                entries
                    .flatten()
                    .filter_map(|e| {
                        let p = e.path();
                        if p.extension().and_then(|x| x.to_str()) == Some("json") {
                            p.file_stem().map(|s| s.to_string_lossy().to_string())
                        } else {
                            None
                        }
                    })
                    .collect()
            })
            .unwrap_or_default();
        names.sort();

        let mut md = Metadata::new();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| PROJECT_BASE.to_string());
        md.set("name", name);
        md.set("type", "mixed");
        md.set(
            "datasets",
            Value::Array(names.into_iter().map(Value::String).collect()),
        );
        md.touch("created");
        md.touch("updated");
        md
    }

    pub fn name(&self) -> String {
        self.metadata
            .get_str("name")
            .map(|s| s.to_string())
            .or_else(|| {
                self.path
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
            })
            .unwrap_or_else(|| PROJECT_BASE.to_string())
    }

    pub fn kind(&self) -> ProjectKind {
        parse_kind(&self.metadata).unwrap_or(ProjectKind::Mixed)
    }

    pub fn is_active(&self) -> bool {
        self.metadata.get_bool("active").unwrap_or(true)
    }

    pub fn ref_project(&self) -> Option<&str> {
        self.metadata
            .get_str("ref_project")
            .filter(|s| !s.trim().is_empty())
    }

    pub fn max_try(&self) -> Option<u64> {
        self.metadata.get_u64("max_try")
    }

    /// Última modificación declarada; si no hay, el mtime del registro.
    pub fn updated(&self) -> Option<DateTime<Utc>> {
        self.metadata.get_time("updated").or_else(|| {
            fs::metadata(Self::record_path(&self.path))
                .and_then(|m| m.modified())
                .ok()
                .map(DateTime::<Utc>::from)
        })
    }

    pub fn data_dir(&self) -> PathBuf {
        self.path.join("data")
    }

    pub fn daemon_dir(&self) -> PathBuf {
        self.path.join("daemon")
    }

    pub fn dataset(&self, name: &str) -> Option<&Dataset> {
        self.datasets.iter().find(|d| d.name == name)
    }

    pub fn reference_datasets(&self) -> impl Iterator<Item = &Dataset> {
        self.datasets.iter().filter(|d| d.is_ref())
    }

    pub fn entity(&self, id: &EntityId) -> Option<EntityRef<'_>> {
        match id {
            EntityId::Project => Some(EntityRef::Project(self)),
            EntityId::Dataset(name) => self.dataset(name).map(|dataset| EntityRef::Dataset {
                project: self,
                dataset,
            }),
        }
    }

    pub fn metadata_of_mut(&mut self, id: &EntityId) -> Option<&mut Metadata> {
        match id {
            EntityId::Project => Some(&mut self.metadata),
            EntityId::Dataset(name) => self
                .datasets
                .iter_mut()
                .find(|d| &d.name == name)
                .map(|d| &mut d.metadata),
        }
    }

    pub fn record_of(&self, id: &EntityId) -> PathBuf {
        match id {
            EntityId::Project => Self::record_path(&self.path),
            EntityId::Dataset(name) => Self::dataset_record_path(&self.path, name),
        }
    }
}

/// Vista uniforme de un dataset o del propio proyecto.
#[derive(Debug, Clone, Copy)]
pub enum EntityRef<'a> {
    Dataset {
        project: &'a Project,
        dataset: &'a Dataset,
    },
    Project(&'a Project),
}

impl<'a> EntityRef<'a> {
    pub fn kind(&self) -> EntityKind {
        match self {
            EntityRef::Dataset { .. } => EntityKind::Dataset,
            EntityRef::Project(_) => EntityKind::Project,
        }
    }

    pub fn id(&self) -> EntityId {
        match self {
            EntityRef::Dataset { dataset, .. } => EntityId::Dataset(dataset.name.clone()),
            EntityRef::Project(_) => EntityId::Project,
        }
    }

    pub fn base(&self) -> &'a str {
        match self {
            EntityRef::Dataset { dataset, .. } => &dataset.name,
            EntityRef::Project(_) => PROJECT_BASE,
        }
    }

    pub fn project(&self) -> &'a Project {
        match self {
            EntityRef::Dataset { project, .. } => project,
            EntityRef::Project(project) => project,
        }
    }

    pub fn metadata(&self) -> &'a Metadata {
        match self {
            EntityRef::Dataset { dataset, .. } => &dataset.metadata,
            EntityRef::Project(project) => &project.metadata,
        }
    }

    pub fn is_active(&self) -> bool {
        match self {
            EntityRef::Dataset { dataset, .. } => dataset.is_active(),
            EntityRef::Project(project) => project.is_active(),
        }
    }

    /// `run_<task>` en el registro: `Some(false)` fuerza el salto,
    /// `Some(true)` fuerza la ejecución.
    pub fn task_override(&self, task: Task) -> Option<bool> {
        self.metadata().get_bool(&format!("run_{task}"))
    }

    pub fn is_multi(&self) -> bool {
        match self {
            EntityRef::Dataset { dataset, .. } => dataset.kind().is_multi(),
            EntityRef::Project(project) => project.kind().is_multi(),
        }
    }

    pub fn satisfies(&self, rule: TaskRule) -> bool {
        match rule {
            TaskRule::ReferenceOnly => match self {
                EntityRef::Dataset { dataset, .. } => dataset.is_ref(),
                EntityRef::Project(_) => true,
            },
            TaskRule::QueryOnly => match self {
                EntityRef::Dataset { dataset, .. } => !dataset.is_ref(),
                EntityRef::Project(_) => false,
            },
            TaskRule::MultiOnly => self.is_multi(),
            TaskRule::NonMultiOnly => !self.is_multi(),
            TaskRule::RequiresRefProject => self.project().ref_project().is_some(),
            TaskRule::CladeProjectOnly => self.project().kind() == ProjectKind::Clade,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    fn temp_dir(sub: &str) -> PathBuf {
        let base = env::temp_dir().join("entity_tests").join(sub);
        let _ = fs::remove_dir_all(&base);
        fs::create_dir_all(base.join("metadata")).unwrap();
        base
    }

    #[test]
    fn carga_proyecto_y_reconstruye_dataset_perdido() {
        let dir = temp_dir("load");
        let store = MetadataStore::default();

        let mut md = Metadata::new();
        md.set("name", "demo");
        md.set("type", "clade");
        md.set("datasets", serde_json::json!(["a", "b"]));
        store.save(&Project::record_path(&dir), &md).unwrap();

        let mut a = Dataset::fresh_metadata("a");
        a.set("type", "metagenome");
        a.set("ref", false);
        store
            .save(&Project::dataset_record_path(&dir, "a"), &a)
            .unwrap();

        let p = Project::load(&store, &dir).unwrap();
        assert_eq!(p.name(), "demo");
        assert_eq!(p.kind(), ProjectKind::Clade);
        assert_eq!(p.datasets.len(), 2);
        assert!(p.dataset("a").unwrap().kind().is_multi());
        assert!(!p.dataset("a").unwrap().is_ref());
        // "b" no tenía registro: se creó uno mínimo
        assert!(Project::dataset_record_path(&dir, "b").is_file());
        assert_eq!(p.reference_datasets().count(), 1);
    }

    #[test]
    fn registro_de_proyecto_corrupto_se_reconstruye_desde_disco() {
        let dir = temp_dir("rebuild");
        let store = MetadataStore::default();
        store
            .save(
                &Project::dataset_record_path(&dir, "x1"),
                &Dataset::fresh_metadata("x1"),
            )
            .unwrap();
        fs::write(Project::record_path(&dir), b"<<basura>>").unwrap();

        let p = Project::load(&store, &dir).unwrap();
        assert_eq!(p.name(), "rebuild");
        assert_eq!(p.datasets.len(), 1);
        assert_eq!(p.datasets[0].name, "x1");
        assert!(p.updated().is_some());
    }

    #[test]
    fn directorio_sin_registro_no_es_proyecto() {
        let dir = temp_dir("noproject");
        assert!(!Project::is_project_dir(&dir));
        assert!(Project::load(&MetadataStore::default(), &dir).is_err());
    }
}
