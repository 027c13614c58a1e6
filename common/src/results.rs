use std::{
    collections::{BTreeMap, HashMap},
    fs,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::entity::EntityRef;
use crate::metadata::{MetadataStore, StoreError};
use crate::task::{Task, TaskTable};

/// Archivos que un resultado reclama: clave lógica → nombre de archivo.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResultFiles(BTreeMap<String, String>);

impl ResultFiles {
    pub fn insert(&mut self, key: &str, file: String) {
        self.0.insert(key.to_string(), file);
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(|s| s.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Registro persistido junto a los archivos (`<base>.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub created: DateTime<Utc>,
    pub started: Option<DateTime<Utc>>,
    pub done: Option<DateTime<Utc>>,
    pub files: ResultFiles,
    #[serde(default)]
    pub stats: Map<String, Value>,
    #[serde(default)]
    pub versions: Map<String, Value>,
}

/// Lo que un builder puede ver: un directorio y un nombre base.
pub struct ResultProbe<'a> {
    dir: &'a Path,
    base: &'a str,
}

impl<'a> ResultProbe<'a> {
    pub fn new(dir: &'a Path, base: &'a str) -> Self {
        Self { dir, base }
    }

    pub fn file_name(&self, suffix: &str) -> String {
        format!("{}{}", self.base, suffix)
    }

    pub fn has(&self, suffix: &str) -> bool {
        self.dir.join(self.file_name(suffix)).exists()
    }

    fn first(&self, suffixes: &[&str]) -> Option<String> {
        suffixes
            .iter()
            .find(|s| self.has(s))
            .map(|s| self.file_name(s))
    }

    /// Falla (None) si no existe ninguna de las alternativas.
    pub fn require(&self, files: &mut ResultFiles, key: &str, suffixes: &[&str]) -> Option<()> {
        let file = self.first(suffixes)?;
        files.insert(key, file);
        Some(())
    }

    pub fn optional(&self, files: &mut ResultFiles, key: &str, suffixes: &[&str]) {
        if let Some(file) = self.first(suffixes) {
            files.insert(key, file);
        }
    }

    /// Al menos uno de los grupos debe existir; se toman todos los presentes.
    pub fn require_any(&self, files: &mut ResultFiles, groups: &[(&str, &[&str])]) -> Option<()> {
        let before = files.len();
        for (key, suffixes) in groups {
            self.optional(files, key, suffixes);
        }
        (files.len() > before).then_some(())
    }
}

pub type ResultBuilder = fn(&ResultProbe<'_>) -> Option<ResultFiles>;

/* ---------------- builders por tarea ---------------- */

fn build_raw_reads(p: &ResultProbe<'_>) -> Option<ResultFiles> {
    let mut f = ResultFiles::default();
    p.require(&mut f, "pair1", &[".1.fastq", ".1.fastq.gz"])?;
    p.optional(&mut f, "pair2", &[".2.fastq", ".2.fastq.gz"]);
    Some(f)
}

fn build_trimmed_reads(p: &ResultProbe<'_>) -> Option<ResultFiles> {
    let mut f = ResultFiles::default();
    p.require(&mut f, "pair1", &[".1.clipped.fastq", ".1.clipped.fastq.gz"])?;
    p.optional(&mut f, "pair2", &[".2.clipped.fastq", ".2.clipped.fastq.gz"]);
    p.optional(
        &mut f,
        "single",
        &[".1.clipped.single.fastq", ".1.clipped.single.fastq.gz"],
    );
    Some(f)
}

fn build_read_quality(p: &ResultProbe<'_>) -> Option<ResultFiles> {
    let mut f = ResultFiles::default();
    p.require(&mut f, "solexaqa", &[".solexaqa"])?;
    p.require(&mut f, "fastqc", &[".fastqc"])?;
    Some(f)
}

fn build_trimmed_fasta(p: &ResultProbe<'_>) -> Option<ResultFiles> {
    let mut f = ResultFiles::default();
    p.require_any(
        &mut f,
        &[
            ("coupled", &[".CoupledReads.fa", ".CoupledReads.fa.gz"]),
            ("single", &[".SingleReads.fa", ".SingleReads.fa.gz"]),
        ],
    )?;
    Some(f)
}

fn build_assembly(p: &ResultProbe<'_>) -> Option<ResultFiles> {
    let mut f = ResultFiles::default();
    p.require(&mut f, "largecontigs", &[".LargeContigs.fna", ".LargeContigs.fna.gz"])?;
    p.optional(&mut f, "allcontigs", &[".AllContigs.fna", ".AllContigs.fna.gz"]);
    Some(f)
}

fn build_cds(p: &ResultProbe<'_>) -> Option<ResultFiles> {
    let mut f = ResultFiles::default();
    p.require(&mut f, "proteins", &[".faa", ".faa.gz"])?;
    p.optional(&mut f, "genes", &[".fna", ".fna.gz"]);
    p.optional(&mut f, "gff", &[".gff3", ".gff3.gz", ".gff2"]);
    Some(f)
}

fn build_essential_genes(p: &ResultProbe<'_>) -> Option<ResultFiles> {
    let mut f = ResultFiles::default();
    p.require(&mut f, "ess_genes", &[".ess.faa"])?;
    p.require(&mut f, "collection", &[".ess"])?;
    p.optional(&mut f, "report", &[".ess/log"]);
    Some(f)
}

fn build_mytaxa(p: &ResultProbe<'_>) -> Option<ResultFiles> {
    let mut f = ResultFiles::default();
    p.require(&mut f, "mytaxa", &[".mytaxa"])?;
    p.optional(&mut f, "blast", &[".blast", ".blast.gz"]);
    p.optional(&mut f, "mytaxain", &[".mytaxain", ".mytaxain.gz"]);
    Some(f)
}

fn build_mytaxa_scan(p: &ResultProbe<'_>) -> Option<ResultFiles> {
    let mut f = ResultFiles::default();
    p.require(&mut f, "report", &[".pdf"])?;
    p.optional(&mut f, "wintax", &[".wintax"]);
    Some(f)
}

fn build_ssu(p: &ResultProbe<'_>) -> Option<ResultFiles> {
    let mut f = ResultFiles::default();
    p.require(&mut f, "longest_ssu_gene", &[".ssu.fa", ".ssu.fa.gz"])?;
    p.optional(&mut f, "gff", &[".ssu.gff", ".ssu.gff.gz"]);
    p.optional(&mut f, "all_ssu_genes", &[".ssu.all.fa", ".ssu.all.fa.gz"]);
    Some(f)
}

fn build_distances(p: &ResultProbe<'_>) -> Option<ResultFiles> {
    let mut f = ResultFiles::default();
    p.require_any(
        &mut f,
        &[
            ("haai_db", &[".haai.db"]),
            ("aai_db", &[".aai.db"]),
            ("ani_db", &[".ani.db"]),
        ],
    )?;
    Some(f)
}

fn build_taxonomy(p: &ResultProbe<'_>) -> Option<ResultFiles> {
    let mut f = ResultFiles::default();
    p.require(&mut f, "aai_medoids", &[".aai-medoids.tsv"])?;
    p.require(&mut f, "aai_db", &[".aai.db"])?;
    p.optional(&mut f, "ani_db", &[".ani.db"]);
    Some(f)
}

/// Stats no produce archivos: todo va al registro.
fn build_stats(_p: &ResultProbe<'_>) -> Option<ResultFiles> {
    Some(ResultFiles::default())
}

fn build_project_stats(p: &ResultProbe<'_>) -> Option<ResultFiles> {
    let mut f = ResultFiles::default();
    p.require(&mut f, "taxonomy", &[".taxonomy.json"])?;
    p.require(&mut f, "metadata", &[".metadata.db"])?;
    Some(f)
}

fn build_distance_matrix(p: &ResultProbe<'_>) -> Option<ResultFiles> {
    let mut f = ResultFiles::default();
    p.require(&mut f, "rds", &[".rds"])?;
    p.require(&mut f, "log", &[".log"])?;
    p.optional(&mut f, "txt", &[".txt", ".txt.gz"]);
    Some(f)
}

fn build_clade_finding(p: &ResultProbe<'_>) -> Option<ResultFiles> {
    let mut f = ResultFiles::default();
    p.require(&mut f, "proposal", &[".proposed-clades"])?;
    p.optional(&mut f, "report", &[".pdf"]);
    Some(f)
}

fn build_subclades(p: &ResultProbe<'_>) -> Option<ResultFiles> {
    let mut f = ResultFiles::default();
    p.require(&mut f, "report", &[".pdf"])?;
    p.require(&mut f, "class_table", &[".class.tsv"])?;
    Some(f)
}

fn build_ogs(p: &ResultProbe<'_>) -> Option<ResultFiles> {
    let mut f = ResultFiles::default();
    p.require(&mut f, "ogs", &[".ogs"])?;
    p.require(&mut f, "stats", &[".stats"])?;
    Some(f)
}

/// Tarea → builder, resuelto al arrancar.
#[derive(Debug, Clone)]
pub struct ResultRegistry {
    builders: HashMap<Task, ResultBuilder>,
}

impl ResultRegistry {
    pub fn new(builders: HashMap<Task, ResultBuilder>) -> Self {
        Self { builders }
    }

    pub fn miga() -> Self {
        let entries: [(Task, ResultBuilder); 20] = [
            (Task::RawReads, build_raw_reads),
            (Task::TrimmedReads, build_trimmed_reads),
            (Task::ReadQuality, build_read_quality),
            (Task::TrimmedFasta, build_trimmed_fasta),
            (Task::Assembly, build_assembly),
            (Task::Cds, build_cds),
            (Task::EssentialGenes, build_essential_genes),
            (Task::Mytaxa, build_mytaxa),
            (Task::MytaxaScan, build_mytaxa_scan),
            (Task::Ssu, build_ssu),
            (Task::Distances, build_distances),
            (Task::Taxonomy, build_taxonomy),
            (Task::Stats, build_stats),
            (Task::ProjectStats, build_project_stats),
            (Task::HaaiDistances, build_distance_matrix),
            (Task::AaiDistances, build_distance_matrix),
            (Task::AniDistances, build_distance_matrix),
            (Task::CladeFinding, build_clade_finding),
            (Task::Subclades, build_subclades),
            (Task::Ogs, build_ogs),
        ];
        Self {
            builders: entries.into_iter().collect(),
        }
    }

    pub fn builder(&self, task: Task) -> Option<ResultBuilder> {
        self.builders.get(&task).copied()
    }
}

/// Consultas y mantenimiento de resultados sobre una tabla + registry.
pub struct ResultIndex<'a> {
    table: &'a TaskTable,
    registry: &'a ResultRegistry,
}

struct Location {
    dir: PathBuf,
    done: PathBuf,
    record: PathBuf,
}

fn mtime(path: &Path) -> Option<DateTime<Utc>> {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .map(DateTime::<Utc>::from)
}

impl<'a> ResultIndex<'a> {
    pub fn new(table: &'a TaskTable, registry: &'a ResultRegistry) -> Self {
        Self { table, registry }
    }

    fn locate(&self, entity: &EntityRef<'_>, task: Task) -> Option<Location> {
        let def = self.table.def(task)?;
        let dir = entity.project().data_dir().join(def.dir);
        let base = entity.base();
        Some(Location {
            done: dir.join(format!("{base}.done")),
            record: dir.join(format!("{base}.json")),
            dir,
        })
    }

    /// Solo lectura: el resultado existe si hay `.done`, el builder
    /// encuentra sus archivos y todo lo reclamado existe.
    pub fn find(&self, entity: &EntityRef<'_>, task: Task) -> Option<ResultRecord> {
        let loc = self.locate(entity, task)?;
        if !loc.done.exists() {
            return None;
        }
        let builder = self.registry.builder(task)?;
        let files = builder(&ResultProbe::new(&loc.dir, entity.base()))?;

        if let Some(record) = read_result_record(&loc.record) {
            let all_there = record
                .files
                .iter()
                .all(|(_, f)| loc.dir.join(f).exists());
            return all_there.then_some(record);
        }

        let done = mtime(&loc.done);
        Some(ResultRecord {
            created: done.unwrap_or_else(|| DateTime::<Utc>::from(std::time::UNIX_EPOCH)),
            started: mtime(&loc.dir.join(format!("{}.start", entity.base()))),
            done,
            files,
            stats: Map::new(),
            versions: Map::new(),
        })
    }

    /// Escribe `<base>.json` si aún no existe. Devuelve el registro.
    pub fn materialize(
        &self,
        store: &MetadataStore,
        entity: &EntityRef<'_>,
        task: Task,
    ) -> Result<Option<ResultRecord>, StoreError> {
        let Some(mut record) = self.find(entity, task) else {
            return Ok(None);
        };
        let Some(loc) = self.locate(entity, task) else {
            return Ok(None);
        };
        if loc.record.exists() {
            return Ok(Some(record));
        }

        record.created = Utc::now();
        store.save(&loc.record, &record)?;
        info!("resultado {} de {} registrado", task, entity.base());
        Ok(Some(record))
    }

    /// Un registro que reclama archivos inexistentes se invalida: se borran
    /// `<base>.json` y `<base>.done`. Devuelve las tareas invalidadas.
    pub fn invalidate_stale(&self, entity: &EntityRef<'_>) -> Result<Vec<Task>, StoreError> {
        let mut invalidated = Vec::new();

        for task in self.table.tasks(entity.kind()) {
            let Some(loc) = self.locate(entity, task) else {
                continue;
            };
            let Some(record) = read_result_record(&loc.record) else {
                continue;
            };
            let missing: Vec<&String> = record
                .files
                .iter()
                .filter(|(_, f)| !loc.dir.join(f.as_str()).exists())
                .map(|(_, f)| f)
                .collect();
            if missing.is_empty() {
                continue;
            }

            warn!(
                "resultado {} de {} reclama archivos inexistentes ({:?}), invalidando",
                task,
                entity.base(),
                missing
            );
            for p in [&loc.record, &loc.done] {
                if let Err(e) = fs::remove_file(p) {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        return Err(StoreError::Io {
                            path: p.to_path_buf(),
                            source: e,
                        });
                    }
                }
            }
            invalidated.push(task);
        }

        Ok(invalidated)
    }
}

fn read_result_record(path: &Path) -> Option<ResultRecord> {
    // sin lock: los registros de resultados tienen un solo escritor
    match fs::read(path) {
        Ok(raw) => serde_json::from_slice(&raw).ok(),
        Err(_) => None,
    }
}
