//! Helpers de prueba compartidos (feature `fixtures`).

use std::{
    env, fs,
    path::{Path, PathBuf},
};

use serde_json::Value;

use crate::entity::{Dataset, Project};
use crate::metadata::{Metadata, MetadataStore};
use crate::task::Task;

/// Directorio temporal limpio: `<tmp>/<group>/<sub>`.
pub fn scratch_dir(group: &str, sub: &str) -> PathBuf {
    let base = env::temp_dir().join(group).join(sub);
    let _ = fs::remove_dir_all(&base);
    fs::create_dir_all(&base).unwrap();
    base
}

/// Arma un proyecto en disco con sus registros.
pub struct ProjectBuilder {
    path: PathBuf,
    metadata: Metadata,
    datasets: Vec<(String, Metadata)>,
}

impl ProjectBuilder {
    pub fn new(path: &Path) -> Self {
        let mut metadata = Metadata::new();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "fixture".into());
        metadata.set("name", name);
        metadata.set("type", "genomes");
        metadata.touch("created");
        Self {
            path: path.to_path_buf(),
            metadata,
            datasets: Vec::new(),
        }
    }

    pub fn set(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.set(key, value);
        self
    }

    pub fn dataset(self, name: &str) -> Self {
        self.dataset_with(name, |_| {})
    }

    pub fn query_dataset(self, name: &str) -> Self {
        self.dataset_with(name, |md| md.set("ref", false))
    }

    pub fn dataset_with(mut self, name: &str, f: impl FnOnce(&mut Metadata)) -> Self {
        let mut md = Dataset::fresh_metadata(name);
        f(&mut md);
        self.datasets.push((name.to_string(), md));
        self
    }

    pub fn build(mut self, store: &MetadataStore) -> Project {
        let names: Vec<Value> = self
            .datasets
            .iter()
            .map(|(n, _)| Value::String(n.clone()))
            .collect();
        self.metadata.set("datasets", Value::Array(names));

        fs::create_dir_all(self.path.join("metadata")).unwrap();
        fs::create_dir_all(self.path.join("data")).unwrap();
        fs::create_dir_all(self.path.join("daemon")).unwrap();
        store
            .save(&Project::record_path(&self.path), &self.metadata)
            .unwrap();
        for (name, md) in &self.datasets {
            store
                .save(&Project::dataset_record_path(&self.path, name), md)
                .unwrap();
        }
        Project::load(store, &self.path).unwrap()
    }
}

/// Crea `<base><suffix>` para cada sufijo y el marcador `<base>.done`.
pub fn write_result(project: &Path, task_dir: &str, base: &str, suffixes: &[&str]) {
    let dir = project.join("data").join(task_dir);
    fs::create_dir_all(&dir).unwrap();
    for s in suffixes {
        fs::write(dir.join(format!("{base}{s}")), b"fixture").unwrap();
    }
    fs::write(dir.join(format!("{base}.done")), b"").unwrap();
}

/// Un `<task>.bash` vacío por cada tarea.
pub fn scripts_dir(root: &Path) -> PathBuf {
    let dir = root.join("scripts");
    fs::create_dir_all(&dir).unwrap();
    for t in Task::ALL {
        fs::write(dir.join(format!("{t}.bash")), b"#!/bin/bash\ntrue\n").unwrap();
    }
    dir
}
