use std::{
    collections::BTreeMap,
    fs::{self, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
    thread,
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

/// Registro clave→valor de una entidad (dataset o proyecto).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metadata(BTreeMap<String, Value>);

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|v| v.as_str())
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.0.get(key).and_then(|v| v.as_bool())
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.0.get(key).and_then(|v| v.as_u64())
    }

    /// Timestamps se guardan como RFC 3339.
    pub fn get_time(&self, key: &str) -> Option<DateTime<Utc>> {
        self.get_str(key)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc))
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn touch(&mut self, key: &str) {
        self.set(key, Utc::now().to_rfc3339());
    }

    /// Borra todas las claves con el prefijo dado (ej: contadores `_try_`).
    pub fn remove_prefixed(&mut self, prefix: &str) {
        self.0.retain(|k, _| !k.starts_with(prefix));
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    /// Otro proceso murió con el lock tomado: no se rompe en silencio.
    #[error("lock {path} held for more than {waited:?}")]
    LockTimeout { path: PathBuf, waited: Duration },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot encode record {path}: {source}")]
    Encode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl StoreError {
    fn io(path: &Path, source: io::Error) -> Self {
        StoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    pub fn is_lock_timeout(&self) -> bool {
        matches!(self, StoreError::LockTimeout { .. })
    }
}

/// Resultado de leer un registro del disco.
#[derive(Debug, Clone, PartialEq)]
pub enum Loaded<T> {
    Found(T),
    Missing,
    /// El archivo existía pero no se pudo parsear; fue descartado.
    Discarded,
}

impl<T> Loaded<T> {
    pub fn found(self) -> Option<T> {
        match self {
            Loaded::Found(v) => Some(v),
            _ => None,
        }
    }
}

/// Esperas crecientes mientras exista el `.lock`.
#[derive(Debug, Clone, Copy)]
pub struct LockPolicy {
    pub first_wait: Duration,
    pub max_wait: Duration,
    pub ceiling: Duration,
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self {
            first_wait: Duration::from_millis(50),
            max_wait: Duration::from_secs(2),
            ceiling: Duration::from_secs(600),
        }
    }
}

/// Persistencia de registros JSON con exclusión mutua por archivo `.lock`.
///
/// Escritura: crear `<path>.lock` (O_EXCL), escribir a un temporal,
/// renombrar sobre el destino y borrar el lock. Lectores y escritores
/// esperan mientras el lock exista.
#[derive(Debug, Clone, Default)]
pub struct MetadataStore {
    policy: LockPolicy,
}

/// Mientras viva, el `.lock` existe.
pub struct LockGuard {
    path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!("no se pudo borrar el lock {}: {}", self.path.display(), e);
        }
    }
}

pub fn lock_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".lock");
    PathBuf::from(name)
}

impl MetadataStore {
    pub fn new(policy: LockPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> LockPolicy {
        self.policy
    }

    /// Espera (con backoff) a que no exista el lock. Para lectores.
    fn wait_unlocked(&self, path: &Path) -> Result<(), StoreError> {
        let lock = lock_path(path);
        let start = Instant::now();
        let mut wait = self.policy.first_wait;

        while lock.exists() {
            if start.elapsed() > self.policy.ceiling {
                return Err(StoreError::LockTimeout {
                    path: lock,
                    waited: start.elapsed(),
                });
            }
            thread::sleep(wait);
            wait = (wait * 2).min(self.policy.max_wait);
        }
        Ok(())
    }

    /// Toma el lock del registro. Para escritores.
    pub fn acquire(&self, path: &Path) -> Result<LockGuard, StoreError> {
        let lock = lock_path(path);
        let start = Instant::now();
        let mut wait = self.policy.first_wait;

        if let Some(parent) = lock.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
            }
        }

        loop {
            match OpenOptions::new().write(true).create_new(true).open(&lock) {
                Ok(mut f) => {
                    let _ = writeln!(f, "{}", std::process::id());
                    return Ok(LockGuard { path: lock });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    if start.elapsed() > self.policy.ceiling {
                        return Err(StoreError::LockTimeout {
                            path: lock,
                            waited: start.elapsed(),
                        });
                    }
                    debug!("esperando lock {} ({:?})", lock.display(), wait);
                    thread::sleep(wait);
                    wait = (wait * 2).min(self.policy.max_wait);
                }
                Err(e) => return Err(StoreError::io(&lock, e)),
            }
        }
    }

    pub fn load<T: DeserializeOwned>(&self, path: &Path) -> Result<Loaded<T>, StoreError> {
        self.wait_unlocked(path)?;
        read_record(path)
    }

    pub fn save<T: Serialize>(&self, path: &Path, value: &T) -> Result<(), StoreError> {
        let _guard = self.acquire(path)?;
        write_record(path, value)
    }

    /// Leer-modificar-escribir bajo un mismo lock.
    /// Un registro ilegible se reconstruye desde `T::default()`.
    pub fn update<T, F>(&self, path: &Path, f: F) -> Result<T, StoreError>
    where
        T: Serialize + DeserializeOwned + Default,
        F: FnOnce(&mut T),
    {
        let _guard = self.acquire(path)?;
        let mut value = read_record(path)?.found().unwrap_or_default();
        f(&mut value);
        write_record(path, &value)?;
        Ok(value)
    }

    /// Reconstruye un registro faltante o corrupto bajo lock. Si otro
    /// escritor ya dejó uno válido, se devuelve ese.
    pub fn repair<T, F>(&self, path: &Path, rebuild: F) -> Result<T, StoreError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> T,
    {
        let _guard = self.acquire(path)?;
        if let Loaded::Found(value) = read_record(path)? {
            return Ok(value);
        }
        let value = rebuild();
        write_record(path, &value)?;
        Ok(value)
    }
}

fn read_record<T: DeserializeOwned>(path: &Path) -> Result<Loaded<T>, StoreError> {
    let raw = match fs::read(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Loaded::Missing),
        Err(e) => return Err(StoreError::io(path, e)),
    };

    match serde_json::from_slice(&raw) {
        Ok(v) => Ok(Loaded::Found(v)),
        Err(e) => {
            // no se borra: solo se reescribe bajo lock con save/update
            warn!("registro corrupto {} descartado: {}", path.display(), e);
            Ok(Loaded::Discarded)
        }
    }
}

fn write_record<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let json = serde_json::to_vec_pretty(value).map_err(|e| StoreError::Encode {
        path: path.to_path_buf(),
        source: e,
    })?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4()));

    fs::write(&tmp, &json).map_err(|e| StoreError::io(&tmp, e))?;
    fs::rename(&tmp, path).map_err(|e| StoreError::io(path, e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        env,
        sync::{Arc, Barrier},
    };

    fn temp_dir(sub: &str) -> PathBuf {
        let base = env::temp_dir().join("metadata_store_tests").join(sub);
        let _ = fs::remove_dir_all(&base);
        fs::create_dir_all(&base).unwrap();
        base
    }

    fn fast_policy() -> LockPolicy {
        LockPolicy {
            first_wait: Duration::from_millis(5),
            max_wait: Duration::from_millis(20),
            ceiling: Duration::from_secs(5),
        }
    }

    #[test]
    fn guardar_y_cargar_registro() {
        let dir = temp_dir("roundtrip");
        let path = dir.join("ds1.json");
        let store = MetadataStore::new(fast_policy());

        let mut md = Metadata::new();
        md.set("name", "ds1");
        md.set("ref", true);
        store.save(&path, &md).unwrap();

        let back: Metadata = store.load(&path).unwrap().found().unwrap();
        assert_eq!(back, md);
        assert!(!lock_path(&path).exists());
    }

    #[test]
    fn registro_faltante_es_missing() {
        let dir = temp_dir("missing");
        let store = MetadataStore::default();
        let loaded: Loaded<Metadata> = store.load(&dir.join("nada.json")).unwrap();
        assert_eq!(loaded, Loaded::Missing);
    }

    #[test]
    fn registro_corrupto_se_descarta_y_update_lo_reconstruye() {
        let dir = temp_dir("corrupt");
        let path = dir.join("ds1.json");
        fs::write(&path, b"{ esto no es json").unwrap();
        let store = MetadataStore::new(fast_policy());

        let loaded: Loaded<Metadata> = store.load(&path).unwrap();
        assert_eq!(loaded, Loaded::Discarded);
        // leer sin lock no toca el archivo
        assert_eq!(fs::read(&path).unwrap(), b"{ esto no es json");

        fs::write(&path, b"[[[").unwrap();
        let md: Metadata = store.update(&path, |m: &mut Metadata| m.set("name", "ds1")).unwrap();
        assert_eq!(md.get_str("name"), Some("ds1"));
        let again: Loaded<Metadata> = store.load(&path).unwrap();
        assert_eq!(again.found().unwrap().get_str("name"), Some("ds1"));
    }

    #[test]
    fn reparar_respeta_lo_que_otro_escritor_ya_arreglo() {
        let dir = temp_dir("repair");
        let path = dir.join("ds1.json");
        fs::write(&path, b"{ roto").unwrap();
        let store = MetadataStore::new(fast_policy());

        let seen: Loaded<Metadata> = store.load(&path).unwrap();
        assert_eq!(seen, Loaded::Discarded);

        // entre la lectura y la reparación alguien guardó uno bueno
        let mut good = Metadata::new();
        good.set("name", "bueno");
        store.save(&path, &good).unwrap();

        let repaired: Metadata = store
            .repair(&path, || {
                let mut md = Metadata::new();
                md.set("name", "reconstruido");
                md
            })
            .unwrap();
        assert_eq!(repaired, good);

        fs::write(&path, b"[[[").unwrap();
        let rebuilt: Metadata = store
            .repair(&path, || {
                let mut md = Metadata::new();
                md.set("name", "reconstruido");
                md
            })
            .unwrap();
        assert_eq!(rebuilt.get_str("name"), Some("reconstruido"));
        assert!(!lock_path(&path).exists());
    }

    #[test]
    fn lock_retenido_mas_del_techo_es_fatal() {
        let dir = temp_dir("timeout");
        let path = dir.join("p.json");
        fs::write(lock_path(&path), b"99999").unwrap();

        let store = MetadataStore::new(LockPolicy {
            first_wait: Duration::from_millis(5),
            max_wait: Duration::from_millis(10),
            ceiling: Duration::from_millis(60),
        });

        let err = store.save(&path, &Metadata::new()).unwrap_err();
        assert!(err.is_lock_timeout());
        let err = store.load::<Metadata>(&path).unwrap_err();
        assert!(err.is_lock_timeout());
    }

    #[test]
    fn dos_escritores_nunca_se_entrelazan() {
        let dir = temp_dir("mutex");
        let path = dir.join("shared.json");
        let store = MetadataStore::new(fast_policy());

        // lock artificial que se libera tras un rato
        let lock = lock_path(&path);
        fs::write(&lock, b"artificial").unwrap();

        let barrier = Arc::new(Barrier::new(3));
        let spans = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut handles = Vec::new();

        for writer in ["a", "b"] {
            let store = store.clone();
            let path = path.clone();
            let barrier = barrier.clone();
            let spans = spans.clone();
            handles.push(thread::spawn(move || {
                barrier.wait();
                store
                    .update(&path, |m: &mut Metadata| {
                        let began = Instant::now();
                        for i in 0..20 {
                            m.set(format!("k{i}"), writer);
                        }
                        m.set("writer", writer);
                        let n = m.get_u64("writes").unwrap_or(0);
                        m.set("writes", n + 1);
                        thread::sleep(Duration::from_millis(30));
                        spans.lock().unwrap().push((began, Instant::now()));
                    })
                    .unwrap();
            }));
        }

        barrier.wait();
        thread::sleep(Duration::from_millis(50));
        fs::remove_file(&lock).unwrap();

        for h in handles {
            h.join().unwrap();
        }

        let mut spans = spans.lock().unwrap().clone();
        spans.sort();
        assert_eq!(spans.len(), 2);
        assert!(spans[0].1 <= spans[1].0, "las escrituras se solaparon");

        let md: Metadata = store.load(&path).unwrap().found().unwrap();
        let winner = md.get_str("writer").unwrap().to_string();
        for i in 0..20 {
            assert_eq!(md.get_str(&format!("k{i}")), Some(winner.as_str()));
        }
        // ninguna actualización se perdió
        assert_eq!(md.get_u64("writes"), Some(2));
        assert!(!lock.exists());
    }
}
