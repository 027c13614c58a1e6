use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::entity::EntityId;
use crate::task::Task;

/// Familia de backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
    #[default]
    Bash,
    Ssh,
    Qsub,
    Msub,
    Slurm,
}

impl BackendType {
    pub fn as_str(self) -> &'static str {
        match self {
            BackendType::Bash => "bash",
            BackendType::Ssh => "ssh",
            BackendType::Qsub => "qsub",
            BackendType::Msub => "msub",
            BackendType::Slurm => "slurm",
        }
    }

    /// En colas batch el handle es la salida del comando de envío.
    pub fn handle_from_stdout(self) -> bool {
        matches!(self, BackendType::Qsub | BackendType::Msub | BackendType::Slurm)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    #[error("template `{0}` is empty")]
    Empty(&'static str),

    #[error("unresolved placeholder {token} in `{rendered}`")]
    Unresolved { token: String, rendered: String },

    #[error("missing task script {}", .0.display())]
    MissingScript(PathBuf),

    #[error("`cmd` uses {{{{host}}}} but no nodelist is configured")]
    HostWithoutNodes,
}

/// Configuración de backend (`daemon.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
    pub latency: u64,
    pub maxjobs: usize,
    pub ppn: u32,
    pub nodelist: Option<String>,
    pub cmd: String,
    pub var: String,
    pub varsep: String,
    pub alive: String,
    pub kill: String,
    #[serde(rename = "type")]
    pub kind: BackendType,
    pub format_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scripts: Option<PathBuf>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            latency: 30,
            maxjobs: 6,
            ppn: 2,
            nodelist: None,
            cmd: "{{vars}} bash {{script}} > '{{log}}' 2>&1".to_string(),
            var: "{{key}}='{{value}}'".to_string(),
            varsep: " ".to_string(),
            alive: "ps -p {{pid}} | tail -n+2 | wc -l | awk '{print $1}'".to_string(),
            kill: "kill -9 {{pid}}".to_string(),
            kind: BackendType::Bash,
            format_version: 1,
            scripts: None,
        }
    }
}

/// Misma forma que `BackendConfig` pero con todo opcional: las claves
/// ausentes no pisan la capa anterior.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct BackendOverride {
    pub latency: Option<u64>,
    pub maxjobs: Option<usize>,
    pub ppn: Option<u32>,
    pub nodelist: Option<String>,
    pub cmd: Option<String>,
    pub var: Option<String>,
    pub varsep: Option<String>,
    pub alive: Option<String>,
    pub kill: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<BackendType>,
    pub format_version: Option<u32>,
    pub scripts: Option<PathBuf>,
}

/// Datos de un job necesarios para renderizar su comando.
#[derive(Debug, Clone)]
pub struct LaunchContext<'a> {
    pub project_path: &'a Path,
    pub project_name: &'a str,
    pub entity: &'a EntityId,
    pub task: Task,
    pub cpus: u32,
    pub miga: &'a Path,
}

impl LaunchContext<'_> {
    pub fn log_path(&self) -> PathBuf {
        self.project_path
            .join("daemon")
            .join(self.task.as_str())
            .join(format!("{}.log", self.entity.base()))
    }

    /// `<proyecto[..10]>:<tarea>:<dataset|->`
    pub fn label(&self) -> String {
        let short: String = self.project_name.chars().take(10).collect();
        format!("{}:{}:{}", short, self.task, self.entity.name().unwrap_or("-"))
    }
}

/// Sustitución textual de `{{name}}`.
pub fn substitute(template: &str, vars: &[(&str, &str)]) -> String {
    let mut out = template.to_string();
    for (name, value) in vars {
        out = out.replace(&format!("{{{{{name}}}}}"), value);
    }
    out
}

/// Primer `{{...}}` que quede en el texto, salvo los permitidos.
fn unresolved<'a>(rendered: &'a str, allowed: &[&str]) -> Option<&'a str> {
    let mut rest = rendered;
    let mut offset = 0;
    while let Some(start) = rest.find("{{") {
        let after = &rest[start + 2..];
        let end = after.find("}}")?;
        let token = &rendered[offset + start..offset + start + 2 + end + 2];
        let name = &after[..end];
        if !allowed.contains(&name) {
            return Some(token);
        }
        offset += start + 2 + end + 2;
        rest = &rendered[offset..];
    }
    None
}

fn checked(
    name: &'static str,
    template: &str,
    vars: &[(&str, &str)],
    allowed: &[&str],
) -> Result<String, TemplateError> {
    if template.trim().is_empty() {
        return Err(TemplateError::Empty(name));
    }
    let rendered = substitute(template, vars);
    if let Some(token) = unresolved(&rendered, allowed) {
        return Err(TemplateError::Unresolved {
            token: token.to_string(),
            rendered,
        });
    }
    Ok(rendered)
}

impl BackendConfig {
    pub fn merge(&mut self, o: BackendOverride) {
        if let Some(v) = o.latency {
            self.latency = v;
        }
        if let Some(v) = o.maxjobs {
            self.maxjobs = v;
        }
        if let Some(v) = o.ppn {
            self.ppn = v;
        }
        if o.nodelist.is_some() {
            self.nodelist = o.nodelist;
        }
        if let Some(v) = o.cmd {
            self.cmd = v;
        }
        if let Some(v) = o.var {
            self.var = v;
        }
        if let Some(v) = o.varsep {
            self.varsep = v;
        }
        if let Some(v) = o.alive {
            self.alive = v;
        }
        if let Some(v) = o.kill {
            self.kill = v;
        }
        if let Some(v) = o.kind {
            self.kind = v;
        }
        if let Some(v) = o.format_version {
            self.format_version = v;
        }
        if o.scripts.is_some() {
            self.scripts = o.scripts;
        }
    }

    pub fn script_path(&self, task: Task) -> Option<PathBuf> {
        self.scripts
            .as_ref()
            .map(|dir| dir.join(format!("{task}.bash")))
    }

    fn render_vars(&self, ctx: &LaunchContext<'_>) -> Result<String, TemplateError> {
        let project = ctx.project_path.display().to_string();
        let cores = ctx.cpus.to_string();
        let miga = ctx.miga.display().to_string();

        let mut pairs: Vec<(&str, &str)> = vec![("PROJECT", &project)];
        if let Some(ds) = ctx.entity.name() {
            pairs.push(("DATASET", ds));
        }
        pairs.push(("CORES", &cores));
        pairs.push(("RUNTYPE", self.kind.as_str()));
        pairs.push(("MIGA", &miga));

        let rendered = pairs
            .into_iter()
            .map(|(k, v)| checked("var", &self.var, &[("key", k), ("value", v)], &[]))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rendered.join(&self.varsep))
    }

    /// Plantillas que nunca van a poder despacharse con esta config.
    pub fn validate(&self, has_nodes: bool) -> Result<(), TemplateError> {
        for (name, template) in [
            ("cmd", &self.cmd),
            ("var", &self.var),
            ("alive", &self.alive),
            ("kill", &self.kill),
        ] {
            if template.trim().is_empty() {
                return Err(TemplateError::Empty(name));
            }
        }
        if !has_nodes && self.cmd.contains("{{host}}") {
            return Err(TemplateError::HostWithoutNodes);
        }
        Ok(())
    }

    /// Primera fase: todo menos `{{host}}`, que se liga al despachar.
    pub fn render_launch(&self, ctx: &LaunchContext<'_>) -> Result<String, TemplateError> {
        let script = self
            .script_path(ctx.task)
            .ok_or_else(|| TemplateError::MissingScript(PathBuf::from(format!("{}.bash", ctx.task))))?;
        if !script.is_file() {
            return Err(TemplateError::MissingScript(script));
        }

        let vars = self.render_vars(ctx)?;
        let script = script.display().to_string();
        let cpus = ctx.cpus.to_string();
        let log = ctx.log_path().display().to_string();
        let label = ctx.label();

        checked(
            "cmd",
            &self.cmd,
            &[
                ("script", &script),
                ("vars", &vars),
                ("cpus", &cpus),
                ("log", &log),
                ("task_name", &label),
            ],
            &["host"],
        )
    }

    pub fn render_alive(&self, handle: &str) -> Result<String, TemplateError> {
        checked("alive", &self.alive, &[("pid", handle)], &[])
    }

    pub fn render_kill(&self, handle: &str) -> Result<String, TemplateError> {
        checked("kill", &self.kill, &[("pid", handle)], &[])
    }
}

/// Segunda fase: liga `{{host}}` al nodo asignado.
pub fn bind_host(command: &str, host: Option<&str>) -> Result<String, TemplateError> {
    match host {
        Some(h) => Ok(substitute(command, &[("host", h)])),
        None => match unresolved(command, &[]) {
            Some(token) => Err(TemplateError::Unresolved {
                token: token.to_string(),
                rendered: command.to_string(),
            }),
            None => Ok(command.to_string()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{scratch_dir, scripts_dir};

    fn ctx<'a>(project: &'a Path, entity: &'a EntityId, miga: &'a Path) -> LaunchContext<'a> {
        LaunchContext {
            project_path: project,
            project_name: "demo_project_long",
            entity,
            task: Task::Assembly,
            cpus: 4,
            miga,
        }
    }

    #[test]
    fn render_bash_sustituye_todo() {
        let dir = scratch_dir("template_tests", "bash");
        let config = BackendConfig {
            scripts: Some(scripts_dir(&dir)),
            ..BackendConfig::default()
        };
        let entity = EntityId::Dataset("ds1".into());
        let c = ctx(Path::new("/p/demo"), &entity, Path::new("/opt/miga"));

        let cmd = config.render_launch(&c).unwrap();
        assert!(cmd.starts_with("PROJECT='/p/demo' DATASET='ds1' CORES='4' RUNTYPE='bash' MIGA='/opt/miga' bash "));
        assert!(cmd.contains("assembly.bash"));
        assert!(cmd.ends_with("> '/p/demo/daemon/assembly/ds1.log' 2>&1"));
        assert_eq!(c.label(), "demo_proje:assembly:ds1");
    }

    #[test]
    fn job_de_proyecto_no_lleva_dataset() {
        let dir = scratch_dir("template_tests", "project");
        let config = BackendConfig {
            scripts: Some(scripts_dir(&dir)),
            ..BackendConfig::default()
        };
        let entity = EntityId::Project;
        let c = ctx(Path::new("/p/demo"), &entity, Path::new("/opt/miga"));
        let cmd = config.render_launch(&c).unwrap();
        assert!(!cmd.contains("DATASET"));
        assert!(cmd.contains("miga-project.log"));
        assert_eq!(c.label(), "demo_proje:assembly:-");
    }

    #[test]
    fn placeholder_desconocido_es_error() {
        let dir = scratch_dir("template_tests", "unknown");
        let config = BackendConfig {
            scripts: Some(scripts_dir(&dir)),
            cmd: "run {{script}} --queue {{cola}}".into(),
            ..BackendConfig::default()
        };
        let entity = EntityId::Project;
        let err = config
            .render_launch(&ctx(Path::new("/p"), &entity, Path::new("/m")))
            .unwrap_err();
        assert!(matches!(err, TemplateError::Unresolved { ref token, .. } if token == "{{cola}}"));
    }

    #[test]
    fn script_faltante_es_error() {
        let dir = scratch_dir("template_tests", "noscript");
        let config = BackendConfig {
            scripts: Some(dir.join("no-existe")),
            ..BackendConfig::default()
        };
        let entity = EntityId::Project;
        let err = config
            .render_launch(&ctx(Path::new("/p"), &entity, Path::new("/m")))
            .unwrap_err();
        assert!(matches!(err, TemplateError::MissingScript(_)));
    }

    #[test]
    fn host_se_liga_al_despachar() {
        let dir = scratch_dir("template_tests", "ssh");
        let config = BackendConfig {
            scripts: Some(scripts_dir(&dir)),
            kind: BackendType::Ssh,
            cmd: "ssh {{host}} '{{vars}} bash {{script}}' > '{{log}}' 2>&1".into(),
            ..BackendConfig::default()
        };
        let entity = EntityId::Dataset("ds1".into());
        let cmd = config
            .render_launch(&ctx(Path::new("/p"), &entity, Path::new("/m")))
            .unwrap();
        assert!(cmd.contains("{{host}}"));
        assert!(cmd.contains("RUNTYPE='ssh'"));

        assert!(bind_host(&cmd, Some("node7")).unwrap().starts_with("ssh node7 "));
        assert!(bind_host(&cmd, None).is_err());
    }

    #[test]
    fn host_sin_lista_de_nodos_no_valida() {
        let ssh = BackendConfig {
            kind: BackendType::Ssh,
            cmd: "ssh {{host}} '{{vars}} bash {{script}}' > '{{log}}' 2>&1".into(),
            ..BackendConfig::default()
        };
        assert_eq!(ssh.validate(false), Err(TemplateError::HostWithoutNodes));
        assert_eq!(ssh.validate(true), Ok(()));
        assert_eq!(BackendConfig::default().validate(false), Ok(()));

        let no_kill = BackendConfig {
            kill: " ".into(),
            ..BackendConfig::default()
        };
        assert_eq!(no_kill.validate(false), Err(TemplateError::Empty("kill")));
    }

    #[test]
    fn alive_y_kill_reciben_el_handle() {
        let config = BackendConfig::default();
        assert_eq!(config.render_kill("123").unwrap(), "kill -9 123");
        assert!(config.render_alive("123").unwrap().starts_with("ps -p 123 "));

        let empty = BackendConfig {
            kill: "  ".into(),
            ..BackendConfig::default()
        };
        assert_eq!(empty.render_kill("1"), Err(TemplateError::Empty("kill")));
    }

    #[test]
    fn override_solo_pisa_claves_presentes() {
        let mut config = BackendConfig::default();
        let o: BackendOverride =
            serde_json::from_str(r#"{"maxjobs": 12, "type": "slurm"}"#).unwrap();
        config.merge(o);
        assert_eq!(config.maxjobs, 12);
        assert_eq!(config.kind, BackendType::Slurm);
        assert!(config.kind.handle_from_stdout());
        assert_eq!(config.latency, 30);
        assert_eq!(config.var, "{{key}}='{{value}}'");
    }
}
