use std::{
    ffi::OsString,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use common::{
    dispatch, process, EntityEvent, EntityId, MetadataStore, Project, StatusFile,
    SupervisionPaths,
};
use daemon::DaemonArgs;
use lair::{LairOptions, ProcessSpawner};
use tracing::{info, warn};

use crate::background::{self, Report, STOP_WAIT};

#[derive(Parser, Debug)]
#[command(name = "miga")]
#[command(about = "Daemons de proyecto y supervisor de flota")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Daemon de un proyecto
    Daemon {
        #[arg(value_enum)]
        action: DaemonAction,

        /// Directorio del proyecto
        #[arg(short = 'P', long = "project", value_name = "DIR")]
        project: PathBuf,

        /// Config de backend extra, encima de la del usuario y la del proyecto
        #[arg(long, value_name = "FILE")]
        json: Option<PathBuf>,

        #[arg(long, value_name = "N")]
        max_jobs: Option<usize>,

        /// Sale cuando no queda nada por hacer
        #[arg(long)]
        shutdown_when_idle: bool,

        #[arg(long, hide = true)]
        max_iterations: Option<u64>,
    },

    /// Supervisor de todos los proyectos bajo una raíz
    Lair {
        #[arg(value_enum)]
        action: LairAction,

        #[arg(short = 'p', long = "path", value_name = "DIR")]
        root: PathBuf,

        /// Segundos entre pasadas
        #[arg(long, default_value_t = 120)]
        latency: u64,

        /// Segundos que se respeta un heartbeat viejo antes de relanzar
        #[arg(long, default_value_t = 1800)]
        wait_for: u64,

        /// Relanzar aunque el proyecto no haya cambiado
        #[arg(long)]
        no_trust_timestamp: bool,

        /// Decide pero no lanza nada
        #[arg(long)]
        dry: bool,
    },

    /// Reactiva un dataset (o el proyecto) y borra sus contadores de intentos
    Activate {
        #[arg(short = 'P', long = "project", value_name = "DIR")]
        project: PathBuf,

        #[arg(short = 'D', long = "dataset", value_name = "NOMBRE")]
        dataset: Option<String>,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum DaemonAction {
    Start,
    Stop,
    Restart,
    Reload,
    Run,
    Zap,
    Status,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum LairAction {
    Start,
    Stop,
    Run,
    Status,
    List,
    Running,
    Terminate,
}

/* ---------------- daemon ---------------- */

fn daemon_run_args(project: &Path, args: &DaemonArgs) -> Vec<OsString> {
    let mut out: Vec<OsString> = vec!["daemon".into(), "run".into(), "-P".into(), project.into()];
    if let Some(json) = &args.json {
        out.push("--json".into());
        out.push(json.into());
    }
    if let Some(n) = args.max_jobs {
        out.push("--max-jobs".into());
        out.push(n.to_string().into());
    }
    if args.shutdown_when_idle {
        out.push("--shutdown-when-idle".into());
    }
    out
}

fn daemon_status(project: &Path, paths: &SupervisionPaths) -> Result<()> {
    let now = Utc::now();
    println!("Daemon de {}:", project.display());
    Report::of(paths, now).print(now);

    // lectura directa: el status no debe borrar un archivo corrupto
    let path = daemon::status_path(project);
    match fs::read_to_string(&path) {
        Ok(raw) => match serde_json::from_str::<StatusFile>(&raw) {
            Ok(status) => println!(
                "  jobs     : {} corriendo, {} en cola",
                status.jobs_running.len(),
                status.jobs_to_run.len()
            ),
            Err(e) => println!("  jobs     : {} ilegible ({})", path.display(), e),
        },
        Err(_) => println!("  jobs     : (sin archivo de estado)"),
    }
    Ok(())
}

async fn daemon_action(action: DaemonAction, project: PathBuf, args: DaemonArgs) -> Result<()> {
    if !common::Project::is_project_dir(&project) {
        bail!("{} no es un proyecto", project.display());
    }
    let paths = SupervisionPaths::for_daemon(&project);

    match action {
        DaemonAction::Start => {
            let pid = background::spawn_background(
                &paths,
                "daemon.log",
                &daemon_run_args(&project, &args),
            )?;
            println!("Daemon lanzado (pid {})", pid);
        }
        DaemonAction::Stop => {
            if background::stop(&paths, STOP_WAIT).await? {
                println!("Daemon detenido");
            } else {
                println!("No había daemon corriendo");
            }
        }
        DaemonAction::Restart => {
            background::stop(&paths, STOP_WAIT).await?;
            let pid = background::spawn_background(
                &paths,
                "daemon.log",
                &daemon_run_args(&project, &args),
            )?;
            println!("Daemon relanzado (pid {})", pid);
        }
        DaemonAction::Reload => {
            let Some(pid) = background::live_pid(&paths) else {
                bail!("no hay daemon en segundo plano para {}", project.display());
            };
            process::send_hangup(pid).with_context(|| format!("enviando SIGHUP a {pid}"))?;
            println!("Reload pedido al pid {}", pid);
        }
        DaemonAction::Run => {
            if paths.is_active() && paths.read_pid() != Some(std::process::id()) {
                bail!("ya hay un daemon activo en {}", project.display());
            }
            let result = daemon::run(&project, args).await;
            if paths.read_pid() == Some(std::process::id()) {
                paths.clear_pid();
            }
            result?;
        }
        DaemonAction::Zap => {
            background::zap(&paths)?;
            println!("Restos del daemon borrados");
        }
        DaemonAction::Status => daemon_status(&project, &paths)?,
    }
    Ok(())
}

/* ---------------- lair ---------------- */

fn lair_run_args(root: &Path, options: &LairOptions) -> Vec<OsString> {
    let mut out: Vec<OsString> = vec![
        "lair".into(),
        "run".into(),
        "-p".into(),
        root.into(),
        "--latency".into(),
        options.latency.as_secs().to_string().into(),
        "--wait-for".into(),
        options.wait_for.as_secs().to_string().into(),
    ];
    if !options.trust_timestamp {
        out.push("--no-trust-timestamp".into());
    }
    if options.dry {
        out.push("--dry".into());
    }
    out
}

fn print_daemons(root: &Path, only_active: bool) {
    let now = Utc::now();
    let mut shown = 0;
    for d in lair::list(root) {
        if only_active && !d.active {
            continue;
        }
        shown += 1;
        let age = d
            .last_alive
            .map(|t| format!("hace {} s", (now - t).num_seconds()))
            .unwrap_or_else(|| "nunca".into());
        println!(
            "{}  {}  heartbeat {}{}",
            if d.active { "activo  " } else { "inactivo" },
            d.project.display(),
            age,
            d.pid.map(|p| format!("  pid {p}")).unwrap_or_default()
        );
    }
    if shown == 0 {
        println!("(ningún proyecto)");
    }
}

async fn lair_action(action: LairAction, root: PathBuf, options: LairOptions) -> Result<()> {
    if !root.is_dir() {
        bail!("{} no es un directorio", root.display());
    }
    let paths = SupervisionPaths::for_lair(&root);

    match action {
        LairAction::Start => {
            let pid =
                background::spawn_background(&paths, "lair.log", &lair_run_args(&root, &options))?;
            println!("Lair lanzado (pid {})", pid);
        }
        LairAction::Stop => {
            if background::stop(&paths, STOP_WAIT).await? {
                println!("Lair detenido");
            } else {
                println!("No había lair corriendo");
            }
        }
        LairAction::Run => {
            if paths.is_active() && paths.read_pid() != Some(std::process::id()) {
                bail!("ya hay un lair activo en {}", root.display());
            }
            let result = lair::run(&root, options, ProcessSpawner::current()?).await;
            if paths.read_pid() == Some(std::process::id()) {
                paths.clear_pid();
            }
            result?;
        }
        LairAction::Status => {
            let now = Utc::now();
            println!("Lair de {}:", root.display());
            Report::of(&paths, now).print(now);
        }
        LairAction::List => print_daemons(&root, false),
        LairAction::Running => print_daemons(&root, true),
        LairAction::Terminate => {
            let n = lair::terminate_daemons(&root)?;
            println!("Terminación pedida al lair y a {} daemons", n);
        }
    }
    Ok(())
}

/* ---------------- activate ---------------- */

fn activate(project: &Path, dataset: Option<String>) -> Result<()> {
    let store = MetadataStore::default();
    let mut loaded = Project::load(&store, project)
        .with_context(|| format!("cargando {}", project.display()))?;
    let id = EntityId::from_name(dataset);
    if loaded.entity(&id).is_none() {
        bail!("{} no existe en {}", id, project.display());
    }
    dispatch(&store, &mut loaded, &id, EntityEvent::Activated)?;
    println!("{} activado", id);
    Ok(())
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Daemon {
            action,
            project,
            json,
            max_jobs,
            shutdown_when_idle,
            max_iterations,
        } => {
            let args = DaemonArgs {
                json,
                max_jobs,
                shutdown_when_idle,
                max_iterations,
            };
            info!("daemon {:?} en {}", action, project.display());
            daemon_action(action, project, args).await
        }

        Commands::Lair {
            action,
            root,
            latency,
            wait_for,
            no_trust_timestamp,
            dry,
        } => {
            if latency == 0 {
                warn!("--latency 0: el lair no va a descansar entre pasadas");
            }
            let options = LairOptions {
                latency: Duration::from_secs(latency),
                wait_for: Duration::from_secs(wait_for),
                trust_timestamp: !no_trust_timestamp,
                dry,
                max_iterations: None,
            };
            lair_action(action, root, options).await
        }

        Commands::Activate { project, dataset } => activate(&project, dataset),
    }
}
