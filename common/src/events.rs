use tracing::{info, warn};

use crate::entity::{EntityId, EntityKind, Project};
use crate::metadata::{Metadata, MetadataStore, StoreError};
use crate::task::Task;

/// Cambios de ciclo de vida de una entidad.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntityEvent {
    Activated,
    Inactivated { reason: String },
    ResultReady(Task),
}

impl EntityEvent {
    pub fn name(&self) -> &'static str {
        match self {
            EntityEvent::Activated => "on_activate",
            EntityEvent::Inactivated { .. } => "on_inactivate",
            EntityEvent::ResultReady(_) => "on_result_ready",
        }
    }
}

type Hook = fn(&mut Metadata, &EntityEvent);

fn touch_updated(md: &mut Metadata, _event: &EntityEvent) {
    md.touch("updated");
}

fn activate(md: &mut Metadata, _event: &EntityEvent) {
    md.set("active", true);
    md.remove("inactive_reason");
    md.remove_prefixed("_try_");
    md.touch("updated");
}

fn inactivate(md: &mut Metadata, event: &EntityEvent) {
    md.set("active", false);
    if let EntityEvent::Inactivated { reason } = event {
        md.set("inactive_reason", reason.as_str());
    }
    md.touch("updated");
}

/// Tabla fija (tipo de entidad, evento) → hooks. El segundo valor indica
/// si el proyecto dueño también registra el cambio.
fn hooks_for(kind: EntityKind, event: &EntityEvent) -> (Hook, bool) {
    match (kind, event) {
        (EntityKind::Dataset, EntityEvent::Activated) => (activate, true),
        (EntityKind::Dataset, EntityEvent::Inactivated { .. }) => (inactivate, true),
        (EntityKind::Dataset, EntityEvent::ResultReady(_)) => (touch_updated, true),
        (EntityKind::Project, EntityEvent::Activated) => (activate, false),
        (EntityKind::Project, EntityEvent::Inactivated { .. }) => (inactivate, false),
        (EntityKind::Project, EntityEvent::ResultReady(_)) => (touch_updated, false),
    }
}

/// Aplica los hooks del evento al registro en disco (bajo lock) y a la
/// copia en memoria del proyecto.
pub fn dispatch(
    store: &MetadataStore,
    project: &mut Project,
    id: &EntityId,
    event: EntityEvent,
) -> Result<(), StoreError> {
    if project.metadata_of_mut(id).is_none() {
        warn!("evento {} para entidad desconocida {}", event.name(), id);
        return Ok(());
    }

    let (hook, touch_project) = hooks_for(id.kind(), &event);
    let path = project.record_of(id);
    let fresh: Metadata = store.update(&path, |md| hook(md, &event))?;
    if let Some(md) = project.metadata_of_mut(id) {
        *md = fresh;
    }

    match &event {
        EntityEvent::Inactivated { reason } => info!("{} inactivado: {}", id, reason),
        EntityEvent::Activated => info!("{} activado", id),
        _ => {}
    }

    if touch_project {
        let record = Project::record_path(&project.path);
        project.metadata = store.update(&record, |md: &mut Metadata| md.touch("updated"))?;
    }
    Ok(())
}
