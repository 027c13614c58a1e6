use std::path::Path;

use common::StatusFile;
use tracing::info;

use crate::launcher::Launcher;
use crate::monitor::probe_running;
use crate::state::DaemonState;

/// Reconstruye cola y jobs en vuelo desde el status file y re-sondea
/// enseguida los que dicen estar corriendo.
pub fn recover<L: Launcher + ?Sized>(status_path: &Path, launcher: &mut L) -> DaemonState {
    let Some(status) = StatusFile::load(status_path) else {
        return DaemonState::default();
    };

    let mut state = DaemonState::from_status(status);
    let dropped = probe_running(&mut state, launcher);
    info!(
        "estado recuperado: {} en cola, {} en vuelo ({} ya no corrían)",
        state.queue.len(),
        state.running.len(),
        dropped
    );
    state
}
