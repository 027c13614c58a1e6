use tracing::{info, warn};

use crate::launcher::Launcher;
use crate::state::DaemonState;

/// Sondea cada job en vuelo y saca los que el backend da por muertos.
/// Si la sonda falla el job se conserva. Devuelve cuántos se sacaron.
pub fn probe_running<L: Launcher + ?Sized>(state: &mut DaemonState, launcher: &mut L) -> usize {
    let before = state.running.len();

    state.running.retain(|job| {
        let Some(handle) = job.handle.as_deref() else {
            return false;
        };
        match launcher.is_alive(handle) {
            Ok(true) => true,
            Ok(false) => {
                info!("job {} (handle {}) ya no corre", job.label, handle);
                false
            }
            Err(e) => {
                warn!("no se pudo sondear {} (handle {}): {:?}", job.label, handle, e);
                true
            }
        }
    });

    before - state.running.len()
}
