use std::{
    any::Any,
    sync::mpsc::Receiver,
    thread::{self, JoinHandle},
};

use log::{debug, error, info, warn};

use crate::{
    app_context::AppContext, library::catalog::CatalogSource, playback::player::PlayerEvent,
};

pub struct BackgroundServicesConfig {
    pub context: AppContext,
    /// Scanned once, in order, on the scan thread.
    pub catalog_sources: Vec<Box<dyn CatalogSource>>,
    /// Events reported by the audio output.
    pub player_events: Receiver<PlayerEvent>,
}

/// Handles of the spawned service threads.
pub struct BackgroundServices {
    pub scan: JoinHandle<()>,
    pub player_events: JoinHandle<()>,
}

fn panic_payload_to_string(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        return (*s).to_string();
    }
    if let Some(s) = payload.downcast_ref::<String>() {
        return s.clone();
    }
    "non-string panic payload".to_string()
}

fn run_guarded<F: FnOnce()>(name: &str, body: F) {
    if let Err(payload) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(body)) {
        error!(
            "{} thread terminated due to panic: {}",
            name,
            panic_payload_to_string(payload.as_ref())
        );
    }
}

pub fn spawn_background_services(
    config: BackgroundServicesConfig,
) -> std::io::Result<BackgroundServices> {
    let BackgroundServicesConfig {
        context,
        catalog_sources,
        player_events,
    } = config;

    let scan_context = context.clone();
    let scan = thread::Builder::new()
        .name("library-scan".to_string())
        .spawn(move || {
            run_guarded("Library scan", || {
                let mut catalog_sources = catalog_sources;
                for source in catalog_sources.iter_mut() {
                    if let Err(err) = scan_context.scan(source.as_mut()) {
                        warn!("Catalog source {} failed: {}", source.name(), err);
                    }
                }
                info!("Library scan finished");
            })
        })?;

    let player_events = thread::Builder::new()
        .name("player-events".to_string())
        .spawn(move || {
            run_guarded("Player event", || {
                // Ends when every sender is dropped.
                while let Ok(event) = player_events.recv() {
                    if !context.queue.handle_player_event(event) {
                        debug!("Dropped stale player event");
                    }
                }
            })
        })?;

    Ok(BackgroundServices { scan, player_events })
}
