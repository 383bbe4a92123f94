use std::{path::PathBuf, sync::mpsc, sync::Arc};

use log::{error, info, warn};
use melodex::{
    app_context::AppContext,
    config_persistence,
    db_manager::{self, DbManager},
    library::{catalog::LocalFolderSource, library_manager::LibraryManager},
    playback::{player::LoggingPlayer, queue_engine::QueueEngine},
    services::{spawn_background_services, BackgroundServicesConfig},
};
use tokio::sync::broadcast;

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config_file = config_persistence::default_config_path()
        .ok_or("could not find the user config directory")?;
    let config = config_persistence::load_or_create_config(&config_file)?;
    log::set_max_level(config.log_level_filter());

    let database_path = match &config.storage.database_path {
        Some(path) => PathBuf::from(path),
        None => db_manager::default_database_path()?,
    };
    info!("Using database {}", database_path.display());

    let (bus_sender, _) = broadcast::channel(1024);
    let library = LibraryManager::new(
        config.library_folders(),
        DbManager::open(&database_path)?,
        bus_sender.clone(),
        config.scan_batch_size(),
    );
    // The queue keeps its restart state through its own connection.
    let queue = QueueEngine::new(
        Box::new(LoggingPlayer::default()),
        Some(Box::new(DbManager::open(&database_path)?)),
        config.queue_settings(),
        bus_sender.clone(),
    );
    let context = AppContext::new(
        Arc::new(library),
        Arc::new(queue),
        bus_sender,
        Some(config_file),
    );

    let (player_event_sender, player_events) = mpsc::channel();
    let services = spawn_background_services(BackgroundServicesConfig {
        context: context.clone(),
        catalog_sources: vec![Box::new(LocalFolderSource::new(config.library_folders()))],
        player_events,
    })?;
    if services.scan.join().is_err() {
        warn!("Library scan thread exited abnormally");
    }

    let pruned = context.library.restore_persisted_state()?;
    if pruned > 0 {
        info!("Pruned {} playlist entries of missing tracks", pruned);
    }
    if let Err(err) = context.restore_queue() {
        warn!("Could not restore the previous queue: {}", err);
    }

    let index = context.library.snapshot();
    let queue = context.queue.snapshot();
    info!(
        "Library: {} tracks, {} artists, {} albums, {} genres, {} playlists",
        index.music_count(),
        index.artists().len(),
        index.albums().len(),
        index.genres().len(),
        index.playlists().len()
    );
    info!("Queue: {} tracks, state {:?}", queue.tracks.len(), queue.state);

    drop(player_event_sender);
    if services.player_events.join().is_err() {
        warn!("Player event thread exited abnormally");
    }
    Ok(())
}

fn main() {
    let mut clog = colog::default_builder();
    clog.filter(None, log::LevelFilter::Trace);
    clog.init();
    log::set_max_level(log::LevelFilter::Info);

    std::panic::set_hook(Box::new(|panic_info| {
        let current_thread = std::thread::current();
        let thread_name = current_thread.name().unwrap_or("unnamed");
        error!("panic in thread '{}': {}", thread_name, panic_info);
    }));

    if let Err(err) = run() {
        error!("melodex failed to start: {}", err);
        std::process::exit(1);
    }
}
