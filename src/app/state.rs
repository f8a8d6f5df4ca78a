//! Application state shared across routes

use std::sync::Arc;

use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::warn;

use crate::config::Config;
use crate::game::{MatchRegistry, PracticeHandle, PracticeLoop};
use crate::matchmaking::{ActivityMonitor, Matchmaker};
use crate::store::positions::{run_writer, PositionRecord};
use crate::store::{PositionLog, PositionWriter};
use crate::ws::session::SessionRegistry;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub matchmaker: Arc<Matchmaker>,
    pub match_registry: Arc<MatchRegistry>,
    pub practice: PracticeHandle,
    pub sessions: Arc<SessionRegistry>,
    pub positions: PositionLog,
    /// Permits for concurrent socket writes across all sessions
    pub sender_pool: Arc<Semaphore>,
}

/// Long-running tasks created alongside the state, started by [`BackgroundTasks::spawn`]
pub struct BackgroundTasks {
    practice: PracticeLoop,
    monitor: ActivityMonitor,
    position_rx: Option<mpsc::Receiver<PositionRecord>>,
    config: Arc<Config>,
}

impl AppState {
    pub fn new(config: Config, shutdown: watch::Receiver<bool>) -> (Self, BackgroundTasks) {
        let config = Arc::new(config);

        let (positions, position_rx) = if config.position_log_enabled {
            let (log, rx) = PositionLog::new(config.position_log_capacity);
            (log, Some(rx))
        } else {
            (PositionLog::disabled(), None)
        };

        let match_registry = Arc::new(MatchRegistry::new());
        let sessions = Arc::new(SessionRegistry::new());
        let matchmaker = Matchmaker::new(
            match_registry.clone(),
            config.game,
            positions.clone(),
            shutdown,
        );

        let (practice_loop, practice) = PracticeLoop::new(
            config.game.broadcast_skip,
            config.practice_seed,
            sessions.clone(),
            matchmaker.clone(),
            positions.clone(),
        );

        let monitor = ActivityMonitor::new(
            matchmaker.clone(),
            practice.clone(),
            sessions.clone(),
            config.sweep_interval,
            config.lobby_timeout,
            config.ingame_timeout,
        );

        let state = Self {
            sender_pool: Arc::new(Semaphore::new(config.sender_pool_size)),
            config: config.clone(),
            matchmaker,
            match_registry,
            practice,
            sessions,
            positions,
        };

        let background = BackgroundTasks {
            practice: practice_loop,
            monitor,
            position_rx,
            config,
        };

        (state, background)
    }
}

impl BackgroundTasks {
    /// Start the practice loop, idle sweep and position writer
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let mut tasks = vec![
            tokio::spawn(self.practice.run(shutdown.clone())),
            tokio::spawn(self.monitor.run(shutdown.clone())),
        ];

        if let Some(rx) = self.position_rx {
            let path = self.config.position_log_path.clone();
            tasks.push(tokio::spawn(async move {
                let writer = match PositionWriter::open(path).await {
                    Ok(writer) => writer,
                    Err(e) => {
                        warn!(error = %e, "Position log file unavailable, using trace output");
                        PositionWriter::Trace
                    }
                };
                run_writer(rx, writer, shutdown).await;
            }));
        }

        tasks
    }
}
