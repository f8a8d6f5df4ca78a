//! Periodic idle-player sweep

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::time::{interval_at, MissedTickBehavior};
use tracing::{debug, info};

use crate::game::PracticeHandle;
use crate::ws::session::SessionRegistry;

use super::service::Matchmaker;

/// Evicts players that stopped sending anything
pub struct ActivityMonitor {
    matchmaker: Arc<Matchmaker>,
    practice: PracticeHandle,
    sessions: Arc<SessionRegistry>,
    sweep_interval: Duration,
    lobby_timeout: Duration,
    ingame_timeout: Duration,
}

impl ActivityMonitor {
    pub fn new(
        matchmaker: Arc<Matchmaker>,
        practice: PracticeHandle,
        sessions: Arc<SessionRegistry>,
        sweep_interval: Duration,
        lobby_timeout: Duration,
        ingame_timeout: Duration,
    ) -> Self {
        Self {
            matchmaker,
            practice,
            sessions,
            sweep_interval,
            lobby_timeout,
            ingame_timeout,
        }
    }

    /// Evict everyone idle as of `now`; returns the evicted names
    pub fn sweep(&self, now: Instant) -> Vec<String> {
        let idle = self
            .matchmaker
            .idle_players(now, self.lobby_timeout, self.ingame_timeout);

        for name in &idle {
            self.matchmaker.remove_player(name);
            self.practice.leave(name);
            self.sessions.evict(name);
            info!(player = %name, "Evicted idle player");
        }

        if idle.is_empty() {
            debug!(tracked = self.matchmaker.tracked_players(), "Idle sweep found nothing");
        }
        idle
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let start = tokio::time::Instant::now() + self.sweep_interval;
        let mut ticker = interval_at(start, self.sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep(Instant::now());
                }
                _ = shutdown.changed() => break,
            }
        }
        info!("Activity monitor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GameConfig;
    use crate::game::practice::BindingLookup;
    use crate::game::{MatchRegistry, PracticeLoop};
    use crate::store::positions::PositionLog;
    use crate::ws::session::Session;

    struct Fixture {
        monitor: ActivityMonitor,
        matchmaker: Arc<Matchmaker>,
        practice: PracticeLoop,
        sessions: Arc<SessionRegistry>,
        registry: Arc<MatchRegistry>,
        _shutdown: watch::Sender<bool>,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(MatchRegistry::new());
        let sessions = Arc::new(SessionRegistry::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let matchmaker = Matchmaker::new(
            registry.clone(),
            GameConfig::default(),
            PositionLog::disabled(),
            shutdown_rx,
        );
        let (practice, handle) = PracticeLoop::new(
            1,
            Some(1),
            sessions.clone(),
            matchmaker.clone(),
            PositionLog::disabled(),
        );
        let monitor = ActivityMonitor::new(
            matchmaker.clone(),
            handle,
            sessions.clone(),
            Duration::from_secs(60),
            Duration::from_secs(10),
            Duration::from_secs(100),
        );
        Fixture {
            monitor,
            matchmaker,
            practice,
            sessions,
            registry,
            _shutdown: shutdown_tx,
        }
    }

    #[tokio::test]
    async fn idle_lobby_player_is_fully_evicted() {
        let mut f = fixture();
        let (session, _rx) = Session::new("ana", 8);
        f.sessions.insert(session.clone());
        f.matchmaker.touch("ana");
        f.matchmaker.enqueue("ana", Some(session.clone()));
        f.monitor.practice.join("ana");
        f.practice.step();

        let evicted = f.monitor.sweep(Instant::now() + Duration::from_secs(30));
        assert_eq!(evicted, ["ana"]);
        assert_eq!(f.matchmaker.queue_size(), 0);
        assert!(!f.monitor.practice.contains("ana"));
        assert!(f.sessions.get("ana").is_none());
        assert!(session.is_closed());

        f.practice.step();
        assert_eq!(f.monitor.practice.active_players(), 0);
    }

    #[tokio::test]
    async fn in_game_players_get_the_longer_timeout() {
        let f = fixture();
        f.matchmaker.touch("ana");
        f.matchmaker.touch("bo");
        f.matchmaker.enqueue("ana", None);
        f.matchmaker.enqueue("bo", None);

        assert!(f.monitor.sweep(Instant::now() + Duration::from_secs(30)).is_empty());
        assert!(f.matchmaker.is_bound("ana"));

        let mut evicted = f.monitor.sweep(Instant::now() + Duration::from_secs(300));
        evicted.sort();
        assert_eq!(evicted, ["ana", "bo"]);
        assert!(!f.matchmaker.is_bound("ana"));
        assert!(!f.matchmaker.is_bound("bo"));
    }

    #[tokio::test]
    async fn evicted_match_players_leave_the_match() {
        let f = fixture();
        f.matchmaker.touch("ana");
        f.matchmaker.touch("bo");
        f.matchmaker.enqueue("ana", None);
        f.matchmaker.enqueue("bo", None);
        assert_eq!(f.registry.active_matches(), 1);

        f.monitor.sweep(Instant::now() + Duration::from_secs(300));

        // The emptied match stops on its next tick and unregisters itself
        for _ in 0..50 {
            if f.registry.active_matches() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(f.registry.active_matches(), 0);
    }

    #[tokio::test]
    async fn active_players_survive() {
        let f = fixture();
        f.matchmaker.touch("ana");
        assert!(f.monitor.sweep(Instant::now()).is_empty());
        assert_eq!(f.matchmaker.tracked_players(), 1);
    }
}
