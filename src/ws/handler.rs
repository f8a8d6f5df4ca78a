//! WebSocket upgrade handler

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::app::AppState;
use crate::matchmaking::JoinOutcome;
use crate::util::rate_limit::ConnectionRateLimiter;
use crate::ws::protocol::{ClientMsg, ServerMsg};
use crate::ws::session::{spawn_writer, Session};

/// Longest accepted player name, in characters
const MAX_NAME_LEN: usize = 32;

/// WebSocket upgrade handler
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// A connection whose identity has been fixed by its first join
struct Identity {
    session: Arc<Session>,
    writer: JoinHandle<()>,
}

/// Handle the upgraded WebSocket connection
async fn handle_socket(socket: WebSocket, state: AppState) {
    debug!("New WebSocket connection");

    let (ws_sink, mut ws_stream) = socket.split();
    let mut ws_sink = Some(ws_sink);
    let rate_limiter = ConnectionRateLimiter::new(state.config.input_rate_limit);
    let mut identity: Option<Identity> = None;

    loop {
        let next = match identity.as_mut() {
            Some(conn) => tokio::select! {
                msg = ws_stream.next() => msg,
                _ = &mut conn.writer => {
                    debug!(player = %conn.session.name(), "Writer finished, closing connection");
                    None
                }
            },
            None => ws_stream.next().await,
        };

        let Some(result) = next else { break };

        let text = match result {
            Ok(Message::Text(text)) => text,
            Ok(Message::Binary(_)) => {
                debug!("Received binary message, ignoring");
                continue;
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
            Ok(Message::Close(_)) => {
                debug!("Client initiated close");
                break;
            }
            Err(e) => {
                debug!(error = %e, "WebSocket error");
                break;
            }
        };

        if !rate_limiter.check() {
            debug!("Rate limited inbound message");
            continue;
        }

        let msg = match serde_json::from_str::<ClientMsg>(&text) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(error = %e, "Failed to parse client message");
                continue;
            }
        };

        match (&msg, identity.as_ref()) {
            (ClientMsg::Join { name }, None) => {
                let name = match validate_name(name) {
                    Ok(name) => name,
                    Err(reply) => {
                        if let Some(sink) = ws_sink.as_mut() {
                            if let Ok(json) = serde_json::to_string(&reply) {
                                let _ = sink.send(Message::Text(json)).await;
                            }
                        }
                        continue;
                    }
                };
                let Some(sink) = ws_sink.take() else { break };

                let (session, rx) = Session::new(name, state.config.session_queue_capacity);
                let writer = spawn_writer(session.clone(), rx, sink, state.sender_pool.clone());
                if let Some(previous) = state.sessions.insert(session.clone()) {
                    info!(player = %session.name(), "New connection supersedes previous session");
                    previous.close();
                }

                join(&state, &session);
                identity = Some(Identity { session, writer });
            }
            (ClientMsg::Join { .. }, Some(conn)) => {
                join(&state, &conn.session);
            }
            (_, Some(conn)) => {
                dispatch(&state, conn.session.name(), &msg);
            }
            (_, None) => {
                debug!("Ignoring message before join");
            }
        }
    }

    if let Some(conn) = identity {
        disconnect(&state, &conn.session);
        info!(player = %conn.session.name(), "WebSocket connection closed");
    }
}

/// Trim and bound a requested name, or build the rejection to send back
fn validate_name(raw: &str) -> Result<&str, ServerMsg> {
    let name = raw.trim();
    if name.is_empty() {
        return Err(ServerMsg::error("invalid_name", "name must not be empty"));
    }
    if name.chars().count() > MAX_NAME_LEN {
        return Err(ServerMsg::error(
            "invalid_name",
            format!("name must be at most {MAX_NAME_LEN} characters"),
        ));
    }
    Ok(name)
}

/// Put a player into matchmaking, parking them in practice while they wait
fn join(state: &AppState, session: &Arc<Session>) -> JoinOutcome {
    let name = session.name();
    state.matchmaker.touch(name);

    let outcome = state.matchmaker.enqueue(name, Some(session.clone()));
    match &outcome {
        JoinOutcome::Queued => {
            state.practice.join(name);
            info!(player = %name, queue_size = state.matchmaker.queue_size(), "Player queued");
        }
        JoinOutcome::Matched { match_id, opponent } => {
            state.practice.leave(name);
            info!(player = %name, %match_id, opponent = %opponent, "Player matched");
        }
        JoinOutcome::AlreadyBound { match_id } => {
            if !state.matchmaker.attach_session(name, session.clone()) {
                error!(player = %name, %match_id, "Bound match is gone, session not attached");
            } else {
                info!(player = %name, %match_id, "Player rejoined their match");
            }
        }
    }
    outcome
}

/// Route a post-join message to the player's match, or practice when unbound
fn dispatch(state: &AppState, name: &str, msg: &ClientMsg) {
    state.matchmaker.touch(name);

    match msg {
        ClientMsg::Input { .. } => {
            let Some(sample) = msg.as_input() else { return };
            if !state.matchmaker.route_input(name, sample) {
                state.practice.submit_input(name, sample);
            }
        }
        ClientMsg::BoostReset { .. } => {
            if !state.matchmaker.refill_boost(name) {
                state.practice.refill_boost(name);
            }
        }
        ClientMsg::BallJump { .. } => {
            if !state.matchmaker.pop_ball(name) {
                state.practice.pop_ball();
            }
        }
        ClientMsg::Join { .. } => {}
        ClientMsg::Unknown => {
            debug!(player = %name, "Ignoring unknown message type");
        }
    }
}

/// Tear down everything tied to this connection.
///
/// A newer connection under the same name keeps its practice seat and
/// session; the match binding survives so a later join can reattach.
fn disconnect(state: &AppState, session: &Arc<Session>) {
    let name = session.name();
    if state.sessions.remove_if_current(name, session.id()) {
        state.practice.leave(name);
    }
    state.matchmaker.disconnect(name, session.id());
    if let Some(match_id) = state.matchmaker.match_of(name) {
        info!(player = %name, %match_id, "Disconnected mid-match, binding kept for rejoin");
    }
    session.close();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tokio::sync::watch;

    use crate::config::{Config, GameConfig};
    use crate::game::practice::BindingLookup;
    use crate::game::InputSample;
    use crate::ws::session::Outbound;

    fn state() -> (AppState, crate::app::BackgroundTasks, watch::Sender<bool>) {
        let (tx, rx) = watch::channel(false);
        let config = Config {
            position_log_enabled: false,
            practice_seed: Some(7),
            game: GameConfig {
                countdown_secs: 1,
                round_secs: 30,
                broadcast_skip: 1,
            },
            ..Config::default()
        };
        let (state, background) = AppState::new(config, rx);
        (state, background, tx)
    }

    fn connect(state: &AppState, name: &str) -> (Arc<Session>, tokio::sync::mpsc::Receiver<Outbound>) {
        let (session, rx) = Session::new(name, 64);
        state.sessions.insert(session.clone());
        (session, rx)
    }

    #[test]
    fn names_are_trimmed_and_bounded() {
        assert_eq!(validate_name("  ana ").ok(), Some("ana"));
        assert!(matches!(
            validate_name("   "),
            Err(ServerMsg::Error { ref code, .. }) if code == "invalid_name"
        ));
        assert!(validate_name(&"x".repeat(MAX_NAME_LEN + 1)).is_err());
        assert!(validate_name(&"x".repeat(MAX_NAME_LEN)).is_ok());
    }

    #[tokio::test]
    async fn lone_join_waits_in_practice() {
        let (state, _bg, _tx) = state();
        let (ana, _rx) = connect(&state, "ana");

        assert!(matches!(join(&state, &ana), JoinOutcome::Queued));
        assert!(state.practice.contains("ana"));
        assert_eq!(state.matchmaker.queue_size(), 1);
    }

    #[tokio::test]
    async fn second_join_forms_a_match_and_leaves_practice() {
        let (state, _bg, _tx) = state();
        let (ana, mut ana_rx) = connect(&state, "ana");
        let (bo, _bo_rx) = connect(&state, "bo");

        join(&state, &ana);
        let outcome = join(&state, &bo);
        assert!(matches!(outcome, JoinOutcome::Matched { ref opponent, .. } if opponent == "ana"));
        assert!(!state.practice.contains("bo"));
        assert!(state.matchmaker.is_bound("ana"));
        assert_eq!(state.match_registry.active_matches(), 1);

        let Some(Outbound::Text(frame)) = ana_rx.recv().await else {
            panic!("expected matched frame");
        };
        assert!(frame.contains("\"type\":\"matched\""));
    }

    #[tokio::test]
    async fn input_goes_to_practice_until_matched() {
        let (state, _bg, _tx) = state();
        let (ana, _rx) = connect(&state, "ana");
        join(&state, &ana);

        let input = ClientMsg::Input {
            name: "ana".into(),
            seq: 3,
            throttle: 1.0,
            steer: 0.0,
            jump: false,
            boost: false,
            brake: false,
        };
        dispatch(&state, "ana", &input);
        assert!(!state.matchmaker.route_input("ana", InputSample::default()));
        assert!(state.practice.submit_input("ana", InputSample::default()));
    }

    #[tokio::test]
    async fn disconnect_keeps_binding_for_rejoin() {
        let (state, _bg, _tx) = state();
        let (ana, _ana_rx) = connect(&state, "ana");
        let (bo, _bo_rx) = connect(&state, "bo");
        join(&state, &ana);
        join(&state, &bo);

        disconnect(&state, &ana);
        assert!(ana.is_closed());
        assert!(state.sessions.get("ana").is_none());
        assert!(state.matchmaker.is_bound("ana"));

        let (again, _again_rx) = connect(&state, "ana");
        assert!(matches!(join(&state, &again), JoinOutcome::AlreadyBound { .. }));
    }

    #[tokio::test]
    async fn stale_disconnect_leaves_newer_session_alone() {
        let (state, _bg, _tx) = state();
        let (old, _old_rx) = connect(&state, "ana");
        join(&state, &old);
        let (new, _new_rx) = connect(&state, "ana");
        join(&state, &new);

        disconnect(&state, &old);
        assert_eq!(state.sessions.get("ana").map(|s| s.id()), Some(new.id()));
        assert!(state.practice.contains("ana"));
        assert_eq!(state.matchmaker.queue_size(), 1);
    }

    #[tokio::test]
    async fn queued_player_disconnect_drops_them_from_queue() {
        let (state, _bg, _tx) = state();
        let (ana, _rx) = connect(&state, "ana");
        join(&state, &ana);

        disconnect(&state, &ana);
        assert_eq!(state.matchmaker.queue_size(), 0);
        assert!(!state.practice.contains("ana"));

        // Nothing pairs with the departed player
        let (bo, _bo_rx) = connect(&state, "bo");
        assert!(matches!(join(&state, &bo), JoinOutcome::Queued));
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(state.match_registry.active_matches(), 0);
    }
}
