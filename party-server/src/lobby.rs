//! Global server state: the registry of live sessions and connected
//! players, session code generation, and the routing of decoded client
//! messages to the session they belong to.
//!
//! Locking discipline: the registry locks (`sessions`, `players`) are only
//! held to look up or mutate the maps themselves, never across a session
//! operation. Session state is mutated under the per-session mutex, which
//! serializes every input of that session (player message, generation
//! result, watchdog probe) while letting distinct sessions run in parallel.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use protocol::{
    ClientMessage, PlayerId, SESSION_CODE_ALPHABET, SESSION_CODE_LEN, ServerMessage,
};
use rand::Rng;
use tokio::sync::{Mutex, RwLock, mpsc};

use crate::dispatcher::{GenerationResult, ImageDispatcher};
use crate::script::ScriptLibrary;
use crate::session::{PlayerSender, Session, SessionFate};

/// How often the code generator retries before giving up. The code space
/// has 36^4 entries, so hitting this in practice means the server is full.
const CODE_ATTEMPTS: usize = 64;

/// What we track per connected player.
pub struct PlayerEntry {
    /// Send handle of the player's connection.
    pub sender: PlayerSender,
    /// The session the player currently sits in, if any.
    pub session: Option<String>,
}

/// The application state shared by all connections.
pub struct AppState {
    /// All live sessions by code.
    pub sessions: Mutex<HashMap<String, Arc<Mutex<Session>>>>,
    /// All connected players that have identified themselves.
    pub players: Mutex<HashMap<PlayerId, PlayerEntry>>,
    /// The loaded game scripts; replaced wholesale on reload.
    pub library: RwLock<ScriptLibrary>,
    /// The image generation dispatcher.
    pub dispatcher: ImageDispatcher,
    /// Where game scripts live, for the reload route.
    pub games_dir: PathBuf,
}

/// Draws a fresh session code: four uppercase alphanumeric characters.
fn generate_code(rng: &mut impl Rng) -> String {
    (0..SESSION_CODE_LEN)
        .map(|_| SESSION_CODE_ALPHABET[rng.gen_range(0..SESSION_CODE_ALPHABET.len())] as char)
        .collect()
}

/// Creates a new empty session under a fresh code. Collisions regenerate;
/// a saturated code space is reported as `None` instead of spinning.
pub async fn create_session(state: &Arc<AppState>) -> Option<(String, Arc<Mutex<Session>>)> {
    let mut sessions = state.sessions.lock().await;
    let mut rng = rand::thread_rng();
    for _ in 0..CODE_ATTEMPTS {
        let code = generate_code(&mut rng);
        if sessions.contains_key(&code) {
            continue;
        }
        let session = Arc::new(Mutex::new(Session::new(code.clone())));
        sessions.insert(code.clone(), session.clone());
        tracing::info!(session = code, "Created session.");
        return Some((code, session));
    }
    tracing::error!("Could not find a free session code.");
    None
}

/// Removes a session and clears the membership of everyone still assigned
/// to it.
pub async fn destroy_session(state: &Arc<AppState>, code: &str) {
    let session = state.sessions.lock().await.remove(code);
    let Some(session) = session else {
        return;
    };
    tracing::info!(session = code, "Destroying session.");
    let members = session.lock().await.member_ids();
    let mut players = state.players.lock().await;
    for member in members {
        if let Some(entry) = players.get_mut(&member)
            && entry.session.as_deref() == Some(code)
        {
            entry.session = None;
        }
    }
}

/// Looks the player's current session up.
async fn session_of(state: &Arc<AppState>, player: PlayerId) -> Option<(String, Arc<Mutex<Session>>)> {
    let code = {
        let players = state.players.lock().await;
        players.get(&player)?.session.clone()?
    };
    let session = state.sessions.lock().await.get(&code).cloned()?;
    Some((code, session))
}

/// Takes a player out of its current session, destroying the session when
/// its fate says so.
pub async fn leave_current_session(state: &Arc<AppState>, player: PlayerId) {
    let Some((code, session)) = session_of(state, player).await else {
        return;
    };
    {
        let mut players = state.players.lock().await;
        if let Some(entry) = players.get_mut(&player) {
            entry.session = None;
        }
    }
    let library = state.library.read().await.clone();
    let fate = session
        .lock()
        .await
        .remove_player(player, &library, &state.dispatcher)
        .await;
    if fate == SessionFate::Destroy {
        destroy_session(state, &code).await;
    }
}

/// Full cleanup when a connection goes away: a graceful leave plus removal
/// from the player registry.
pub async fn disconnect_player(state: &Arc<AppState>, player: PlayerId) {
    leave_current_session(state, player).await;
    state.players.lock().await.remove(&player);
    tracing::info!(%player, "Player gone.");
}

/// Registers (or re-registers) the player's connection. On a reconnect the
/// session assignment survives, the new connection takes over.
async fn register_player(state: &Arc<AppState>, player: PlayerId, sender: &PlayerSender) {
    let mut players = state.players.lock().await;
    let session = players.get(&player).and_then(|entry| entry.session.clone());
    players.insert(
        player,
        PlayerEntry {
            sender: sender.clone(),
            session,
        },
    );
}

fn reply(sender: &PlayerSender, message: ServerMessage) {
    if sender.send(message).is_err() {
        tracing::warn!("Reply to an already closed connection.");
    }
}

/// Routes one decoded client message. `identity` is the player this
/// connection has authenticated as so far; messages that carry a player id
/// establish it.
pub async fn handle_client_message(
    state: &Arc<AppState>,
    identity: &mut Option<PlayerId>,
    sender: &PlayerSender,
    message: ClientMessage,
) {
    // Player objects exist from the first message carrying an id.
    if let Some(player) = message.player_id() {
        if *identity != Some(player) {
            *identity = Some(player);
            register_player(state, player, sender).await;
        }
    }

    match message {
        ClientMessage::Hello { text } => {
            tracing::debug!(text, "Client hello.");
            reply(
                sender,
                ServerMessage::Hello {
                    text: "hello from the party server".to_string(),
                },
            );
        }

        ClientMessage::StartNewGame { player_id } => {
            // Starting over always means leaving whatever we were in.
            leave_current_session(state, player_id).await;
            let Some((code, session)) = create_session(state).await else {
                reply(
                    sender,
                    ServerMessage::FailedToJoin {
                        reason: "no free session codes".to_string(),
                    },
                );
                return;
            };
            {
                let mut locked = session.lock().await;
                // A fresh session never refuses its host.
                let _ = locked.add_player(player_id, sender.clone());
            }
            {
                let mut players = state.players.lock().await;
                if let Some(entry) = players.get_mut(&player_id) {
                    entry.session = Some(code.clone());
                }
            }
            reply(sender, ServerMessage::GameStarting { session_code: code });
        }

        ClientMessage::JoinGame {
            session_code,
            player_id,
        } => {
            leave_current_session(state, player_id).await;
            let code = session_code.trim().to_uppercase();
            let session = state.sessions.lock().await.get(&code).cloned();
            let Some(session) = session else {
                reply(
                    sender,
                    ServerMessage::FailedToJoin {
                        reason: format!("session {code} does not exist"),
                    },
                );
                return;
            };
            let mut locked = session.lock().await;
            match locked.add_player(player_id, sender.clone()) {
                Ok(()) => {
                    drop(locked);
                    {
                        let mut players = state.players.lock().await;
                        if let Some(entry) = players.get_mut(&player_id) {
                            entry.session = Some(code.clone());
                        }
                    }
                    session.lock().await.announce_membership();
                }
                Err(reason) => {
                    drop(locked);
                    reply(
                        sender,
                        ServerMessage::FailedToJoin {
                            reason: reason.to_string(),
                        },
                    );
                }
            }
        }

        ClientMessage::LeaveGame {} => {
            let Some(player) = *identity else {
                tracing::warn!("LeaveGame from an unidentified connection.");
                return;
            };
            leave_current_session(state, player).await;
        }

        ClientMessage::ChooseGame { name } => {
            let Some(player) = *identity else {
                tracing::warn!("ChooseGame from an unidentified connection.");
                return;
            };
            let Some((code, session)) = session_of(state, player).await else {
                tracing::warn!(%player, "ChooseGame outside a session.");
                return;
            };
            let library = state.library.read().await.clone();
            let fate = session
                .lock()
                .await
                .choose_game(player, &name, &library, &state.dispatcher)
                .await;
            if fate == SessionFate::Destroy {
                destroy_session(state, &code).await;
            }
        }

        ClientMessage::ClientInput { inputs } => {
            let Some(player) = *identity else {
                tracing::warn!("ClientInput from an unidentified connection.");
                return;
            };
            let Some((code, session)) = session_of(state, player).await else {
                tracing::warn!(%player, "ClientInput outside a session.");
                return;
            };
            let fate = session
                .lock()
                .await
                .client_input(player, inputs, &state.dispatcher)
                .await;
            if fate == SessionFate::Destroy {
                destroy_session(state, &code).await;
            }
        }
    }
}

/// Drains the dispatcher's result channel for the whole process lifetime.
/// A result whose session disappeared in the meantime is discarded; late
/// deliveries must never crash anything.
pub async fn deliver_results(
    state: Arc<AppState>,
    mut results: mpsc::UnboundedReceiver<GenerationResult>,
) {
    while let Some(result) = results.recv().await {
        let session = state.sessions.lock().await.get(&result.session_code).cloned();
        let Some(session) = session else {
            tracing::info!(
                session = result.session_code,
                dest_var = result.dest_var,
                "Discarding generation result for a gone session."
            );
            continue;
        };
        let code = result.session_code.clone();
        let fate = session
            .lock()
            .await
            .images_ready(result, &state.dispatcher)
            .await;
        if fate == SessionFate::Destroy {
            destroy_session(&state, &code).await;
        }
    }
}

/// Drops sessions whose members are all gone without a clean leave. This is
/// a fallback; the disconnect path handles the normal case.
pub async fn cleanup_dead_sessions(state: &Arc<AppState>) {
    let codes: Vec<String> = state.sessions.lock().await.keys().cloned().collect();
    for code in codes {
        let session = state.sessions.lock().await.get(&code).cloned();
        let Some(session) = session else { continue };
        let dead = session.lock().await.all_connections_closed();
        if dead {
            tracing::info!(session = code, "Removing dead session.");
            destroy_session(state, &code).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_have_the_right_shape() {
        let mut rng = rand::thread_rng();
        for _ in 0..100 {
            let code = generate_code(&mut rng);
            assert_eq!(code.len(), SESSION_CODE_LEN);
            assert!(
                code.chars()
                    .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
            );
        }
    }
}
