//! One session: the players grouped under a four character code, the
//! pre-game vote for which mini game to play, and the running game itself.
//!
//! All methods are called with the session's lock held by the caller, so
//! everything in here is plain sequential state manipulation. The only
//! async edges are sends into player channels (never blocking) and the
//! handoff of generation requests to the dispatcher.

use std::collections::HashMap;

use indexmap::IndexMap;
use protocol::{PlayerId, ServerMessage};
use rand::Rng;
use tokio::sync::mpsc;

use crate::dispatcher::{GenerationResult, ImageDispatcher};
use crate::engine::{Effect, Game, UiRecipient};
use crate::script::ScriptLibrary;

/// The send handle of one player's connection.
pub type PlayerSender = mpsc::UnboundedSender<ServerMessage>;

/// Why a session wants to be torn down.
#[derive(Debug, PartialEq, Eq)]
pub enum SessionFate {
    /// Keep going.
    Alive,
    /// Remove the session; members were already notified where needed.
    Destroy,
}

pub struct Session {
    code: String,
    members: IndexMap<PlayerId, PlayerSender>,
    /// The pre-game vote. Only used while `game` is still unset.
    votes: HashMap<PlayerId, String>,
    game: Option<Game>,
}

impl Session {
    pub fn new(code: String) -> Self {
        Session {
            code,
            members: IndexMap::new(),
            votes: HashMap::new(),
            game: None,
        }
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn player_count(&self) -> usize {
        self.members.len()
    }

    pub fn game_running(&self) -> bool {
        self.game.is_some()
    }

    pub fn member_ids(&self) -> Vec<PlayerId> {
        self.members.keys().copied().collect()
    }

    /// True when every member's connection has gone away; the watchdog uses
    /// this to collect sessions that never got a clean leave.
    pub fn all_connections_closed(&self) -> bool {
        self.members.values().all(|sender| sender.is_closed())
    }

    /// Admits a player. Only possible while no game has been started.
    pub fn add_player(&mut self, player: PlayerId, sender: PlayerSender) -> Result<(), &'static str> {
        if self.game.is_some() {
            return Err("game already in progress");
        }
        self.members.insert(player, sender);
        Ok(())
    }

    /// Sends to one member; a closed channel only logs, the watchdog and
    /// the disconnect path take care of the membership.
    fn send_to(&self, player: PlayerId, message: ServerMessage) {
        let Some(sender) = self.members.get(&player) else {
            tracing::warn!(session = self.code, %player, "Send to a player that is not a member.");
            return;
        };
        if sender.send(message).is_err() {
            tracing::warn!(session = self.code, %player, "Send to a closed player connection.");
        }
    }

    fn broadcast(&self, message: ServerMessage) {
        for (&player, _) in &self.members {
            self.send_to(player, message.clone());
        }
    }

    /// Tells every member that the membership changed and a game should be
    /// selected. Used after a successful join.
    pub fn announce_membership(&self) {
        self.broadcast(ServerMessage::SelectGame {
            session_code: self.code.clone(),
        });
    }

    /// Removes a player at any time. Mid-game the engine observes the
    /// reduced membership on the pass this triggers. Pre-game, a departure
    /// can complete the vote, so the library snapshot is needed here too.
    pub async fn remove_player(
        &mut self,
        player: PlayerId,
        library: &ScriptLibrary,
        dispatcher: &ImageDispatcher,
    ) -> SessionFate {
        if self.members.shift_remove(&player).is_none() {
            return self.fate();
        }
        self.votes.remove(&player);
        tracing::info!(session = self.code, %player, "Player left the session.");

        if let Some(game) = self.game.as_mut() {
            game.on_player_left(player);
            return self.pump_effects(dispatcher).await;
        }

        // Pre-game bookkeeping: a lone host gets its hosting screen back,
        // and the departure may have completed the vote.
        if self.members.len() == 1 {
            let (&host, _) = self.members.first().expect("one member present");
            self.send_to(
                host,
                ServerMessage::GameStarting {
                    session_code: self.code.clone(),
                },
            );
        }
        self.try_start(library, dispatcher).await
    }

    /// Records a pre-game vote. Once every member voted (and there are at
    /// least two), the plurality choice starts.
    pub async fn choose_game(
        &mut self,
        player: PlayerId,
        name: &str,
        library: &ScriptLibrary,
        dispatcher: &ImageDispatcher,
    ) -> SessionFate {
        if self.game.is_some() {
            tracing::warn!(session = self.code, %player, "Vote after the game started, ignoring.");
            return SessionFate::Alive;
        }
        if !self.members.contains_key(&player) {
            tracing::warn!(session = self.code, %player, "Vote from a non-member, ignoring.");
            return SessionFate::Alive;
        }
        if !library.contains_key(name) {
            tracing::warn!(session = self.code, %player, game = name, "Vote for an unknown game, ignoring.");
            return SessionFate::Alive;
        }
        self.votes.insert(player, name.to_string());
        self.try_start(library, dispatcher).await
    }

    /// Starts the voted game once every member has voted and at least two
    /// players are present.
    async fn try_start(
        &mut self,
        library: &ScriptLibrary,
        dispatcher: &ImageDispatcher,
    ) -> SessionFate {
        if self.game.is_some() || self.members.len() < 2 {
            return SessionFate::Alive;
        }
        if !self.members.keys().all(|member| self.votes.contains_key(member)) {
            return SessionFate::Alive;
        }

        // Plurality over the cast votes, ties broken uniformly.
        let mut counts: IndexMap<&str, usize> = IndexMap::new();
        for name in self.votes.values() {
            *counts.entry(name.as_str()).or_insert(0) += 1;
        }
        let best = counts.values().copied().max().unwrap_or(0);
        let tied: Vec<&str> = counts
            .iter()
            .filter(|&(_, &count)| count == best)
            .map(|(&name, _)| name)
            .collect();
        let choice = tied[rand::thread_rng().gen_range(0..tied.len())].to_string();

        let Some(script) = library.get(&choice) else {
            // The library was reloaded between vote and start.
            tracing::error!(session = self.code, game = choice, "Voted game vanished from the library.");
            self.broadcast(ServerMessage::ReturnToLobby {
                interrupted_reason: Some(format!("game {choice} is not available")),
            });
            return SessionFate::Destroy;
        };

        tracing::info!(session = self.code, game = choice, players = self.members.len(), "Starting game.");
        self.votes.clear();
        let mut game = Game::new(script.clone(), self.member_ids(), self.code.clone());
        game.tick();
        self.game = Some(game);
        self.pump_effects(dispatcher).await
    }

    /// Scripted input from a player, mid-game.
    pub async fn client_input(
        &mut self,
        player: PlayerId,
        inputs: IndexMap<String, protocol::Value>,
        dispatcher: &ImageDispatcher,
    ) -> SessionFate {
        let Some(game) = self.game.as_mut() else {
            tracing::warn!(session = self.code, %player, "Client input without a running game.");
            return SessionFate::Alive;
        };
        if !self.members.contains_key(&player) {
            tracing::warn!(session = self.code, %player, "Client input from a non-member.");
            return SessionFate::Alive;
        }
        game.on_player_input(player, inputs);
        self.pump_effects(dispatcher).await
    }

    /// A completed generation request coming back from the dispatcher.
    pub async fn images_ready(
        &mut self,
        result: GenerationResult,
        dispatcher: &ImageDispatcher,
    ) -> SessionFate {
        let Some(game) = self.game.as_mut() else {
            tracing::warn!(
                session = self.code,
                dest_var = result.dest_var,
                "Dropping generation result without a running game."
            );
            return SessionFate::Alive;
        };
        game.on_images_ready(result.player, &result.dest_var, result.images);
        self.pump_effects(dispatcher).await
    }

    /// Drains the engine's effects: UI messages go out in emission order,
    /// generation requests go to the dispatcher (cheap enqueue only), and a
    /// finished game tears the session down.
    async fn pump_effects(&mut self, dispatcher: &ImageDispatcher) -> SessionFate {
        let Some(game) = self.game.as_mut() else {
            return self.fate();
        };
        let effects = game.drain_effects();
        let mut finished = false;
        for effect in effects {
            match effect {
                Effect::SendUi { to, command } => {
                    let message = ServerMessage::ClientUi { command };
                    match to {
                        UiRecipient::One(player) => self.send_to(player, message),
                        UiRecipient::All => self.broadcast(message),
                    }
                }
                Effect::SubmitGeneration(spec) => {
                    dispatcher.submit(spec).await;
                }
                Effect::GameFinished => finished = true,
            }
        }
        if finished {
            tracing::info!(session = self.code, "Game finished, returning players to the lobby.");
            self.broadcast(ServerMessage::ReturnToLobby {
                interrupted_reason: None,
            });
            return SessionFate::Destroy;
        }
        self.fate()
    }

    fn fate(&self) -> SessionFate {
        if self.members.is_empty() {
            SessionFate::Destroy
        } else {
            SessionFate::Alive
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::GenerationResult;
    use crate::images::AssetCache;
    use crate::script::GameScript;
    use protocol::Value;
    use std::sync::Arc;

    struct NoTransport;

    #[async_trait::async_trait]
    impl crate::dispatcher::UpstreamTransport for NoTransport {
        async fn active_model(
            &self,
            _host: &str,
            _port: u16,
        ) -> Result<String, crate::dispatcher::TransportError> {
            unreachable!("tests run without upstreams")
        }
        async fn switch_model(
            &self,
            _host: &str,
            _port: u16,
            _model: &str,
        ) -> Result<(), crate::dispatcher::TransportError> {
            unreachable!("tests run without upstreams")
        }
        async fn generate(
            &self,
            _host: &str,
            _port: u16,
            _endpoint: &str,
            _payload: serde_json::Value,
        ) -> Result<Vec<String>, crate::dispatcher::TransportError> {
            unreachable!("tests run without upstreams")
        }
    }

    /// A dispatcher without upstreams: every request answers immediately
    /// from the placeholder pool, which keeps session tests self-contained.
    fn test_dispatcher() -> (
        ImageDispatcher,
        mpsc::UnboundedReceiver<GenerationResult>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let dispatcher = ImageDispatcher::new(
            Vec::new(),
            Box::new(NoTransport),
            AssetCache::new(std::env::temp_dir()),
            vec!["placeholder-a".to_string(), "placeholder-b".to_string()],
            tx,
        );
        (dispatcher, rx)
    }

    fn library_with(scripts: &[(&str, &str)]) -> ScriptLibrary {
        scripts
            .iter()
            .map(|(name, ops)| {
                let ops = serde_json::from_str(ops).expect("test script must parse");
                (
                    name.to_string(),
                    Arc::new(GameScript {
                        name: name.to_string(),
                        ops,
                    }),
                )
            })
            .collect()
    }

    fn player(seed: u128) -> (PlayerId, PlayerSender, mpsc::UnboundedReceiver<ServerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (uuid::Uuid::from_u128(seed), tx, rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ServerMessage>) -> Vec<ServerMessage> {
        let mut messages = Vec::new();
        while let Ok(message) = rx.try_recv() {
            messages.push(message);
        }
        messages
    }

    const MINI: &str = r#"[
        {"kind": "ui", "ui": {"command": "intro", "param": "welcome"}},
        {"kind": "wait_var", "var": "@never"}
    ]"#;

    fn inputs(entries: &[(&str, Value)]) -> IndexMap<String, Value> {
        entries
            .iter()
            .map(|(key, value)| (key.to_string(), value.clone()))
            .collect()
    }

    #[tokio::test]
    async fn a_single_player_cannot_start_a_game() {
        let (dispatcher, _rx) = test_dispatcher();
        let library = library_with(&[("mini", MINI)]);
        let mut session = Session::new("AAAA".to_string());
        let (a, tx, _arx) = player(1);
        session.add_player(a, tx).unwrap();
        session.choose_game(a, "mini", &library, &dispatcher).await;
        assert!(!session.game_running());
    }

    #[tokio::test]
    async fn a_completed_vote_starts_the_game_and_freezes_admission() {
        let (dispatcher, _rx) = test_dispatcher();
        let library = library_with(&[("mini", MINI)]);
        let mut session = Session::new("AAAA".to_string());
        let (a, atx, mut arx) = player(1);
        let (b, btx, mut brx) = player(2);
        session.add_player(a, atx).unwrap();
        session.add_player(b, btx).unwrap();

        session.choose_game(a, "mini", &library, &dispatcher).await;
        assert!(!session.game_running());
        session.choose_game(b, "mini", &library, &dispatcher).await;
        assert!(session.game_running());

        // The intro from the global cursor reaches both members.
        assert!(drain(&mut arx).iter().any(
            |m| matches!(m, ServerMessage::ClientUi { command } if command.command == "intro")
        ));
        assert!(drain(&mut brx).iter().any(
            |m| matches!(m, ServerMessage::ClientUi { command } if command.command == "intro")
        ));

        // Once running, nobody else gets in.
        let (c, ctx, _crx) = player(3);
        assert!(session.add_player(c, ctx).is_err());
    }

    #[tokio::test]
    async fn unknown_game_votes_are_ignored() {
        let (dispatcher, _rx) = test_dispatcher();
        let library = library_with(&[("mini", MINI)]);
        let mut session = Session::new("AAAA".to_string());
        let (a, atx, _arx) = player(1);
        let (b, btx, _brx) = player(2);
        session.add_player(a, atx).unwrap();
        session.add_player(b, btx).unwrap();
        session.choose_game(a, "mini", &library, &dispatcher).await;
        session.choose_game(b, "no-such-game", &library, &dispatcher).await;
        assert!(!session.game_running());
    }

    #[tokio::test]
    async fn a_tied_vote_starts_one_of_the_tied_games() {
        let (dispatcher, _rx) = test_dispatcher();
        let library = library_with(&[("mini", MINI), ("other", MINI)]);
        let mut session = Session::new("AAAA".to_string());
        let (a, atx, _arx) = player(1);
        let (b, btx, _brx) = player(2);
        session.add_player(a, atx).unwrap();
        session.add_player(b, btx).unwrap();
        session.choose_game(a, "mini", &library, &dispatcher).await;
        session.choose_game(b, "other", &library, &dispatcher).await;
        assert!(session.game_running());
    }

    #[tokio::test]
    async fn a_departure_can_complete_the_vote() {
        let (dispatcher, _rx) = test_dispatcher();
        let library = library_with(&[("mini", MINI)]);
        let mut session = Session::new("AAAA".to_string());
        let (a, atx, _arx) = player(1);
        let (b, btx, _brx) = player(2);
        let (c, ctx, _crx) = player(3);
        session.add_player(a, atx).unwrap();
        session.add_player(b, btx).unwrap();
        session.add_player(c, ctx).unwrap();
        session.choose_game(a, "mini", &library, &dispatcher).await;
        session.choose_game(b, "mini", &library, &dispatcher).await;
        assert!(!session.game_running());
        // The non-voter leaves; the remaining two are unanimous.
        let fate = session.remove_player(c, &library, &dispatcher).await;
        assert_eq!(fate, SessionFate::Alive);
        assert!(session.game_running());
    }

    #[tokio::test]
    async fn a_lone_host_sees_its_code_again() {
        let (dispatcher, _rx) = test_dispatcher();
        let library = library_with(&[("mini", MINI)]);
        let mut session = Session::new("AB12".to_string());
        let (a, atx, mut arx) = player(1);
        let (b, btx, _brx) = player(2);
        session.add_player(a, atx).unwrap();
        session.add_player(b, btx).unwrap();
        session.remove_player(b, &library, &dispatcher).await;
        let messages = drain(&mut arx);
        assert!(messages.iter().any(|m| matches!(
            m,
            ServerMessage::GameStarting { session_code } if session_code == "AB12"
        )));
    }

    #[tokio::test]
    async fn the_last_player_leaving_destroys_the_session() {
        let (dispatcher, _rx) = test_dispatcher();
        let library = library_with(&[("mini", MINI)]);
        let mut session = Session::new("AAAA".to_string());
        let (a, atx, _arx) = player(1);
        session.add_player(a, atx).unwrap();
        let fate = session.remove_player(a, &library, &dispatcher).await;
        assert_eq!(fate, SessionFate::Destroy);
    }

    /// The themed vote, end to end: two players prompt, pick one of their
    /// generated images, vote for each other's pick, and the tally reports
    /// both as tied winners.
    #[tokio::test]
    async fn themed_vote_plays_through() {
        const THEMED: &str = r#"[
            {"kind": "init_state"},
            {"kind": "random_choice", "choices": ["A hairy situation."], "out": "@theme"},
            {"kind": "per_player", "ops": [
                {"kind": "ui", "ui": {"command": "ask_prompt", "param": "Theme: {@theme}"}},
                {"kind": "wait_var", "var": "@@prompt"},
                {"kind": "txt2img", "params": {"prompt": "@@prompt", "batch_size": 2, "iterations": 1}, "out": "@@images"},
                {"kind": "wait_var", "var": "@@images"},
                {"kind": "ui", "ui": {"command": "pick_image", "param": "@@images"}},
                {"kind": "wait_var", "var": "@@pick"}
            ]},
            {"kind": "wait_var_all", "var": "@@pick"},
            {"kind": "gather_map_by_player", "each_var": "@@pick", "out": "@picks"},
            {"kind": "per_player", "ops": [
                {"kind": "ui", "ui": {"command": "cast_vote", "param": "@picks"}},
                {"kind": "wait_var", "var": "@@vote"}
            ]},
            {"kind": "wait_var_all", "var": "@@vote"},
            {"kind": "gather_list", "each_var": "@@vote", "out": "@votes"},
            {"kind": "tally", "votes_var": "@votes", "out": "@winners"},
            {"kind": "ui", "ui": {"command": "show_winners", "param": "@winners"}}
        ]"#;

        let (dispatcher, mut results) = test_dispatcher();
        let library = library_with(&[("themed", THEMED)]);
        let mut session = Session::new("GAME".to_string());
        let (a, atx, mut arx) = player(1);
        let (b, btx, mut brx) = player(2);
        session.add_player(a, atx).unwrap();
        session.add_player(b, btx).unwrap();
        session.choose_game(a, "themed", &library, &dispatcher).await;
        session.choose_game(b, "themed", &library, &dispatcher).await;
        assert!(session.game_running());

        // Both got asked for a prompt, with the theme spliced in.
        for rx in [&mut arx, &mut brx] {
            let asked = drain(rx);
            assert!(asked.iter().any(|m| matches!(
                m,
                ServerMessage::ClientUi { command }
                    if command.command == "ask_prompt"
                        && command.param == Value::from("Theme: A hairy situation.")
            )));
        }

        session
            .client_input(a, inputs(&[("@@prompt", Value::from("kermit"))]), &dispatcher)
            .await;
        session
            .client_input(b, inputs(&[("@@prompt", Value::from("sasquatch"))]), &dispatcher)
            .await;

        // Two generation requests answered from the placeholder pool (no
        // upstreams configured). Feed them back like the delivery task.
        for _ in 0..2 {
            let result = results.try_recv().expect("a generation result");
            assert_eq!(result.images.len(), 2);
            session.images_ready(result, &dispatcher).await;
        }

        // Each player picks the first of its own images.
        let mut picks = Vec::new();
        for (id, rx) in [(a, &mut arx), (b, &mut brx)] {
            let shown = drain(rx);
            let ids: Vec<String> = shown
                .iter()
                .find_map(|m| match m {
                    ServerMessage::ClientUi { command } if command.command == "pick_image" => {
                        command.param.as_map().map(|map| map.keys().cloned().collect())
                    }
                    _ => None,
                })
                .expect("a pick_image command");
            assert_eq!(ids.len(), 2);
            picks.push((id, ids[0].clone()));
        }
        for (id, pick) in &picks {
            session
                .client_input(*id, inputs(&[("@@pick", Value::from(pick.clone()))]), &dispatcher)
                .await;
        }

        // Everyone votes for the other player's pick.
        let fate_a = session
            .client_input(a, inputs(&[("@@vote", Value::from(picks[1].1.clone()))]), &dispatcher)
            .await;
        assert_eq!(fate_a, SessionFate::Alive);
        let fate_b = session
            .client_input(b, inputs(&[("@@vote", Value::from(picks[0].1.clone()))]), &dispatcher)
            .await;

        // Both picks are tied winners and the session winds down.
        let finale = drain(&mut arx);
        let winners = finale
            .iter()
            .find_map(|m| match m {
                ServerMessage::ClientUi { command } if command.command == "show_winners" => {
                    command.param.as_items().map(<[Value]>::to_vec)
                }
                _ => None,
            })
            .expect("a show_winners command");
        assert_eq!(winners.len(), 2);
        assert!(winners.contains(&Value::from(picks[0].1.clone())));
        assert!(winners.contains(&Value::from(picks[1].1.clone())));
        assert!(finale.iter().any(|m| matches!(
            m,
            ServerMessage::ReturnToLobby { interrupted_reason: None }
        )));
        assert_eq!(fate_b, SessionFate::Destroy);
    }
}

