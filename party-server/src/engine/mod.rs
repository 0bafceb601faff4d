//! The game orchestration engine.
//!
//! A [`Game`] interprets one script against the two tier variable store. It
//! owns a single global cursor over the full op list and, while a
//! `per_player` block is active, one sub-cursor per session member with its
//! own local variable map. The engine itself is synchronous: the session
//! layer feeds it the three inputs (player input, image result, tick) under
//! the session lock, and everything the engine wants to happen in the
//! outside world comes back out of [`Game::drain_effects`].

mod ops;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use indexmap::IndexMap;
use protocol::{PlayerId, UiCommand, Value};
use rand::SeedableRng;
use rand::rngs::StdRng;

use crate::dispatcher::GenerationSpec;
use crate::script::{GameScript, Op};
use crate::store::{KeyScope, VarMap, classify};

/// All images a game has produced or received, by minted id.
pub type ImageCache = HashMap<String, String>;

/// Who a UI message goes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UiRecipient {
    /// Only the player whose cursor emitted the message.
    One(PlayerId),
    /// Every current session member.
    All,
}

/// A side effect the engine asks its session to perform. Effects come out
/// in emission order; the session drains them after every input.
#[derive(Debug)]
pub enum Effect {
    /// Send a UI command over the wire.
    SendUi {
        to: UiRecipient,
        command: UiCommand,
    },
    /// Hand a generation request to the image dispatcher.
    SubmitGeneration(GenerationSpec),
    /// The global cursor ran off the end of the script; the session should
    /// tear the game down.
    GameFinished,
}

/// One per-player execution pointer into the active sub-script.
struct SubCursor {
    index: usize,
    locals: VarMap,
}

/// The currently executing `per_player` block. Re-entering such a block
/// replaces the previous one, which discards all previous local contexts.
struct PerPlayerBlock {
    ops: Arc<Vec<Op>>,
    cursors: IndexMap<PlayerId, SubCursor>,
}

/// An in-progress execution of one mini game script.
pub struct Game {
    session_code: String,
    script: Arc<GameScript>,
    global_index: usize,
    globals: VarMap,
    block: Option<PerPlayerBlock>,
    players: Vec<PlayerId>,
    images: ImageCache,
    effects: VecDeque<Effect>,
    rng: StdRng,
    finished_flagged: bool,
}

impl Game {
    /// Starts a game over the given members. The membership may only shrink
    /// from here on. Call [`Game::tick`] once after construction to run the
    /// script up to its first blocking op.
    pub fn new(script: Arc<GameScript>, players: Vec<PlayerId>, session_code: String) -> Self {
        Self::with_rng(script, players, session_code, StdRng::from_entropy())
    }

    /// Like [`Game::new`] with a caller-provided generator, so tests can be
    /// deterministic.
    pub fn with_rng(
        script: Arc<GameScript>,
        players: Vec<PlayerId>,
        session_code: String,
        rng: StdRng,
    ) -> Self {
        Game {
            session_code,
            script,
            global_index: 0,
            globals: VarMap::new(),
            block: None,
            players,
            images: ImageCache::new(),
            effects: VecDeque::new(),
            rng,
            finished_flagged: false,
        }
    }

    /// The members still playing.
    pub fn players(&self) -> &[PlayerId] {
        &self.players
    }

    /// True once the global cursor ran off the end of the script.
    pub fn is_finished(&self) -> bool {
        self.global_index >= self.script.ops.len()
    }

    /// Takes all pending effects in emission order.
    pub fn drain_effects(&mut self) -> Vec<Effect> {
        self.effects.drain(..).collect()
    }

    /// Input event: a tick with no state change. Runs a work pass, which is
    /// idempotent when nothing changed.
    pub fn tick(&mut self) {
        self.run_pass();
    }

    /// Input event: a player sent scripted inputs. Every entry is written to
    /// the tier its prefix selects, locals going to the sending player's
    /// context.
    pub fn on_player_input(&mut self, player: PlayerId, inputs: IndexMap<String, Value>) {
        for (key, value) in inputs {
            match classify(&key) {
                Some(KeyScope::Global) => {
                    self.globals.insert(key, value);
                }
                Some(KeyScope::Local) => {
                    if let Some(block) = self.block.as_mut()
                        && let Some(cursor) = block.cursors.get_mut(&player)
                    {
                        cursor.locals.insert(key, value);
                    } else {
                        tracing::error!(
                            session = self.session_code,
                            %player,
                            key,
                            "Dropping local input without an active player context."
                        );
                    }
                }
                None => {
                    tracing::error!(
                        session = self.session_code,
                        %player,
                        key,
                        "Dropping input with a malformed variable key."
                    );
                }
            }
        }
        self.run_pass();
    }

    /// Input event: the dispatcher finished a generation request. The
    /// id-to-payload map becomes the destination variable, and every image
    /// joins the per-game cache so `gather_images` can find it later.
    pub fn on_images_ready(
        &mut self,
        player: Option<PlayerId>,
        dest_var: &str,
        images: IndexMap<String, String>,
    ) {
        let as_value = Value::Map(
            images
                .iter()
                .map(|(id, payload)| (id.clone(), Value::String(payload.clone())))
                .collect(),
        );
        for (id, payload) in images {
            self.images.insert(id, payload);
        }
        match classify(dest_var) {
            Some(KeyScope::Global) => {
                self.globals.insert(dest_var.to_string(), as_value);
            }
            Some(KeyScope::Local) => {
                let context = player.and_then(|player| {
                    self.block
                        .as_mut()
                        .and_then(|block| block.cursors.get_mut(&player))
                });
                if let Some(cursor) = context {
                    cursor.locals.insert(dest_var.to_string(), as_value);
                } else {
                    tracing::error!(
                        session = self.session_code,
                        dest_var,
                        "Image result arrived for a player context that no longer exists."
                    );
                }
            }
            None => {
                tracing::error!(
                    session = self.session_code,
                    dest_var,
                    "Image result with a malformed destination variable."
                );
            }
        }
        self.run_pass();
    }

    /// Input event: a player left. Its cursor and local context disappear,
    /// so barrier ops observe the reduced membership from now on.
    pub fn on_player_left(&mut self, player: PlayerId) {
        self.players.retain(|&member| member != player);
        if let Some(block) = self.block.as_mut() {
            block.cursors.shift_remove(&player);
        }
        self.run_pass();
    }

    /// The work-until-blocked pass: step every per-player cursor to its next
    /// blocking op, then the global cursor, and repeat until a full round
    /// makes no progress.
    fn run_pass(&mut self) {
        loop {
            let mut progressed = false;
            if let Some(block) = &self.block {
                let members: Vec<PlayerId> = block.cursors.keys().copied().collect();
                for player in members {
                    progressed |= self.run_player_cursor(player);
                }
            }
            progressed |= self.run_global_cursor();
            if !progressed {
                break;
            }
        }
        if self.is_finished() && !self.finished_flagged {
            self.finished_flagged = true;
            self.effects.push_back(Effect::GameFinished);
        }
    }

    /// Steps one player's cursor until it blocks or finishes. Returns
    /// whether anything advanced.
    fn run_player_cursor(&mut self, player: PlayerId) -> bool {
        let mut progressed = false;
        loop {
            let Some(block) = &self.block else {
                return progressed;
            };
            let Some(cursor) = block.cursors.get(&player) else {
                return progressed;
            };
            let ops = block.ops.clone();
            if cursor.index >= ops.len() {
                return progressed;
            }
            let op = ops[cursor.index].clone();

            // The local map is taken out for the duration of the op, which
            // keeps the borrow on the game itself free for op execution.
            let mut locals = {
                let block = self.block.as_mut().unwrap();
                std::mem::take(&mut block.cursors.get_mut(&player).unwrap().locals)
            };
            let advance = self.exec_op(&op, Some(player), Some(&mut locals));
            let Some(cursor) = self
                .block
                .as_mut()
                .and_then(|block| block.cursors.get_mut(&player))
            else {
                return progressed;
            };
            cursor.locals = locals;
            if !advance {
                return progressed;
            }
            cursor.index += 1;
            progressed = true;
        }
    }

    /// Steps the global cursor until it blocks or finishes.
    fn run_global_cursor(&mut self) -> bool {
        let mut progressed = false;
        loop {
            let script = self.script.clone();
            if self.global_index >= script.ops.len() {
                return progressed;
            }
            let op = script.ops[self.global_index].clone();
            if !self.exec_op(&op, None, None) {
                return progressed;
            }
            self.global_index += 1;
            progressed = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::GenerationKind;

    fn script(ops: Vec<Op>) -> Arc<GameScript> {
        Arc::new(GameScript {
            name: "test-game".to_string(),
            ops,
        })
    }

    fn parse_ops(raw: &str) -> Vec<Op> {
        serde_json::from_str(raw).expect("test script must parse")
    }

    fn game(ops: Vec<Op>, players: Vec<PlayerId>) -> Game {
        Game::with_rng(
            script(ops),
            players,
            "TEST".to_string(),
            StdRng::seed_from_u64(7),
        )
    }

    fn two_players() -> (PlayerId, PlayerId) {
        // Fixed ids keep member iteration order deterministic in tests.
        (
            uuid::Uuid::from_u128(1),
            uuid::Uuid::from_u128(2),
        )
    }

    fn global(game: &Game, key: &str) -> Option<Value> {
        game.globals.get(key).cloned()
    }

    #[test]
    fn per_player_cursors_are_isolated() {
        let (a, b) = two_players();
        let ops = parse_ops(
            r#"[
                {"kind": "per_player", "ops": [
                    {"kind": "copy", "from": 1, "out": "@@n"},
                    {"kind": "copy", "from": 2, "out": "@@n"}
                ]},
                {"kind": "wait_var_all", "var": "@@n"},
                {"kind": "gather_list", "each_var": "@@n", "out": "@out"}
            ]"#,
        );
        let mut game = game(ops, vec![a, b]);
        game.tick();
        assert!(game.is_finished());
        assert_eq!(
            global(&game, "@out"),
            Some(Value::List(vec![Value::Number(2.0), Value::Number(2.0)]))
        );
    }

    #[test]
    fn barrier_converges_when_a_player_disconnects() {
        let (a, b) = two_players();
        let c = uuid::Uuid::from_u128(3);
        let ops = parse_ops(
            r#"[
                {"kind": "per_player", "ops": [
                    {"kind": "wait_var", "var": "@@answer"},
                    {"kind": "copy", "from": true, "out": "@@done"}
                ]},
                {"kind": "wait_var_all", "var": "@@done"},
                {"kind": "copy", "from": "passed", "out": "@barrier"}
            ]"#,
        );
        let mut game = game(ops, vec![a, b, c]);
        game.tick();
        assert_eq!(global(&game, "@barrier"), None);

        let mut inputs = IndexMap::new();
        inputs.insert("@@answer".to_string(), Value::from("yes"));
        game.on_player_input(a, inputs.clone());
        assert_eq!(global(&game, "@barrier"), None);

        // B leaves before answering; the barrier must not wait for it.
        game.on_player_left(b);
        assert_eq!(global(&game, "@barrier"), None);

        game.on_player_input(c, inputs);
        assert_eq!(global(&game, "@barrier"), Some(Value::from("passed")));
        assert!(game.is_finished());
    }

    #[test]
    fn work_pass_is_idempotent_while_blocked() {
        let (a, b) = two_players();
        let ops = parse_ops(
            r#"[
                {"kind": "copy", "from": "x", "out": "@seen"},
                {"kind": "wait_var", "var": "@never"}
            ]"#,
        );
        let mut game = game(ops, vec![a, b]);
        game.tick();
        let snapshot = game.globals.clone();
        let index = game.global_index;
        game.tick();
        game.tick();
        assert_eq!(game.globals, snapshot);
        assert_eq!(game.global_index, index);
        assert!(!game.is_finished());
    }

    #[test]
    fn generation_ops_emit_requests_and_results_unblock() {
        let (a, b) = two_players();
        let ops = parse_ops(
            r#"[
                {"kind": "per_player", "ops": [
                    {"kind": "wait_var", "var": "@@prompt"},
                    {"kind": "txt2img", "params": {"prompt": "@@prompt", "batch_size": 2, "iterations": 1}, "out": "@@images"},
                    {"kind": "wait_var", "var": "@@images"},
                    {"kind": "copy", "from": true, "out": "@@done"}
                ]},
                {"kind": "wait_var_all", "var": "@@done"}
            ]"#,
        );
        let mut game = game(ops, vec![a, b]);
        game.tick();

        let mut inputs = IndexMap::new();
        inputs.insert("@@prompt".to_string(), Value::from("kermit"));
        game.on_player_input(a, inputs);

        let effects = game.drain_effects();
        let request = effects
            .iter()
            .find_map(|effect| match effect {
                Effect::SubmitGeneration(spec) => Some(spec),
                _ => None,
            })
            .expect("a generation request must be emitted");
        assert_eq!(request.player, Some(a));
        assert_eq!(request.dest_var, "@@images");
        assert_eq!(request.expected_images(), 2);
        let GenerationKind::Text { prompt, .. } = &request.kind else {
            panic!("expected a text request");
        };
        assert_eq!(prompt, "kermit");

        // Completion writes the id map into A's context and the cache.
        let mut images = IndexMap::new();
        images.insert("id-1".to_string(), "payload-1".to_string());
        images.insert("id-2".to_string(), "payload-2".to_string());
        game.on_images_ready(Some(a), "@@images", images);
        assert_eq!(game.images.len(), 2);
        assert!(!game.is_finished());

        // B finishing its side ends the game.
        let mut inputs = IndexMap::new();
        inputs.insert("@@prompt".to_string(), Value::from("sasquatch"));
        game.on_player_input(b, inputs);
        let mut images = IndexMap::new();
        images.insert("id-3".to_string(), "payload-3".to_string());
        images.insert("id-4".to_string(), "payload-4".to_string());
        game.on_images_ready(Some(b), "@@images", images);
        assert!(game.is_finished());
        let effects = game.drain_effects();
        assert!(effects.iter().any(|e| matches!(e, Effect::GameFinished)));
    }

    #[test]
    fn late_image_result_for_a_gone_player_is_dropped() {
        let (a, b) = two_players();
        let ops = parse_ops(
            r#"[
                {"kind": "per_player", "ops": [
                    {"kind": "wait_var", "var": "@@images"}
                ]},
                {"kind": "wait_var_all", "var": "@@images"}
            ]"#,
        );
        let mut game = game(ops, vec![a, b]);
        game.tick();
        game.on_player_left(a);
        let mut images = IndexMap::new();
        images.insert("id-1".to_string(), "payload".to_string());
        // Must not panic, and must not create a context for A.
        game.on_images_ready(Some(a), "@@images", images);
        assert!(!game.is_finished());
    }

    #[test]
    fn ui_from_per_player_cursor_targets_one_or_all() {
        let (a, b) = two_players();
        let ops = parse_ops(
            r#"[
                {"kind": "per_player", "ops": [
                    {"kind": "ui", "ui": {"command": "just_me", "param": "hi"}},
                    {"kind": "ui", "ui": {"command": "everyone", "param": "yo", "sendToAll": true}},
                    {"kind": "wait_var", "var": "@@never"}
                ]}
            ]"#,
        );
        let mut game = game(ops, vec![a, b]);
        game.tick();
        let effects = game.drain_effects();
        let mut solo = Vec::new();
        let mut broadcast = 0;
        for effect in &effects {
            if let Effect::SendUi { to, command } = effect {
                match command.command.as_str() {
                    "just_me" => {
                        let UiRecipient::One(player) = to else {
                            panic!("just_me must be targeted");
                        };
                        solo.push(*player);
                        assert_eq!(command.send_to_all, None);
                    }
                    "everyone" => {
                        assert_eq!(*to, UiRecipient::All);
                        broadcast += 1;
                    }
                    other => panic!("unexpected command {other}"),
                }
            }
        }
        assert_eq!(solo, vec![a, b]);
        assert_eq!(broadcast, 2);
    }

    #[test]
    fn reentering_per_player_discards_previous_locals() {
        let (a, b) = two_players();
        let ops = parse_ops(
            r#"[
                {"kind": "per_player", "ops": [
                    {"kind": "copy", "from": "old", "out": "@@keep"}
                ]},
                {"kind": "per_player", "ops": [
                    {"kind": "wait_var", "var": "@@keep"}
                ]},
                {"kind": "wait_var_all", "var": "@@keep"}
            ]"#,
        );
        let mut game = game(ops, vec![a, b]);
        game.tick();
        // The first block wrote @@keep, but the second block starts fresh,
        // so the barrier is still waiting.
        assert!(!game.is_finished());
        let mut inputs = IndexMap::new();
        inputs.insert("@@keep".to_string(), Value::from("new"));
        game.on_player_input(a, inputs.clone());
        game.on_player_input(b, inputs);
        assert!(game.is_finished());
    }

    #[test]
    fn script_errors_advance_instead_of_deadlocking() {
        let (a, b) = two_players();
        let ops = parse_ops(
            r#"[
                {"kind": "quantum_leap"},
                {"kind": "tally", "votes_var": "@no_such", "out": "@winners"},
                {"kind": "our_player_id", "out": "@whoami"},
                {"kind": "copy", "from": "alive", "out": "@end"}
            ]"#,
        );
        let mut game = game(ops, vec![a, b]);
        game.tick();
        assert!(game.is_finished());
        assert_eq!(global(&game, "@end"), Some(Value::from("alive")));
        assert_eq!(global(&game, "@whoami"), None);
    }

    #[test]
    fn map_ops_obey_their_laws() {
        let (a, b) = two_players();
        let ops = parse_ops(
            r#"[
                {"kind": "copy", "from": {"a": "x", "b": "y"}, "out": "@m"},
                {"kind": "keys_to_list", "map_var": "@m", "out": "@keys"},
                {"kind": "invert_map", "map_var": "@m", "out": "@inv"},
                {"kind": "invert_map", "map_var": "@inv", "out": "@inv2"},
                {"kind": "make_map", "keys": "@keys", "values": ["x", "y"], "out": "@rebuilt"},
                {"kind": "remap_keys", "map_var": "@m", "key_map": {"a": "alpha"}, "out": "@remapped"},
                {"kind": "copy", "from": {"x": "1", "y": "2"}, "out": "@m2"},
                {"kind": "compose_maps", "m1": "@m", "m2": "@m2", "out": "@composed"}
            ]"#,
        );
        let mut game = game(ops, vec![a, b]);
        game.tick();
        assert!(game.is_finished());

        let source = global(&game, "@m").unwrap();
        // Inverting twice is the identity for maps with distinct values.
        assert_eq!(global(&game, "@inv2"), Some(source.clone()));
        // keys_to_list plus make_map with the matching values reproduces
        // the original entries.
        assert_eq!(global(&game, "@rebuilt"), Some(source));
        // Entries without a key translation are dropped.
        let Some(Value::Map(remapped)) = global(&game, "@remapped") else {
            panic!("expected a map");
        };
        assert_eq!(remapped.len(), 1);
        assert_eq!(remapped["alpha"], Value::from("x"));
        // Composition chains through the middle map.
        let Some(Value::Map(composed)) = global(&game, "@composed") else {
            panic!("expected a map");
        };
        assert_eq!(composed["a"], Value::from("1"));
        assert_eq!(composed["b"], Value::from("2"));
    }

    #[test]
    fn select_picks_from_the_table_or_writes_null() {
        let (a, b) = two_players();
        let ops = parse_ops(
            r#"[
                {"kind": "copy", "from": "beta", "out": "@key"},
                {"kind": "select", "key_var": "@key", "table": {"alpha": "A", "beta": "B"}, "out": "@picked"},
                {"kind": "copy", "from": "gamma", "out": "@other"},
                {"kind": "select", "key_var": "@other", "table": {"alpha": "A"}, "out": "@none"}
            ]"#,
        );
        let mut game = game(ops, vec![a, b]);
        game.tick();
        assert_eq!(global(&game, "@picked"), Some(Value::from("B")));
        assert_eq!(global(&game, "@none"), Some(Value::Null));
    }

    #[test]
    fn pair_players_rotates_the_membership() {
        let (a, b) = two_players();
        let c = uuid::Uuid::from_u128(3);
        let ops = parse_ops(r#"[{"kind": "pair_players", "out": "@pairs"}]"#);
        let mut game = game(ops, vec![a, b, c]);
        game.tick();
        let Some(Value::Map(pairs)) = global(&game, "@pairs") else {
            panic!("expected a map");
        };
        assert_eq!(pairs[&a.to_string()], Value::String(b.to_string()));
        assert_eq!(pairs[&b.to_string()], Value::String(c.to_string()));
        assert_eq!(pairs[&c.to_string()], Value::String(a.to_string()));
    }

    #[test]
    fn gather_images_skips_unknown_ids() {
        let (a, b) = two_players();
        let ops = parse_ops(
            r#"[
                {"kind": "wait_var", "var": "@imgs"},
                {"kind": "copy", "from": ["id-1", "id-404"], "out": "@wanted"},
                {"kind": "gather_images", "ids_var": "@wanted", "out": "@gallery"}
            ]"#,
        );
        let mut game = game(ops, vec![a, b]);
        game.tick();
        let mut images = IndexMap::new();
        images.insert("id-1".to_string(), "payload".to_string());
        game.on_images_ready(None, "@imgs", images);
        assert!(game.is_finished());
        let Some(Value::Map(gallery)) = global(&game, "@gallery") else {
            panic!("expected a map");
        };
        assert_eq!(gallery.len(), 1);
        assert_eq!(gallery["id-1"], Value::from("payload"));
    }

    #[test]
    fn random_choice_can_draw_from_a_referenced_list() {
        let (a, b) = two_players();
        let ops = parse_ops(
            r#"[
                {"kind": "copy", "from": ["p", "q"], "out": "@tied"},
                {"kind": "random_choice", "choices": ["@tied"], "out": "@pick"}
            ]"#,
        );
        let mut game = game(ops, vec![a, b]);
        game.tick();
        let pick = global(&game, "@pick").unwrap();
        assert!(pick == Value::from("p") || pick == Value::from("q"));
    }

    #[test]
    fn init_state_clears_both_tiers() {
        let (a, b) = two_players();
        let ops = parse_ops(
            r#"[
                {"kind": "copy", "from": "x", "out": "@g"},
                {"kind": "per_player", "ops": [
                    {"kind": "copy", "from": "y", "out": "@@l"},
                    {"kind": "wait_var", "var": "@@hold"}
                ]},
                {"kind": "init_state"},
                {"kind": "wait_var", "var": "@never"}
            ]"#,
        );
        let mut game = game(ops, vec![a, b]);
        game.tick();
        assert_eq!(global(&game, "@g"), None);
        let block = game.block.as_ref().unwrap();
        for cursor in block.cursors.values() {
            assert!(cursor.locals.is_empty());
        }
    }
}
