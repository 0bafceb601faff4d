//! Execution of the individual script ops.
//!
//! Every op runs against the scope of its cursor: the global map, plus the
//! local map of the executing player for per-player steps. The executor
//! returns whether the cursor advances; only the two wait ops ever report
//! false. A broken op (missing argument, wrong type, unknown kind) is
//! logged and advanced past, so a buggy script cannot deadlock its session.

use indexmap::IndexMap;
use protocol::{PlayerId, UiCommand, Value};
use rand::Rng;

use super::{Effect, Game, UiRecipient};
use crate::dispatcher::{GenerationKind, GenerationSpec};
use crate::script::Op;
use crate::store::{KeyScope, Scope, VarMap, classify, expand};

impl Game {
    /// Runs one op. `player` and `locals` are set iff this is a per-player
    /// cursor step. Returns whether the cursor advances.
    pub(super) fn exec_op(
        &mut self,
        op: &Op,
        player: Option<PlayerId>,
        mut locals: Option<&mut VarMap>,
    ) -> bool {
        match op {
            Op::InitState => {
                self.globals.clear();
                if let Some(block) = self.block.as_mut() {
                    for cursor in block.cursors.values_mut() {
                        cursor.locals.clear();
                    }
                }
                // The executing player's map is currently detached.
                if let Some(own) = locals.as_deref_mut() {
                    own.clear();
                }
                true
            }

            Op::Ui { ui } => {
                if ui.command.is_empty() {
                    self.op_error(op, player, "ui op without a command");
                    return true;
                }
                let param = expand(&ui.param, &self.globals, locals.as_deref());
                let to = match player {
                    Some(player) if !ui.send_to_all.unwrap_or(false) => UiRecipient::One(player),
                    _ => UiRecipient::All,
                };
                self.effects.push_back(Effect::SendUi {
                    to,
                    command: UiCommand {
                        command: ui.command.clone(),
                        param,
                        send_to_all: None,
                    },
                });
                true
            }

            Op::RandomChoice { choices, out } => {
                if choices.is_empty() {
                    self.op_error(op, player, "empty choices list");
                    return true;
                }
                let mut expanded: Vec<Value> = choices
                    .iter()
                    .map(|choice| expand(choice, &self.globals, locals.as_deref()))
                    .collect();
                // A single reference to a list draws from that list, which
                // lets scripts break a tallied tie uniformly.
                if expanded.len() == 1 {
                    match expanded.remove(0) {
                        Value::List(items) | Value::Set(items) => expanded = items,
                        other => expanded.push(other),
                    }
                }
                if expanded.is_empty() {
                    self.op_error(op, player, "choices expanded to nothing");
                    return true;
                }
                let pick = expanded[self.rng.gen_range(0..expanded.len())].clone();
                self.write(out, pick, player, locals);
                true
            }

            Op::PerPlayer { ops } => {
                if player.is_some() {
                    self.op_error(op, player, "per_player inside a per-player block");
                    return true;
                }
                let cursors = self
                    .players
                    .iter()
                    .map(|&member| {
                        (
                            member,
                            super::SubCursor {
                                index: 0,
                                locals: VarMap::new(),
                            },
                        )
                    })
                    .collect();
                self.block = Some(super::PerPlayerBlock {
                    ops: std::sync::Arc::new(ops.clone()),
                    cursors,
                });
                true
            }

            Op::WaitVar { var } => {
                match classify(var) {
                    None => {
                        self.op_error(op, player, "malformed wait variable");
                        true
                    }
                    Some(KeyScope::Local) if player.is_none() => {
                        self.op_error(op, player, "waiting on a local variable in the global cursor");
                        true
                    }
                    _ => {
                        let scope = Scope {
                            globals: &mut self.globals,
                            locals: locals.as_deref_mut(),
                        };
                        scope.exists(var)
                    }
                }
            }

            Op::WaitVarAll { var } => {
                if player.is_some() {
                    self.op_error(op, player, "wait_var_all inside a per-player block");
                    return true;
                }
                if classify(var) != Some(KeyScope::Local) {
                    self.op_error(op, player, "wait_var_all needs a local variable");
                    return true;
                }
                let Some(block) = self.block.as_ref() else {
                    self.op_error(op, player, "wait_var_all without a per_player block");
                    return true;
                };
                block
                    .cursors
                    .values()
                    .all(|cursor| cursor.locals.contains_key(var))
            }

            Op::Txt2img { params, out } => {
                let kind = GenerationKind::Text {
                    prompt: self.expand_text(&params.prompt, locals.as_deref()),
                    negative_prompt: self.expand_text(&params.negative_prompt, locals.as_deref()),
                };
                self.submit_generation(op, player, out, kind, params.batch_size, params.iterations);
                true
            }

            Op::Depth2img { params, out } => {
                if params.image.is_empty() {
                    self.op_error(op, player, "depth2img without an initial image");
                    return true;
                }
                let kind = GenerationKind::Depth {
                    image: self
                        .expand_text(&Value::String(params.image.clone()), locals.as_deref()),
                    prompt: self.expand_text(&params.prompt, locals.as_deref()),
                    negative_prompt: self.expand_text(&params.negative_prompt, locals.as_deref()),
                    denoising_strength: params.denoising_strength,
                };
                self.submit_generation(op, player, out, kind, params.batch_size, params.iterations);
                true
            }

            Op::Sketch2img { prompt, image, out } => {
                let sketch = expand(image, &self.globals, locals.as_deref());
                let Value::String(sketch_base64) = sketch else {
                    self.op_error(op, player, "sketch image did not resolve to a string");
                    return true;
                };
                let kind = GenerationKind::Sketch {
                    prompt: self.expand_text(prompt, locals.as_deref()),
                    sketch_base64,
                };
                self.submit_generation(op, player, out, kind, 1, 1);
                true
            }

            Op::KeysToList { map_var, out } => {
                let keys = {
                    let scope = Scope {
                        globals: &mut self.globals,
                        locals: locals.as_deref_mut(),
                    };
                    scope.read(map_var).and_then(Value::as_map).map(|entries| {
                        entries
                            .keys()
                            .map(|key| Value::String(key.clone()))
                            .collect::<Vec<Value>>()
                    })
                };
                match keys {
                    Some(keys) => {
                        self.write(out, Value::List(keys), player, locals);
                    }
                    None => self.op_error(op, player, "keys_to_list source is not a map"),
                }
                true
            }

            Op::GatherSet { each_var, out } => {
                if let Some(collected) = self.gather(op, player, each_var) {
                    let set = Value::set_from(collected.into_iter().map(|(_, value)| value));
                    self.write(out, set, player, locals);
                }
                true
            }

            Op::GatherList { each_var, out } => {
                if let Some(collected) = self.gather(op, player, each_var) {
                    let list = collected.into_iter().map(|(_, value)| value).collect();
                    self.write(out, Value::List(list), player, locals);
                }
                true
            }

            Op::GatherMapByPlayer { each_var, out } => {
                if let Some(collected) = self.gather(op, player, each_var) {
                    let map: IndexMap<String, Value> = collected
                        .into_iter()
                        .map(|(member, value)| (member.to_string(), value))
                        .collect();
                    self.write(out, Value::Map(map), player, locals);
                }
                true
            }

            Op::GatherImages { ids_var, out } => {
                let ids = {
                    let scope = Scope {
                        globals: &mut self.globals,
                        locals: locals.as_deref_mut(),
                    };
                    scope.read(ids_var).and_then(Value::as_items).map(<[Value]>::to_vec)
                };
                let Some(ids) = ids else {
                    self.op_error(op, player, "gather_images source is not a list or set");
                    return true;
                };
                let mut gathered: IndexMap<String, Value> = IndexMap::new();
                for id in ids {
                    let Some(id) = id.as_str() else {
                        self.op_error(op, player, "image id is not a string");
                        continue;
                    };
                    match self.images.get(id) {
                        Some(payload) => {
                            gathered.insert(id.to_string(), Value::String(payload.clone()));
                        }
                        None => {
                            tracing::error!(
                                session = self.session_code,
                                image_id = id,
                                "Skipping unknown image id in gather_images."
                            );
                        }
                    }
                }
                self.write(out, Value::Map(gathered), player, locals);
                true
            }

            Op::Tally { votes_var, out } => {
                let votes = {
                    let scope = Scope {
                        globals: &mut self.globals,
                        locals: locals.as_deref_mut(),
                    };
                    scope.read(votes_var).and_then(Value::as_items).map(<[Value]>::to_vec)
                };
                match votes {
                    Some(votes) => {
                        let winners = tally_winners(&votes);
                        self.write(out, Value::List(winners), player, locals);
                    }
                    None => self.op_error(op, player, "tally source is not a list or set"),
                }
                true
            }

            Op::Select {
                key_var,
                table,
                out,
            } => {
                let key = {
                    let scope = Scope {
                        globals: &mut self.globals,
                        locals: locals.as_deref_mut(),
                    };
                    scope.read(key_var).cloned()
                };
                let Some(key) = key else {
                    self.op_error(op, player, "select key variable is missing");
                    return true;
                };
                let key = expand(&key, &self.globals, locals.as_deref()).printable();
                let table = expand(table, &self.globals, locals.as_deref());
                let Some(table) = table.as_map() else {
                    self.op_error(op, player, "select table is not a map");
                    return true;
                };
                let chosen = match table.get(&key) {
                    Some(value) => expand(value, &self.globals, locals.as_deref()),
                    None => {
                        tracing::debug!(
                            session = self.session_code,
                            key,
                            "Select key not in table, writing null."
                        );
                        Value::Null
                    }
                };
                self.write(out, chosen, player, locals);
                true
            }

            Op::Copy { from, out } => {
                let value = expand(from, &self.globals, locals.as_deref());
                self.write(out, value, player, locals);
                true
            }

            Op::Delete { var } => {
                let mut scope = Scope {
                    globals: &mut self.globals,
                    locals: locals.as_deref_mut(),
                };
                scope.delete(var);
                true
            }

            Op::MakeMap { keys, values, out } => {
                let keys = expand(keys, &self.globals, locals.as_deref());
                let values = expand(values, &self.globals, locals.as_deref());
                let (Some(keys), Some(values)) = (keys.as_items(), values.as_items()) else {
                    self.op_error(op, player, "make_map arguments are not lists");
                    return true;
                };
                if keys.len() != values.len() {
                    self.op_error(op, player, "make_map lists differ in length");
                    return true;
                }
                let map: IndexMap<String, Value> = keys
                    .iter()
                    .zip(values.iter())
                    .map(|(key, value)| (key.printable(), value.clone()))
                    .collect();
                self.write(out, Value::Map(map), player, locals);
                true
            }

            Op::PairPlayers { out } => {
                let count = self.players.len();
                let map: IndexMap<String, Value> = self
                    .players
                    .iter()
                    .enumerate()
                    .map(|(position, member)| {
                        let partner = self.players[(position + 1) % count];
                        (member.to_string(), Value::String(partner.to_string()))
                    })
                    .collect();
                self.write(out, Value::Map(map), player, locals);
                true
            }

            Op::RemapKeys {
                map_var,
                key_map,
                out,
            } => {
                let source = {
                    let scope = Scope {
                        globals: &mut self.globals,
                        locals: locals.as_deref_mut(),
                    };
                    scope.read(map_var).and_then(Value::as_map).cloned()
                };
                let Some(source) = source else {
                    self.op_error(op, player, "remap_keys source is not a map");
                    return true;
                };
                let translation = expand(key_map, &self.globals, locals.as_deref());
                let Some(translation) = translation.as_map() else {
                    self.op_error(op, player, "remap_keys key map is not a map");
                    return true;
                };
                let mut remapped: IndexMap<String, Value> = IndexMap::new();
                for (key, value) in source {
                    // Entries without a translation are dropped.
                    if let Some(new_key) = translation.get(&key) {
                        remapped.insert(new_key.printable(), value);
                    }
                }
                self.write(out, Value::Map(remapped), player, locals);
                true
            }

            Op::InvertMap { map_var, out } => {
                let source = {
                    let scope = Scope {
                        globals: &mut self.globals,
                        locals: locals.as_deref_mut(),
                    };
                    scope.read(map_var).and_then(Value::as_map).cloned()
                };
                let Some(source) = source else {
                    self.op_error(op, player, "invert_map source is not a map");
                    return true;
                };
                let mut inverted: IndexMap<String, Value> = IndexMap::new();
                for (key, value) in source {
                    let new_key = value.printable();
                    if inverted
                        .insert(new_key.clone(), Value::String(key))
                        .is_some()
                    {
                        tracing::warn!(
                            session = self.session_code,
                            duplicate = new_key,
                            "invert_map with duplicate values, later entry wins."
                        );
                    }
                }
                self.write(out, Value::Map(inverted), player, locals);
                true
            }

            Op::ComposeMaps { m1, m2, out } => {
                let (first, second) = {
                    let scope = Scope {
                        globals: &mut self.globals,
                        locals: locals.as_deref_mut(),
                    };
                    (
                        scope.read(m1).and_then(Value::as_map).cloned(),
                        scope.read(m2).and_then(Value::as_map).cloned(),
                    )
                };
                let (Some(first), Some(second)) = (first, second) else {
                    self.op_error(op, player, "compose_maps arguments are not maps");
                    return true;
                };
                let mut composed: IndexMap<String, Value> = IndexMap::new();
                for (key, value) in first {
                    let middle = value.printable();
                    match second.get(&middle) {
                        Some(target) => {
                            composed.insert(key, target.clone());
                        }
                        None => {
                            tracing::error!(
                                session = self.session_code,
                                key,
                                middle,
                                "compose_maps second stage misses a key, dropping entry."
                            );
                        }
                    }
                }
                self.write(out, Value::Map(composed), player, locals);
                true
            }

            Op::OurPlayerId { out } => match player {
                Some(player) => {
                    let id = Value::String(player.to_string());
                    self.write(out, id, Some(player), locals);
                    true
                }
                None => {
                    self.op_error(op, None, "our_player_id in the global cursor");
                    true
                }
            },

            Op::Unknown => {
                self.op_error(op, player, "unknown op kind");
                true
            }
        }
    }

    /// Writes through the cursor's scope with routing and error logging.
    fn write(
        &mut self,
        out: &str,
        value: Value,
        player: Option<PlayerId>,
        mut locals: Option<&mut VarMap>,
    ) {
        let mut scope = Scope {
            globals: &mut self.globals,
            locals: locals.as_deref_mut(),
        };
        if !scope.write(out, value) {
            tracing::error!(
                session = self.session_code,
                player = player.map(|p| p.to_string()).unwrap_or_default(),
                out,
                "Discarded op output."
            );
        }
    }

    /// Expands a prompt-like argument to plain text. A null stays empty so
    /// an omitted negative prompt does not read "null" upstream.
    fn expand_text(&self, value: &Value, locals: Option<&VarMap>) -> String {
        match expand(value, &self.globals, locals) {
            Value::Null => String::new(),
            other => other.printable(),
        }
    }

    /// Shared tail of the three generation ops: validate the destination,
    /// then emit the request effect. The dispatcher writes the result back
    /// asynchronously; the op itself never blocks its cursor.
    fn submit_generation(
        &mut self,
        op: &Op,
        player: Option<PlayerId>,
        out: &str,
        kind: GenerationKind,
        batch_size: u32,
        iterations: u32,
    ) {
        match classify(out) {
            None => {
                self.op_error(op, player, "generation without a destination variable");
            }
            Some(KeyScope::Local) if player.is_none() => {
                self.op_error(op, player, "local generation output in the global cursor");
            }
            Some(_) => {
                self.effects
                    .push_back(Effect::SubmitGeneration(GenerationSpec {
                        session_code: self.session_code.clone(),
                        player,
                        dest_var: out.to_string(),
                        kind,
                        batch_size,
                        iterations,
                    }));
            }
        }
    }

    /// Collects `each_var` from every per-player context, in member
    /// iteration order. Returns `None` (after logging) when the op is used
    /// outside the global cursor or without a block.
    fn gather(
        &mut self,
        op: &Op,
        player: Option<PlayerId>,
        each_var: &str,
    ) -> Option<Vec<(PlayerId, Value)>> {
        if player.is_some() {
            self.op_error(op, player, "gather op inside a per-player block");
            return None;
        }
        if classify(each_var) != Some(KeyScope::Local) {
            self.op_error(op, player, "gather source must be a local variable");
            return None;
        }
        let Some(block) = self.block.as_ref() else {
            self.op_error(op, player, "gather op without a per_player block");
            return None;
        };
        let mut collected = Vec::with_capacity(block.cursors.len());
        for (&member, cursor) in &block.cursors {
            match cursor.locals.get(each_var) {
                Some(value) => collected.push((member, value.clone())),
                None => {
                    tracing::debug!(
                        session = self.session_code,
                        %member,
                        each_var,
                        "Gather skips a player without the variable."
                    );
                }
            }
        }
        Some(collected)
    }

    /// Uniform logging for script author mistakes. The cursor advances
    /// afterwards; a broken op never blocks the session.
    fn op_error(&self, op: &Op, player: Option<PlayerId>, problem: &str) {
        tracing::error!(
            session = self.session_code,
            op = op.kind_name(),
            player = player.map(|p| p.to_string()).unwrap_or_default(),
            problem,
            "Script error, advancing past the op."
        );
    }
}

/// The values of maximum multiplicity, ties preserved in first-appearance
/// order.
fn tally_winners(votes: &[Value]) -> Vec<Value> {
    let mut counted: Vec<(Value, usize)> = Vec::new();
    for vote in votes {
        match counted.iter_mut().find(|(value, _)| value == vote) {
            Some((_, count)) => *count += 1,
            None => counted.push((vote.clone(), 1)),
        }
    }
    let best = counted.iter().map(|(_, count)| *count).max().unwrap_or(0);
    counted
        .into_iter()
        .filter(|(_, count)| *count == best)
        .map(|(value, _)| value)
        .collect()
}
