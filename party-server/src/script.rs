//! The declarative mini-game scripts the engine interprets.
//!
//! A script is a finite ordered list of ops. Every op carries a `kind` tag
//! and a fixed set of named arguments; arguments are stored verbatim and
//! only expanded when the op executes. Script files are JSON documents in
//! the games directory and can be hot-reloaded without a restart, the same
//! way the relay reloads its game configuration.

use std::path::Path;
use std::sync::Arc;

use indexmap::IndexMap;
use protocol::{UiCommand, Value};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Parameters of a text-to-image generation step.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TextToImageParams {
    /// The positive prompt. May reference variables.
    pub prompt: Value,
    /// The optional negative prompt.
    pub negative_prompt: Value,
    /// How many images per iteration.
    pub batch_size: u32,
    /// How many iterations.
    pub iterations: u32,
}

/// Parameters of a depth-conditioned generation step.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DepthToImageParams {
    /// Asset path of the initial image the depth model conditions on.
    pub image: String,
    pub prompt: Value,
    pub negative_prompt: Value,
    /// How strongly the prompt overrides the initial image.
    pub denoising_strength: f64,
    pub batch_size: u32,
    pub iterations: u32,
}

/// One unit of scripted work.
///
/// All argument fields default when absent so an authoring mistake surfaces
/// as a logged script error at run time instead of refusing the whole file;
/// the engine advances past a broken op to keep the session alive. An op
/// kind this server does not know parses as [`Op::Unknown`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Op {
    /// Clear the global map and every local map.
    InitState,
    /// Emit a UI message to the executing player or the whole session.
    Ui {
        #[serde(default)]
        ui: UiCommand,
    },
    /// Pick one element uniformly and write it to `out`. A choices list
    /// that expands to a single list or set draws from that collection's
    /// elements, so a tallied tie can be broken in place.
    RandomChoice {
        #[serde(default)]
        choices: Vec<Value>,
        #[serde(default)]
        out: String,
    },
    /// Spawn one local cursor per current session member over the sub-script.
    PerPlayer {
        #[serde(default)]
        ops: Vec<Op>,
    },
    /// Block until `var` exists in the active context.
    WaitVar {
        #[serde(default)]
        var: String,
    },
    /// Block until every per-player context holds `var`. Global cursor only.
    WaitVarAll {
        #[serde(default)]
        var: String,
    },
    /// Submit a text-to-image request; the dispatcher writes `out` later.
    Txt2img {
        #[serde(default)]
        params: TextToImageParams,
        #[serde(default)]
        out: String,
    },
    /// Submit a depth-conditioned request.
    Depth2img {
        #[serde(default)]
        params: DepthToImageParams,
        #[serde(default)]
        out: String,
    },
    /// Submit a scribble-conditioned request.
    Sketch2img {
        #[serde(default)]
        prompt: Value,
        #[serde(default)]
        image: Value,
        #[serde(default)]
        out: String,
    },
    /// Write the insertion-order key list of a map variable.
    KeysToList {
        #[serde(default)]
        map_var: String,
        #[serde(default)]
        out: String,
    },
    /// Collect a local variable from every player context into a set.
    GatherSet {
        #[serde(default)]
        each_var: String,
        #[serde(default)]
        out: String,
    },
    /// Collect a local variable from every player context into a list.
    GatherList {
        #[serde(default)]
        each_var: String,
        #[serde(default)]
        out: String,
    },
    /// Build a player-id to value map over all players that have the key.
    GatherMapByPlayer {
        #[serde(default)]
        each_var: String,
        #[serde(default)]
        out: String,
    },
    /// Resolve a list of image ids against the per-game image cache.
    GatherImages {
        #[serde(default)]
        ids_var: String,
        #[serde(default)]
        out: String,
    },
    /// Count occurrences and write the argmax values as a list.
    Tally {
        #[serde(default)]
        votes_var: String,
        #[serde(default)]
        out: String,
    },
    /// Use the expanded key variable to pick a sub-value from `table`. The
    /// table is either an inline map or a variable reference expanding to
    /// one.
    Select {
        #[serde(default)]
        key_var: String,
        #[serde(default)]
        table: Value,
        #[serde(default)]
        out: String,
    },
    /// Expand `from` and write the result to `out`.
    Copy {
        #[serde(default)]
        from: Value,
        #[serde(default)]
        out: String,
    },
    /// Remove a variable.
    Delete {
        #[serde(default)]
        var: String,
    },
    /// Zip two same-length lists into a map.
    MakeMap {
        #[serde(default)]
        keys: Value,
        #[serde(default)]
        values: Value,
        #[serde(default)]
        out: String,
    },
    /// Deterministic 1:1 pairing, member i to member (i+1) mod N.
    PairPlayers {
        #[serde(default)]
        out: String,
    },
    /// Rename the keys of a map through a key translation map.
    RemapKeys {
        #[serde(default)]
        map_var: String,
        #[serde(default)]
        key_map: Value,
        #[serde(default)]
        out: String,
    },
    /// Swap keys and values.
    InvertMap {
        #[serde(default)]
        map_var: String,
        #[serde(default)]
        out: String,
    },
    /// Compose two maps: result maps k to m2[m1[k]].
    ComposeMaps {
        #[serde(default)]
        m1: String,
        #[serde(default)]
        m2: String,
        #[serde(default)]
        out: String,
    },
    /// Write the executing player's id. Per-player cursors only.
    OurPlayerId {
        #[serde(default)]
        out: String,
    },
    /// Any op kind we do not understand. Logged and skipped at run time.
    #[serde(other)]
    Unknown,
}

impl Op {
    /// The tag used in log messages.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Op::InitState => "init_state",
            Op::Ui { .. } => "ui",
            Op::RandomChoice { .. } => "random_choice",
            Op::PerPlayer { .. } => "per_player",
            Op::WaitVar { .. } => "wait_var",
            Op::WaitVarAll { .. } => "wait_var_all",
            Op::Txt2img { .. } => "txt2img",
            Op::Depth2img { .. } => "depth2img",
            Op::Sketch2img { .. } => "sketch2img",
            Op::KeysToList { .. } => "keys_to_list",
            Op::GatherSet { .. } => "gather_set",
            Op::GatherList { .. } => "gather_list",
            Op::GatherMapByPlayer { .. } => "gather_map_by_player",
            Op::GatherImages { .. } => "gather_images",
            Op::Tally { .. } => "tally",
            Op::Select { .. } => "select",
            Op::Copy { .. } => "copy",
            Op::Delete { .. } => "delete",
            Op::MakeMap { .. } => "make_map",
            Op::PairPlayers { .. } => "pair_players",
            Op::RemapKeys { .. } => "remap_keys",
            Op::InvertMap { .. } => "invert_map",
            Op::ComposeMaps { .. } => "compose_maps",
            Op::OurPlayerId { .. } => "our_player_id",
            Op::Unknown => "unknown",
        }
    }
}

/// A complete mini game: a display name plus its op list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameScript {
    /// The name players vote for.
    pub name: String,
    /// The ordered op list the global cursor runs.
    pub ops: Vec<Op>,
}

/// All loaded game scripts, keyed by name in load order.
pub type ScriptLibrary = IndexMap<String, Arc<GameScript>>;

/// What can go wrong while loading the games directory.
#[derive(Debug, Error)]
pub enum ScriptLoadError {
    #[error("failed to read games directory: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse script {file}: {source}")]
    Parse {
        file: String,
        source: serde_json::Error,
    },
}

/// Reads every `*.json` file in the games directory into a fresh library.
/// A parse error in any file fails the whole reload, so a half-broken
/// library never goes live.
pub async fn load_library(dir: &Path) -> Result<ScriptLibrary, ScriptLoadError> {
    let mut library = ScriptLibrary::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut files: Vec<std::path::PathBuf> = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "json") {
            files.push(path);
        }
    }
    // Stable load order independent of directory enumeration.
    files.sort();

    for path in files {
        let content = tokio::fs::read_to_string(&path).await?;
        let script: GameScript =
            serde_json::from_str(&content).map_err(|source| ScriptLoadError::Parse {
                file: path.display().to_string(),
                source,
            })?;
        tracing::info!(game = script.name, file = %path.display(), ops = script.ops.len(), "Loaded game script.");
        library.insert(script.name.clone(), Arc::new(script));
    }
    Ok(library)
}
