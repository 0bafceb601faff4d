//! The message types that travel between the party server and its players.
//! Every frame is a JSON object with a `kind` discriminator field; the fields
//! of each kind are camelCase. Also contains the [`Value`] sum type that game
//! scripts, client inputs and UI commands exchange.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The opaque 128 bit id a player mints for itself on first contact.
pub type PlayerId = Uuid;

/// The length of a session code.
pub const SESSION_CODE_LEN: usize = 4;

/// The alphabet session codes are drawn from (uppercase alphanumeric).
pub const SESSION_CODE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// A value as it lives in the variable store and on the wire.
///
/// Sets only ever originate on the server (gathering ops); on the wire they
/// are indistinguishable from lists, so inbound JSON arrays always decode as
/// [`Value::List`]. Maps keep insertion order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// The explicit absence marker (JSON null).
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    List(Vec<Value>),
    /// Like a list, but without duplicates. Insertion order is kept so the
    /// rendering stays deterministic.
    Set(Vec<Value>),
    Map(IndexMap<String, Value>),
}

impl Value {
    /// A short tag for log messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::List(_) => "list",
            Value::Set(_) => "set",
            Value::Map(_) => "map",
        }
    }

    /// The printable form used when a variable is spliced into a string.
    /// Numbers that hold an integral value render without a fractional part.
    pub fn printable(&self) -> String {
        match self {
            Value::Null => "null".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => format_number(*n),
            Value::String(s) => s.clone(),
            Value::List(items) | Value::Set(items) => {
                let inner: Vec<String> = items.iter().map(Value::printable).collect();
                format!("[{}]", inner.join(", "))
            }
            Value::Map(entries) => {
                let inner: Vec<String> = entries
                    .iter()
                    .map(|(k, v)| format!("{}: {}", k, v.printable()))
                    .collect();
                format!("{{{}}}", inner.join(", "))
            }
        }
    }

    /// Builds a set from the given elements, collapsing duplicates while
    /// keeping first-insertion order.
    pub fn set_from(items: impl IntoIterator<Item = Value>) -> Value {
        let mut unique: Vec<Value> = Vec::new();
        for item in items {
            if !unique.contains(&item) {
                unique.push(item);
            }
        }
        Value::Set(unique)
    }

    /// The string inside, if this is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// The elements inside, if this is a list or a set.
    pub fn as_items(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) | Value::Set(items) => Some(items),
            _ => None,
        }
    }

    /// The entries inside, if this is a map.
    pub fn as_map(&self) -> Option<&IndexMap<String, Value>> {
        match self {
            Value::Map(entries) => Some(entries),
            _ => None,
        }
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::Null
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Number(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

/// Renders a number the way JSON would, but without the trailing `.0` on
/// integral values.
fn format_number(n: f64) -> String {
    if n.is_finite() && n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

/// A UI instruction for the front end. The server treats `command` and
/// `param` as opaque; `sendToAll` is only meaningful inside game scripts and
/// is stripped before a command reaches the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UiCommand {
    /// The front end command name (e.g. which screen to show).
    pub command: String,
    /// The payload for the command.
    #[serde(default = "default_param")]
    pub param: Value,
    /// Whether a per-player script step should broadcast this command to the
    /// whole session instead of only its own player.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub send_to_all: Option<bool>,
}

fn default_param() -> Value {
    Value::Null
}

impl Default for UiCommand {
    fn default() -> Self {
        UiCommand {
            command: String::new(),
            param: Value::Null,
            send_to_all: None,
        }
    }
}

/// Everything a player may send to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Courtesy round-trip on connect.
    Hello { text: String },
    /// Host a fresh session; the server answers with `GameStarting`.
    StartNewGame { player_id: PlayerId },
    /// Join an existing session by code.
    JoinGame {
        session_code: String,
        player_id: PlayerId,
    },
    /// Leave whatever session we are currently in.
    LeaveGame {},
    /// The pre-game vote for a named mini game.
    ChooseGame { name: String },
    /// Scripted input: each entry is written to the variable store.
    ClientInput { inputs: IndexMap<String, Value> },
}

/// Everything the server may send to a player.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// Courtesy reply to the client hello.
    Hello { text: String },
    /// A session exists now (or again); carries its join code.
    GameStarting { session_code: String },
    /// Broadcast to all members when the membership changed and a game
    /// should be selected.
    SelectGame { session_code: String },
    /// A join attempt was refused.
    FailedToJoin { reason: String },
    /// An opaque UI instruction for the front end.
    ClientUi { command: UiCommand },
    /// Back to the lobby. A missing reason means normal termination.
    ReturnToLobby { interrupted_reason: Option<String> },
}

impl ClientMessage {
    /// Extracts the player id for message kinds that identify the sender.
    pub fn player_id(&self) -> Option<PlayerId> {
        match self {
            ClientMessage::StartNewGame { player_id } => Some(*player_id),
            ClientMessage::JoinGame { player_id, .. } => Some(*player_id),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_messages_round_trip() {
        let player = Uuid::new_v4();
        let mut inputs = IndexMap::new();
        inputs.insert("@@prompt".to_string(), Value::from("kermit"));
        let messages = vec![
            ClientMessage::Hello {
                text: "hi".to_string(),
            },
            ClientMessage::StartNewGame { player_id: player },
            ClientMessage::JoinGame {
                session_code: "AB12".to_string(),
                player_id: player,
            },
            ClientMessage::LeaveGame {},
            ClientMessage::ChooseGame {
                name: "mood".to_string(),
            },
            ClientMessage::ClientInput { inputs },
        ];
        for message in messages {
            let encoded = serde_json::to_string(&message).unwrap();
            let decoded: ClientMessage = serde_json::from_str(&encoded).unwrap();
            assert_eq!(message, decoded);
        }
    }

    #[test]
    fn server_messages_round_trip() {
        let messages = vec![
            ServerMessage::Hello {
                text: "hi".to_string(),
            },
            ServerMessage::GameStarting {
                session_code: "XY77".to_string(),
            },
            ServerMessage::SelectGame {
                session_code: "XY77".to_string(),
            },
            ServerMessage::FailedToJoin {
                reason: "no such session".to_string(),
            },
            ServerMessage::ClientUi {
                command: UiCommand {
                    command: "show_image".to_string(),
                    param: Value::from("abc"),
                    send_to_all: None,
                },
            },
            ServerMessage::ReturnToLobby {
                interrupted_reason: None,
            },
            ServerMessage::ReturnToLobby {
                interrupted_reason: Some("fatal script error".to_string()),
            },
        ];
        for message in messages {
            let encoded = serde_json::to_string(&message).unwrap();
            let decoded: ServerMessage = serde_json::from_str(&encoded).unwrap();
            assert_eq!(message, decoded);
        }
    }

    #[test]
    fn wire_fields_are_camel_case() {
        let encoded = serde_json::to_string(&ClientMessage::JoinGame {
            session_code: "AB12".to_string(),
            player_id: Uuid::nil(),
        })
        .unwrap();
        assert!(encoded.contains("\"kind\":\"JoinGame\""));
        assert!(encoded.contains("\"sessionCode\""));
        assert!(encoded.contains("\"playerId\""));
    }

    #[test]
    fn values_decode_untagged() {
        let decoded: Value = serde_json::from_str("null").unwrap();
        assert_eq!(decoded, Value::Null);
        let decoded: Value = serde_json::from_str("true").unwrap();
        assert_eq!(decoded, Value::Bool(true));
        let decoded: Value = serde_json::from_str("3.5").unwrap();
        assert_eq!(decoded, Value::Number(3.5));
        let decoded: Value = serde_json::from_str("\"hi\"").unwrap();
        assert_eq!(decoded, Value::from("hi"));
        let decoded: Value = serde_json::from_str("[1, 2]").unwrap();
        assert_eq!(
            decoded,
            Value::List(vec![Value::Number(1.0), Value::Number(2.0)])
        );
        let decoded: Value = serde_json::from_str("{\"a\": 1}").unwrap();
        let Value::Map(entries) = decoded else {
            panic!("expected a map");
        };
        assert_eq!(entries["a"], Value::Number(1.0));
    }

    #[test]
    fn sets_serialize_as_arrays() {
        let set = Value::set_from(vec![Value::from("a"), Value::from("b"), Value::from("a")]);
        assert_eq!(set.as_items().unwrap().len(), 2);
        let encoded = serde_json::to_string(&set).unwrap();
        assert_eq!(encoded, "[\"a\",\"b\"]");
    }

    #[test]
    fn printable_forms_are_deterministic() {
        assert_eq!(Value::Number(4.0).printable(), "4");
        assert_eq!(Value::Number(4.5).printable(), "4.5");
        assert_eq!(Value::Bool(true).printable(), "true");
        assert_eq!(Value::from("hi").printable(), "hi");
        let list = Value::List(vec![Value::Number(1.0), Value::from("x")]);
        assert_eq!(list.printable(), "[1, x]");
        let mut entries = IndexMap::new();
        entries.insert("k".to_string(), Value::Number(2.0));
        assert_eq!(Value::Map(entries).printable(), "{k: 2}");
    }
}
