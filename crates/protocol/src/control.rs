//! The loosely-typed JSON control language spoken over the browser-facing
//! WebSocket and WebRTC DataChannel.
//!
//! The wire is deliberately permissive: `type` may be a string or one of a
//! couple of legacy numeric aliases, fields are optional with sensible
//! defaults, and a message this parser doesn't recognize is logged and
//! dropped rather than rejected.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
pub enum InboundControl {
    Ping {
        id: Value,
    },
    Key {
        action: KeyAction,
        keycode: u32,
        repeat: u32,
        meta_state: u32,
    },
    Touch {
        action: TouchActionKind,
        pointer_id: u64,
        x: f64,
        y: f64,
        screen_width: u16,
        screen_height: u16,
        pressure: f32,
        action_button: u32,
        buttons: u32,
    },
    Scroll {
        x: f64,
        y: f64,
        screen_width: u16,
        screen_height: u16,
        h_scroll: f64,
        v_scroll: f64,
        buttons: u32,
    },
    ResetVideo,
    ClipboardGet,
    ClipboardSet {
        text: String,
        paste: bool,
        sequence: u64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAction {
    Down,
    Up,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TouchActionKind {
    Down,
    Up,
    Move,
}

#[derive(Debug, thiserror::Error)]
pub enum ControlParseError {
    #[error("not a JSON object")]
    NotAnObject,
    #[error("missing or unrecognized \"type\"")]
    UnrecognizedType,
    #[error("missing required field \"{0}\"")]
    MissingField(&'static str),
    #[error("field \"{0}\" has the wrong type")]
    BadField(&'static str),
}

fn field<'a>(obj: &'a serde_json::Map<String, Value>, name: &'static str) -> Result<&'a Value, ControlParseError> {
    obj.get(name).ok_or(ControlParseError::MissingField(name))
}

fn as_f64(v: &Value, name: &'static str) -> Result<f64, ControlParseError> {
    v.as_f64().ok_or(ControlParseError::BadField(name))
}

fn as_u64(v: &Value, name: &'static str) -> Result<u64, ControlParseError> {
    v.as_u64().ok_or(ControlParseError::BadField(name))
}

/// Parse one inbound JSON control message. Logging of unrecognized types is
/// the caller's responsibility (this just returns the error).
pub fn parse_inbound(value: &Value) -> Result<InboundControl, ControlParseError> {
    let obj = value.as_object().ok_or(ControlParseError::NotAnObject)?;
    let ty = obj.get("type").ok_or(ControlParseError::UnrecognizedType)?;

    let type_tag: String = if let Some(s) = ty.as_str() {
        s.to_string()
    } else if let Some(n) = ty.as_u64() {
        match n {
            8 => "clipboard_get".to_string(),
            9 => "clipboard_set".to_string(),
            _ => return Err(ControlParseError::UnrecognizedType),
        }
    } else {
        return Err(ControlParseError::UnrecognizedType);
    };

    match type_tag.as_str() {
        "ping" => Ok(InboundControl::Ping {
            id: obj.get("id").cloned().unwrap_or(Value::Null),
        }),
        "key" => {
            let action = match field(obj, "action")?.as_str() {
                Some("down") => KeyAction::Down,
                Some("up") => KeyAction::Up,
                _ => return Err(ControlParseError::BadField("action")),
            };
            let keycode = as_u64(field(obj, "keycode")?, "keycode")? as u32;
            let repeat = obj.get("repeat").and_then(Value::as_u64).unwrap_or(0) as u32;
            let meta_state = obj.get("meta_state").and_then(Value::as_u64).unwrap_or(0) as u32;
            Ok(InboundControl::Key {
                action,
                keycode,
                repeat,
                meta_state,
            })
        }
        "touch" => {
            let action = match field(obj, "action")?.as_str() {
                Some("down") => TouchActionKind::Down,
                Some("up") => TouchActionKind::Up,
                Some("move") => TouchActionKind::Move,
                _ => return Err(ControlParseError::BadField("action")),
            };
            let x = as_f64(field(obj, "x")?, "x")?;
            let y = as_f64(field(obj, "y")?, "y")?;
            let screen_width = as_u64(field(obj, "screen_width")?, "screen_width")? as u16;
            let screen_height = as_u64(field(obj, "screen_height")?, "screen_height")? as u16;
            let pointer_id = obj.get("pointer_id").and_then(Value::as_u64).unwrap_or(0);
            let pressure = obj.get("pressure").and_then(Value::as_f64).unwrap_or(1.0) as f32;
            let action_button = obj.get("action_button").and_then(Value::as_u64).unwrap_or(1) as u32;
            let buttons = obj.get("buttons").and_then(Value::as_u64).unwrap_or(1) as u32;
            Ok(InboundControl::Touch {
                action,
                pointer_id,
                x,
                y,
                screen_width,
                screen_height,
                pressure,
                action_button,
                buttons,
            })
        }
        "scroll" => {
            let x = as_f64(field(obj, "x")?, "x")?;
            let y = as_f64(field(obj, "y")?, "y")?;
            let screen_width = as_u64(field(obj, "screen_width")?, "screen_width")? as u16;
            let screen_height = as_u64(field(obj, "screen_height")?, "screen_height")? as u16;
            let h_scroll = obj.get("h_scroll").and_then(Value::as_f64).unwrap_or(0.0);
            let v_scroll = obj.get("v_scroll").and_then(Value::as_f64).unwrap_or(0.0);
            let buttons = obj.get("buttons").and_then(Value::as_u64).unwrap_or(0) as u32;
            Ok(InboundControl::Scroll {
                x,
                y,
                screen_width,
                screen_height,
                h_scroll,
                v_scroll,
                buttons,
            })
        }
        "reset_video" => Ok(InboundControl::ResetVideo),
        "clipboard_get" => Ok(InboundControl::ClipboardGet),
        "clipboard_set" => {
            let text = field(obj, "text")?
                .as_str()
                .ok_or(ControlParseError::BadField("text"))?
                .to_string();
            let paste = obj.get("paste").and_then(Value::as_bool).unwrap_or(false);
            let sequence = obj.get("sequence").and_then(Value::as_u64).unwrap_or(0);
            Ok(InboundControl::ClipboardSet { text, paste, sequence })
        }
        _ => Err(ControlParseError::UnrecognizedType),
    }
}

/// Clamp a normalized `[0.0, 1.0]` coordinate into device pixels, per the
/// `[0, screen_width] × [0, screen_height]` clamp on injected coordinates.
/// Returns `None` if the input coordinate falls outside `[0.0, 1.0]` — those
/// injections are dropped rather than clamped, since they indicate a client
/// reporting a point outside its own video surface.
pub fn normalize_coordinate(fraction: f64, screen_extent: u16) -> Option<u32> {
    if !(0.0..=1.0).contains(&fraction) {
        return None;
    }
    Some((fraction * screen_extent as f64).round() as u32)
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum OutboundControlReply {
    #[serde(rename = "pong")]
    Pong { id: Value, timestamp_ms: u64 },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_ping() {
        let v = json!({"type": "ping", "id": 42});
        assert_eq!(parse_inbound(&v).unwrap(), InboundControl::Ping { id: json!(42) });
    }

    #[test]
    fn parses_numeric_clipboard_aliases() {
        assert_eq!(parse_inbound(&json!({"type": 8})).unwrap(), InboundControl::ClipboardGet);
        let set = parse_inbound(&json!({"type": 9, "text": "hi"})).unwrap();
        assert_eq!(
            set,
            InboundControl::ClipboardSet {
                text: "hi".into(),
                paste: false,
                sequence: 0
            }
        );
    }

    #[test]
    fn unknown_type_is_an_error_not_a_panic() {
        assert!(matches!(
            parse_inbound(&json!({"type": "flibbertigibbet"})),
            Err(ControlParseError::UnrecognizedType)
        ));
        assert!(matches!(
            parse_inbound(&json!({"type": 200})),
            Err(ControlParseError::UnrecognizedType)
        ));
    }

    /// Scenario 3 from spec §8: touch encoding, at the JSON-parse layer.
    #[test]
    fn touch_scenario_parses_and_normalizes() {
        let v = json!({
            "type": "touch",
            "action": "down",
            "x": 0.0,
            "y": 0.0,
            "screen_width": 1080,
            "screen_height": 1920,
            "pressure": 1.0,
        });
        let parsed = parse_inbound(&v).unwrap();
        match parsed {
            InboundControl::Touch {
                action,
                x,
                y,
                screen_width,
                screen_height,
                pressure,
                action_button,
                buttons,
                ..
            } => {
                assert_eq!(action, TouchActionKind::Down);
                assert_eq!(normalize_coordinate(x, screen_width), Some(0));
                assert_eq!(normalize_coordinate(y, screen_height), Some(0));
                assert_eq!(pressure, 1.0);
                assert_eq!(action_button, 1);
                assert_eq!(buttons, 1);
            }
            other => panic!("expected Touch, got {other:?}"),
        }
    }

    #[test]
    fn out_of_range_coordinate_is_dropped() {
        assert_eq!(normalize_coordinate(1.5, 1080), None);
        assert_eq!(normalize_coordinate(-0.1, 1080), None);
        assert_eq!(normalize_coordinate(1.0, 1080), Some(1080));
    }

    #[test]
    fn pong_reply_serializes_with_tag() {
        let reply = OutboundControlReply::Pong {
            id: json!(1),
            timestamp_ms: 1_700_000_000_000,
        };
        let v = serde_json::to_value(&reply).unwrap();
        assert_eq!(v["type"], "pong");
        assert_eq!(v["id"], 1);
    }
}
