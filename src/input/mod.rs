//! Keyboard/mouse event protocol on the `input` channel.
//!
//! The controller encodes its local events into channel messages carrying
//! Windows virtual-key codes and normalized coordinates; the controlled side
//! validates the addressee and password hash before handing the event to the
//! OS injector. Authority lives with the controlled side.

use log::debug;
use thiserror::Error;

use crate::wire::{ChannelMessage, MSG_KEYBOARD, MSG_MOUSE};

pub const FLAG_DOWN: &str = "down";
pub const FLAG_UP: &str = "up";
pub const FLAG_MOVE: &str = "move";
pub const FLAG_WHEEL: &str = "wheel";
pub const FLAG_DOUBLE_CLICK: &str = "doubleClick";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MouseFlag {
    Down,
    Up,
    Move,
    Wheel,
    DoubleClick,
}

impl MouseFlag {
    pub fn as_str(&self) -> &'static str {
        match self {
            MouseFlag::Down => FLAG_DOWN,
            MouseFlag::Up => FLAG_UP,
            MouseFlag::Move => FLAG_MOVE,
            MouseFlag::Wheel => FLAG_WHEEL,
            MouseFlag::DoubleClick => FLAG_DOUBLE_CLICK,
        }
    }

    pub fn parse(text: &str) -> Option<Self> {
        match text {
            FLAG_DOWN => Some(MouseFlag::Down),
            FLAG_UP => Some(MouseFlag::Up),
            FLAG_MOVE => Some(MouseFlag::Move),
            FLAG_WHEEL => Some(MouseFlag::Wheel),
            FLAG_DOUBLE_CLICK => Some(MouseFlag::DoubleClick),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyFlag {
    Down,
    Up,
}

impl KeyFlag {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyFlag::Down => FLAG_DOWN,
            KeyFlag::Up => FLAG_UP,
        }
    }

    pub fn parse(text: &str) -> Option<Self> {
        match text {
            FLAG_DOWN => Some(KeyFlag::Down),
            FLAG_UP => Some(KeyFlag::Up),
            _ => None,
        }
    }
}

/// Button numbering: 0 none, 1 left, 2 right, 3 middle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MouseEvent {
    pub button: i32,
    /// Normalized coordinates in `[0, 1]`; out-of-range values are still
    /// forwarded and clamped at injection time.
    pub x: f64,
    pub y: f64,
    pub wheel: i32,
    pub flag: MouseFlag,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyEvent {
    /// Windows virtual-key value; the controller translates local key ids
    /// into this space before sending.
    pub key: i32,
    pub flag: KeyFlag,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InputEvent {
    Mouse(MouseEvent),
    Keyboard(KeyEvent),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum InputAuthError {
    #[error("input event from unexpected sender")]
    WrongSender,
    #[error("input event addressed to another receiver")]
    WrongReceiver,
    #[error("input event password mismatch")]
    WrongPassword,
}

/// Encodes an event for the wire, stamped with the session identity so the
/// controlled side can authenticate it.
pub fn encode_event(
    event: &InputEvent,
    sender: &str,
    receiver: &str,
    receiver_pwd: &str,
) -> ChannelMessage {
    let mut msg = match event {
        InputEvent::Mouse(mouse) => {
            let mut msg = ChannelMessage::new(MSG_MOUSE);
            msg.button = Some(mouse.button);
            msg.x = Some(mouse.x);
            msg.y = Some(mouse.y);
            msg.mouse_data = Some(mouse.wheel);
            msg.dw_flags = Some(mouse.flag.as_str().to_string());
            msg
        }
        InputEvent::Keyboard(key) => {
            let mut msg = ChannelMessage::new(MSG_KEYBOARD);
            msg.key = Some(key.key);
            msg.dw_flags = Some(key.flag.as_str().to_string());
            msg
        }
    };
    msg.sender = Some(sender.to_string());
    msg.receiver = Some(receiver.to_string());
    msg.receiver_pwd = Some(receiver_pwd.to_string());
    msg
}

/// Per-session authentication gate for inbound input messages.
#[derive(Debug, Clone)]
pub struct InputGate {
    local_id: String,
    local_pwd_md5: String,
    remote_id: String,
}

impl InputGate {
    pub fn new(local_id: &str, local_pwd_md5: &str, remote_id: &str) -> Self {
        Self {
            local_id: local_id.to_string(),
            local_pwd_md5: local_pwd_md5.to_string(),
            remote_id: remote_id.to_string(),
        }
    }

    /// Checks sender, receiver, and password hash. Failures drop the message
    /// at the caller; nothing is injected.
    pub fn validate(&self, msg: &ChannelMessage) -> Result<(), InputAuthError> {
        if msg.sender.as_deref() != Some(self.remote_id.as_str()) {
            return Err(InputAuthError::WrongSender);
        }
        if msg.receiver.as_deref() != Some(self.local_id.as_str()) {
            return Err(InputAuthError::WrongReceiver);
        }
        if msg.receiver_pwd.as_deref() != Some(self.local_pwd_md5.as_str()) {
            return Err(InputAuthError::WrongPassword);
        }
        Ok(())
    }
}

/// Decodes a validated channel message into an event. `None` for messages
/// that are not input events (or are malformed).
pub fn parse_event(msg: &ChannelMessage) -> Option<InputEvent> {
    match msg.msg_type.as_str() {
        MSG_MOUSE => {
            let flag = MouseFlag::parse(msg.dw_flags.as_deref()?)?;
            // Out-of-range coordinates are forwarded as-is; the injector
            // clamps them onto the screen.
            Some(InputEvent::Mouse(MouseEvent {
                button: msg.button.unwrap_or(0),
                x: msg.x?,
                y: msg.y?,
                wheel: msg.mouse_data.unwrap_or(0),
                flag,
            }))
        }
        MSG_KEYBOARD => {
            let flag = KeyFlag::parse(msg.dw_flags.as_deref()?)?;
            Some(InputEvent::Keyboard(KeyEvent {
                key: msg.key?,
                flag,
            }))
        }
        _ => None,
    }
}

/// Seam to the OS input primitives. Implementations clamp normalized
/// coordinates into `[0, 1]` before mapping onto the screen.
pub trait InputInjector: Send + Sync {
    fn mouse(&self, event: &MouseEvent);
    fn keyboard(&self, event: &KeyEvent);
}

pub fn clamp_normalized(value: f64) -> f64 {
    value.clamp(0.0, 1.0)
}

/// Injector that only logs; used where no OS backend is wired up and in
/// tests.
#[derive(Debug, Default)]
pub struct NullInjector;

impl InputInjector for NullInjector {
    fn mouse(&self, event: &MouseEvent) {
        debug!(
            "mouse {:?} button={} at ({:.3}, {:.3})",
            event.flag,
            event.button,
            clamp_normalized(event.x),
            clamp_normalized(event.y)
        );
    }

    fn keyboard(&self, event: &KeyEvent) {
        debug!("keyboard {:?} vk={}", event.flag, event.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_key(flag: KeyFlag) -> ChannelMessage {
        encode_event(
            &InputEvent::Keyboard(KeyEvent { key: 0x41, flag }),
            "CTL",
            "CLI",
            "HASH",
        )
    }

    #[test]
    fn key_press_release_round_trip() {
        for (flag, text) in [(KeyFlag::Down, "down"), (KeyFlag::Up, "up")] {
            let msg = sample_key(flag);
            assert_eq!(msg.msg_type, MSG_KEYBOARD);
            assert_eq!(msg.dw_flags.as_deref(), Some(text));
            match parse_event(&msg) {
                Some(InputEvent::Keyboard(event)) => {
                    assert_eq!(event.key, 0x41);
                    assert_eq!(event.flag, flag);
                }
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[test]
    fn gate_rejects_wrong_password() {
        let gate = InputGate::new("CLI", "GOODHASH", "CTL");
        let mut msg = sample_key(KeyFlag::Down);
        assert_eq!(
            gate.validate(&msg),
            Err(InputAuthError::WrongPassword)
        );
        msg.receiver_pwd = Some("GOODHASH".into());
        assert_eq!(gate.validate(&msg), Ok(()));
    }

    #[test]
    fn gate_rejects_misaddressed_messages() {
        let gate = InputGate::new("CLI", "HASH", "CTL");
        let mut msg = sample_key(KeyFlag::Down);
        msg.receiver = Some("SOMEONE_ELSE".into());
        assert_eq!(gate.validate(&msg), Err(InputAuthError::WrongReceiver));

        let mut msg = sample_key(KeyFlag::Down);
        msg.sender = Some("IMPOSTOR".into());
        assert_eq!(gate.validate(&msg), Err(InputAuthError::WrongSender));
    }

    #[test]
    fn out_of_range_coordinates_still_parse() {
        // Forwarded as-is in both directions; clamping happens at injection.
        for (x, y) in [(1.7, 0.3), (-0.2, -1.0)] {
            let event = InputEvent::Mouse(MouseEvent {
                button: 1,
                x,
                y,
                wheel: 0,
                flag: MouseFlag::Move,
            });
            let msg = encode_event(&event, "CTL", "CLI", "HASH");
            match parse_event(&msg) {
                Some(InputEvent::Mouse(mouse)) => {
                    assert_eq!(mouse.x, x);
                    assert_eq!(mouse.y, y);
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(clamp_normalized(1.7), 1.0);
        assert_eq!(clamp_normalized(-0.2), 0.0);
    }

    #[test]
    fn wheel_event_carries_delta() {
        let event = InputEvent::Mouse(MouseEvent {
            button: 0,
            x: 0.5,
            y: 0.5,
            wheel: -120,
            flag: MouseFlag::Wheel,
        });
        let msg = encode_event(&event, "CTL", "CLI", "HASH");
        match parse_event(&msg) {
            Some(InputEvent::Mouse(mouse)) => {
                assert_eq!(mouse.wheel, -120);
                assert_eq!(mouse.flag, MouseFlag::Wheel);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
