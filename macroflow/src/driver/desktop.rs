//! Desktop input through rdev, with clipboard paste for text rdev cannot type.

use arboard::Clipboard;
use async_trait::async_trait;
use rdev::{simulate, Button, EventType, Key};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, warn};

use super::ActionDriver;
use crate::errors::ActionDriverError;
use crate::step::MouseButton;

/// Pause between synthesized events so the OS registers each one.
const EVENT_GAP: Duration = Duration::from_millis(20);
const MOVE_STEP: Duration = Duration::from_millis(10);

#[derive(Debug, Default)]
pub struct RdevDriver {
    /// Last position this driver moved to; rdev cannot query the cursor.
    position: Mutex<Option<(f64, f64)>>,
}

impl RdevDriver {
    pub fn new() -> Self {
        Self::default()
    }

    fn last_position(&self) -> Option<(f64, f64)> {
        self.position.lock().ok().and_then(|p| *p)
    }

    fn set_position(&self, x: f64, y: f64) {
        if let Ok(mut p) = self.position.lock() {
            *p = Some((x, y));
        }
    }
}

async fn send(event: EventType) -> Result<(), ActionDriverError> {
    simulate(&event).map_err(|e| ActionDriverError::Synthesis(format!("{event:?}: {e:?}")))?;
    tokio::time::sleep(EVENT_GAP).await;
    Ok(())
}

fn button(b: MouseButton) -> Button {
    match b {
        MouseButton::Left => Button::Left,
        MouseButton::Right => Button::Right,
        MouseButton::Middle => Button::Middle,
    }
}

fn paste_modifier() -> Key {
    if cfg!(target_os = "macos") {
        Key::MetaLeft
    } else {
        Key::ControlLeft
    }
}

/// Maps a hotkey name (`ctrl`, `enter`, `f5`, `a`, ...) to a key.
fn parse_key(name: &str) -> Result<Key, ActionDriverError> {
    let lower = name.trim().to_lowercase();
    let key = match lower.as_str() {
        "ctrl" | "control" => Key::ControlLeft,
        "shift" => Key::ShiftLeft,
        "alt" | "option" => Key::Alt,
        "cmd" | "command" | "win" | "meta" | "super" => Key::MetaLeft,
        "enter" | "return" => Key::Return,
        "esc" | "escape" => Key::Escape,
        "tab" => Key::Tab,
        "space" => Key::Space,
        "backspace" => Key::Backspace,
        "delete" | "del" => Key::Delete,
        "insert" => Key::Insert,
        "home" => Key::Home,
        "end" => Key::End,
        "pageup" | "page_up" => Key::PageUp,
        "pagedown" | "page_down" => Key::PageDown,
        "up" => Key::UpArrow,
        "down" => Key::DownArrow,
        "left" => Key::LeftArrow,
        "right" => Key::RightArrow,
        "capslock" => Key::CapsLock,
        "f1" => Key::F1,
        "f2" => Key::F2,
        "f3" => Key::F3,
        "f4" => Key::F4,
        "f5" => Key::F5,
        "f6" => Key::F6,
        "f7" => Key::F7,
        "f8" => Key::F8,
        "f9" => Key::F9,
        "f10" => Key::F10,
        "f11" => Key::F11,
        "f12" => Key::F12,
        other => {
            let mut chars = other.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) => char_key(c)
                    .map(|(k, _)| k)
                    .ok_or_else(|| ActionDriverError::UnknownKey(name.to_string()))?,
                _ => return Err(ActionDriverError::UnknownKey(name.to_string())),
            }
        }
    };
    Ok(key)
}

/// Key for a character on a US layout, and whether shift is needed.
fn char_key(c: char) -> Option<(Key, bool)> {
    let shifted = c.is_ascii_uppercase();
    let key = match c.to_ascii_lowercase() {
        'a' => Key::KeyA,
        'b' => Key::KeyB,
        'c' => Key::KeyC,
        'd' => Key::KeyD,
        'e' => Key::KeyE,
        'f' => Key::KeyF,
        'g' => Key::KeyG,
        'h' => Key::KeyH,
        'i' => Key::KeyI,
        'j' => Key::KeyJ,
        'k' => Key::KeyK,
        'l' => Key::KeyL,
        'm' => Key::KeyM,
        'n' => Key::KeyN,
        'o' => Key::KeyO,
        'p' => Key::KeyP,
        'q' => Key::KeyQ,
        'r' => Key::KeyR,
        's' => Key::KeyS,
        't' => Key::KeyT,
        'u' => Key::KeyU,
        'v' => Key::KeyV,
        'w' => Key::KeyW,
        'x' => Key::KeyX,
        'y' => Key::KeyY,
        'z' => Key::KeyZ,
        '0' => Key::Num0,
        '1' => Key::Num1,
        '2' => Key::Num2,
        '3' => Key::Num3,
        '4' => Key::Num4,
        '5' => Key::Num5,
        '6' => Key::Num6,
        '7' => Key::Num7,
        '8' => Key::Num8,
        '9' => Key::Num9,
        ' ' => Key::Space,
        '\n' => Key::Return,
        '\t' => Key::Tab,
        '-' => Key::Minus,
        '=' => Key::Equal,
        ',' => Key::Comma,
        '.' => Key::Dot,
        '/' => Key::Slash,
        ';' => Key::SemiColon,
        '\'' => Key::Quote,
        '[' => Key::LeftBracket,
        ']' => Key::RightBracket,
        '\\' => Key::BackSlash,
        _ => return None,
    };
    Some((key, shifted))
}

async fn tap(key: Key, shift: bool) -> Result<(), ActionDriverError> {
    if shift {
        send(EventType::KeyPress(Key::ShiftLeft)).await?;
    }
    send(EventType::KeyPress(key)).await?;
    send(EventType::KeyRelease(key)).await?;
    if shift {
        send(EventType::KeyRelease(Key::ShiftLeft)).await?;
    }
    Ok(())
}

fn send_blocking(event: EventType) -> Result<(), ActionDriverError> {
    simulate(&event).map_err(|e| ActionDriverError::Synthesis(format!("{event:?}: {e:?}")))?;
    std::thread::sleep(EVENT_GAP);
    Ok(())
}

/// Pastes `text` through the clipboard, restoring the previous clipboard text.
/// Blocking; the clipboard handle stays on one thread.
fn paste(text: String) -> Result<(), ActionDriverError> {
    let mut clipboard = Clipboard::new()
        .map_err(|e| ActionDriverError::Clipboard(format!("Failed to access clipboard: {e}")))?;
    let previous = clipboard.get_text().ok();
    clipboard
        .set_text(text)
        .map_err(|e| ActionDriverError::Clipboard(format!("Failed to set clipboard: {e}")))?;

    let modifier = paste_modifier();
    let result = send_blocking(EventType::KeyPress(modifier))
        .and_then(|_| send_blocking(EventType::KeyPress(Key::KeyV)))
        .and_then(|_| send_blocking(EventType::KeyRelease(Key::KeyV)))
        .and_then(|_| send_blocking(EventType::KeyRelease(modifier)));
    // Let the target read the clipboard before it is restored.
    std::thread::sleep(Duration::from_millis(100));

    if let Some(previous) = previous {
        if let Err(e) = clipboard.set_text(previous) {
            warn!("Failed to restore clipboard: {}", e);
        }
    }
    result
}

#[async_trait]
impl ActionDriver for RdevDriver {
    async fn click(
        &self,
        x: i32,
        y: i32,
        b: MouseButton,
        count: u32,
    ) -> Result<(), ActionDriverError> {
        let (fx, fy) = (f64::from(x), f64::from(y));
        send(EventType::MouseMove { x: fx, y: fy }).await?;
        self.set_position(fx, fy);
        for _ in 0..count.max(1) {
            send(EventType::ButtonPress(button(b))).await?;
            send(EventType::ButtonRelease(button(b))).await?;
        }
        debug!("Clicked {} x{} at ({}, {})", b, count, x, y);
        Ok(())
    }

    async fn move_to(&self, x: i32, y: i32, duration: Duration) -> Result<(), ActionDriverError> {
        let (tx, ty) = (f64::from(x), f64::from(y));
        let steps = (duration.as_millis() / MOVE_STEP.as_millis()) as u32;
        if let (Some((sx, sy)), true) = (self.last_position(), steps > 1) {
            for i in 1..steps {
                let t = f64::from(i) / f64::from(steps);
                simulate(&EventType::MouseMove {
                    x: sx + (tx - sx) * t,
                    y: sy + (ty - sy) * t,
                })
                .map_err(|e| ActionDriverError::Synthesis(format!("mouse move: {e:?}")))?;
                tokio::time::sleep(MOVE_STEP).await;
            }
        }
        send(EventType::MouseMove { x: tx, y: ty }).await?;
        self.set_position(tx, ty);
        Ok(())
    }

    async fn type_text(&self, text: &str, interval: Duration) -> Result<(), ActionDriverError> {
        let keys: Option<Vec<(Key, bool)>> = text.chars().map(char_key).collect();
        match keys {
            Some(keys) => {
                for (key, shift) in keys {
                    tap(key, shift).await?;
                    if !interval.is_zero() {
                        tokio::time::sleep(interval).await;
                    }
                }
                Ok(())
            }
            None => {
                debug!("Pasting {} chars through the clipboard", text.chars().count());
                let text = text.to_string();
                tokio::task::spawn_blocking(move || paste(text))
                    .await
                    .map_err(|e| ActionDriverError::Clipboard(format!("paste task failed: {e}")))?
            }
        }
    }

    async fn hotkey(&self, names: &[String]) -> Result<(), ActionDriverError> {
        let keys = names.iter().map(|n| parse_key(n)).collect::<Result<Vec<_>, _>>()?;
        if keys.is_empty() {
            return Err(ActionDriverError::UnknownKey(String::new()));
        }
        for key in &keys {
            send(EventType::KeyPress(*key)).await?;
        }
        for key in keys.iter().rev() {
            send(EventType::KeyRelease(*key)).await?;
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "rdev"
    }
}
