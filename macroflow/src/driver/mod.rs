//! Action Driver: the input-synthesis contract the engine drives.

use async_trait::async_trait;
use std::sync::Mutex;
use std::time::Duration;
use tracing::info;

use crate::errors::ActionDriverError;
use crate::step::MouseButton;

#[cfg(feature = "input")]
mod desktop;

#[cfg(feature = "input")]
pub use desktop::RdevDriver;

/// Injects mouse and keyboard input. Each call returns once the action has been
/// delivered.
#[async_trait]
pub trait ActionDriver: Send + Sync {
    async fn click(
        &self,
        x: i32,
        y: i32,
        button: MouseButton,
        count: u32,
    ) -> Result<(), ActionDriverError>;

    async fn move_to(&self, x: i32, y: i32, duration: Duration) -> Result<(), ActionDriverError>;

    async fn type_text(&self, text: &str, interval: Duration) -> Result<(), ActionDriverError>;

    async fn hotkey(&self, keys: &[String]) -> Result<(), ActionDriverError>;

    fn name(&self) -> &str {
        "driver"
    }
}

/// An action as delivered to a driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverAction {
    Click { x: i32, y: i32, button: MouseButton, count: u32 },
    Move { x: i32, y: i32, duration: Duration },
    Type { text: String, interval: Duration },
    Hotkey { keys: Vec<String> },
}

impl std::fmt::Display for DriverAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DriverAction::Click { x, y, button, count } => {
                write!(f, "click {button} x{count} at ({x}, {y})")
            }
            DriverAction::Move { x, y, duration } => {
                write!(f, "move to ({x}, {y}) over {duration:?}")
            }
            DriverAction::Type { text, .. } => write!(f, "type {text:?}"),
            DriverAction::Hotkey { keys } => write!(f, "hotkey {}", keys.join("+")),
        }
    }
}

/// Logs and records actions without touching the desktop.
#[derive(Debug, Default)]
pub struct DryRunDriver {
    actions: Mutex<Vec<DriverAction>>,
}

impl DryRunDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Actions received so far, in order.
    pub fn actions(&self) -> Vec<DriverAction> {
        self.actions.lock().map(|a| a.clone()).unwrap_or_default()
    }

    fn record(&self, action: DriverAction) -> Result<(), ActionDriverError> {
        info!("[dry-run] {}", action);
        self.actions
            .lock()
            .map_err(|_| ActionDriverError::Synthesis("dry-run action log poisoned".to_string()))?
            .push(action);
        Ok(())
    }
}

#[async_trait]
impl ActionDriver for DryRunDriver {
    async fn click(
        &self,
        x: i32,
        y: i32,
        button: MouseButton,
        count: u32,
    ) -> Result<(), ActionDriverError> {
        self.record(DriverAction::Click { x, y, button, count })
    }

    async fn move_to(&self, x: i32, y: i32, duration: Duration) -> Result<(), ActionDriverError> {
        self.record(DriverAction::Move { x, y, duration })
    }

    async fn type_text(&self, text: &str, interval: Duration) -> Result<(), ActionDriverError> {
        self.record(DriverAction::Type {
            text: text.to_string(),
            interval,
        })
    }

    async fn hotkey(&self, keys: &[String]) -> Result<(), ActionDriverError> {
        if keys.is_empty() {
            return Err(ActionDriverError::UnknownKey(String::new()));
        }
        self.record(DriverAction::Hotkey { keys: keys.to_vec() })
    }

    fn name(&self) -> &str {
        "dry-run"
    }
}
