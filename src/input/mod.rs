//! Input Module - Mouse and Keyboard Injection
//!
//! SAFETY: real injection is disabled by default and requires explicit opt-in
//! via the `input` feature flag: `--features input`
//!
//! # Safety Mechanisms
//! - Disabled by default (requires --features input)
//! - Emergency kill switch shared by every injector
//! - Text length cap per call
//! - Dry-run injector that only records what would have been sent

#[cfg(feature = "input")]
use enigo::{Enigo, Keyboard, Mouse, Settings};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use thiserror::Error;
use tracing::info;

/// Global kill switch; once set no injector sends anything until restart
static INPUT_KILL_SWITCH: AtomicBool = AtomicBool::new(false);

const MAX_TEXT_LEN: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MouseButton {
    Left,
    Right,
}

/// Input errors
#[derive(Debug, Error)]
pub enum InputError {
    #[error("injection unavailable: {0}")]
    InjectionUnavailable(String),

    #[error("Emergency kill switch is active. Restart required")]
    KillSwitchActive,

    #[error("Text too long ({0} chars). Max 10000 characters per call")]
    TextTooLong(usize),

    #[error("Mouse operation failed: {0}")]
    MouseError(String),

    #[error("Keyboard operation failed: {0}")]
    KeyboardError(String),
}

/// Transport for synthetic input
pub trait InputInjector: Send + Sync {
    fn name(&self) -> &str;
    fn move_cursor(&self, x: i32, y: i32) -> Result<(), InputError>;
    fn click(&self, button: MouseButton) -> Result<(), InputError>;
    fn type_text(&self, text: &str) -> Result<(), InputError>;
}

/// Activate emergency kill switch (cannot be reversed without restart)
pub fn activate_kill_switch() {
    INPUT_KILL_SWITCH.store(true, Ordering::SeqCst);
}

pub fn kill_switch_active() -> bool {
    INPUT_KILL_SWITCH.load(Ordering::SeqCst)
}

fn preflight(text: Option<&str>) -> Result<(), InputError> {
    if kill_switch_active() {
        return Err(InputError::KillSwitchActive);
    }
    match text {
        Some(t) if t.chars().count() > MAX_TEXT_LEN => Err(InputError::TextTooLong(t.chars().count())),
        _ => Ok(()),
    }
}

/// Local mouse/keyboard through enigo
#[cfg(feature = "input")]
#[derive(Default)]
pub struct EnigoInjector;

#[cfg(feature = "input")]
impl EnigoInjector {
    pub fn new() -> Self {
        Self
    }

    // Enigo is not Send on every platform; open a connection per call
    fn connect() -> Result<Enigo, InputError> {
        Enigo::new(&Settings::default()).map_err(|e| InputError::InjectionUnavailable(e.to_string()))
    }
}

#[cfg(feature = "input")]
impl InputInjector for EnigoInjector {
    fn name(&self) -> &str {
        "enigo"
    }

    fn move_cursor(&self, x: i32, y: i32) -> Result<(), InputError> {
        preflight(None)?;
        Self::connect()?
            .move_mouse(x, y, enigo::Coordinate::Abs)
            .map_err(|e| InputError::MouseError(e.to_string()))
    }

    fn click(&self, button: MouseButton) -> Result<(), InputError> {
        preflight(None)?;
        let btn = match button {
            MouseButton::Left => enigo::Button::Left,
            MouseButton::Right => enigo::Button::Right,
        };
        Self::connect()?
            .button(btn, enigo::Direction::Click)
            .map_err(|e| InputError::MouseError(e.to_string()))
    }

    fn type_text(&self, text: &str) -> Result<(), InputError> {
        preflight(Some(text))?;
        Self::connect()?
            .text(text)
            .map_err(|e| InputError::KeyboardError(e.to_string()))
    }
}

/// What an injector was asked to send
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InjectedInput {
    Move { x: i32, y: i32 },
    Click(MouseButton),
    Text(String),
}

/// Records and logs input instead of sending it
#[derive(Default)]
pub struct DryRunInjector {
    sent: Mutex<Vec<InjectedInput>>,
}

impl DryRunInjector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<InjectedInput> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    fn record(&self, input: InjectedInput) -> Result<(), InputError> {
        info!(?input, "dry-run input");
        self.sent
            .lock()
            .map_err(|_| InputError::InjectionUnavailable("recorder lock poisoned".into()))?
            .push(input);
        Ok(())
    }
}

impl InputInjector for DryRunInjector {
    fn name(&self) -> &str {
        "dry-run"
    }

    fn move_cursor(&self, x: i32, y: i32) -> Result<(), InputError> {
        preflight(None)?;
        self.record(InjectedInput::Move { x, y })
    }

    fn click(&self, button: MouseButton) -> Result<(), InputError> {
        preflight(None)?;
        self.record(InjectedInput::Click(button))
    }

    fn type_text(&self, text: &str) -> Result<(), InputError> {
        preflight(Some(text))?;
        self.record(InjectedInput::Text(text.to_string()))
    }
}

/// No transport connected
pub struct Disconnected;

impl InputInjector for Disconnected {
    fn name(&self) -> &str {
        "disconnected"
    }

    fn move_cursor(&self, _x: i32, _y: i32) -> Result<(), InputError> {
        Err(InputError::InjectionUnavailable("no input transport connected".into()))
    }

    fn click(&self, _button: MouseButton) -> Result<(), InputError> {
        Err(InputError::InjectionUnavailable("no input transport connected".into()))
    }

    fn type_text(&self, _text: &str) -> Result<(), InputError> {
        Err(InputError::InjectionUnavailable("no input transport connected".into()))
    }
}

/// Local injection when compiled in, otherwise [`Disconnected`]
pub fn local_injector() -> Box<dyn InputInjector> {
    #[cfg(feature = "input")]
    return Box::new(EnigoInjector::new());

    #[cfg(not(feature = "input"))]
    Box::new(Disconnected)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dry_run_records_in_order() {
        let injector = DryRunInjector::new();
        injector.move_cursor(75, 1025).unwrap();
        injector.click(MouseButton::Left).unwrap();
        injector.type_text("hello\n").unwrap();
        assert_eq!(
            injector.sent(),
            vec![
                InjectedInput::Move { x: 75, y: 1025 },
                InjectedInput::Click(MouseButton::Left),
                InjectedInput::Text("hello\n".into()),
            ]
        );
    }

    #[test]
    fn test_text_length_cap() {
        let injector = DryRunInjector::new();
        let long = "a".repeat(MAX_TEXT_LEN + 1);
        assert!(matches!(injector.type_text(&long), Err(InputError::TextTooLong(_))));
        assert!(injector.sent().is_empty());
    }

    #[test]
    fn test_disconnected_is_unavailable() {
        assert!(matches!(
            Disconnected.click(MouseButton::Right),
            Err(InputError::InjectionUnavailable(_))
        ));
        assert!(Disconnected.type_text("x").is_err());
    }
}
