//! Console key handling

use anyhow::Result;
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyModifiers};
use std::time::Duration;

use super::app::{App, AppAction, InputMode};

/// Canned requests bound to single keys
pub const TURN_ON: &str = "Turn on";
pub const TURN_OFF: &str = "Turn off";

pub struct EventHandler {
    tick_rate: Duration,
}

impl Default for EventHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHandler {
    pub fn new() -> Self {
        Self {
            tick_rate: Duration::from_millis(50),
        }
    }

    /// Poll for next event
    ///
    /// Returns Some(Event) if an event occurred, None if tick timeout elapsed.
    pub fn poll(&self) -> Result<Option<Event>> {
        if event::poll(self.tick_rate)? {
            Ok(Some(event::read()?))
        } else {
            Ok(None)
        }
    }

    pub fn handle_key(&self, app: &mut App, key: KeyEvent) -> AppAction {
        // Ctrl+C quits from any mode
        if key.code == KeyCode::Char('c') && key.modifiers.contains(KeyModifiers::CONTROL) {
            return AppAction::Quit;
        }

        match &app.input_mode {
            InputMode::Normal => self.handle_normal_mode(app, key),
            InputMode::Editing { .. } => self.handle_editing_mode(app, key),
            InputMode::Help => {
                app.cancel_input();
                AppAction::None
            }
        }
    }

    fn handle_normal_mode(&self, app: &mut App, key: KeyEvent) -> AppAction {
        match key.code {
            KeyCode::Char('q') => AppAction::Quit,
            KeyCode::Char('o') => AppAction::SendLine(TURN_ON.to_string()),
            KeyCode::Char('f') => AppAction::SendLine(TURN_OFF.to_string()),
            KeyCode::Char('t') => AppAction::ToggleThrottle,
            KeyCode::Char('x') => AppAction::Flush,
            KeyCode::Char('r') => AppAction::Rescan,
            KeyCode::Char('c') => {
                app.clear();
                AppAction::None
            }
            KeyCode::Char('i') | KeyCode::Enter => {
                app.start_editing();
                AppAction::None
            }
            KeyCode::Char('?') => {
                app.show_help();
                AppAction::None
            }
            _ => AppAction::None,
        }
    }

    fn handle_editing_mode(&self, app: &mut App, key: KeyEvent) -> AppAction {
        match key.code {
            KeyCode::Esc => {
                app.cancel_input();
                AppAction::None
            }
            KeyCode::Enter => app.confirm_input(),
            KeyCode::Backspace => {
                app.input_backspace();
                AppAction::None
            }
            KeyCode::Char(c) => {
                app.input_char(c);
                AppAction::None
            }
            _ => AppAction::None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(code: KeyCode) -> KeyEvent {
        KeyEvent::new(code, KeyModifiers::NONE)
    }

    fn app() -> App {
        App::new("Done".to_string(), Duration::from_secs(3))
    }

    #[test]
    fn test_canned_requests() {
        let handler = EventHandler::new();
        let mut app = app();

        assert_eq!(
            handler.handle_key(&mut app, key(KeyCode::Char('o'))),
            AppAction::SendLine("Turn on".to_string())
        );
        assert_eq!(
            handler.handle_key(&mut app, key(KeyCode::Char('f'))),
            AppAction::SendLine("Turn off".to_string())
        );
        assert_eq!(
            handler.handle_key(&mut app, key(KeyCode::Char('t'))),
            AppAction::ToggleThrottle
        );
        assert_eq!(
            handler.handle_key(&mut app, key(KeyCode::Char('r'))),
            AppAction::Rescan
        );
        assert_eq!(
            handler.handle_key(&mut app, key(KeyCode::Char('q'))),
            AppAction::Quit
        );
    }

    #[test]
    fn test_editing_mode_captures_letters() {
        let handler = EventHandler::new();
        let mut app = app();

        handler.handle_key(&mut app, key(KeyCode::Char('i')));
        for c in "quit".chars() {
            assert_eq!(handler.handle_key(&mut app, key(KeyCode::Char(c))), AppAction::None);
        }
        assert_eq!(
            handler.handle_key(&mut app, key(KeyCode::Enter)),
            AppAction::SendLine("quit".to_string())
        );
    }

    #[test]
    fn test_ctrl_c_quits_while_editing() {
        let handler = EventHandler::new();
        let mut app = app();
        app.start_editing();

        let action = handler.handle_key(
            &mut app,
            KeyEvent::new(KeyCode::Char('c'), KeyModifiers::CONTROL),
        );
        assert_eq!(action, AppAction::Quit);
    }

    #[test]
    fn test_escape_cancels_editing() {
        let handler = EventHandler::new();
        let mut app = app();
        app.start_editing();
        app.input_char('x');

        handler.handle_key(&mut app, key(KeyCode::Esc));
        assert_eq!(app.input_mode, InputMode::Normal);
    }
}
