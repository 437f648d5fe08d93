//! Console application state

use crate::lines::LineBuffer;
use bridge::{DeviceState, TransferStats};
use common::BridgeEvent;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Output lines kept for scrollback
pub const MAX_OUTPUT_LINES: usize = 1000;

/// Actions produced by key handling
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppAction {
    None,
    /// Write the line (newline appended) to the port
    SendLine(String),
    ToggleThrottle,
    /// Discard writes still in flight
    Flush,
    /// Re-enumerate USB devices
    Rescan,
    Quit,
}

/// Console input mode
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputMode {
    Normal,
    /// Typing a free-form line
    Editing { input: String },
    Help,
}

/// Where an output line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineOrigin {
    Device,
    Sent,
    Notice,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub origin: LineOrigin,
    pub text: String,
}

/// What the console currently knows about the bridged port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortView {
    pub name: String,
    pub state: DeviceState,
    pub stats: TransferStats,
    pub throttled: bool,
    pub write_room: usize,
}

#[derive(Debug, Clone)]
struct PendingReply {
    request: String,
    sent_at: Instant,
    deadline: Instant,
}

pub struct App {
    pub output: VecDeque<OutputLine>,
    pub port: Option<PortView>,
    pub input_mode: InputMode,
    pub status_message: Option<String>,
    pub should_quit: bool,
    lines: LineBuffer,
    pending: Option<PendingReply>,
    expected_reply: String,
    response_timeout: Duration,
}

impl App {
    pub fn new(expected_reply: String, response_timeout: Duration) -> Self {
        Self {
            output: VecDeque::new(),
            port: None,
            input_mode: InputMode::Normal,
            status_message: None,
            should_quit: false,
            lines: LineBuffer::default(),
            pending: None,
            expected_reply,
            response_timeout,
        }
    }

    pub fn set_status(&mut self, message: String) {
        self.status_message = Some(message);
    }

    pub fn clear_status(&mut self) {
        self.status_message = None;
    }

    pub fn set_port(&mut self, port: Option<PortView>) {
        if port.is_none() {
            self.lines.clear();
        }
        self.port = port;
    }

    /// Request still waiting for its reply, if any
    pub fn pending_request(&self) -> Option<&str> {
        self.pending.as_ref().map(|p| p.request.as_str())
    }

    /// Text received since the last newline
    pub fn partial_line(&self) -> String {
        self.lines.partial()
    }

    pub fn push_line(&mut self, origin: LineOrigin, text: String) {
        if self.output.len() == MAX_OUTPUT_LINES {
            self.output.pop_front();
        }
        self.output.push_back(OutputLine { origin, text });
    }

    /// Feed bytes read from the port
    pub fn push_bytes(&mut self, bytes: &[u8], now: Instant) {
        for line in self.lines.push(bytes) {
            if line == self.expected_reply
                && let Some(pending) = self.pending.take()
            {
                let elapsed = now.saturating_duration_since(pending.sent_at);
                self.set_status(format!(
                    "'{}' answered in {} ms",
                    pending.request,
                    elapsed.as_millis()
                ));
            }
            self.push_line(LineOrigin::Device, line);
        }
    }

    /// Note a line written to the device and start waiting for its reply
    pub fn record_sent(&mut self, line: String, now: Instant) {
        self.push_line(LineOrigin::Sent, line.clone());
        self.pending = Some(PendingReply {
            request: line,
            sent_at: now,
            deadline: now + self.response_timeout,
        });
    }

    pub fn check_reply_timeout(&mut self, now: Instant) {
        if let Some(pending) = &self.pending
            && now >= pending.deadline
        {
            let message = format!(
                "No '{}' reply to '{}' within {} ms",
                self.expected_reply,
                pending.request,
                self.response_timeout.as_millis()
            );
            self.pending = None;
            self.push_line(LineOrigin::Notice, message.clone());
            self.set_status(message);
        }
    }

    pub fn on_event(&mut self, event: BridgeEvent) {
        let notice = match event {
            BridgeEvent::Attached {
                slot,
                vendor_id,
                product_id,
            } => format!(
                "Device {:04x}:{:04x} attached in slot {}",
                vendor_id, product_id, slot
            ),
            BridgeEvent::Detached { slot } => {
                self.pending = None;
                format!("Device in slot {} detached", slot)
            }
            BridgeEvent::TransportError { slot, message } => {
                format!("Inbound stream on slot {} stopped: {}", slot, message)
            }
            BridgeEvent::WriteFailed { slot, message } => {
                format!("Write on slot {} failed: {}", slot, message)
            }
            BridgeEvent::DeviceGone { slot } => format!("Device in slot {} is gone", slot),
        };
        self.push_line(LineOrigin::Notice, notice.clone());
        self.set_status(notice);
    }

    pub fn clear(&mut self) {
        self.output.clear();
        self.lines.clear();
        self.clear_status();
    }

    pub fn start_editing(&mut self) {
        self.input_mode = InputMode::Editing {
            input: String::new(),
        };
    }

    pub fn input_char(&mut self, c: char) {
        if let InputMode::Editing { input } = &mut self.input_mode {
            input.push(c);
        }
    }

    pub fn input_backspace(&mut self) {
        if let InputMode::Editing { input } = &mut self.input_mode {
            input.pop();
        }
    }

    /// Leave editing mode and send what was typed
    pub fn confirm_input(&mut self) -> AppAction {
        let mode = std::mem::replace(&mut self.input_mode, InputMode::Normal);
        match mode {
            InputMode::Editing { input } if !input.is_empty() => AppAction::SendLine(input),
            _ => AppAction::None,
        }
    }

    pub fn show_help(&mut self) {
        self.input_mode = InputMode::Help;
    }

    pub fn cancel_input(&mut self) {
        self.input_mode = InputMode::Normal;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn app() -> App {
        App::new("Done".to_string(), Duration::from_millis(500))
    }

    #[test]
    fn test_reply_clears_pending() {
        let mut app = app();
        let start = Instant::now();

        app.record_sent("Turn on".to_string(), start);
        assert_eq!(app.pending_request(), Some("Turn on"));

        app.push_bytes(b"Do", start);
        assert_eq!(app.partial_line(), "Do");
        app.push_bytes(b"ne\n", start + Duration::from_millis(20));

        assert_eq!(app.pending_request(), None);
        assert_eq!(app.output.len(), 2);
        assert_eq!(app.output[1].origin, LineOrigin::Device);
        assert_eq!(app.output[1].text, "Done");
        assert!(app.status_message.as_ref().unwrap().contains("20 ms"));
    }

    #[test]
    fn test_reply_timeout_reports_once() {
        let mut app = app();
        let start = Instant::now();
        app.record_sent("Turn off".to_string(), start);

        app.check_reply_timeout(start + Duration::from_millis(100));
        assert!(app.pending_request().is_some());

        app.check_reply_timeout(start + Duration::from_millis(600));
        assert!(app.pending_request().is_none());
        assert_eq!(app.output.back().unwrap().origin, LineOrigin::Notice);

        let lines = app.output.len();
        app.check_reply_timeout(start + Duration::from_secs(5));
        assert_eq!(app.output.len(), lines);
    }

    #[test]
    fn test_output_is_bounded() {
        let mut app = app();
        for i in 0..MAX_OUTPUT_LINES + 10 {
            app.push_line(LineOrigin::Device, i.to_string());
        }
        assert_eq!(app.output.len(), MAX_OUTPUT_LINES);
        assert_eq!(app.output.front().unwrap().text, "10");
    }

    #[test]
    fn test_detach_event_drops_pending() {
        let mut app = app();
        app.record_sent("Turn on".to_string(), Instant::now());

        app.on_event(BridgeEvent::Detached { slot: 0 });
        assert!(app.pending_request().is_none());
        assert!(app.status_message.as_ref().unwrap().contains("detached"));
    }

    #[test]
    fn test_editing_produces_send_action() {
        let mut app = app();
        app.start_editing();
        for c in "Statu".chars() {
            app.input_char(c);
        }
        app.input_backspace();
        app.input_char('s');

        assert_eq!(app.confirm_input(), AppAction::SendLine("Stats".to_string()));
        assert_eq!(app.input_mode, InputMode::Normal);

        app.start_editing();
        assert_eq!(app.confirm_input(), AppAction::None);
    }
}
