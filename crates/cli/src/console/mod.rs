//! Interactive console
//!
//! Shows everything the device sends and lets the user send lines to it.
//!
//! # Layout
//!
//! - **Top**: port name, stream state and transfer counters
//! - **Center**: device output, sent lines and bridge notices
//! - **Bottom**: line editor and key help
//!
//! # Keybindings
//!
//! - `o` / `f`: send "Turn on" / "Turn off"
//! - `i` or `Enter`: type a line to send
//! - `t`: throttle or unthrottle the inbound stream
//! - `x`: discard writes still in flight
//! - `r`: rescan USB devices
//! - `c`: clear output
//! - `q` or `Ctrl+C`: quit

pub mod app;
pub mod events;
pub mod ui;

use anyhow::{Context, Result};
use bridge::{BridgeError, DeviceState, StreamPort};
use crossterm::{
    event::Event,
    execute,
    terminal::{EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode},
};
use ratatui::{Terminal, backend::CrosstermBackend};
use std::io::{self, Stdout};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::config::BridgeConfig;
use crate::session::Session;

pub use app::{App, AppAction, PortView};
pub use events::EventHandler;

/// Console runner that owns the terminal and the open port
pub struct ConsoleRunner<'a> {
    terminal: Terminal<CrosstermBackend<Stdout>>,
    app: App,
    event_handler: EventHandler,
    session: &'a Session,
    config: &'a BridgeConfig,
    /// Port opened by the console, if any
    port: Option<Arc<StreamPort>>,
}

impl<'a> ConsoleRunner<'a> {
    pub fn new(session: &'a Session, config: &'a BridgeConfig) -> Result<Self> {
        enable_raw_mode().context("Failed to enable raw mode")?;
        let mut stdout = io::stdout();
        execute!(stdout, EnterAlternateScreen).context("Failed to enter alternate screen")?;
        let backend = CrosstermBackend::new(stdout);
        let terminal = Terminal::new(backend).context("Failed to create terminal")?;

        let app = App::new(
            config.client.expected_reply.clone(),
            config.client.response_timeout(),
        );

        Ok(Self {
            terminal,
            app,
            event_handler: EventHandler::new(),
            session,
            config,
            port: None,
        })
    }

    pub fn run(&mut self) -> Result<()> {
        info!("Starting console");

        loop {
            self.refresh_port();

            for event in self.session.events.drain() {
                self.app.on_event(event);
            }

            self.read_inbound();
            self.app.check_reply_timeout(Instant::now());
            self.update_port_view();

            self.terminal.draw(|f| ui::render(f, &self.app))?;

            if let Some(Event::Key(key)) = self.event_handler.poll()? {
                let action = self.event_handler.handle_key(&mut self.app, key);
                self.handle_action(action);
            }

            if self.app.should_quit {
                break;
            }
        }

        self.release_port();
        info!("Console shutting down");
        Ok(())
    }

    /// Drop a port whose device went away and open a newly attached one
    fn refresh_port(&mut self) {
        let gone = self.port.as_ref().is_some_and(|port| {
            matches!(
                port.state(),
                DeviceState::Detaching | DeviceState::Destroyed | DeviceState::Detached
            )
        });
        if gone {
            self.release_port();
        }

        if self.port.is_some() {
            return;
        }

        if let Some(port) = self.session.current_port() {
            port.set_line_settings(self.config.line.clone());
            match port.open() {
                Ok(()) => {
                    self.app.set_status(format!("Opened {}", port.name()));
                    self.port = Some(port);
                }
                Err(e) => {
                    debug!("Open of {} failed: {}", port.name(), e);
                    self.app
                        .set_status(format!("Failed to open {}: {}", port.name(), e));
                }
            }
        }
    }

    fn release_port(&mut self) {
        if let Some(port) = self.port.take() {
            port.close();
        }
        self.app.set_port(None);
    }

    fn read_inbound(&mut self) {
        let Some(port) = &self.port else {
            return;
        };

        let mut buf = [0u8; 512];
        loop {
            match port.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => self.app.push_bytes(&buf[..n], Instant::now()),
                Err(BridgeError::NoDevice) => break,
                Err(e) => {
                    warn!("Read from {} failed: {}", port.name(), e);
                    self.app.set_status(format!("Read failed: {}", e));
                    break;
                }
            }
        }
    }

    fn update_port_view(&mut self) {
        let view = self.port.as_ref().map(|port| PortView {
            name: port.name().to_string(),
            state: port.state(),
            stats: port.stats(),
            throttled: port.is_throttled(),
            write_room: port.write_room(),
        });
        self.app.set_port(view);
    }

    fn handle_action(&mut self, action: AppAction) {
        match action {
            AppAction::None => {}
            AppAction::Quit => {
                self.app.should_quit = true;
            }
            AppAction::SendLine(line) => {
                let Some(port) = &self.port else {
                    self.app.set_status("No device attached".to_string());
                    return;
                };
                match port.write(format!("{}\n", line).as_bytes()) {
                    Ok(_) => self.app.record_sent(line, Instant::now()),
                    Err(e) => self.app.set_status(format!("Write failed: {}", e)),
                }
            }
            AppAction::ToggleThrottle => {
                let Some(port) = &self.port else {
                    return;
                };
                if port.is_throttled() {
                    match port.unthrottle() {
                        Ok(()) => self.app.set_status("Inbound stream resumed".to_string()),
                        Err(e) => self.app.set_status(format!("Unthrottle failed: {}", e)),
                    }
                } else {
                    port.throttle();
                    self.app.set_status("Inbound stream throttled".to_string());
                }
            }
            AppAction::Rescan => {
                self.session.rescan();
                self.app.set_status("Rescanning USB devices".to_string());
            }
            AppAction::Flush => {
                if let Some(port) = &self.port {
                    port.flush();
                    self.app.set_status("Pending writes discarded".to_string());
                }
            }
        }
    }
}

impl Drop for ConsoleRunner<'_> {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
        let _ = execute!(self.terminal.backend_mut(), LeaveAlternateScreen);
        let _ = self.terminal.show_cursor();
    }
}

/// Run the console until the user quits
pub async fn run_console(session: &Session, config: &BridgeConfig) -> Result<()> {
    let mut runner = ConsoleRunner::new(session, config)?;
    tokio::task::block_in_place(|| runner.run())
}
