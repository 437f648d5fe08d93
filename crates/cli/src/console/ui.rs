//! Console rendering with ratatui

use bridge::DeviceState;
use ratatui::{
    Frame,
    layout::{Alignment, Constraint, Direction, Layout, Rect},
    style::{Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Clear, Paragraph, Wrap},
};

use super::app::{App, InputMode, LineOrigin};

mod colors {
    use ratatui::style::Color;

    pub const ACTIVE: Color = Color::Green;
    pub const PAUSED: Color = Color::Yellow;
    pub const DETACHED: Color = Color::Red;

    pub const DEVICE_TEXT: Color = Color::White;
    pub const SENT_TEXT: Color = Color::Cyan;
    pub const NOTICE_TEXT: Color = Color::Magenta;
    pub const PARTIAL_TEXT: Color = Color::Gray;

    pub const STATUS_BAR_BG: Color = Color::Blue;
    pub const HELP_BAR_BG: Color = Color::DarkGray;
    pub const INPUT_BORDER: Color = Color::Cyan;
}

pub fn render(frame: &mut Frame, app: &App) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3), // Status bar
            Constraint::Min(5),    // Device output
            Constraint::Length(3), // Input line
            Constraint::Length(1), // Help bar
        ])
        .split(frame.area());

    render_status_bar(frame, app, chunks[0]);
    render_output(frame, app, chunks[1]);
    render_input(frame, app, chunks[2]);
    render_help_bar(frame, chunks[3]);

    if app.input_mode == InputMode::Help {
        render_help_overlay(frame);
    }
}

fn state_label(state: DeviceState) -> (&'static str, ratatui::style::Color) {
    match state {
        DeviceState::Active => ("reading", colors::ACTIVE),
        DeviceState::Attached => ("idle", colors::ACTIVE),
        DeviceState::Paused => ("throttled", colors::PAUSED),
        DeviceState::Detaching => ("detaching", colors::PAUSED),
        DeviceState::Detached | DeviceState::Destroyed => ("detached", colors::DETACHED),
    }
}

fn render_status_bar(frame: &mut Frame, app: &App, area: Rect) {
    let mut spans = match &app.port {
        Some(port) => {
            let (label, color) = state_label(port.state);
            vec![
                Span::raw(format!(" {} ", port.name)),
                Span::styled(format!("[{}]", label), Style::default().fg(color)),
                Span::raw(format!(
                    " | in {} B | out {} B | writes in flight {} | room {} B",
                    port.stats.bytes_in,
                    port.stats.bytes_out,
                    port.stats.writes_in_flight,
                    port.write_room
                )),
            ]
        }
        None => vec![Span::styled(
            " Waiting for device...",
            Style::default().fg(colors::DETACHED),
        )],
    };

    if let Some(message) = &app.status_message {
        spans.push(Span::styled(
            format!(" | {}", message),
            Style::default().fg(colors::PAUSED),
        ));
    }

    let paragraph = Paragraph::new(Line::from(spans))
        .style(Style::default().bg(colors::STATUS_BAR_BG))
        .block(
            Block::default()
                .borders(Borders::ALL)
                .title(" USB TTY Bridge ")
                .title_style(Style::default().add_modifier(Modifier::BOLD)),
        );

    frame.render_widget(paragraph, area);
}

fn render_output(frame: &mut Frame, app: &App, area: Rect) {
    let visible = area.height.saturating_sub(2) as usize;

    let mut lines: Vec<Line> = app
        .output
        .iter()
        .map(|line| match line.origin {
            LineOrigin::Device => Line::styled(
                line.text.clone(),
                Style::default().fg(colors::DEVICE_TEXT),
            ),
            LineOrigin::Sent => Line::styled(
                format!("> {}", line.text),
                Style::default().fg(colors::SENT_TEXT),
            ),
            LineOrigin::Notice => Line::styled(
                format!("-- {}", line.text),
                Style::default()
                    .fg(colors::NOTICE_TEXT)
                    .add_modifier(Modifier::ITALIC),
            ),
        })
        .collect();

    let partial = app.partial_line();
    if !partial.is_empty() {
        lines.push(Line::styled(partial, Style::default().fg(colors::PARTIAL_TEXT)));
    }

    let skip = lines.len().saturating_sub(visible);
    let lines: Vec<Line> = lines.into_iter().skip(skip).collect();

    let title = match app.pending_request() {
        Some(request) => format!(" Output (waiting for reply to '{}') ", request),
        None => " Output ".to_string(),
    };

    let paragraph = Paragraph::new(lines)
        .block(Block::default().borders(Borders::ALL).title(title))
        .wrap(Wrap { trim: false });

    frame.render_widget(paragraph, area);
}

fn render_input(frame: &mut Frame, app: &App, area: Rect) {
    let (text, border) = match &app.input_mode {
        InputMode::Editing { input } => (format!("{}_", input), colors::INPUT_BORDER),
        _ => (String::new(), colors::HELP_BAR_BG),
    };

    let paragraph = Paragraph::new(text).block(
        Block::default()
            .borders(Borders::ALL)
            .border_style(Style::default().fg(border))
            .title(" Send "),
    );

    frame.render_widget(paragraph, area);
}

fn render_help_bar(frame: &mut Frame, area: Rect) {
    let help = " o: Turn on | f: Turn off | i: type line | t: throttle | x: flush | r: rescan | c: clear | ?: help | q: quit";
    let paragraph = Paragraph::new(help).style(Style::default().bg(colors::HELP_BAR_BG));
    frame.render_widget(paragraph, area);
}

fn render_help_overlay(frame: &mut Frame) {
    let area = centered_rect(60, 50, frame.area());

    let text = vec![
        Line::from(Span::styled(
            "Keys",
            Style::default().add_modifier(Modifier::BOLD),
        )),
        Line::from(""),
        Line::from("o          Send \"Turn on\""),
        Line::from("f          Send \"Turn off\""),
        Line::from("i, Enter   Type a line, Enter sends, Esc cancels"),
        Line::from("t          Throttle / unthrottle the inbound stream"),
        Line::from("x          Discard writes still in flight"),
        Line::from("r          Rescan USB devices"),
        Line::from("c          Clear output"),
        Line::from("q, Ctrl+C  Quit"),
        Line::from(""),
        Line::from("Press any key to close"),
    ];

    let paragraph = Paragraph::new(text)
        .alignment(Alignment::Left)
        .block(Block::default().borders(Borders::ALL).title(" Help "));

    frame.render_widget(Clear, area);
    frame.render_widget(paragraph, area);
}

/// Rect of `percent_x` by `percent_y` centered in `area`
fn centered_rect(percent_x: u16, percent_y: u16, area: Rect) -> Rect {
    let vertical = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Percentage((100 - percent_y) / 2),
            Constraint::Percentage(percent_y),
            Constraint::Percentage((100 - percent_y) / 2),
        ])
        .split(area);

    Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage((100 - percent_x) / 2),
            Constraint::Percentage(percent_x),
            Constraint::Percentage((100 - percent_x) / 2),
        ])
        .split(vertical[1])[1]
}
