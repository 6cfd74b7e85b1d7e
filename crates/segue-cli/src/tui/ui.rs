//! UI rendering logic for the TUI

use crate::tui::app::TuiApp;
use crate::tui::layout::{centered, create_layout, truncate_string};
use log::Level;
use ratatui::{
    layout::{Alignment, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, List, ListItem, Paragraph, Wrap},
    Frame,
};
use segue_core::{PlaybackStatus, SlotView};

/// Render the entire UI
pub fn render_ui(frame: &mut Frame, app: &TuiApp) {
    let area = frame.area();

    if app.show_help_modal {
        render_help_modal(frame, area);
        return;
    }
    if app.show_error_modal {
        render_error_modal(frame, app, area);
        return;
    }

    let layout = create_layout(area);
    render_header(frame, layout.header, app);
    render_slots(frame, layout.slots, app);
    render_events(frame, layout.events, app);
    render_log(frame, layout.log, app);
    render_footer(frame, layout.footer, app);
}

fn state_style(state: PlaybackStatus) -> (&'static str, Color) {
    match state {
        PlaybackStatus::Playing => ("▶", Color::Green),
        PlaybackStatus::Paused => ("⏸", Color::Yellow),
        PlaybackStatus::Draining => ("…", Color::Magenta),
        PlaybackStatus::Stopped => ("■", Color::Red),
        PlaybackStatus::Idle => ("·", Color::DarkGray),
    }
}

fn render_header(frame: &mut Frame, area: Rect, app: &TuiApp) {
    let status = &app.status;
    let (icon, color) = state_style(status.state);
    let label = Style::default().fg(Color::DarkGray);
    let value = Style::default().fg(Color::White).add_modifier(Modifier::BOLD);

    let segment = status
        .segment
        .map_or_else(|| "-".to_string(), |id| id.to_string());
    let quarters_per_minute = status.steps_per_second * 60.0 / 4.0;

    let mut line1 = vec![
        Span::styled(format!(" {} ", icon), Style::default().fg(color).add_modifier(Modifier::BOLD)),
        Span::styled("SEGUE", Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD)),
        Span::raw("  "),
        Span::styled(status.state.as_str().to_uppercase(), Style::default().fg(color)),
        Span::raw("   "),
        Span::styled("segment ", label),
        Span::styled(segment, value),
        Span::raw("   "),
        Span::styled("step ", label),
        Span::styled(format!("{:.2}", status.position.to_float()), value),
    ];
    if status.degraded {
        line1.push(Span::raw("   "));
        line1.push(Span::styled(
            "DEGRADED",
            Style::default().fg(Color::Red).add_modifier(Modifier::BOLD),
        ));
    }
    if status.restart_pending {
        line1.push(Span::raw("   "));
        line1.push(Span::styled("restart pending", Style::default().fg(Color::Yellow)));
    }

    let line2 = Line::from(vec![
        Span::styled(" tempo ", label),
        Span::styled(format!("{:.1} steps/s", status.steps_per_second), value),
        Span::styled(format!(" ({:.0} qpm)", quarters_per_minute), label),
        Span::raw("   "),
        Span::styled("temperature ", label),
        Span::styled(format!("{:.1}", status.temperature), value),
        Span::raw("   "),
        Span::styled("oracle ", label),
        Span::styled(app.oracle.clone(), value),
    ]);

    let line3 = Line::from(vec![
        Span::styled(" notes ", label),
        Span::styled(status.notes_played.to_string(), value),
        Span::raw("   "),
        Span::styled("underruns ", label),
        Span::styled(
            status.underruns.to_string(),
            if status.underruns > 0 {
                Style::default().fg(Color::Yellow)
            } else {
                value
            },
        ),
        Span::raw("   "),
        Span::styled("sink errors ", label),
        Span::styled(status.sink_errors.to_string(), value),
        Span::raw("   "),
        Span::styled(app.recent_notes.join(" "), Style::default().fg(Color::Cyan)),
    ]);

    let bar_width = area.width.saturating_sub(4) as usize;
    let line4 = Line::from(Span::styled(
        format!(" {}", progress_bar(app.segment_progress(), bar_width)),
        Style::default().fg(color),
    ));

    let paragraph = Paragraph::new(vec![Line::from(line1), line2, line3, line4]).block(
        Block::default()
            .borders(Borders::ALL)
            .border_style(Style::default().fg(Color::DarkGray)),
    );
    frame.render_widget(paragraph, area);
}

fn progress_bar(progress: f64, width: usize) -> String {
    let filled = ((progress.clamp(0.0, 1.0)) * width as f64).round() as usize;
    let mut out = "▓".repeat(filled.min(width));
    out.push_str(&"░".repeat(width.saturating_sub(filled)));
    out
}

fn render_slots(frame: &mut Frame, area: Rect, app: &TuiApp) {
    let items: Vec<ListItem> = app
        .buffer
        .slots
        .iter()
        .enumerate()
        .map(|(i, slot)| {
            let (text, style) = match slot {
                SlotView::Empty => ("empty".to_string(), Style::default().fg(Color::DarkGray)),
                SlotView::Pending { segment, attempt } if *attempt > 1 => (
                    format!("{} retry {}", segment, attempt),
                    Style::default().fg(Color::Yellow),
                ),
                SlotView::Pending { segment, .. } => {
                    (format!("{} generating", segment), Style::default().fg(Color::Blue))
                }
                SlotView::Ready { segment } => (format!("{} ready", segment), Style::default().fg(Color::Green)),
                SlotView::Parked { segment } => (
                    format!("{} failed", segment),
                    Style::default().fg(Color::Red).add_modifier(Modifier::BOLD),
                ),
            };
            ListItem::new(Line::from(vec![
                Span::styled(format!(" {} ", i), Style::default().fg(Color::DarkGray)),
                Span::styled(text, style),
            ]))
        })
        .collect();

    let title = format!(" Lookahead {}/{} ", app.buffer.ready, app.buffer.depth);
    let list = List::new(items).block(
        Block::default()
            .title(title)
            .borders(Borders::ALL)
            .border_style(Style::default().fg(Color::DarkGray)),
    );
    frame.render_widget(list, area);
}

fn render_events(frame: &mut Frame, area: Rect, app: &TuiApp) {
    let block = Block::default()
        .title(" Pipeline ")
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::DarkGray));
    let inner = block.inner(area);
    frame.render_widget(block, area);

    let rows = inner.height as usize;
    let width = inner.width as usize;
    let start = app.events.len().saturating_sub(rows);
    let lines: Vec<Line> = app.events[start..]
        .iter()
        .map(|text| {
            let style = if text.contains("failed") || text.contains("underrun") {
                Style::default().fg(Color::Yellow)
            } else {
                Style::default().fg(Color::Gray)
            };
            Line::from(Span::styled(truncate_string(text, width), style))
        })
        .collect();
    frame.render_widget(Paragraph::new(lines), inner);
}

fn render_log(frame: &mut Frame, area: Rect, app: &TuiApp) {
    let level_indicator = match app.min_log_level {
        Level::Error => "ERR",
        Level::Warn => "≥WARN",
        Level::Info => "≥INFO",
        Level::Debug => "≥DBG",
        Level::Trace => "ALL",
    };
    let block = Block::default()
        .title(format!(" Log [{}] ", level_indicator))
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::DarkGray));
    let inner = block.inner(area);
    frame.render_widget(block, area);

    let entries = app.filtered_log_entries();
    let start = entries.len().saturating_sub(inner.height as usize);
    let lines: Vec<Line> = entries[start..]
        .iter()
        .map(|entry| {
            Line::from(vec![
                Span::styled(format!("[{}] ", entry.timestamp), Style::default().fg(Color::DarkGray)),
                Span::styled(format!("{:<5}", log_level_label(entry.level)), log_level_style(entry.level)),
                Span::raw(" "),
                Span::styled(entry.message.clone(), Style::default().fg(Color::White)),
            ])
        })
        .collect();
    frame.render_widget(Paragraph::new(lines).wrap(Wrap { trim: false }), inner);
}

fn render_footer(frame: &mut Frame, area: Rect, app: &TuiApp) {
    let key = Style::default().fg(Color::White);
    let desc = Style::default().fg(Color::DarkGray);
    let play = match app.status.state {
        PlaybackStatus::Playing | PlaybackStatus::Draining => " pause",
        PlaybackStatus::Paused => " resume",
        PlaybackStatus::Idle | PlaybackStatus::Stopped => " start",
    };

    let mut spans = vec![
        Span::styled("?", key),
        Span::styled(" help", desc),
        Span::raw("  "),
        Span::styled("space", key),
        Span::styled(play, desc),
        Span::raw("  "),
        Span::styled("s", key),
        Span::styled(" stop", desc),
        Span::raw("  "),
        Span::styled("r", key),
        Span::styled(" regenerate", desc),
        Span::raw("  "),
        Span::styled("+/-", key),
        Span::styled(" temperature", desc),
        Span::raw("  "),
        Span::styled("</>", key),
        Span::styled(" tempo", desc),
        Span::raw("  "),
        Span::styled("q", key),
        Span::styled(" quit", desc),
    ];

    if app.error_message.is_some() {
        spans.push(Span::raw("  "));
        spans.push(Span::styled(
            "e error",
            Style::default().fg(Color::Red).add_modifier(Modifier::BOLD),
        ));
    }

    let paragraph = Paragraph::new(Line::from(spans))
        .block(
            Block::default()
                .borders(Borders::ALL)
                .border_style(Style::default().fg(Color::DarkGray)),
        )
        .alignment(Alignment::Center);
    frame.render_widget(paragraph, area);
}

fn render_error_modal(frame: &mut Frame, app: &TuiApp, area: Rect) {
    let Some(error) = &app.error_message else {
        return;
    };
    let modal = centered(area, area.width.saturating_sub(10).min(100), area.height.saturating_sub(10).min(20));

    let text = Paragraph::new(error.as_str())
        .block(
            Block::default()
                .borders(Borders::ALL)
                .border_style(Style::default().fg(Color::Red))
                .title(" ERROR ")
                .title_bottom(" ESC or 'e' to close ")
                .style(Style::default().bg(Color::Black)),
        )
        .wrap(Wrap { trim: false })
        .style(Style::default().fg(Color::Red));
    frame.render_widget(text, modal);
}

fn log_level_label(level: Level) -> &'static str {
    match level {
        Level::Error => "ERR",
        Level::Warn => "WARN",
        Level::Info => "INFO",
        Level::Debug => "DBG",
        Level::Trace => "TRC",
    }
}

fn log_level_style(level: Level) -> Style {
    match level {
        Level::Error => Style::default().fg(Color::Red).add_modifier(Modifier::BOLD),
        Level::Warn => Style::default().fg(Color::Yellow),
        Level::Info => Style::default().fg(Color::Cyan),
        Level::Debug => Style::default().fg(Color::Green),
        Level::Trace => Style::default().fg(Color::Magenta),
    }
}

fn render_help_modal(frame: &mut Frame, area: Rect) {
    let modal = centered(area, 60, 20);
    let heading = Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD);
    let key = Style::default().fg(Color::White);
    let desc = Style::default().fg(Color::Gray);
    let row = |k: &'static str, d: &'static str| Line::from(vec![Span::styled(k, key), Span::styled(d, desc)]);

    let help_text = vec![
        Line::from(Span::styled("  Transport", heading)),
        row("  Space       ", "Start / pause / resume"),
        row("  s           ", "Stop and discard the buffer"),
        row("  r           ", "Regenerate from what just played"),
        Line::from(""),
        Line::from(Span::styled("  Generation", heading)),
        row("  + / -       ", "Temperature up / down (0.1 - 2.0)"),
        row("  > / <       ", "Tempo up / down"),
        Line::from(""),
        Line::from(Span::styled("  View", heading)),
        row("  1-5         ", "Log level (errors ... everything)"),
        row("  e           ", "Show last error"),
        row("  ?           ", "Toggle this help"),
        row("  q / Ctrl+C  ", "Quit"),
    ];

    let paragraph = Paragraph::new(help_text).block(
        Block::default()
            .title(" Keys ")
            .borders(Borders::ALL)
            .border_style(Style::default().fg(Color::Cyan))
            .style(Style::default().bg(Color::Black)),
    );
    frame.render_widget(paragraph, modal);
}
