//! Terminal console for segue
//!
//! Shows transport state, lookahead slots and pipeline events using ratatui,
//! and maps keys to transport commands.

pub mod app;
pub mod layout;
pub mod logger;
pub mod ui;

pub use app::TuiApp;
pub use logger::{init_logger, init_tui_logger};

use anyhow::Result;
use crossbeam_channel::Sender;
use crossterm::event::{self, Event, KeyCode, KeyEventKind, KeyModifiers};
use crossterm::execute;
use crossterm::terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen};
use ratatui::{backend::CrosstermBackend, Terminal};
use segue_core::TransportController;
use std::io;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// Event types that can be sent to the TUI
#[derive(Clone, Debug)]
pub enum TuiEvent {
    /// A log message to display
    Log { level: log::Level, message: String },
    /// An error occurred
    Error(String),
}

static TUI_EVENT_SENDER: Mutex<Option<Sender<TuiEvent>>> = Mutex::new(None);

/// Initialize the TUI event channel
pub fn init_tui_channel() -> crossbeam_channel::Receiver<TuiEvent> {
    let (sender, receiver) = crossbeam_channel::unbounded();
    *TUI_EVENT_SENDER.lock().unwrap_or_else(PoisonError::into_inner) = Some(sender);
    receiver
}

pub fn send_tui_event(event: TuiEvent) {
    if let Some(sender) = TUI_EVENT_SENDER
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .as_ref()
    {
        let _ = sender.send(event);
    }
}

/// Run the console until the user quits.
pub fn run(transport: &mut TransportController, autostart: bool) -> Result<()> {
    let events = init_tui_channel();

    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let mut terminal = Terminal::new(CrosstermBackend::new(stdout))?;

    let mut app = TuiApp::new();
    if autostart {
        app.apply(transport, app::Action::TogglePlay);
    }

    let result = loop {
        for event in events.try_iter() {
            app.process_event(event);
        }
        app.update(transport);

        if let Err(e) = terminal.draw(|f| ui::render_ui(f, &app)) {
            break Err(e.into());
        }

        match event::poll(Duration::from_millis(50)) {
            Ok(false) => continue,
            Ok(true) => {}
            Err(e) => break Err(e.into()),
        }
        let key = match event::read() {
            Ok(Event::Key(key)) if key.kind == KeyEventKind::Press => key,
            Ok(_) => continue,
            Err(e) => break Err(e.into()),
        };

        let action = match key.code {
            KeyCode::Char('q') => break Ok(()),
            KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => break Ok(()),
            KeyCode::Char('?') => {
                app.toggle_help_modal();
                continue;
            }
            KeyCode::Char('e') => {
                app.toggle_error_modal();
                continue;
            }
            KeyCode::Esc => {
                app.close_modals();
                continue;
            }
            KeyCode::Char(c @ '1'..='5') => {
                app.set_log_level(c as u8 - b'0');
                continue;
            }
            code => match app::Action::from_key(code) {
                Some(action) => action,
                None => continue,
            },
        };
        app.apply(transport, action);
    };

    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;

    result
}
