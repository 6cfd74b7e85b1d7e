//! TUI application state and logic

use crate::tui::TuiEvent;
use crossterm::event::KeyCode;
use log::Level;
use segue_core::{
    clamp_temperature, note_name, BufferSnapshot, PipelineConfig, PlaybackStatus, TransportCommand,
    TransportController, TransportStatus,
};
use std::collections::VecDeque;

const MAX_LOG_ENTRIES: usize = 200;

/// Pipeline events shown in the main panel.
const EVENT_ROWS: usize = 100;

const TEMPERATURE_STEP: f64 = 0.1;
const TEMPO_STEP: f64 = 0.5;
const MIN_TEMPO: f64 = 0.5;
const MAX_TEMPO: f64 = 64.0;

/// Something the user asked the transport to do.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    TogglePlay,
    Stop,
    Regenerate,
    TemperatureUp,
    TemperatureDown,
    TempoUp,
    TempoDown,
}

impl Action {
    pub fn from_key(code: KeyCode) -> Option<Self> {
        match code {
            KeyCode::Char(' ') => Some(Action::TogglePlay),
            KeyCode::Char('s') => Some(Action::Stop),
            KeyCode::Char('r') => Some(Action::Regenerate),
            KeyCode::Char('+') | KeyCode::Char('=') => Some(Action::TemperatureUp),
            KeyCode::Char('-') => Some(Action::TemperatureDown),
            KeyCode::Char('>') | KeyCode::Char('.') | KeyCode::Right => Some(Action::TempoUp),
            KeyCode::Char('<') | KeyCode::Char(',') | KeyCode::Left => Some(Action::TempoDown),
            _ => None,
        }
    }
}

/// The command an action turns into, if any.
pub fn command_for(action: Action, state: PlaybackStatus, config: &PipelineConfig) -> Option<TransportCommand> {
    let reconfigure = |change: &dyn Fn(&mut PipelineConfig)| {
        let mut next = config.clone();
        change(&mut next);
        (next != *config).then(|| TransportCommand::SetConfig(Box::new(next)))
    };

    match action {
        Action::TogglePlay => Some(match state {
            PlaybackStatus::Idle | PlaybackStatus::Stopped => TransportCommand::Start,
            PlaybackStatus::Playing | PlaybackStatus::Draining => TransportCommand::Pause,
            PlaybackStatus::Paused => TransportCommand::Resume,
        }),
        Action::Stop => Some(TransportCommand::Stop),
        Action::Regenerate => Some(TransportCommand::Regenerate),
        Action::TemperatureUp | Action::TemperatureDown => {
            let delta = if action == Action::TemperatureUp {
                TEMPERATURE_STEP
            } else {
                -TEMPERATURE_STEP
            };
            reconfigure(&|c: &mut PipelineConfig| {
                let stepped = ((c.model.temperature + delta) * 10.0).round() / 10.0;
                c.model.temperature = clamp_temperature(stepped);
            })
        }
        Action::TempoUp | Action::TempoDown => {
            let delta = if action == Action::TempoUp { TEMPO_STEP } else { -TEMPO_STEP };
            reconfigure(&|c: &mut PipelineConfig| {
                c.playback.steps_per_second = (c.playback.steps_per_second + delta).clamp(MIN_TEMPO, MAX_TEMPO);
            })
        }
    }
}

#[derive(Clone, Debug)]
pub struct LogEntry {
    pub timestamp: String,
    pub level: Level,
    pub message: String,
}

/// Main TUI application state
pub struct TuiApp {
    pub log_buffer: VecDeque<LogEntry>,
    pub error_message: Option<String>,
    pub show_error_modal: bool,
    pub show_help_modal: bool,
    pub status: TransportStatus,
    pub buffer: BufferSnapshot,
    /// Described pipeline events, oldest first
    pub events: Vec<String>,
    /// Recently played notes as names
    pub recent_notes: Vec<String>,
    pub step_count: u32,
    pub oracle: String,
    /// Minimum log level to display
    pub min_log_level: Level,
}

impl Default for TuiApp {
    fn default() -> Self {
        Self::new()
    }
}

impl TuiApp {
    pub fn new() -> Self {
        Self {
            log_buffer: VecDeque::with_capacity(MAX_LOG_ENTRIES),
            error_message: None,
            show_error_modal: false,
            show_help_modal: false,
            status: TransportStatus::default(),
            buffer: BufferSnapshot::default(),
            events: Vec::new(),
            recent_notes: Vec::new(),
            step_count: 0,
            oracle: String::new(),
            min_log_level: Level::Info,
        }
    }

    /// Refresh the cached view of the pipeline.
    pub fn update(&mut self, transport: &TransportController) {
        self.status = transport.status();
        self.buffer = transport.buffer().snapshot();
        self.events = transport
            .recent_events(EVENT_ROWS)
            .iter()
            .map(|e| e.describe())
            .collect();
        self.recent_notes = transport.board().with_read(|s| {
            s.history_tail
                .iter()
                .map(|n| note_name(n.pitch))
                .collect()
        });
        self.step_count = transport.config().model.step_count;
        self.oracle = transport.oracle_name().to_string();
    }

    /// Carry out `action`, reporting failures in the error modal.
    pub fn apply(&mut self, transport: &mut TransportController, action: Action) {
        let Some(command) = command_for(action, self.status.state, transport.config()) else {
            return;
        };
        log::debug!("Console: {:?}", action);
        if let Err(e) = transport.dispatch(command) {
            log::error!("{:?} failed: {}", action, e);
        }
    }

    pub fn process_event(&mut self, event: TuiEvent) {
        match event {
            TuiEvent::Log { level, message } => self.add_log(level, message),
            TuiEvent::Error(msg) => {
                self.error_message = Some(msg.clone());
                self.add_log(Level::Error, msg);
            }
        }
    }

    pub fn add_log(&mut self, level: Level, message: String) {
        let timestamp = chrono::Local::now().format("%H:%M:%S").to_string();
        self.log_buffer.push_back(LogEntry {
            timestamp,
            level,
            message,
        });
        if self.log_buffer.len() > MAX_LOG_ENTRIES {
            self.log_buffer.pop_front();
        }
    }

    /// Log entries at or above the selected level.
    pub fn filtered_log_entries(&self) -> Vec<&LogEntry> {
        self.log_buffer
            .iter()
            .filter(|e| e.level <= self.min_log_level)
            .collect()
    }

    /// 1 = errors only ... 5 = everything
    pub fn set_log_level(&mut self, level: u8) {
        self.min_log_level = match level {
            1 => Level::Error,
            2 => Level::Warn,
            3 => Level::Info,
            4 => Level::Debug,
            _ => Level::Trace,
        };
    }

    pub fn toggle_help_modal(&mut self) {
        self.show_help_modal = !self.show_help_modal;
    }

    pub fn toggle_error_modal(&mut self) {
        if self.error_message.is_some() {
            self.show_error_modal = !self.show_error_modal;
        }
    }

    pub fn close_modals(&mut self) {
        self.show_help_modal = false;
        self.show_error_modal = false;
    }

    /// Position inside the current segment, 0.0..1.0.
    pub fn segment_progress(&self) -> f64 {
        if self.step_count == 0 {
            return 0.0;
        }
        (self.status.segment_offset.to_float() / self.step_count as f64).clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use segue_core::StepTime;

    #[test]
    fn test_toggle_play_follows_state() {
        let config = PipelineConfig::default();
        let cmd = |state| command_for(Action::TogglePlay, state, &config);
        assert_eq!(cmd(PlaybackStatus::Idle), Some(TransportCommand::Start));
        assert_eq!(cmd(PlaybackStatus::Stopped), Some(TransportCommand::Start));
        assert_eq!(cmd(PlaybackStatus::Playing), Some(TransportCommand::Pause));
        assert_eq!(cmd(PlaybackStatus::Draining), Some(TransportCommand::Pause));
        assert_eq!(cmd(PlaybackStatus::Paused), Some(TransportCommand::Resume));
    }

    #[test]
    fn test_temperature_steps_and_clamps() {
        let mut config = PipelineConfig::default();
        config.model.temperature = 1.95;
        match command_for(Action::TemperatureUp, PlaybackStatus::Playing, &config) {
            Some(TransportCommand::SetConfig(next)) => assert_eq!(next.model.temperature, 2.0),
            other => panic!("unexpected {other:?}"),
        }

        config.model.temperature = 2.0;
        assert_eq!(command_for(Action::TemperatureUp, PlaybackStatus::Playing, &config), None);

        config.model.temperature = 0.1;
        assert_eq!(command_for(Action::TemperatureDown, PlaybackStatus::Playing, &config), None);

        config.model.temperature = 1.0;
        match command_for(Action::TemperatureDown, PlaybackStatus::Idle, &config) {
            Some(TransportCommand::SetConfig(next)) => assert!((next.model.temperature - 0.9).abs() < 1e-9),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_tempo_has_a_floor() {
        let mut config = PipelineConfig::default();
        config.playback.steps_per_second = MIN_TEMPO;
        assert_eq!(command_for(Action::TempoDown, PlaybackStatus::Playing, &config), None);
        match command_for(Action::TempoUp, PlaybackStatus::Playing, &config) {
            Some(TransportCommand::SetConfig(next)) => assert_eq!(next.playback.steps_per_second, 1.0),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_keys_map_to_actions() {
        assert_eq!(Action::from_key(KeyCode::Char(' ')), Some(Action::TogglePlay));
        assert_eq!(Action::from_key(KeyCode::Char('r')), Some(Action::Regenerate));
        assert_eq!(Action::from_key(KeyCode::Char('+')), Some(Action::TemperatureUp));
        assert_eq!(Action::from_key(KeyCode::Char('x')), None);
    }

    #[test]
    fn test_segment_progress_uses_offset_into_segment() {
        let mut app = TuiApp::new();
        app.step_count = 16;
        app.status.position = StepTime::from_steps(100);
        app.status.segment_offset = StepTime::from_steps(4);
        assert_eq!(app.segment_progress(), 0.25);
    }

    #[test]
    fn test_log_level_filter() {
        let mut app = TuiApp::new();
        app.add_log(Level::Debug, "detail".into());
        app.add_log(Level::Warn, "careful".into());
        assert_eq!(app.filtered_log_entries().len(), 1);
        app.set_log_level(5);
        assert_eq!(app.filtered_log_entries().len(), 2);
        app.set_log_level(1);
        assert!(app.filtered_log_entries().is_empty());
    }
}
