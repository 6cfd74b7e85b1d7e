//! Headless playback: no console, periodic status lines, Ctrl-C to stop.

use anyhow::{Context, Result};
use segue_core::{TransportCommand, TransportController, TransportStatus};
use signal_hook::consts::{SIGINT, SIGTERM};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const STATUS_INTERVAL: Duration = Duration::from_secs(2);
const POLL: Duration = Duration::from_millis(50);

/// Play until interrupted or until `duration` has elapsed.
pub fn run(transport: &mut TransportController, duration: Option<Duration>) -> Result<()> {
    let interrupted = Arc::new(AtomicBool::new(false));
    for signal in [SIGINT, SIGTERM] {
        signal_hook::flag::register(signal, Arc::clone(&interrupted))
            .context("Failed to install signal handler")?;
    }

    transport.dispatch(TransportCommand::Start)?;
    match duration {
        Some(d) => log::info!("Playing for {} (Ctrl+C to stop)", humantime::format_duration(d)),
        None => log::info!("Playing (Ctrl+C to stop)"),
    }

    let started = Instant::now();
    let mut last_report = started;
    while !interrupted.load(Ordering::Relaxed) {
        if duration.is_some_and(|d| started.elapsed() >= d) {
            break;
        }
        std::thread::sleep(POLL);
        if last_report.elapsed() >= STATUS_INTERVAL {
            last_report = Instant::now();
            log::info!("{}", status_line(&transport.status()));
        }
    }

    if interrupted.load(Ordering::Relaxed) {
        log::info!("Interrupted");
    }
    transport.dispatch(TransportCommand::Stop)?;
    log::info!("{}", status_line(&transport.status()));
    Ok(())
}

/// One-line summary for the log.
pub fn status_line(status: &TransportStatus) -> String {
    let segment = status
        .segment
        .map_or_else(|| "-".to_string(), |id| id.to_string());
    let mut line = format!(
        "{} segment {} step {:.1} | buffer {}/{} ready, {} pending | {} notes, {} underruns",
        status.state,
        segment,
        status.position.to_float(),
        status.ready,
        status.depth,
        status.pending,
        status.notes_played,
        status.underruns,
    );
    if status.degraded {
        line.push_str(" | DEGRADED");
    }
    if let Some(error) = &status.last_error {
        line.push_str(&format!(" | last error: {}", error));
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use segue_core::{PlaybackStatus, SegmentId, StepTime};

    #[test]
    fn test_status_line() {
        let status = TransportStatus {
            state: PlaybackStatus::Playing,
            segment: Some(SegmentId(3)),
            position: StepTime::from_steps(40),
            ready: 1,
            depth: 2,
            pending: 1,
            notes_played: 37,
            degraded: true,
            ..Default::default()
        };
        assert_eq!(
            status_line(&status),
            "playing segment #3 step 40.0 | buffer 1/2 ready, 1 pending | 37 notes, 0 underruns | DEGRADED"
        );
    }
}
