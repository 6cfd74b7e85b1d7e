//! Live MIDI port output via midir.
//!
//! A small thread owns the port connection. Note-ons go out as soon as the
//! scheduler plays them; matching note-offs are sent when each note's length
//! has elapsed.

use anyhow::{Context, Result};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use midir::{MidiOutput, MidiOutputConnection};
use segue_core::{NoteSink, ScheduledNote, SinkError};
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::thread::{self, JoinHandle};
use std::time::Instant;

/// Channel-voice messages sent to the port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MidiMessage {
    NoteOn { channel: u8, note: u8, velocity: u8 },
    NoteOff { channel: u8, note: u8 },
    /// All notes off (CC 123)
    AllNotesOff { channel: u8 },
}

impl MidiMessage {
    fn to_bytes(self) -> [u8; 3] {
        match self {
            MidiMessage::NoteOn { channel, note, velocity } => [0x90 | (channel & 0x0F), note & 0x7F, velocity & 0x7F],
            MidiMessage::NoteOff { channel, note } => [0x80 | (channel & 0x0F), note & 0x7F, 0],
            MidiMessage::AllNotesOff { channel } => [0xB0 | (channel & 0x0F), 123, 0],
        }
    }
}

enum PortCommand {
    Note { note: u8, velocity: u8, off_at: Instant },
    Silence,
}

/// Names of the available output ports.
pub fn list_ports() -> Result<Vec<String>> {
    let output = MidiOutput::new("segue").context("Failed to initialise MIDI")?;
    Ok(output
        .ports()
        .iter()
        .filter_map(|port| output.port_name(port).ok())
        .collect())
}

/// Sends played notes to a MIDI output port.
pub struct MidiPortSink {
    tx: Option<Sender<PortCommand>>,
    thread: Option<JoinHandle<()>>,
    port_name: String,
}

impl MidiPortSink {
    /// Connect to the first port whose name contains `wanted`.
    pub fn connect(wanted: &str, channel: u8) -> Result<Self> {
        let output = MidiOutput::new("segue").context("Failed to initialise MIDI")?;
        let ports = output.ports();
        let (port, port_name) = ports
            .iter()
            .filter_map(|port| output.port_name(port).ok().map(|name| (port, name)))
            .find(|(_, name)| name.contains(wanted))
            .with_context(|| format!("No MIDI output port matching '{}'", wanted))?;

        let connection = output
            .connect(port, "segue-out")
            .map_err(|e| anyhow::anyhow!("Failed to connect to '{}': {}", port_name, e))?;
        log::info!("Sending notes to MIDI port '{}' channel {}", port_name, channel + 1);

        let (tx, rx) = unbounded();
        let worker = PortThread {
            connection,
            channel: channel & 0x0F,
            pending: BinaryHeap::new(),
        };
        let thread = thread::Builder::new()
            .name("segue-midi-out".to_string())
            .spawn(move || worker.run(rx))
            .context("Failed to spawn MIDI output thread")?;

        Ok(Self {
            tx: Some(tx),
            thread: Some(thread),
            port_name,
        })
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    fn send(&self, command: PortCommand) -> Result<(), SinkError> {
        match &self.tx {
            Some(tx) => tx
                .send(command)
                .map_err(|_| SinkError::Send(format!("MIDI port '{}' closed", self.port_name))),
            None => Err(SinkError::Send("MIDI output already finished".to_string())),
        }
    }
}

impl NoteSink for MidiPortSink {
    fn play(&mut self, note: &ScheduledNote) -> Result<(), SinkError> {
        let Some(pitch) = note.note.pitch.midi() else {
            return Ok(());
        };
        self.send(PortCommand::Note {
            note: pitch,
            velocity: note.note.velocity,
            off_at: Instant::now() + note.length,
        })
    }

    fn silence(&mut self) {
        let _ = self.send(PortCommand::Silence);
    }

    fn finish(&mut self) -> Result<(), SinkError> {
        self.silence();
        self.tx.take();
        if let Some(handle) = self.thread.take() {
            handle
                .join()
                .map_err(|_| SinkError::Send("MIDI output thread panicked".to_string()))?;
        }
        Ok(())
    }
}

impl Drop for MidiPortSink {
    fn drop(&mut self) {
        let _ = self.finish();
    }
}

struct PortThread {
    connection: MidiOutputConnection,
    channel: u8,
    /// Scheduled note-offs, earliest first
    pending: BinaryHeap<Reverse<(Instant, u8)>>,
}

impl PortThread {
    fn run(mut self, rx: Receiver<PortCommand>) {
        loop {
            let command = match self.pending.peek() {
                Some(Reverse((deadline, _))) => match rx.recv_deadline(*deadline) {
                    Ok(cmd) => Some(cmd),
                    Err(RecvTimeoutError::Timeout) => None,
                    Err(RecvTimeoutError::Disconnected) => break,
                },
                None => match rx.recv() {
                    Ok(cmd) => Some(cmd),
                    Err(_) => break,
                },
            };

            match command {
                Some(PortCommand::Note { note, velocity, off_at }) => {
                    // Retriggering a held pitch ends it first.
                    if self.pending.iter().any(|Reverse((_, n))| *n == note) {
                        self.pending.retain(|Reverse((_, n))| *n != note);
                        self.send(MidiMessage::NoteOff { channel: self.channel, note });
                    }
                    self.send(MidiMessage::NoteOn {
                        channel: self.channel,
                        note,
                        velocity,
                    });
                    self.pending.push(Reverse((off_at, note)));
                }
                Some(PortCommand::Silence) => self.all_off(),
                None => {}
            }
            self.release_due(Instant::now());
        }
        self.all_off();
        self.connection.close();
    }

    fn release_due(&mut self, now: Instant) {
        while let Some(Reverse((at, note))) = self.pending.peek().copied() {
            if at > now {
                break;
            }
            self.pending.pop();
            self.send(MidiMessage::NoteOff { channel: self.channel, note });
        }
    }

    fn all_off(&mut self) {
        while let Some(Reverse((_, note))) = self.pending.pop() {
            self.send(MidiMessage::NoteOff { channel: self.channel, note });
        }
        self.send(MidiMessage::AllNotesOff { channel: self.channel });
    }

    fn send(&mut self, message: MidiMessage) {
        if let Err(e) = self.connection.send(&message.to_bytes()) {
            log::warn!("MIDI send failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_bytes() {
        assert_eq!(
            MidiMessage::NoteOn {
                channel: 1,
                note: 60,
                velocity: 100
            }
            .to_bytes(),
            [0x91, 60, 100]
        );
        assert_eq!(MidiMessage::NoteOff { channel: 0, note: 200 }.to_bytes(), [0x80, 72, 0]);
        assert_eq!(MidiMessage::AllNotesOff { channel: 15 }.to_bytes(), [0xBF, 123, 0]);
    }
}
