//! Line-delimited JSON spoken between the coordinator and worker processes.
//!
//! The coordinator writes to a worker's stdin, the worker answers on its
//! stdout. Workers log to stderr only.

use std::io::{BufRead, Write};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::barrier::{Arrival, Rendezvous};
use crate::config::BenchmarkSettings;
use crate::error::BarrierError;

use super::WorkerReport;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CoordinatorMessage {
    Start {
        worker: usize,
        settings: BenchmarkSettings,
    },
    Release {
        generation: u64,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkerMessage {
    Arrive { generation: u64 },
    Reset,
    Report { report: WorkerReport },
    Failed { message: String },
}

pub fn encode<T: Serialize>(message: &T) -> serde_json::Result<String> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}

pub fn decode<'a, T: Deserialize<'a>>(line: &'a str) -> serde_json::Result<T> {
    serde_json::from_str(line.trim_end())
}

/// Reads one message, `None` on end of stream.
pub fn read_message<R: BufRead, T: for<'de> Deserialize<'de>>(
    reader: &mut R,
) -> std::io::Result<Option<T>> {
    let mut line = String::new();
    if reader.read_line(&mut line)? == 0 {
        return Ok(None);
    }
    decode(&line)
        .map(Some)
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))
}

pub fn write_message<W: Write, T: Serialize>(writer: &mut W, message: &T) -> std::io::Result<()> {
    let line = encode(message).map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))?;
    writer.write_all(line.as_bytes())?;
    writer.flush()
}

struct PipeEnds<R, W> {
    reader: R,
    writer: W,
    generation: u64,
}

/// Worker-side view of the coordinator's barrier.
///
/// `wait` announces the arrival and blocks until the coordinator releases
/// that generation. A closed or garbled pipe means the coordinator has torn
/// the run down, which surfaces as a broken barrier.
pub struct PipeBarrier<R, W> {
    ends: Mutex<PipeEnds<R, W>>,
}

impl<R: BufRead, W: Write> PipeBarrier<R, W> {
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            ends: Mutex::new(PipeEnds {
                reader,
                writer,
                generation: 0,
            }),
        }
    }

    pub fn send(&self, message: &WorkerMessage) -> std::io::Result<()> {
        let mut ends = self.ends.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        write_message(&mut ends.writer, message)
    }
}

impl<R: BufRead, W: Write> Rendezvous for PipeBarrier<R, W> {
    fn wait(&self) -> Result<Arrival, BarrierError> {
        let mut ends = self.ends.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let generation = ends.generation;
        write_message(&mut ends.writer, &WorkerMessage::Arrive { generation })
            .map_err(|_| BarrierError::Broken)?;
        match read_message::<_, CoordinatorMessage>(&mut ends.reader) {
            Ok(Some(CoordinatorMessage::Release { generation: released }))
                if released == generation =>
            {
                ends.generation += 1;
                Ok(Arrival::Released { generation })
            }
            _ => Err(BarrierError::Broken),
        }
    }

    fn reset(&self) -> Result<(), BarrierError> {
        self.send(&WorkerMessage::Reset)
            .map_err(|_| BarrierError::Broken)
    }

    fn abort(&self) {
        // Dropping out is enough: the coordinator tears down on failure.
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn messages_are_tagged_single_lines() {
        let line = encode(&WorkerMessage::Arrive { generation: 2 }).unwrap();
        assert_eq!(line, "{\"kind\":\"arrive\",\"generation\":2}\n");
        let back: WorkerMessage = decode(&line).unwrap();
        assert_eq!(back, WorkerMessage::Arrive { generation: 2 });
    }

    #[test]
    fn start_carries_full_settings() {
        let settings = BenchmarkSettings {
            num_processes: 3,
            ..BenchmarkSettings::default()
        };
        let line = encode(&CoordinatorMessage::Start {
            worker: 1,
            settings: settings.clone(),
        })
        .unwrap();
        match decode::<CoordinatorMessage>(&line).unwrap() {
            CoordinatorMessage::Start { worker, settings: copy } => {
                assert_eq!(worker, 1);
                assert_eq!(copy, settings);
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn pipe_barrier_waits_for_matching_release() {
        let input = format!(
            "{}{}",
            encode(&CoordinatorMessage::Release { generation: 0 }).unwrap(),
            encode(&CoordinatorMessage::Release { generation: 1 }).unwrap()
        );
        let barrier = PipeBarrier::new(Cursor::new(input.into_bytes()), Vec::new());
        assert_eq!(barrier.wait().unwrap(), Arrival::Released { generation: 0 });
        barrier.reset().unwrap();
        assert_eq!(barrier.wait().unwrap(), Arrival::Released { generation: 1 });
        assert_eq!(barrier.wait(), Err(BarrierError::Broken));

        let ends = barrier.ends.into_inner().unwrap();
        let written = String::from_utf8(ends.writer).unwrap();
        let kinds: Vec<WorkerMessage> = written.lines().map(|l| decode(l).unwrap()).collect();
        assert_eq!(
            kinds,
            vec![
                WorkerMessage::Arrive { generation: 0 },
                WorkerMessage::Reset,
                WorkerMessage::Arrive { generation: 1 },
                WorkerMessage::Arrive { generation: 2 },
            ]
        );
    }

    #[test]
    fn out_of_order_release_breaks() {
        let input = encode(&CoordinatorMessage::Release { generation: 5 }).unwrap();
        let barrier = PipeBarrier::new(Cursor::new(input.into_bytes()), Vec::new());
        assert_eq!(barrier.wait(), Err(BarrierError::Broken));
    }
}
