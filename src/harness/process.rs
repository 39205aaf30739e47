//! Isolated workers: one child process per worker.
//!
//! The coordinator re-executes a worker program (normally this binary with
//! the hidden `worker` subcommand), hands each child its settings and
//! drives the shared barrier from its own event loop. Any failure kills
//! every child.

use std::env;
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{bail, Context};
use log::{debug, info, warn};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time::Instant;

use crate::barrier::{Arrival, BarrierState};
use crate::config::BenchmarkSettings;
use crate::error::{BarrierError, HarnessError};
use crate::sim::SimulatorFactory;

use super::protocol::{self, CoordinatorMessage, PipeBarrier, WorkerMessage};
use super::{run_worker, WorkerPool, WorkerReport};

pub struct ProcessPool {
    program: PathBuf,
    args: Vec<String>,
}

impl ProcessPool {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Workers re-run the current executable in worker mode.
    pub fn current_exe() -> std::io::Result<Self> {
        Ok(Self::new(env::current_exe()?, vec!["worker".to_string()]))
    }

    fn spawn(
        &self,
        index: usize,
        events: UnboundedSender<(usize, WorkerEvent)>,
    ) -> Result<WorkerProcess, HarnessError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| HarnessError::WorkerSpawn { index, source })?;
        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(HarnessError::Protocol(format!(
                "worker {index} started without pipes"
            )));
        };
        tokio::spawn(read_events(index, stdout, events));
        debug!("spawned worker {index} (pid {:?})", child.id());
        Ok(WorkerProcess { index, child, stdin })
    }

    async fn coordinate(
        &self,
        settings: &BenchmarkSettings,
    ) -> Result<Vec<WorkerReport>, HarnessError> {
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let mut workers = Vec::with_capacity(settings.num_processes);
        for index in 0..settings.num_processes {
            match self.spawn(index, events_tx.clone()) {
                Ok(worker) => workers.push(worker),
                Err(err) => {
                    kill_all(&mut workers).await;
                    return Err(err);
                }
            }
        }
        drop(events_tx);

        let outcome = drive(&mut workers, &mut events, settings).await;
        match outcome {
            Ok(reports) => {
                for worker in &mut workers {
                    worker.finish().await?;
                }
                Ok(reports)
            }
            Err(err) => {
                warn!("tearing down {} worker process(es): {err}", workers.len());
                kill_all(&mut workers).await;
                Err(err)
            }
        }
    }
}

impl WorkerPool for ProcessPool {
    fn run(&self, settings: &BenchmarkSettings) -> Result<Vec<WorkerReport>, HarnessError> {
        settings.validate()?;
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(HarnessError::Runtime)?;
        runtime.block_on(self.coordinate(settings))
    }
}

#[derive(Debug)]
enum WorkerEvent {
    Message(WorkerMessage),
    Invalid(String),
    Closed,
}

struct WorkerProcess {
    index: usize,
    child: Child,
    stdin: ChildStdin,
}

impl WorkerProcess {
    async fn send(&mut self, message: &CoordinatorMessage) -> Result<(), HarnessError> {
        let line = protocol::encode(message)
            .map_err(|err| HarnessError::Protocol(err.to_string()))?;
        let written = async {
            self.stdin.write_all(line.as_bytes()).await?;
            self.stdin.flush().await
        };
        written.await.map_err(|err| HarnessError::WorkerFailed {
            index: self.index,
            message: format!("lost connection: {err}"),
        })
    }

    async fn finish(&mut self) -> Result<(), HarnessError> {
        let status = self
            .child
            .wait()
            .await
            .map_err(|err| HarnessError::WorkerFailed {
                index: self.index,
                message: err.to_string(),
            })?;
        if !status.success() {
            return Err(HarnessError::WorkerFailed {
                index: self.index,
                message: format!("exited with {status}"),
            });
        }
        Ok(())
    }
}

async fn read_events(index: usize, stdout: ChildStdout, events: UnboundedSender<(usize, WorkerEvent)>) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        let event = match lines.next_line().await {
            Ok(Some(line)) => match protocol::decode::<WorkerMessage>(&line) {
                Ok(message) => WorkerEvent::Message(message),
                Err(err) => WorkerEvent::Invalid(format!("unreadable message {line:?}: {err}")),
            },
            Ok(None) => WorkerEvent::Closed,
            Err(err) => WorkerEvent::Invalid(err.to_string()),
        };
        let last = !matches!(event, WorkerEvent::Message(_));
        if events.send((index, event)).is_err() || last {
            break;
        }
    }
}

/// Runs the barrier until every worker has reported. The timeout only
/// applies while some parties are waiting on the current generation.
async fn drive(
    workers: &mut [WorkerProcess],
    events: &mut UnboundedReceiver<(usize, WorkerEvent)>,
    settings: &BenchmarkSettings,
) -> Result<Vec<WorkerReport>, HarnessError> {
    let parties = workers.len();
    let timeout = settings.barrier_timeout();
    let mut barrier = BarrierState::new(parties);
    let mut reports: Vec<Option<WorkerReport>> = vec![None; parties];
    let mut remaining = parties;
    let mut deadline: Option<Instant> = None;

    for worker in workers.iter_mut() {
        let start = CoordinatorMessage::Start {
            worker: worker.index,
            settings: settings.clone(),
        };
        worker.send(&start).await?;
    }

    while remaining > 0 {
        let next = match deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline, events.recv()).await {
                Ok(next) => next,
                Err(_) => {
                    barrier.abort();
                    return Err(BarrierError::Timeout(timeout).into());
                }
            },
            None => events.recv().await,
        };
        let Some((index, event)) = next else {
            return Err(HarnessError::Protocol(
                "workers closed their output before reporting".to_string(),
            ));
        };

        match event {
            WorkerEvent::Message(WorkerMessage::Arrive { generation }) => {
                if generation != barrier.generation() {
                    return Err(HarnessError::Protocol(format!(
                        "worker {index} arrived for generation {generation}, barrier is at {}",
                        barrier.generation()
                    )));
                }
                match barrier.arrive()? {
                    Arrival::Waiting { .. } => {
                        deadline.get_or_insert_with(|| Instant::now() + timeout);
                    }
                    Arrival::Released { generation } => {
                        deadline = None;
                        debug!("releasing barrier generation {generation}");
                        for worker in workers.iter_mut() {
                            worker.send(&CoordinatorMessage::Release { generation }).await?;
                        }
                    }
                }
            }
            WorkerEvent::Message(WorkerMessage::Reset) => {
                if index == 0 {
                    barrier.reset()?;
                } else {
                    warn!("ignoring barrier reset from worker {index}");
                }
            }
            WorkerEvent::Message(WorkerMessage::Report { report }) => {
                if report.worker != index {
                    return Err(HarnessError::Protocol(format!(
                        "worker {index} reported as worker {}",
                        report.worker
                    )));
                }
                if reports[index].replace(report).is_none() {
                    remaining -= 1;
                }
                info!("worker {index} reported ({remaining} outstanding)");
            }
            WorkerEvent::Message(WorkerMessage::Failed { message }) => {
                return Err(HarnessError::WorkerFailed { index, message });
            }
            WorkerEvent::Invalid(message) => {
                return Err(HarnessError::Protocol(format!("worker {index}: {message}")));
            }
            WorkerEvent::Closed => {
                if reports[index].is_none() {
                    return Err(HarnessError::WorkerFailed {
                        index,
                        message: "exited before reporting".to_string(),
                    });
                }
            }
        }
    }

    Ok(reports.into_iter().flatten().collect())
}

async fn kill_all(workers: &mut [WorkerProcess]) {
    for worker in workers.iter_mut() {
        if let Err(err) = worker.child.start_kill() {
            debug!("worker {} already gone: {err}", worker.index);
        }
    }
    for worker in workers.iter_mut() {
        let reaped = tokio::time::timeout(Duration::from_secs(5), worker.child.wait()).await;
        if reaped.is_err() {
            warn!("worker {} did not exit after kill", worker.index);
        }
    }
}

/// Reads the coordinator's first message, which must be `Start`.
pub fn read_start<R: BufRead>(input: &mut R) -> anyhow::Result<(usize, BenchmarkSettings)> {
    let start = protocol::read_message::<_, CoordinatorMessage>(input)
        .context("Failed to read start message")?;
    match start {
        Some(CoordinatorMessage::Start { worker, settings }) => Ok((worker, settings)),
        Some(other) => bail!("expected a start message, got {other:?}"),
        None => bail!("coordinator closed the pipe before starting this worker"),
    }
}

/// Body of the hidden `worker` subcommand once started: run the trials
/// against the coordinator's barrier, answer with a report or the failure.
pub fn run_worker_process<F, R, W>(
    factory: &F,
    worker: usize,
    settings: &BenchmarkSettings,
    input: R,
    output: W,
) -> anyhow::Result<()>
where
    F: SimulatorFactory + ?Sized,
    R: BufRead,
    W: Write,
{
    info!("worker {worker} starting on {}", settings.scene.display());

    let barrier = PipeBarrier::new(input, output);
    match run_worker(factory, settings, worker, &barrier) {
        Ok(report) => {
            barrier
                .send(&WorkerMessage::Report { report })
                .context("Failed to send worker report")?;
            Ok(())
        }
        Err(err) => {
            let message = format!("{err:#}");
            if let Err(send_err) = barrier.send(&WorkerMessage::Failed { message }) {
                warn!("worker {worker} could not report its failure: {send_err}");
            }
            Err(err)
        }
    }
}
