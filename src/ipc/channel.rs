//! Per-task channel pair.
//!
//! Each direction is its own `UnixStream` socket pair carrying one JSON
//! message per line. The owning process pumps its end through a thread into
//! a `crossbeam-channel` queue, so sending never blocks the caller and
//! receiving with a timeout is a plain `recv_timeout`.

use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::os::unix::net::UnixStream;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use log::{debug, error, warn};

use crate::models::message::Message;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Supervisor to worker.
    Inbound,
    /// Worker to supervisor.
    Outbound,
}

/// Raw sockets for both directions, created before the fork.
pub struct ChannelPair {
    inbound: (UnixStream, UnixStream),
    outbound: (UnixStream, UnixStream),
}

/// Sockets the supervisor keeps after the fork.
pub struct SupervisorSockets {
    pub to_worker: UnixStream,
    pub from_worker: UnixStream,
}

/// Sockets the worker keeps after the fork.
pub struct WorkerSockets {
    pub from_supervisor: UnixStream,
    pub to_supervisor: UnixStream,
}

impl ChannelPair {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            inbound: UnixStream::pair()?,
            outbound: UnixStream::pair()?,
        })
    }

    pub fn split(self) -> (SupervisorSockets, WorkerSockets) {
        let (inbound_tx, inbound_rx) = self.inbound;
        let (outbound_tx, outbound_rx) = self.outbound;
        (
            SupervisorSockets { to_worker: inbound_tx, from_worker: outbound_rx },
            WorkerSockets { from_supervisor: inbound_rx, to_supervisor: outbound_tx },
        )
    }
}

/// Sending half of one direction.
#[derive(Clone)]
pub struct MessageSender {
    task_id: String,
    direction: Direction,
    queue: Sender<Message>,
}

impl MessageSender {
    /// Queues a message. Never blocks; returns false and logs when the
    /// transport is gone.
    pub fn send(&self, message: Message) -> bool {
        match self.queue.send(message) {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    "Dropping {:?} message '{}' for task '{}': channel closed.",
                    self.direction,
                    e.0.kind,
                    self.task_id
                );
                false
            }
        }
    }
}

/// Receiving half of one direction.
#[derive(Clone)]
pub struct MessageReceiver {
    queue: Receiver<Message>,
}

/// Outcome of a non-blocking receive.
#[derive(Debug, PartialEq)]
pub enum Polled {
    Message(Message),
    Empty,
    Closed,
}

impl MessageReceiver {
    /// Blocks for at most `timeout`; `None` on timeout or a closed channel.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<Message> {
        match self.queue.recv_timeout(timeout) {
            Ok(message) => Some(message),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    pub fn try_recv(&self) -> Polled {
        match self.queue.try_recv() {
            Ok(message) => Polled::Message(message),
            Err(TryRecvError::Empty) => Polled::Empty,
            Err(TryRecvError::Disconnected) => Polled::Closed,
        }
    }
}

/// Local queue the supervisor uses to hand drained worker messages to callers.
pub fn mailbox() -> (Sender<Message>, MessageReceiver) {
    let (tx, rx) = unbounded();
    (tx, MessageReceiver { queue: rx })
}

/// Starts the writer thread for a socket and hands back its queue.
///
/// The thread exits once every sender is dropped or the peer goes away. Join
/// the returned handle to be sure queued messages reached the socket.
pub fn spawn_writer(
    task_id: &str,
    direction: Direction,
    stream: UnixStream,
) -> io::Result<(MessageSender, JoinHandle<()>)> {
    let (tx, rx) = unbounded::<Message>();
    let name = task_id.to_string();
    let handle = thread::Builder::new()
        .name(format!("{}-{:?}-writer", task_id, direction).to_lowercase())
        .spawn(move || {
            let mut writer = BufWriter::new(stream);
            for message in rx.iter() {
                if let Err(e) = write_line(&mut writer, &message) {
                    warn!("Channel writer for task '{}' stopped: {}", name, e);
                    break;
                }
            }
            debug!("Channel writer for task '{}' finished.", name);
        })?;
    Ok((
        MessageSender { task_id: task_id.to_string(), direction, queue: tx },
        handle,
    ))
}

fn write_line(writer: &mut BufWriter<UnixStream>, message: &Message) -> io::Result<()> {
    serde_json::to_writer(&mut *writer, message)?;
    writer.write_all(b"\n")?;
    writer.flush()
}

/// Starts the reader thread for a socket and hands back its queue.
///
/// Malformed lines are logged and skipped. The queue disconnects when the
/// peer closes its end.
pub fn spawn_reader(task_id: &str, stream: UnixStream) -> io::Result<MessageReceiver> {
    let (tx, rx) = unbounded::<Message>();
    let name = task_id.to_string();
    thread::Builder::new()
        .name(format!("{}-reader", task_id))
        .spawn(move || {
            let reader = BufReader::new(stream);
            for line in reader.lines() {
                let line = match line {
                    Ok(line) => line,
                    Err(e) => {
                        debug!("Channel reader for task '{}' closed: {}", name, e);
                        break;
                    }
                };
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<Message>(&line) {
                    Ok(message) => {
                        if tx.send(message).is_err() {
                            break;
                        }
                    }
                    Err(e) => error!("Malformed message from task '{}': {}", name, e),
                }
            }
        })?;
    Ok(MessageReceiver { queue: rx })
}
