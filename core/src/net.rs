//! TCP transport: an I/O worker thread owns the sockets and exchanges
//! complete frames with the simulation thread over bounded FIFO queues.
//!
//! The simulation never blocks on a socket; it drains arrived frames
//! between ticks and hands finished messages back. Per-connection order is
//! preserved in both directions.

use std::collections::HashMap;
use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::mpsc::{Receiver, SyncSender, TryRecvError};
use std::sync::mpsc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::wire::{to_transport_bytes, FrameAssembler, MessageOut};

pub type ConnectionId = u64;

/// Capacity of the frame queues between the I/O worker and the simulation.
const QUEUE_DEPTH: usize = 4096;

/// How long the I/O worker sleeps when nothing happened.
const IDLE_SLEEP: Duration = Duration::from_millis(2);

#[derive(Debug)]
pub enum NetEvent {
    Connected(ConnectionId, SocketAddr),
    /// A complete frame, transport length prefix stripped.
    Frame(ConnectionId, Vec<u8>),
    Disconnected(ConnectionId),
}

enum NetCommand {
    Send(ConnectionId, Vec<u8>),
    Close(ConnectionId),
    Shutdown,
}

/// Listening side, used by both services for their client ports.
pub struct NetworkServer {
    local_addr: SocketAddr,
    events: Receiver<NetEvent>,
    commands: SyncSender<NetCommand>,
    worker: Option<JoinHandle<()>>,
}

impl NetworkServer {
    pub fn bind(addr: &str, max_clients: usize) -> anyhow::Result<NetworkServer> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let (event_tx, event_rx) = mpsc::sync_channel(QUEUE_DEPTH);
        let (command_tx, command_rx) = mpsc::sync_channel(QUEUE_DEPTH);
        let worker = std::thread::Builder::new()
            .name("net-io".to_string())
            .spawn(move || io_loop(listener, event_tx, command_rx, max_clients))?;

        log::info!("listening on {local_addr}");
        Ok(NetworkServer {
            local_addr,
            events: event_rx,
            commands: command_tx,
            worker: Some(worker),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Drain everything the I/O worker delivered since the last poll.
    pub fn poll(&self) -> Vec<NetEvent> {
        let mut events = Vec::new();
        loop {
            match self.events.try_recv() {
                Ok(event) => events.push(event),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        events
    }

    pub fn send(&self, connection: ConnectionId, message: &MessageOut) {
        match to_transport_bytes(message) {
            Ok(bytes) => {
                if self.commands.send(NetCommand::Send(connection, bytes)).is_err() {
                    log::error!("network worker is gone; dropping outgoing frame");
                }
            }
            Err(e) => log::error!("refusing to send oversized frame: {e}"),
        }
    }

    pub fn close(&self, connection: ConnectionId) {
        let _ = self.commands.send(NetCommand::Close(connection));
    }
}

impl Drop for NetworkServer {
    fn drop(&mut self) {
        let _ = self.commands.send(NetCommand::Shutdown);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

struct Connection {
    stream: TcpStream,
    assembler: FrameAssembler,
    outgoing: Vec<u8>,
}

fn io_loop(
    listener: TcpListener,
    events: SyncSender<NetEvent>,
    commands: Receiver<NetCommand>,
    max_clients: usize,
) {
    let mut connections: HashMap<ConnectionId, Connection> = HashMap::new();
    let mut next_id: ConnectionId = 1;
    let mut read_buf = [0u8; 16 * 1024];

    'outer: loop {
        let mut busy = false;

        // Commands from the simulation thread.
        loop {
            match commands.try_recv() {
                Ok(NetCommand::Send(id, bytes)) => {
                    if let Some(connection) = connections.get_mut(&id) {
                        connection.outgoing.extend_from_slice(&bytes);
                    }
                    busy = true;
                }
                Ok(NetCommand::Close(id)) => {
                    connections.remove(&id);
                    busy = true;
                }
                Ok(NetCommand::Shutdown) => break 'outer,
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => break 'outer,
            }
        }

        // New connections.
        match listener.accept() {
            Ok((stream, addr)) => {
                busy = true;
                if connections.len() >= max_clients {
                    log::warn!("connection limit reached, refusing {addr}");
                } else if stream.set_nonblocking(true).is_ok() {
                    let id = next_id;
                    next_id += 1;
                    connections.insert(
                        id,
                        Connection {
                            stream,
                            assembler: FrameAssembler::new(),
                            outgoing: Vec::new(),
                        },
                    );
                    log::info!("new connection {id} from {addr}");
                    if events.send(NetEvent::Connected(id, addr)).is_err() {
                        break 'outer;
                    }
                }
            }
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => {}
            Err(e) => log::error!("accept failed: {e}"),
        }

        // Socket reads and writes.
        let mut dropped = Vec::new();
        for (&id, connection) in connections.iter_mut() {
            match connection.stream.read(&mut read_buf) {
                Ok(0) => {
                    dropped.push(id);
                    continue;
                }
                Ok(n) => {
                    busy = true;
                    connection.assembler.feed(&read_buf[..n]);
                    while let Some(frame) = connection.assembler.next_frame() {
                        if events.send(NetEvent::Frame(id, frame)).is_err() {
                            break 'outer;
                        }
                    }
                }
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => {}
                Err(e) => {
                    log::info!("connection {id} read error: {e}");
                    dropped.push(id);
                    continue;
                }
            }

            if !connection.outgoing.is_empty() {
                match connection.stream.write(&connection.outgoing) {
                    Ok(0) => dropped.push(id),
                    Ok(n) => {
                        busy = true;
                        connection.outgoing.drain(..n);
                    }
                    Err(ref e) if e.kind() == ErrorKind::WouldBlock => {}
                    Err(e) => {
                        log::info!("connection {id} write error: {e}");
                        dropped.push(id);
                    }
                }
            }
        }
        for id in dropped {
            connections.remove(&id);
            if events.send(NetEvent::Disconnected(id)).is_err() {
                break 'outer;
            }
        }

        if !busy {
            std::thread::sleep(IDLE_SLEEP);
        }
    }
}

/// Outgoing connection to another service (game server to account
/// server). Runs on the caller's thread with non-blocking polls.
pub struct NetworkClient {
    stream: TcpStream,
    assembler: FrameAssembler,
    outgoing: Vec<u8>,
}

impl NetworkClient {
    pub fn connect(addr: &str) -> anyhow::Result<NetworkClient> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nonblocking(true)?;
        Ok(NetworkClient {
            stream,
            assembler: FrameAssembler::new(),
            outgoing: Vec::new(),
        })
    }

    pub fn send(&mut self, message: &MessageOut) -> anyhow::Result<()> {
        let bytes = to_transport_bytes(message)?;
        self.outgoing.extend_from_slice(&bytes);
        self.flush()
    }

    pub fn flush(&mut self) -> anyhow::Result<()> {
        while !self.outgoing.is_empty() {
            match self.stream.write(&self.outgoing) {
                Ok(0) => anyhow::bail!("peer closed the connection"),
                Ok(n) => {
                    self.outgoing.drain(..n);
                }
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Complete frames that arrived since the last poll.
    pub fn poll(&mut self) -> anyhow::Result<Vec<Vec<u8>>> {
        let mut frames = Vec::new();
        let mut buf = [0u8; 16 * 1024];
        loop {
            match self.stream.read(&mut buf) {
                Ok(0) => anyhow::bail!("peer closed the connection"),
                Ok(n) => {
                    self.assembler.feed(&buf[..n]);
                }
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => return Err(e.into()),
            }
        }
        while let Some(frame) = self.assembler.next_frame() {
            frames.push(frame);
        }
        Ok(frames)
    }
}
