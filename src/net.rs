//! Connectivity glue: TCP accept loops and hub/peer socket tasks.
//!
//! Grounded on the teacher's `peer.rs` `PeerSession::start`/`run` shape
//! (`TcpStream::connect`, a `Framed` codec, a `select!` loop between the
//! socket and a command channel) generalized from one binary message codec
//! to [`crate::wire::FrameCodec`]'s line framing, and used for both a hub
//! connection and a peer connection. The protocol-level frame handling
//! itself stays in `hub`/`peer` as pure, synchronous functions; this module
//! only owns the bytes-on-the-wire and hands decoded lines to the caller
//! over a channel, "cross-task mutations use message channels".

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;

use crate::wire::FrameCodec;

/// A decoded line from the socket, or the fact that it closed.
#[derive(Debug)]
pub enum SocketEvent {
    Line(String),
    Closed,
}

/// A command posted to a running socket task: send a line, or shut the
/// socket down.
#[derive(Debug)]
pub enum SocketCommand {
    Send(String),
    Shutdown,
}

/// A handle to a running socket task: post commands to it, give it away
/// once connected.
pub struct SocketHandle {
    pub commands: mpsc::UnboundedSender<SocketCommand>,
}

impl SocketHandle {
    pub fn send_line(&self, line: impl Into<String>) -> Result<(), crate::error::Error> {
        self.commands
            .send(SocketCommand::Send(line.into()))
            .map_err(|_| crate::error::Error::ChannelClosed)
    }

    pub fn shutdown(&self) {
        let _ = self.commands.send(SocketCommand::Shutdown);
    }
}

/// Opens an outbound TCP connection to a hub or peer and spawns the task
/// that drives its line-framed socket, returning a handle to post outbound
/// lines to it and the channel on which decoded lines (and the closed
/// marker) arrive.
///
/// TLS is not terminated here; a `tls` flag-true connection is expected to
/// wrap `stream` before this is called in a full build wiring in a
/// TLS crate, a detail cross-cutting with `crypto::verify_keyprint` that
/// the caller performs once the socket is open (spec §6 "cross-cutting:
/// ... TLS context").
pub async fn connect(addr: &str, separator: u8) -> io::Result<(SocketHandle, mpsc::UnboundedReceiver<SocketEvent>)> {
    let stream = TcpStream::connect(addr).await?;
    Ok(spawn_socket_task(stream, separator))
}

fn spawn_socket_task(stream: TcpStream, separator: u8) -> (SocketHandle, mpsc::UnboundedReceiver<SocketEvent>) {
    let framed = Framed::new(stream, FrameCodec::new(separator));
    let (mut sink, mut stream) = framed.split();
    let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel::<SocketCommand>();
    let (evt_tx, evt_rx) = mpsc::unbounded_channel::<SocketEvent>();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                line = stream.next() => {
                    match line {
                        Some(Ok(line)) => {
                            if evt_tx.send(SocketEvent::Line(line)).is_err() {
                                break;
                            }
                        }
                        _ => {
                            let _ = evt_tx.send(SocketEvent::Closed);
                            break;
                        }
                    }
                }
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(SocketCommand::Send(line)) => {
                            if sink.send(line).await.is_err() {
                                let _ = evt_tx.send(SocketEvent::Closed);
                                break;
                            }
                        }
                        Some(SocketCommand::Shutdown) | None => break,
                    }
                }
            }
        }
    });

    (SocketHandle { commands: cmd_tx }, evt_rx)
}

/// A bound listener that accepts peer connections, rotating to the next
/// port in `ports` and backing off 60 s on bind failure "ports
/// rotate on failure with 60 s backoff".
pub struct Listener {
    listener: TcpListener,
    pub local_port: u16,
}

impl Listener {
    /// Tries each candidate port in turn, waiting `backoff` between
    /// attempts once every candidate has failed once.
    pub async fn bind(candidate_ports: &[u16], backoff: Duration) -> io::Result<Self> {
        loop {
            let mut last_err = None;
            for &port in candidate_ports {
                match TcpListener::bind(("0.0.0.0", port)).await {
                    Ok(listener) => {
                        let local_port = listener.local_addr()?.port();
                        return Ok(Self { listener, local_port });
                    }
                    Err(e) => last_err = Some(e),
                }
            }
            if candidate_ports.is_empty() {
                return Err(io::Error::new(io::ErrorKind::InvalidInput, "no candidate ports given"));
            }
            log::warn!(
                "every candidate peer-listener port is in use ({:?}), retrying in {:?}",
                last_err,
                backoff
            );
            tokio::time::delay_for(backoff).await;
        }
    }

    /// Accepts one inbound connection and spawns its socket task, for the
    /// caller to classify (hub redirect target is never relevant here;
    /// this is always a peer connection) once the first frame arrives.
    pub async fn accept(&mut self, separator: u8) -> io::Result<(SocketAddr, SocketHandle, mpsc::UnboundedReceiver<SocketEvent>)> {
        let (stream, addr) = self.listener.accept().await?;
        let (handle, events) = spawn_socket_task(stream, separator);
        Ok((addr, handle, events))
    }
}

/// Runs the accept loop for `listener`, forwarding every accepted
/// connection's address and socket handles down `accepted`. Returns once
/// `accepted` is dropped or a fatal accept error occurs; a transient error
/// is logged and the loop continues.
pub async fn run_accept_loop(
    mut listener: Listener,
    separator: u8,
    accepted: mpsc::UnboundedSender<(SocketAddr, SocketHandle, mpsc::UnboundedReceiver<SocketEvent>)>,
) {
    loop {
        match listener.accept(separator).await {
            Ok(conn) => {
                if accepted.send(conn).is_err() {
                    break;
                }
            }
            Err(e) => {
                log::warn!("accept error on peer listener: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connect_and_accept_exchange_lines() {
        let mut listener = Listener::bind(&[0], Duration::from_millis(1)).await.unwrap();
        let addr = format!("127.0.0.1:{}", listener.local_port);

        let server = tokio::spawn(async move {
            let (_addr, handle, mut events) = listener.accept(b'\n').await.unwrap();
            match events.recv().await {
                Some(SocketEvent::Line(line)) => {
                    handle.send_line(format!("echo:{}", line)).unwrap();
                }
                other => panic!("unexpected event: {:?}", other),
            }
        });

        let (handle, mut events) = connect(&addr, b'\n').await.unwrap();
        handle.send_line("hello").unwrap();
        match events.recv().await {
            Some(SocketEvent::Line(line)) => assert_eq!(line, "echo:hello"),
            other => panic!("unexpected event: {:?}", other),
        }
        server.await.unwrap();
    }

    #[tokio::test]
    async fn closing_the_socket_surfaces_a_closed_event() {
        let mut listener = Listener::bind(&[0], Duration::from_millis(1)).await.unwrap();
        let addr = format!("127.0.0.1:{}", listener.local_port);

        let server = tokio::spawn(async move {
            let (_addr, handle, _events) = listener.accept(b'\n').await.unwrap();
            handle.shutdown();
        });

        let (_handle, mut events) = connect(&addr, b'\n').await.unwrap();
        match events.recv().await {
            Some(SocketEvent::Closed) => {}
            other => panic!("expected Closed, got {:?}", other),
        }
        server.await.unwrap();
    }
}
