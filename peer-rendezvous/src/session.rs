//! Direct peer session that runs after a successful rendezvous.
//!
//! Each side binds a UDP socket to the local endpoint it already used for the
//! broker connection and starts two tasks: one sends lines from an input
//! channel to the peer, the other forwards datagrams from the peer to an
//! output channel. Both tasks share a [`CancellationToken`]; whichever loop
//! sends or receives the farewell token cancels it, and the other loop sees
//! the cancellation on its next iteration.

use std::{io, net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use tokio::{net::UdpSocket, select, sync::mpsc};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Message body that ends the session for both sides.
pub const FAREWELL: &str = "bye";

const MAX_DATAGRAM_LEN: usize = 2048;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    FarewellSent,
    FarewellReceived,
    InputClosed,
}

pub struct PeerSession {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    display_id: String,
}

impl PeerSession {
    pub async fn bind(local: SocketAddr, peer: SocketAddr, display_id: &str) -> Result<Self> {
        let socket = UdpSocket::bind(local)
            .await
            .with_context(|| format!("failed to bind peer socket on {local}"))?;
        Ok(Self::new(socket, peer, display_id))
    }

    pub fn new(socket: UdpSocket, peer: SocketAddr, display_id: &str) -> Self {
        Self {
            socket: Arc::new(socket),
            peer,
            display_id: display_id.to_string(),
        }
    }

    /// Runs both loops until either ends, handing the input channel back.
    pub async fn run(
        self,
        input: mpsc::Receiver<String>,
        output: mpsc::Sender<String>,
    ) -> Result<(mpsc::Receiver<String>, SessionEnd)> {
        let cancel = CancellationToken::new();
        debug!(peer = %self.peer, "peer session started");

        let sender = tokio::spawn(send_loop(
            Arc::clone(&self.socket),
            self.peer,
            self.display_id,
            input,
            cancel.clone(),
        ));
        let receiver = tokio::spawn(receive_loop(self.socket, self.peer, output, cancel));

        let ((input, sent), received) =
            tokio::try_join!(sender, receiver).context("peer session task failed")?;
        let sent = sent.context("failed to send to peer")?;
        let received = received.context("failed to receive from peer")?;

        let end = sent.or(received).unwrap_or(SessionEnd::InputClosed);
        debug!(peer = %self.peer, ?end, "peer session finished");
        Ok((input, end))
    }
}

async fn send_loop(
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    display_id: String,
    mut input: mpsc::Receiver<String>,
    cancel: CancellationToken,
) -> (mpsc::Receiver<String>, io::Result<Option<SessionEnd>>) {
    let _stop_receiver = cancel.clone().drop_guard();
    let result = forward_lines(&socket, peer, &display_id, &mut input, &cancel).await;
    (input, result)
}

async fn forward_lines(
    socket: &UdpSocket,
    peer: SocketAddr,
    display_id: &str,
    input: &mut mpsc::Receiver<String>,
    cancel: &CancellationToken,
) -> io::Result<Option<SessionEnd>> {
    loop {
        let line = select! {
            _ = cancel.cancelled() => return Ok(None),
            line = input.recv() => line,
        };
        let Some(line) = line else {
            return Ok(Some(SessionEnd::InputClosed));
        };

        socket
            .send_to(format_datagram(display_id, &line).as_bytes(), peer)
            .await?;
        if is_farewell(&line) {
            return Ok(Some(SessionEnd::FarewellSent));
        }
    }
}

async fn receive_loop(
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    output: mpsc::Sender<String>,
    cancel: CancellationToken,
) -> io::Result<Option<SessionEnd>> {
    let _stop_sender = cancel.clone().drop_guard();
    let mut buf = vec![0u8; MAX_DATAGRAM_LEN];

    loop {
        let (len, from) = select! {
            _ = cancel.cancelled() => return Ok(None),
            received = socket.recv_from(&mut buf) => received?,
        };
        if from != peer {
            debug!(%from, "ignoring datagram from unexpected sender");
            continue;
        }

        let text = String::from_utf8_lossy(&buf[..len]).into_owned();
        let farewell = is_farewell(message_body(&text));
        if output.send(text).await.is_err() {
            return Ok(None);
        }
        if farewell {
            return Ok(Some(SessionEnd::FarewellReceived));
        }
    }
}

/// Datagram text as shown to the peer: `<id>: message`.
pub fn format_datagram(display_id: &str, text: &str) -> String {
    format!("<{display_id}>: {text}")
}

/// The message text with the sender prefix stripped.
pub fn message_body(datagram: &str) -> &str {
    datagram
        .split_once(">: ")
        .map(|(_, body)| body)
        .unwrap_or(datagram)
}

pub fn is_farewell(text: &str) -> bool {
    text.trim().eq_ignore_ascii_case(FAREWELL)
}
