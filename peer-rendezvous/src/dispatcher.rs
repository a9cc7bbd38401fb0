//! Per-connection command dispatcher.
//!
//! Each accepted connection is served by one [`Dispatcher`] running on its own
//! task. It owns the connection exclusively; other tasks reach it through the
//! [`ClientHandle`] stored in the registry, which feeds the dispatcher's
//! mailbox.
//!
//! Dropping the dispatcher is the single cleanup path: the client is removed
//! from the registry and its pending requests are released before the socket
//! and any outstanding reply slot go away.

use std::{collections::VecDeque, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result, anyhow, bail};
use futures::{SinkExt, StreamExt};
use tokio::{
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
    sync::mpsc::{self, error::TrySendError},
};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, warn};

use crate::{
    broker::BrokerConfig,
    command::{Command, Visibility},
    frame::{Frame, FrameCodec, FrameError, FrameType},
    registry::Registry,
    rendezvous::{self, Answer, Solicitation},
};

/// Longest identity a client may request.
pub const MAX_ID_LEN: usize = 64;

/// Outbound items a dispatcher may have queued before senders are refused.
pub const MAILBOX_CAPACITY: usize = 128;

const LIST_HEADER: &str = "-------LIST OF AVAILABLE CLIENTS-------";
const FAREWELL_ACK: &str = "Good bye and take care!";

/// Work handed to a dispatcher by other tasks.
#[derive(Debug)]
pub enum Outbound {
    /// Write this frame to the client.
    Frame(Frame),
    /// Ask the client whether it accepts a connection request.
    Solicit(Solicitation),
    /// The requester behind `ticket` left before the client answered.
    Withdraw { ticket: u64, requester: String },
    /// The broker is stopping.
    Shutdown,
}

pub type Mailbox = mpsc::Receiver<Outbound>;

/// Sending side of a dispatcher's mailbox.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    tx: mpsc::Sender<Outbound>,
}

impl ClientHandle {
    pub fn channel() -> (Self, Mailbox) {
        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        (Self { tx }, rx)
    }

    /// Queues without waiting. Returns `false` when the dispatcher has gone
    /// away or is too far behind to take more.
    pub fn send(&self, outbound: Outbound) -> bool {
        match self.tx.try_send(outbound) {
            Ok(()) => true,
            Err(TrySendError::Full(outbound)) => {
                warn!(?outbound, "client mailbox full, dropping item");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}

/// Something the dispatcher has to react to.
#[derive(Debug)]
pub enum Event {
    Inbound(Option<Result<Frame, FrameError>>),
    Outbound(Outbound),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Terminate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Registration {
    id: String,
    visibility: Visibility,
}

type FrameReader = FramedRead<OwnedReadHalf, FrameCodec>;
type FrameWriter = FramedWrite<OwnedWriteHalf, FrameCodec>;

/// Serves one accepted connection until it terminates.
pub async fn serve(stream: TcpStream, registry: Arc<Registry>, config: BrokerConfig) -> Result<()> {
    let address = stream.peer_addr().context("connection has no peer address")?;
    let (reader, writer) = stream.into_split();
    let mut reader = FramedRead::new(reader, FrameCodec);
    let mut writer = FramedWrite::new(writer, FrameCodec);

    let Some(registration) = read_registration(&mut reader, &mut writer).await? else {
        debug!(%address, "connection closed before registering");
        return Ok(());
    };

    let (handle, mailbox) = ClientHandle::channel();
    let id = registry.register(&registration.id, handle, address, registration.visibility);
    let mut dispatcher = Dispatcher {
        id,
        address,
        registry,
        reply_timeout: config.reply_timeout,
        reader,
        writer,
        mailbox,
        solicitation: None,
        deferred: VecDeque::new(),
    };
    info!(
        id = %dispatcher.id,
        peer = %address,
        visibility = %registration.visibility,
        "client registered"
    );

    let welcome = Frame::from_server(FrameType::Control, dispatcher.id.clone());
    dispatcher.send(welcome).await?;
    dispatcher.run().await
}

async fn read_registration(
    reader: &mut FrameReader,
    writer: &mut FrameWriter,
) -> Result<Option<Registration>> {
    let frame = match reader.next().await {
        Some(frame) => frame.context("failed to read registration frame")?,
        None => return Ok(None),
    };

    if frame.kind != FrameType::Message {
        bail!("expected a registration message, got a {} frame", frame.kind);
    }
    let visibility = Visibility::from_flag(&frame.text())
        .ok_or_else(|| anyhow!("invalid visibility flag {:?}", frame.text()))?;

    let id = frame.sender.trim();
    if let Err(reason) = validate_id(id) {
        writer
            .send(Frame::from_server(FrameType::Denied, reason))
            .await
            .context("failed to reject registration")?;
        bail!("rejected identity {id:?}: {reason}");
    }

    Ok(Some(Registration {
        id: id.to_string(),
        visibility,
    }))
}

fn validate_id(id: &str) -> Result<(), &'static str> {
    if id.is_empty() {
        Err("identity cannot be empty")
    } else if id.chars().any(char::is_whitespace) {
        Err("identity cannot contain whitespace")
    } else if id.len() > MAX_ID_LEN {
        Err("identity is longer than 64 bytes")
    } else {
        Ok(())
    }
}

pub struct Dispatcher {
    id: String,
    address: SocketAddr,
    registry: Arc<Registry>,
    reply_timeout: Duration,
    reader: FrameReader,
    writer: FrameWriter,
    mailbox: Mailbox,
    /// Connection request awaiting this client's `Y`/`N`.
    solicitation: Option<Solicitation>,
    /// Events that arrived while a rendezvous was in flight.
    deferred: VecDeque<Event>,
}

impl Dispatcher {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn reply_timeout(&self) -> Duration {
        self.reply_timeout
    }

    pub async fn send(&mut self, frame: Frame) -> Result<()> {
        self.writer
            .send(frame)
            .await
            .with_context(|| format!("failed to write to {}", self.id))
    }

    pub(crate) fn inbound_mut(&mut self) -> (&mut FrameReader, &mut Mailbox) {
        (&mut self.reader, &mut self.mailbox)
    }

    pub(crate) fn defer(&mut self, event: Event) {
        self.deferred.push_back(event);
    }

    async fn run(&mut self) -> Result<()> {
        loop {
            let event = match self.deferred.pop_front() {
                Some(event) => event,
                None => self.next_event().await,
            };
            if self.handle_event(event).await? == Flow::Terminate {
                return Ok(());
            }
        }
    }

    async fn next_event(&mut self) -> Event {
        select! {
            inbound = self.reader.next() => Event::Inbound(inbound),
            Some(outbound) = self.mailbox.recv() => Event::Outbound(outbound),
        }
    }

    async fn handle_event(&mut self, event: Event) -> Result<Flow> {
        match event {
            Event::Inbound(Some(Ok(frame))) => self.dispatch_frame(frame).await,
            Event::Inbound(Some(Err(err))) => {
                Err(anyhow::Error::new(err).context(format!("bad frame from {}", self.id)))
            }
            Event::Inbound(None) => {
                debug!(id = %self.id, "client closed the connection");
                Ok(Flow::Terminate)
            }
            Event::Outbound(outbound) => self.deliver(outbound).await,
        }
    }

    async fn dispatch_frame(&mut self, frame: Frame) -> Result<Flow> {
        match frame.kind {
            FrameType::Command => self.handle_command(&frame.text()).await,
            FrameType::Message => {
                self.handle_answer(&frame.text()).await?;
                Ok(Flow::Continue)
            }
            other => {
                debug!(id = %self.id, kind = %other, "unexpected frame type from client");
                self.reply(FrameType::Message, "unrecognized command").await?;
                Ok(Flow::Continue)
            }
        }
    }

    async fn handle_command(&mut self, text: &str) -> Result<Flow> {
        let command = match Command::parse(text) {
            Ok(command) => command,
            Err(err) => {
                debug!(id = %self.id, %err, "rejecting command");
                self.reply(FrameType::Message, err.to_string()).await?;
                return Ok(Flow::Continue);
            }
        };
        debug!(id = %self.id, %command, "dispatching command");

        match command {
            Command::ListClients => {
                let listing = render_public_list(&self.registry.list_public());
                self.reply(FrameType::Control, listing).await?;
            }
            Command::Visibility(visibility) => {
                match self.registry.set_visibility(&self.id, visibility) {
                    Ok(()) => {
                        info!(id = %self.id, %visibility, "visibility updated");
                        let ack = format!("Visibility status changed to {visibility}");
                        self.reply(FrameType::Control, ack).await?;
                    }
                    Err(err) => self.reply(FrameType::Denied, err.to_string()).await?,
                }
            }
            Command::ConnectTo { target } if target == self.id => {
                self.reply(FrameType::Denied, "you cannot connect to yourself")
                    .await?;
            }
            Command::ConnectTo { target } => {
                rendezvous::negotiate(self, &target).await?;
            }
            Command::Terminate => {
                info!(id = %self.id, "client terminating");
                self.reply(FrameType::Control, FAREWELL_ACK).await?;
                return Ok(Flow::Terminate);
            }
        }
        Ok(Flow::Continue)
    }

    /// Relays a `Y`/`N` answer to whoever is waiting on this client.
    ///
    /// Also called while this client's own connection request is in flight,
    /// so a requester waiting on us is never held up by that.
    pub(crate) async fn handle_answer(&mut self, text: &str) -> Result<()> {
        let Some(solicitation) = self.solicitation.take() else {
            return self
                .reply(FrameType::Message, "there is no pending connection request")
                .await;
        };

        let answer = match text.trim().to_ascii_uppercase().as_str() {
            "Y" => Answer::Accept,
            "N" => Answer::Decline,
            _ => {
                self.solicitation = Some(solicitation);
                return self
                    .reply(FrameType::Message, "Invalid reply, say Y or N")
                    .await;
            }
        };

        debug!(id = %self.id, requester = %solicitation.requester, ?answer, "answering connection request");
        if solicitation.reply.send(answer).is_err() {
            self.reply(
                FrameType::Message,
                "that connection request is no longer available",
            )
            .await?;
        }
        Ok(())
    }

    /// Drops the outstanding solicitation if it belongs to `ticket` and tells
    /// the client the requester is gone.
    pub(crate) async fn withdraw(&mut self, ticket: u64, requester: &str) -> Result<()> {
        if self.solicitation.as_ref().map(|pending| pending.ticket) != Some(ticket) {
            return Ok(());
        }
        self.solicitation = None;
        debug!(id = %self.id, %requester, ticket, "connection request withdrawn");
        let notice = format!("{requester} withdrew the connection request");
        // Sent as the requester so the client can match it to its prompt.
        self.send(Frame::new(FrameType::Denied, requester, notice))
            .await
    }

    async fn deliver(&mut self, outbound: Outbound) -> Result<Flow> {
        match outbound {
            Outbound::Frame(frame) => self.send(frame).await?,
            Outbound::Solicit(solicitation) => {
                let request = Frame::new(
                    FrameType::ConnectionRequest,
                    solicitation.requester.clone(),
                    solicitation.prompt(),
                );
                // Only one request can target a client at a time, so any
                // previous slot belongs to a request that already resolved.
                self.solicitation = Some(solicitation);
                self.send(request).await?;
            }
            Outbound::Withdraw { ticket, requester } => {
                self.withdraw(ticket, &requester).await?;
            }
            Outbound::Shutdown => {
                self.reply(FrameType::Control, "broker shutting down").await?;
                return Ok(Flow::Terminate);
            }
        }
        Ok(Flow::Continue)
    }

    async fn reply(&mut self, kind: FrameType, text: impl Into<String>) -> Result<()> {
        self.send(Frame::from_server(kind, text.into().into_bytes()))
            .await
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        // Runs before the fields drop, so a requester waiting on our reply
        // slot only observes the abort once the registry has forgotten us.
        self.registry.release_requests(&self.id);
        if self.registry.unregister(&self.id).is_some() {
            info!(id = %self.id, peer = %self.address, "client disconnected");
        }
    }
}

/// Numbered listing sent in reply to `LIST_CLIENTS`.
pub fn render_public_list(ids: &[String]) -> String {
    let mut listing = String::from(LIST_HEADER);
    listing.push('\n');
    for (index, id) in ids.iter().enumerate() {
        listing.push_str(&format!("{}. {id}\n", index + 1));
    }
    listing
}
