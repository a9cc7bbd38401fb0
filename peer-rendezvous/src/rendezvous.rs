//! Request/accept/deny handshake between two dispatchers.
//!
//! The requester's dispatcher drives the whole negotiation:
//!
//! 1. `Registry::begin_request` marks the target as pending under the lock,
//!    or refuses when the target is unknown or already solicited.
//! 2. With the lock released, a [`Solicitation`] is posted to the target's
//!    mailbox and the requester waits, bounded by the configured timeout, for
//!    the target's dispatcher to relay a `Y`/`N` answer.
//! 3. The outcome is applied under the lock again: acceptance makes both
//!    parties private and exchanges addresses, every other outcome simply
//!    clears the marker.
//!
//! A target that disconnects drops its reply slot, which surfaces here as an
//! aborted request rather than a hang. A requester that disconnects withdraws
//! its request, and the target is told so.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Result;
use futures::StreamExt;
use tokio::{select, sync::oneshot};
use tracing::{debug, info};

use crate::{
    dispatcher::{Dispatcher, Event, Outbound, render_public_list},
    frame::{Frame, FrameType},
    registry::Registry,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RendezvousStatus {
    Pending,
    Accepted,
    Denied,
    TimedOut,
    Aborted,
}

/// A connection request from `requester` to `target`, alive while pending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RendezvousRequest {
    pub ticket: u64,
    pub requester: String,
    pub target: String,
    pub status: RendezvousStatus,
}

impl RendezvousRequest {
    pub fn new(ticket: u64, requester: &str, target: &str) -> Self {
        Self {
            ticket,
            requester: requester.to_string(),
            target: target.to_string(),
            status: RendezvousStatus::Pending,
        }
    }
}

/// The target's answer, relayed by its dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Answer {
    Accept,
    Decline,
    /// The target's dispatcher is itself waiting on a rendezvous.
    Busy,
}

/// Delivered to the target's dispatcher, which prompts its client and replies.
#[derive(Debug)]
pub struct Solicitation {
    pub ticket: u64,
    pub requester: String,
    pub reply: oneshot::Sender<Answer>,
}

impl Solicitation {
    pub fn prompt(&self) -> String {
        format!(
            "{} wants to speak to you. Type 'Y' to accept, and 'N' to deny.",
            self.requester
        )
    }
}

/// How the unlocked wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Wait {
    Answered(Answer),
    TimedOut,
    TargetGone,
    RequesterGone,
}

/// Clears the target's pending marker on every exit path.
struct PendingGuard {
    registry: Arc<Registry>,
    request: RendezvousRequest,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.registry.finish_request(&self.request);
    }
}

/// Negotiates a peer session between `dispatcher`'s client and `target`.
///
/// Errors only when the requester's own connection fails; every other outcome
/// is reported to the requester with a frame and returned as a status.
pub async fn negotiate(dispatcher: &mut Dispatcher, target: &str) -> Result<RendezvousStatus> {
    let registry = Arc::clone(dispatcher.registry());
    let requester = dispatcher.id().to_string();
    let timeout = dispatcher.reply_timeout();

    let (request, target_handle) = match registry.begin_request(&requester, target) {
        Ok(pending) => pending,
        Err(err) => {
            info!(%requester, %target, reason = %err, "connection request refused");
            dispatcher.send(denied(err.to_string())).await?;
            return Ok(RendezvousStatus::Denied);
        }
    };
    let mut marker = PendingGuard {
        registry: Arc::clone(&registry),
        request,
    };
    info!(ticket = marker.request.ticket, %requester, %target, "connection request sent");

    let (reply_tx, reply_rx) = oneshot::channel();
    let solicitation = Solicitation {
        ticket: marker.request.ticket,
        requester: requester.clone(),
        reply: reply_tx,
    };
    let wait = if target_handle.send(Outbound::Solicit(solicitation)) {
        await_answer(dispatcher, reply_rx, timeout).await?
    } else {
        Wait::TargetGone
    };

    let status = match wait {
        Wait::Answered(Answer::Accept) => match registry.accept_request(&marker.request) {
            Ok((requester_addr, target_addr)) => {
                target_handle.send(Outbound::Frame(Frame::message(
                    requester.clone(),
                    announce_address(&requester, requester_addr),
                )));
                dispatcher
                    .send(Frame::message(target, announce_address(target, target_addr)))
                    .await?;
                RendezvousStatus::Accepted
            }
            Err(err) => {
                dispatcher.send(denied(err.to_string())).await?;
                RendezvousStatus::Aborted
            }
        },
        Wait::Answered(Answer::Decline) => {
            registry.finish_request(&marker.request);
            let listing = render_public_list(&registry.list_public());
            dispatcher
                .send(denied(format!(
                    "USER: {target} does not want to speak to you!\n\
                     Please view the list of other available clients:\n{listing}"
                )))
                .await?;
            RendezvousStatus::Denied
        }
        Wait::Answered(Answer::Busy) => {
            registry.finish_request(&marker.request);
            dispatcher
                .send(denied(format!("{target} is busy with another connection request")))
                .await?;
            RendezvousStatus::Denied
        }
        Wait::TimedOut => {
            registry.finish_request(&marker.request);
            dispatcher
                .send(denied(format!("{target} did not respond in time")))
                .await?;
            RendezvousStatus::TimedOut
        }
        Wait::TargetGone => {
            registry.finish_request(&marker.request);
            dispatcher
                .send(denied(format!("{target} disconnected before answering")))
                .await?;
            RendezvousStatus::Aborted
        }
        Wait::RequesterGone => {
            registry.finish_request(&marker.request);
            target_handle.send(Outbound::Withdraw {
                ticket: marker.request.ticket,
                requester: requester.clone(),
            });
            RendezvousStatus::Aborted
        }
    };

    marker.request.status = status;
    info!(
        ticket = marker.request.ticket,
        %requester,
        %target,
        status = ?marker.request.status,
        "connection request resolved"
    );
    Ok(status)
}

/// Waits for the target's answer without holding the registry lock.
///
/// The requester's own stream and mailbox keep being served meanwhile. Its
/// `Y`/`N` answers to someone else's request go through at once, other frames
/// are deferred until the negotiation finishes, and anyone trying to solicit
/// it is told it is busy.
async fn await_answer(
    dispatcher: &mut Dispatcher,
    mut reply: oneshot::Receiver<Answer>,
    timeout: Duration,
) -> Result<Wait> {
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    loop {
        let (reader, mailbox) = dispatcher.inbound_mut();
        select! {
            answer = &mut reply => {
                return Ok(match answer {
                    Ok(answer) => Wait::Answered(answer),
                    Err(_) => Wait::TargetGone,
                });
            }
            _ = &mut deadline => return Ok(Wait::TimedOut),
            inbound = reader.next() => match inbound {
                Some(Ok(frame)) if frame.kind == FrameType::Message => {
                    dispatcher.handle_answer(&frame.text()).await?;
                }
                Some(Ok(frame)) => dispatcher.defer(Event::Inbound(Some(Ok(frame)))),
                ended => {
                    dispatcher.defer(Event::Inbound(ended));
                    debug!(id = dispatcher.id(), "requester went away mid-negotiation");
                    return Ok(Wait::RequesterGone);
                }
            },
            Some(outbound) = mailbox.recv() => match outbound {
                Outbound::Solicit(solicitation) => {
                    let _ = solicitation.reply.send(Answer::Busy);
                }
                Outbound::Frame(frame) => dispatcher.send(frame).await?,
                Outbound::Withdraw { ticket, requester } => {
                    dispatcher.withdraw(ticket, &requester).await?;
                }
                Outbound::Shutdown => {
                    dispatcher.defer(Event::Outbound(Outbound::Shutdown));
                    return Ok(Wait::RequesterGone);
                }
            },
        }
    }
}

fn denied(text: String) -> Frame {
    Frame::from_server(FrameType::Denied, text)
}

/// Payload of the `Message` frame that hands a peer's address over.
pub fn announce_address(id: &str, address: SocketAddr) -> String {
    format!("{id}'s address: {address}")
}

/// Inverse of [`announce_address`]; `None` for any other message text.
pub fn parse_address_announcement(text: &str) -> Option<(String, SocketAddr)> {
    let (id, address) = text.trim().split_once("'s address: ")?;
    let address = address.trim().parse().ok()?;
    Some((id.to_string(), address))
}
