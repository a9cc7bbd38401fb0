use std::{
    io::BufRead,
    net::SocketAddr,
};

use anyhow::{Context, Result, bail};
use futures::{SinkExt, StreamExt};
use tokio::{
    io::{self, AsyncWriteExt},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
    sync::mpsc,
};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{info, warn};

use crate::{
    cli::ClientArgs,
    command::Command,
    frame::{Frame, FrameCodec, FrameType},
    rendezvous::parse_address_announcement,
    session::{FAREWELL, PeerSession, SessionEnd},
};

struct Connection {
    reader: FramedRead<OwnedReadHalf, FrameCodec>,
    writer: FramedWrite<OwnedWriteHalf, FrameCodec>,
    /// Final identity assigned by the broker.
    id: String,
    local_addr: SocketAddr,
}

#[derive(Debug, Default)]
struct ClientState {
    /// Requester whose connection request is waiting on a `Y`/`N`.
    awaiting_decision: Option<String>,
    terminating: bool,
}

pub async fn run(args: ClientArgs) -> Result<()> {
    let mut connection = establish_connection(&args).await?;
    register(&mut connection, &args).await?;
    write_stdout(&format!("*** connected as {}", connection.id)).await?;

    let mut lines = spawn_stdin_reader();
    run_client_loop(&mut connection, &mut lines).await?;
    shutdown_connection(&mut connection).await;

    Ok(())
}

async fn establish_connection(args: &ClientArgs) -> Result<Connection> {
    let stream = TcpStream::connect(args.server)
        .await
        .with_context(|| format!("failed to connect to {}", args.server))?;
    let local_addr = stream.local_addr()?;

    info!("connected to {} from {}", args.server, local_addr);

    let (reader, writer) = stream.into_split();
    Ok(Connection {
        reader: FramedRead::new(reader, FrameCodec),
        writer: FramedWrite::new(writer, FrameCodec),
        id: args.id.clone(),
        local_addr,
    })
}

async fn register(connection: &mut Connection, args: &ClientArgs) -> Result<()> {
    let registration = Frame::message(args.id.clone(), args.visibility.as_flag());
    connection.writer.send(registration).await?;

    match connection.reader.next().await {
        Some(Ok(frame)) if frame.kind == FrameType::Control => {
            connection.id = frame.text().into_owned();
            Ok(())
        }
        Some(Ok(frame)) => bail!("registration refused: {}", frame.text()),
        Some(Err(err)) => Err(err).context("failed to read registration reply"),
        None => bail!("connection closed before registration completed"),
    }
}

/// Reads stdin on a dedicated thread; tokio's stdin cannot be cancelled and
/// would keep the runtime alive on exit.
fn spawn_stdin_reader() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(16);
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            if tx.blocking_send(line).is_err() {
                break;
            }
        }
    });
    rx
}

async fn run_client_loop(
    connection: &mut Connection,
    lines: &mut mpsc::Receiver<String>,
) -> Result<()> {
    let mut state = ClientState::default();

    loop {
        select! {
            frame = connection.reader.next() => {
                let Some(frame) = frame else {
                    write_stdout("*** server closed the connection").await?;
                    break;
                };
                let frame = frame.context("failed to read from server")?;
                if !handle_server_frame(frame, connection, lines, &mut state).await? {
                    break;
                }
            }
            line = lines.recv() => {
                let Some(line) = line else { break };
                handle_input(&line, connection, &mut state).await?;
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                handle_ctrl_c(ctrl_c);
                break;
            }
        }
    }
    Ok(())
}

async fn handle_server_frame(
    frame: Frame,
    connection: &mut Connection,
    lines: &mut mpsc::Receiver<String>,
    state: &mut ClientState,
) -> Result<bool> {
    let text = frame.text();
    let text = text.trim_end();

    match frame.kind {
        FrameType::ConnectionRequest => {
            write_stdout(&format!("REQUEST RECEIVED!! {text}")).await?;
            write_stdout("Enter reply (Y/N):").await?;
            state.awaiting_decision = Some(frame.sender.clone());
        }
        FrameType::Message => match parse_address_announcement(text) {
            Some((peer_id, peer_addr)) => {
                chat(connection, lines, &peer_id, peer_addr).await?;
            }
            None => write_stdout(text).await?,
        },
        FrameType::Control => {
            write_stdout(text).await?;
            if state.terminating {
                return Ok(false);
            }
        }
        FrameType::Denied => {
            if state.awaiting_decision.as_deref() == Some(frame.sender.as_str()) {
                state.awaiting_decision = None;
            }
            write_stderr(&format!("!!! {text}")).await?;
        }
        FrameType::Command => write_stdout(text).await?,
    }
    Ok(true)
}

async fn handle_input(
    line: &str,
    connection: &mut Connection,
    state: &mut ClientState,
) -> Result<()> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(());
    }

    if let Some(requester) = state.awaiting_decision.as_deref() {
        let reply = line.to_ascii_uppercase();
        if reply != "Y" && reply != "N" {
            write_stdout("Invalid reply, say Y or N").await?;
            return Ok(());
        }
        if reply == "N" {
            write_stdout(&format!("*** declined {requester}, proceed with your commands")).await?;
        }
        let answer = Frame::message(connection.id.clone(), reply);
        connection.writer.send(answer).await?;
        state.awaiting_decision = None;
        return Ok(());
    }

    let command = match Command::parse(line) {
        Ok(command) => command,
        Err(err) => {
            write_stderr(&format!("!!! {err}")).await?;
            return Ok(());
        }
    };

    match &command {
        Command::ConnectTo { target } => {
            write_stdout(&format!("*** waiting for {target} to reply...")).await?;
        }
        Command::Terminate => state.terminating = true,
        _ => {}
    }

    let frame = Frame::command(connection.id.clone(), command.to_string());
    connection.writer.send(frame).await?;
    Ok(())
}

/// Runs the direct peer session, then hands stdin back to the command loop.
async fn chat(
    connection: &Connection,
    lines: &mut mpsc::Receiver<String>,
    peer_id: &str,
    peer_addr: SocketAddr,
) -> Result<()> {
    let session = PeerSession::bind(connection.local_addr, peer_addr, &connection.id).await?;
    write_stdout(&format!(
        "*** chatting with {peer_id} at {peer_addr}, type '{FAREWELL}' to finish"
    ))
    .await?;

    let (output, mut inbound) = mpsc::channel::<String>(16);
    let printer = tokio::spawn(async move {
        while let Some(line) = inbound.recv().await {
            if let Err(error) = write_stdout(&line).await {
                warn!(?error, "failed to print peer message");
            }
        }
    });

    let (_, placeholder) = mpsc::channel(1);
    let input = std::mem::replace(lines, placeholder);
    let (input, end) = session.run(input, output).await?;
    *lines = input;
    let _ = printer.await;

    match end {
        SessionEnd::InputClosed => write_stdout("*** chat closed, input ended").await?,
        SessionEnd::FarewellSent | SessionEnd::FarewellReceived => {
            write_stdout("*** chat closed").await?
        }
    }
    Ok(())
}

fn handle_ctrl_c(result: io::Result<()>) {
    if let Err(error) = result {
        warn!(?error, "ctrl-c handler failed");
    }
}

async fn shutdown_connection(connection: &mut Connection) {
    if let Err(error) = connection.writer.get_mut().shutdown().await {
        warn!(?error, "failed to shutdown client writer cleanly");
    }
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}

async fn write_stderr(line: &str) -> io::Result<()> {
    let mut stderr = tokio::io::stderr();
    stderr.write_all(line.as_bytes()).await?;
    stderr.write_all(b"\n").await?;
    stderr.flush().await
}
