use std::{path::Path, process::Stdio, time::Duration};

use anyhow::{Context, Result, anyhow, bail};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines},
    process::{Child, ChildStdin, ChildStdout, Command},
    task::JoinHandle,
    time::timeout,
};

const READ_TIMEOUT: Duration = Duration::from_secs(3);
const LIST_HEADER: &str = "-------LIST OF AVAILABLE CLIENTS-------";

#[tokio::test]
async fn cli_rendezvous_end_to_end() -> Result<()> {
    let binary = assert_cmd::cargo::cargo_bin!("peer_rendezvous");

    let broker_args = ["broker", "--listen", "127.0.0.1:0"];
    let mut broker = Running::launch(&binary, "broker", &broker_args, "info")?;
    let banner = broker.next_line().await?;
    let addr = banner
        .split_whitespace()
        .last()
        .filter(|word| word.contains(':'))
        .with_context(|| format!("broker banner has no address: {banner}"))?
        .to_string();
    let (mut broker_child, broker_output) = broker.into_background();

    let mut amy = Running::client(&binary, "amy", &addr).await?;
    let mut bob = Running::client(&binary, "bob", &addr).await?;

    bob.say("LIST_CLIENTS").await?;
    bob.expect(LIST_HEADER).await?;
    bob.expect("1. amy").await?;
    bob.expect("2. bob").await?;

    // bob asks for amy; amy is prompted and accepts.
    bob.say("CONNECT_TO amy").await?;
    bob.expect("*** waiting for amy to reply...").await?;
    amy.expect_prefix("REQUEST RECEIVED!! bob wants to speak to you.")
        .await?;
    amy.expect("Enter reply (Y/N):").await?;
    amy.say("Y").await?;

    amy.expect_prefix("*** chatting with bob at 127.0.0.1:").await?;
    bob.expect_prefix("*** chatting with amy at 127.0.0.1:").await?;

    // Both sockets are bound once the banners are printed.
    bob.say("hi amy").await?;
    amy.expect("<bob>: hi amy").await?;

    amy.say("bye").await?;
    bob.expect("<amy>: bye").await?;
    bob.expect("*** chat closed").await?;
    amy.expect("*** chat closed").await?;

    // Both went private after the rendezvous, so the listing is empty.
    amy.say("LIST_CLIENTS").await?;
    amy.expect(LIST_HEADER).await?;

    amy.say("TERMINATE").await?;
    amy.expect("Good bye and take care!").await?;
    bob.say("terminate").await?;
    bob.expect("Good bye and take care!").await?;

    amy.finish().await?;
    bob.finish().await?;

    let _ = broker_child.kill().await;
    let _ = broker_child.wait().await;
    let _ = broker_output.await;
    Ok(())
}

/// A spawned `peer_rendezvous` process with its stdout read line by line.
struct Running {
    name: String,
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: Lines<BufReader<ChildStdout>>,
}

impl Running {
    fn launch(binary: &Path, name: &str, args: &[&str], log_filter: &str) -> Result<Self> {
        let mut child = Command::new(binary)
            .args(args)
            .env("RUST_LOG", log_filter)
            .env("NO_COLOR", "1")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn {name}"))?;

        let stdout = child
            .stdout
            .take()
            .with_context(|| format!("{name}: stdout was not piped"))?;
        Ok(Self {
            name: name.to_string(),
            stdin: child.stdin.take(),
            child,
            stdout: BufReader::new(stdout).lines(),
        })
    }

    /// Starts a client and waits for its registration banner.
    async fn client(binary: &Path, id: &str, server: &str) -> Result<Self> {
        let args = ["client", "--id", id, "--server", server];
        let mut client = Self::launch(binary, id, &args, "warn")?;
        client.expect(&format!("*** connected as {id}")).await?;
        Ok(client)
    }

    async fn say(&mut self, line: &str) -> Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .with_context(|| format!("{}: stdin already closed", self.name))?;
        stdin.write_all(format!("{line}\n").as_bytes()).await?;
        stdin.flush().await?;
        Ok(())
    }

    async fn next_line(&mut self) -> Result<String> {
        match timeout(READ_TIMEOUT, self.stdout.next_line()).await {
            Ok(Ok(Some(line))) => Ok(line),
            Ok(Ok(None)) => Err(anyhow!("{}: output ended", self.name)),
            Ok(Err(err)) => {
                Err(err).with_context(|| format!("{}: failed to read output", self.name))
            }
            Err(_) => Err(anyhow!("{}: no output within {READ_TIMEOUT:?}", self.name)),
        }
    }

    async fn expect(&mut self, expected: &str) -> Result<()> {
        let line = self.next_line().await?;
        if line != expected {
            bail!("{}: expected '{expected}', got '{line}'", self.name);
        }
        Ok(())
    }

    async fn expect_prefix(&mut self, prefix: &str) -> Result<()> {
        let line = self.next_line().await?;
        if !line.starts_with(prefix) {
            bail!("{}: expected a line starting '{prefix}', got '{line}'", self.name);
        }
        Ok(())
    }

    /// Waits for the process to exit on its own and checks its status.
    async fn finish(mut self) -> Result<()> {
        let status = timeout(READ_TIMEOUT, self.child.wait())
            .await
            .map_err(|_| anyhow!("{}: did not exit", self.name))??;
        if !status.success() {
            bail!("{} exited with {status}", self.name);
        }
        Ok(())
    }

    /// Keeps draining stdout in the background so the pipe never fills.
    fn into_background(self) -> (Child, JoinHandle<()>) {
        let mut stdout = self.stdout;
        let drain = tokio::spawn(async move {
            while let Ok(Some(_)) = stdout.next_line().await {}
        });
        (self.child, drain)
    }
}
