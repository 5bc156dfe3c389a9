use std::{path::Path, process::Stdio, time::Duration};

use anyhow::{Context, Result, anyhow};
use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
    net::TcpStream,
    process::{Child, ChildStdout, Command},
    time::timeout,
};

const READ_TIMEOUT: Duration = Duration::from_secs(3);

#[tokio::test]
async fn relay_binary_end_to_end() -> Result<()> {
    let log_dir = tempfile::tempdir()?;
    let event_log = log_dir.path().join("events.log");

    let (mut relay, mut relay_stdout) = spawn_relay(&event_log).await?;
    let addr = read_relay_addr(&mut relay_stdout).await?;

    // Drain additional relay logs in the background so the pipe never fills.
    let relay_log_task = tokio::spawn(async move {
        drain_stdout(relay_stdout).await;
    });

    let mut alice = TcpStream::connect(&addr).await?;
    alice.write_all(b"alice").await?;
    tokio::time::sleep(Duration::from_millis(200)).await;

    alice.write_all(b"3||hello from alice").await?;
    let echo = read_record(&mut alice).await?;
    assert!(
        echo.starts_with("3||alice||hello from alice||"),
        "unexpected echo {echo:?}"
    );

    // Bob joins later and gets the still-active message replayed.
    let mut bob = TcpStream::connect(&addr).await?;
    bob.write_all(b"bob").await?;
    let replay = read_record(&mut bob).await?;
    assert_eq!(replay, echo);

    alice.write_all(b"!quit").await?;
    let mut ack = String::new();
    timeout(READ_TIMEOUT, alice.read_to_string(&mut ack)).await??;
    assert_eq!(ack, "!quit");

    send_sigterm(&relay)?;
    let status = timeout(READ_TIMEOUT, relay.wait()).await??;
    assert!(status.success(), "relay exited with {status}");
    let _ = relay_log_task.await;

    let events = std::fs::read_to_string(&event_log)?;
    assert!(events.contains("client joined"));
    assert!(events.contains("broadcast: hello from alice"));
    assert!(events.contains("client left"));

    Ok(())
}

async fn spawn_relay(event_log: &Path) -> Result<(Child, BufReader<ChildStdout>)> {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_priority-relay"));
    cmd.arg("--listen")
        .arg("127.0.0.1:0")
        .arg("--event-log")
        .arg(event_log)
        .env("RUST_LOG", "info")
        .env("NO_COLOR", "1")
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    let mut child = cmd.spawn().context("failed to spawn relay")?;
    let stdout = child
        .stdout
        .take()
        .context("relay stdout missing after spawn")?;

    Ok((child, BufReader::new(stdout)))
}

async fn read_relay_addr(reader: &mut BufReader<ChildStdout>) -> Result<String> {
    let mut line = String::new();
    let bytes = timeout(READ_TIMEOUT, reader.read_line(&mut line)).await??;
    if bytes == 0 {
        return Err(anyhow!("relay did not emit listening address"));
    }
    let trimmed = line.trim();
    let addr = trimmed
        .split_whitespace()
        .last()
        .context("unexpected relay banner format")?;
    if !addr.contains(':') {
        return Err(anyhow!("relay banner missing socket: {trimmed}"));
    }
    Ok(addr.to_string())
}

/// Reads one `&&`-terminated record, without the separator.
async fn read_record(stream: &mut TcpStream) -> Result<String> {
    let mut received = Vec::new();
    let mut byte = [0u8; 1];
    while !received.ends_with(b"&&") {
        let n = timeout(READ_TIMEOUT, stream.read(&mut byte)).await??;
        if n == 0 {
            return Err(anyhow!("stream closed mid-record"));
        }
        received.push(byte[0]);
    }
    received.truncate(received.len() - 2);
    Ok(String::from_utf8(received)?)
}

async fn drain_stdout(mut reader: BufReader<ChildStdout>) {
    let mut buffer = String::new();
    while let Ok(bytes) = reader.read_line(&mut buffer).await {
        if bytes == 0 {
            break;
        }
        buffer.clear();
    }
}

fn send_sigterm(child: &Child) -> Result<()> {
    let pid = child.id().context("relay already exited")?;
    let status = std::process::Command::new("kill")
        .arg("-TERM")
        .arg(pid.to_string())
        .status()
        .context("failed to run kill")?;
    if !status.success() {
        return Err(anyhow!("kill -TERM {pid} failed with {status}"));
    }
    Ok(())
}
