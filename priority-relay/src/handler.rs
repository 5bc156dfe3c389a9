//! Per-connection state machine: `Joining → Replaying → Relaying → Closed`.

use std::{io, sync::Arc};

use anyhow::Result;
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    select,
};
use tracing::{debug, info, warn};

use crate::{
    broadcast::Outgoing,
    protocol::{Inbound, QUIT_COMMAND, RecordDecoder, parse_record, sanitize_name},
    registry::Connection,
    server::RelayState,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerState {
    Joining,
    Replaying,
    Relaying,
    Closed,
}

/// Why a handler left the relaying loop.
#[derive(Debug)]
enum Exit {
    Quit,
    Eof,
    ReadFailed(io::Error),
    Cancelled,
}

enum Step {
    Continue,
    Quit,
}

pub struct ConnectionHandler<R> {
    reader: R,
    connection: Connection,
    state: Arc<RelayState>,
    decoder: RecordDecoder,
    buffer: Vec<u8>,
    phase: HandlerState,
}

impl<R> ConnectionHandler<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(reader: R, connection: Connection, state: Arc<RelayState>) -> Self {
        let buffer = vec![0; state.settings.read_buffer.get()];
        Self {
            reader,
            connection,
            state,
            decoder: RecordDecoder::new(),
            buffer,
            phase: HandlerState::Joining,
        }
    }

    pub fn phase(&self) -> HandlerState {
        self.phase
    }

    /// Drives the connection until it closes.
    pub async fn run(mut self) -> Result<()> {
        let joined = match self.handshake().await {
            Ok(joined) => joined,
            Err(err) => {
                self.close(false).await;
                return Err(err.context("handshake failed"));
            }
        };
        let Some((name, pending)) = joined else {
            self.close(false).await;
            return Ok(());
        };

        self.phase = HandlerState::Replaying;
        let replayed = match self.state.broadcaster.join(&self.connection, &name).await {
            Ok(replayed) => replayed,
            Err(err) => {
                self.phase = HandlerState::Closed;
                return Err(anyhow::Error::new(err).context("replay failed"));
            }
        };
        info!(
            connection = self.connection.id(),
            peer = ?self.connection.peer(),
            %name,
            replayed,
            "client joined"
        );

        self.phase = HandlerState::Relaying;
        let exit = self.relay(&name, pending).await;
        self.finish(&name, exit).await;
        Ok(())
    }

    /// Reads the display name. Records that arrived in the same read after a
    /// separator are handed back for relaying.
    async fn handshake(&mut self) -> Result<Option<(String, Vec<String>)>> {
        let n = select! {
            biased;
            _ = self.connection.cancelled() => return Ok(None),
            read = self.reader.read(&mut self.buffer) => read?,
        };
        if n == 0 {
            debug!(connection = self.connection.id(), "closed before handshake");
            return Ok(None);
        }

        let filled = n == self.buffer.len();
        let mut records = self.decoder.decode(&self.buffer[..n], filled);
        if records.is_empty() {
            records = self.decoder.finish();
        }
        let mut records = records.into_iter();
        let name = records.next().map(|raw| sanitize_name(&raw)).unwrap_or_default();
        if name.is_empty() {
            warn!(connection = self.connection.id(), "rejecting empty display name");
            return Ok(None);
        }

        Ok(Some((name, records.collect())))
    }

    async fn relay(&mut self, name: &str, mut pending: Vec<String>) -> Exit {
        loop {
            if let Step::Quit = self.process_all(name, pending).await {
                return Exit::Quit;
            }

            let read = select! {
                biased;
                _ = self.connection.cancelled() => return Exit::Cancelled,
                read = self.reader.read(&mut self.buffer) => read,
            };

            pending = match read {
                Ok(0) => {
                    let rest = self.decoder.finish();
                    return match self.process_all(name, rest).await {
                        Step::Quit => Exit::Quit,
                        Step::Continue => Exit::Eof,
                    };
                }
                Ok(n) => {
                    let filled = n == self.buffer.len();
                    self.decoder.decode(&self.buffer[..n], filled)
                }
                Err(err) => return Exit::ReadFailed(err),
            };
        }
    }

    async fn process_all(&self, name: &str, records: Vec<String>) -> Step {
        for record in records {
            if let Step::Quit = self.process(name, &record).await {
                return Step::Quit;
            }
        }
        Step::Continue
    }

    async fn process(&self, name: &str, record: &str) -> Step {
        let outgoing = match parse_record(record) {
            Ok(Inbound::Quit) => return Step::Quit,
            Ok(Inbound::Message { priority, body }) => Outgoing::Message {
                sender: name.to_string(),
                priority,
                body,
            },
            Ok(Inbound::Retire { timestamp }) => Outgoing::Retire {
                sender: name.to_string(),
                timestamp,
            },
            Err(err) => {
                debug!(
                    connection = self.connection.id(),
                    %name,
                    error = %err,
                    "dropping malformed record"
                );
                return Step::Continue;
            }
        };

        self.state.broadcaster.publish(outgoing).await;
        Step::Continue
    }

    async fn finish(&mut self, name: &str, exit: Exit) {
        match &exit {
            Exit::Quit => {
                if let Err(err) = self.connection.send(QUIT_COMMAND.as_bytes()).await {
                    debug!(
                        connection = self.connection.id(),
                        error = %err,
                        "quit acknowledgement lost"
                    );
                }
            }
            Exit::ReadFailed(err) => {
                debug!(connection = self.connection.id(), error = %err, "read failed");
            }
            Exit::Eof | Exit::Cancelled => {}
        }

        self.close(true).await;
        info!(connection = self.connection.id(), %name, reason = ?exit, "client left");
    }

    /// Unregisters first, then closes, so no broadcast can target a closed
    /// connection.
    async fn close(&mut self, registered: bool) {
        if registered {
            self.state.registry.unregister(self.connection.id()).await;
        }
        self.connection.close().await;
        self.phase = HandlerState::Closed;
    }
}

#[cfg(test)]
mod tests {
    use std::{num::NonZeroUsize, time::Duration};

    use tokio::io::{AsyncWriteExt, DuplexStream};

    use super::*;
    use crate::server::RelaySettings;

    struct Client {
        stream: DuplexStream,
    }

    impl Client {
        async fn send(&mut self, text: &str) {
            self.stream.write_all(text.as_bytes()).await.expect("client write");
        }

        async fn read_until(&mut self, needle: &str) -> String {
            let mut received = String::new();
            let mut buf = vec![0; 512];
            while !received.contains(needle) {
                let n = tokio::time::timeout(Duration::from_secs(1), self.stream.read(&mut buf))
                    .await
                    .expect("data in time")
                    .expect("client read");
                assert!(n > 0, "stream closed while waiting for {needle:?}");
                received.push_str(std::str::from_utf8(&buf[..n]).expect("utf8"));
            }
            received
        }
    }

    fn spawn_handler(
        state: &Arc<RelayState>,
        id: u64,
    ) -> (Client, tokio::task::JoinHandle<Result<()>>) {
        let (server, client) = tokio::io::duplex(4096);
        let (reader, writer) = tokio::io::split(server);
        let connection = Connection::new(
            id,
            None,
            writer,
            state.settings.write_timeout,
            &state.shutdown,
        );
        let handler = ConnectionHandler::new(reader, connection, Arc::clone(state));
        assert_eq!(handler.phase(), HandlerState::Joining);
        (Client { stream: client }, tokio::spawn(handler.run()))
    }

    async fn wait_for_clients(state: &RelayState, count: usize) {
        tokio::time::timeout(Duration::from_secs(1), async {
            while state.registry.len().await != count {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("clients registered in time");
    }

    #[tokio::test]
    async fn name_is_sanitized_and_pipelined_records_are_relayed() {
        let state = RelayState::new(RelaySettings::default());
        let (mut client, _task) = spawn_handler(&state, 1);

        client.send("42alice&&1||first&&2||second").await;
        let received = client.read_until("second").await;

        assert!(received.starts_with("1||alice||first||"));
        assert!(received.contains("&&2||alice||second||"));
        assert_eq!(state.registry.names().await, vec!["alice"]);
    }

    #[tokio::test]
    async fn quit_is_acknowledged_and_unregisters() {
        let state = RelayState::new(RelaySettings::default());
        let (mut client, task) = spawn_handler(&state, 1);
        client.send("bob").await;
        wait_for_clients(&state, 1).await;

        client.send("0||bye !quit").await;
        let received = client.read_until(QUIT_COMMAND).await;
        assert_eq!(received, QUIT_COMMAND);

        task.await.expect("join").expect("handler result");
        assert!(state.registry.is_empty().await);
        assert!(state.store.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn malformed_records_do_not_end_the_session() {
        let state = RelayState::new(RelaySettings::default());
        let (mut client, _task) = spawn_handler(&state, 1);
        client.send("carol").await;
        wait_for_clients(&state, 1).await;

        client.send("no priority&&high||nope&&7||still here").await;
        let received = client.read_until("still here").await;

        assert!(received.starts_with("7||carol||still here||"));
        assert_eq!(state.store.len().await, 1);
    }

    #[tokio::test]
    async fn record_longer_than_read_buffer_arrives_whole() {
        let settings = RelaySettings {
            read_buffer: NonZeroUsize::new(16).expect("non-zero"),
            ..RelaySettings::default()
        };
        let state = RelayState::new(settings);
        let (mut client, _task) = spawn_handler(&state, 1);
        client.send("frank").await;
        wait_for_clients(&state, 1).await;

        let body = "b".repeat(101);
        client.send(&format!("3||{body}&&4||tail")).await;
        client.read_until("tail").await;

        let bodies: Vec<_> = state
            .store
            .snapshot()
            .await
            .iter()
            .map(|envelope| envelope.body().to_string())
            .collect();
        assert_eq!(bodies, vec![body, "tail".to_string()]);
    }

    #[tokio::test]
    async fn eof_counts_as_quit() {
        let state = RelayState::new(RelaySettings::default());
        let (mut client, task) = spawn_handler(&state, 1);
        client.send("dave").await;
        wait_for_clients(&state, 1).await;

        drop(client);
        task.await.expect("join").expect("handler result");
        assert!(state.registry.is_empty().await);
    }

    #[tokio::test]
    async fn empty_name_is_rejected() {
        let state = RelayState::new(RelaySettings::default());
        let (mut client, task) = spawn_handler(&state, 1);
        client.send("1234").await;

        task.await.expect("join").expect("handler result");
        assert!(state.registry.is_empty().await);
    }

    #[tokio::test]
    async fn shutdown_stops_idle_handler() {
        let state = RelayState::new(RelaySettings::default());
        let (mut client, task) = spawn_handler(&state, 1);
        client.send("erin").await;
        wait_for_clients(&state, 1).await;

        state.shutdown.cancel();
        task.await.expect("join").expect("handler result");
        assert!(state.registry.is_empty().await);
    }
}
