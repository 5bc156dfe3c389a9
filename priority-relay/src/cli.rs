use std::{net::SocketAddr, num::NonZeroUsize, path::PathBuf, time::Duration};

use clap::Parser;

use crate::server::RelaySettings;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Socket address the relay should bind to. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "0.0.0.0:33000")]
    pub listen: SocketAddr,

    /// Bytes read from a client socket at a time.
    #[arg(long, default_value = "1024")]
    pub read_buffer: NonZeroUsize,

    /// Milliseconds a write to one client may take before that client is dropped.
    #[arg(long, default_value_t = 5000)]
    pub write_timeout_ms: u64,

    /// Milliseconds to wait for connections to close on shutdown.
    #[arg(long, default_value_t = 5000)]
    pub drain_timeout_ms: u64,

    /// File the connect/disconnect/broadcast event log is appended to.
    #[arg(long, default_value = "server.log", conflicts_with = "no_event_log")]
    pub event_log: PathBuf,

    /// Only log to stdout.
    #[arg(long)]
    pub no_event_log: bool,
}

impl Cli {
    pub fn settings(&self) -> RelaySettings {
        RelaySettings {
            read_buffer: self.read_buffer,
            write_timeout: Duration::from_millis(self.write_timeout_ms),
            drain_timeout: Duration::from_millis(self.drain_timeout_ms),
        }
    }

    pub fn event_log(&self) -> Option<&PathBuf> {
        (!self.no_event_log).then_some(&self.event_log)
    }
}
