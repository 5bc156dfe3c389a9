//! Multi-client message relay with a replayable backlog.
//!
//! Clients connect over TCP, send a display name, and from then on every
//! record they send is stamped with their name, priority and the server time
//! and fanned out to everybody connected. Messages stay "active" until a
//! client retires them with `!rm <timestamp>`; active messages are replayed to
//! whoever joins later.
//!
//! - [`cli`] parses the command line into [`server::RelaySettings`].
//! - [`protocol`] holds the `&&`/`||` wire format and its tokenizer.
//! - [`registry`] tracks connected clients and owns their write halves.
//! - [`store`] keeps the active backlog.
//! - [`broadcast`] delivers envelopes and evicts clients that stop accepting them.
//! - [`handler`] runs the per-connection state machine.
//! - [`server`] accepts connections and coordinates shutdown.
//!
//! Unit tests sit next to each module; `tests/` drives a real relay over
//! loopback TCP and the compiled binary end to end.

pub mod broadcast;
pub mod cli;
pub mod handler;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod store;
