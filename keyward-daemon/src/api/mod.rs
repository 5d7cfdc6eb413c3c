//! JSON-RPC API for daemon IPC.
//!
//! Hosts that cannot link `keyward-core` directly talk to `keywardd` over a
//! Unix socket: they forward the actions they receive and ask for handshake
//! URLs, nonces and connection listings.

pub mod handlers;
pub mod server;
pub mod types;

pub use handlers::{ApiState, KeywardApiImpl, KeywardApiServer, rpc_error};
pub use server::{ServerHandle, process_request, start_server};
pub use types::*;
