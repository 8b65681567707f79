//! SSH side of the gateway.
//!
//! Accepts SSH connections from Git clients, authenticates them by public
//! key, authorizes the requested `git-upload-pack` / `git-receive-pack`
//! command and proxies it to the upstream host over an outbound SSH session
//! opened with a pooled service account.

pub mod exchange;
pub mod server;
pub mod session;
pub mod upstream;

pub use server::{bind_ssh_server, SshServer};
