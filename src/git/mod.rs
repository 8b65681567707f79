//! Git transport vocabulary shared by the HTTP and SSH front ends.
//!
//! The gateway never parses pack data; it only needs to know which of the two
//! smart-protocol services a request targets so it can classify the request
//! as a read or a write before asking the authorization service.

pub mod command;

use std::fmt;

use prometheus_client::encoding::EncodeLabelValue;

pub use command::{is_git_shell, GitShellCommand};

/// Service name used by fetch and clone.
pub const UPLOAD_PACK: &str = "git-upload-pack";
/// Service name used by push.
pub const RECEIVE_PACK: &str = "git-receive-pack";

// ---------------------------------------------------------------------------
// Operation
// ---------------------------------------------------------------------------

/// Whether a request reads from or writes to a repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EncodeLabelValue)]
pub enum GitOperation {
    Read,
    Write,
}

impl GitOperation {
    /// Classify a smart-protocol service name.
    ///
    /// Only `git-upload-pack` is a read. Everything else, including a missing
    /// or unknown service, is treated as a write so the stricter permission
    /// applies.
    pub fn from_service(service: &str) -> Self {
        if service == UPLOAD_PACK {
            GitOperation::Read
        } else {
            GitOperation::Write
        }
    }

    /// Action verb sent to the authorization service.
    pub fn action(self) -> &'static str {
        match self {
            GitOperation::Read => "GET",
            GitOperation::Write => "POST",
        }
    }
}

impl fmt::Display for GitOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GitOperation::Read => f.write_str("read"),
            GitOperation::Write => f.write_str("write"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_pack_is_read() {
        assert_eq!(GitOperation::from_service("git-upload-pack"), GitOperation::Read);
    }

    #[test]
    fn receive_pack_is_write() {
        assert_eq!(GitOperation::from_service("git-receive-pack"), GitOperation::Write);
    }

    #[test]
    fn unknown_or_missing_service_is_write() {
        assert_eq!(GitOperation::from_service(""), GitOperation::Write);
        assert_eq!(GitOperation::from_service("git-upload-archive"), GitOperation::Write);
        assert_eq!(GitOperation::from_service("GIT-UPLOAD-PACK"), GitOperation::Write);
    }

    #[test]
    fn actions() {
        assert_eq!(GitOperation::Read.action(), "GET");
        assert_eq!(GitOperation::Write.action(), "POST");
    }
}
