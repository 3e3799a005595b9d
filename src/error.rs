use std::io;

use n0_error::{e, stack_error};

/// Errors on the ship↔offshore link.
///
/// The link is precious: [`Lost`](LinkError::Lost) triggers a reconnect on the
/// ship and a new accept on the offshore, while
/// [`Protocol`](LinkError::Protocol) additionally marks the current connection
/// as unusable. Neither kills the process, and per-job failures never produce
/// either of these.
#[stack_error(derive, add_meta)]
#[non_exhaustive]
pub enum LinkError {
    /// The connection died, or EOF arrived mid-frame.
    #[error("link lost")]
    Lost {
        #[error(source, std_err)]
        source: io::Error,
    },
    /// The peer sent something the frame protocol forbids.
    #[error("protocol violation: {reason}")]
    Protocol { reason: String },
}

impl From<io::Error> for LinkError {
    #[track_caller]
    fn from(source: io::Error) -> Self {
        e!(LinkError::Lost { source })
    }
}
