use std::time::Duration;

use hickory_proto::error::ProtoError;
use hickory_proto::rr::{Name, RecordType};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ResolveError>;

/// Failures surfaced to callers of [`crate::Resolver`].
///
/// Transient per-nameserver failures never show up here directly; they are
/// retried and only summarized in [`ResolveError::Exhausted`] once every
/// nameserver has been given up on.
#[derive(Debug, Error)]
pub enum ResolveError {
    /// A relative name was given where an absolute one is required.
    #[error("name is not absolute: {0}")]
    NotAbsolute(Name),

    /// Every candidate query name was answered with NXDOMAIN.
    #[error("the DNS query name does not exist: {}", join_names(.qnames))]
    NxDomain { qnames: Vec<Name> },

    /// The response was final but carried no RRset for the question.
    #[error("the DNS response does not contain an answer to {name} {rtype}")]
    NoAnswer { name: Name, rtype: RecordType },

    #[error("the DNS query name is too long after DNAME substitution")]
    YxDomain,

    /// No nameservers are configured; nothing was sent.
    #[error("no nameservers configured")]
    NoNameservers,

    /// Every nameserver failed or was dropped without a final answer.
    #[error("all nameservers failed to answer: {0}")]
    Exhausted(String),

    /// The lifetime budget elapsed without a final answer.
    #[error("resolution timed out after {0:?}")]
    Timeout(Duration),

    #[error("dns protocol error: {0}")]
    Proto(#[from] ProtoError),
}

impl ResolveError {
    /// True for answers the DNS itself gave (as opposed to failures to get one).
    pub fn is_definitive(&self) -> bool {
        matches!(self, Self::NxDomain { .. } | Self::NoAnswer { .. })
    }
}

fn join_names(names: &[Name]) -> String {
    names
        .iter()
        .map(|n| n.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
