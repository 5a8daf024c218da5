//! Master/slave workload distribution.
//!
//! A master partitions its queued pages across enslaved participants and
//! stays the authority on which elements were audited; slaves audit what they
//! are handed, claim what they discover and report issues upstream.

pub mod channel;
pub mod handler;
pub mod master;
pub mod messages;
pub mod participants;
pub mod slave;

pub use channel::{Channel, Connector, Handler, LocalConnector};
pub use messages::{Envelope, ParticipantInfo, Request, Response};
pub use participants::ParticipantSet;
pub use slave::{IssueBuffer, SlaveLink};

/// Position of an instance in a (possibly) multi-instance scan.
pub enum Role {
    Solo,
    Master,
    Slave(SlaveLink),
}

impl Role {
    pub fn is_slave(&self) -> bool {
        matches!(self, Role::Slave(_))
    }

    pub fn is_master(&self) -> bool {
        matches!(self, Role::Master)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Role::Solo => "solo",
            Role::Master => "master",
            Role::Slave(_) => "slave",
        }
    }
}
