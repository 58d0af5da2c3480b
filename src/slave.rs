/*!
    per-slave runtime state and the device lifecycle.

    A [SlaveDevice] is the master's record of one physical slave: its bus
    address, its segments of the process image, its confirmed lifecycle state
    and its mailbox session state. Devices are created in bus order when the
    segment is configured and owned exclusively by the master; drivers reach
    their slave only through its process-image segments and the mailbox
    accessors.
*/

use crate::{
    image::ImageRegion,
    mailbox::MailboxConfig,
    registers::AlState,
    };


/**
    lifecycle state of one slave, as confirmed by the master.

    The four operation states mirror the slave's own application layer;
    [Self::Error] is the master-side fault state, reached on a rejected
    transition or on communication loss, from which only an explicit reset to
    [Self::Init] recovers.
*/
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub enum LifecycleState {
    #[default]
    Init,
    PreOperational,
    SafeOperational,
    Operational,
    Error,
}

impl LifecycleState {
    /// true if a transition to `target` can be requested from this state
    ///
    /// transitions go one step at a time, except the fallback to [Self::Init]
    /// which is allowed from anywhere and is the only exit from [Self::Error]
    pub fn adjacent(self, target: Self) -> bool {
        use LifecycleState::*;
        matches!((self, target),
            (_, Init)
            | (Init, PreOperational)
            | (PreOperational, SafeOperational) | (SafeOperational, PreOperational)
            | (SafeOperational, Operational) | (Operational, SafeOperational)
            | (Operational, PreOperational))
    }

    /// true if process-image bytes are exchanged with a slave in this state
    pub fn exchanging(self) -> bool {
        matches!(self, Self::SafeOperational | Self::Operational)
    }
    /// true if slave outputs are applied in this state
    pub fn writing_outputs(self) -> bool {
        matches!(self, Self::Operational)
    }
    /// true if mailbox transactions are permitted in this state
    pub fn mailbox_allowed(self) -> bool {
        matches!(self, Self::PreOperational | Self::SafeOperational | Self::Operational)
    }
}

impl From<AlState> for LifecycleState {
    fn from(state: AlState) -> Self {
        match state {
            AlState::Init => Self::Init,
            AlState::PreOperational => Self::PreOperational,
            AlState::SafeOperational => Self::SafeOperational,
            AlState::Operational => Self::Operational,
        }
    }
}
impl TryFrom<LifecycleState> for AlState {
    type Error = &'static str;
    fn try_from(state: LifecycleState) -> Result<Self, &'static str> {
        match state {
            LifecycleState::Init => Ok(Self::Init),
            LifecycleState::PreOperational => Ok(Self::PreOperational),
            LifecycleState::SafeOperational => Ok(Self::SafeOperational),
            LifecycleState::Operational => Ok(Self::Operational),
            LifecycleState::Error => Err("the fault state has no wire encoding"),
        }
    }
}

/// static description of one slave, supplied by the scanning collaborator at startup
#[derive(Clone, Debug)]
pub struct SlaveDescriptor {
    /// fixed station address
    pub address: u16,
    /// mailbox memory regions, [None] for mailbox-less digital slaves
    pub mailbox: Option<MailboxConfig>,
    /// byte count of the output process data (master to slave)
    pub outputs: usize,
    /// byte count of the input process data (slave to master)
    pub inputs: usize,
}

/**
    trait for a device driver consuming one slave's process data.

    Both callbacks run synchronously inside the master's cycle, between
    receiving one response and sending the next frame, so they must not block.
    A driver needing long reactions defers them to its own task and only
    copies bytes here.
*/
pub trait SlaveDelegate: Send {
    /// fill the slave's output bytes before they are sent, called once per cycle
    fn update_outputs(&mut self, _outputs: &mut [u8]) {}
    /// consume the slave's input bytes after they were received, called once per cycle
    fn consume_inputs(&mut self, _inputs: &[u8]) {}
}

/// the master's runtime record of one slave
pub struct SlaveDevice {
    pub descriptor: SlaveDescriptor,
    /// segments of the process image assigned to this slave
    pub region: ImageRegion,
    /// last confirmed lifecycle state
    pub state: LifecycleState,
    /// state requested but not confirmed yet
    pub requested: Option<AlState>,
    /// driver invoked around the cyclic exchange
    pub(crate) delegate: Option<Box<dyn SlaveDelegate>>,
    /// mailbox session counter, rolling from 1 to 7
    pub(crate) mailbox_count: u8,
    /// consecutive cycles without a response from this slave
    pub(crate) lost_responses: u32,
}

impl SlaveDevice {
    pub(crate) fn new(descriptor: SlaveDescriptor, region: ImageRegion) -> Self {
        Self {
            descriptor,
            region,
            state: LifecycleState::Init,
            requested: None,
            delegate: None,
            mailbox_count: 0,
            lost_responses: 0,
        }
    }

    /// record a served cyclic exchange, clearing the loss streak
    pub(crate) fn record_response(&mut self) {
        self.lost_responses = 0;
    }
    /// record a missed cyclic exchange, returns true when the loss streak reaches `threshold`
    pub(crate) fn record_loss(&mut self, threshold: u32) -> bool {
        self.lost_responses = self.lost_responses.saturating_add(1);
        self.lost_responses >= threshold
    }
}
