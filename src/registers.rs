/*!
    structs and consts for the slave controller registers the engine touches.

    Registers are declared here as [Field] constants instead of hardcoded
    offsets, so what you see here is exactly what the master may read or
    write in a slave's physical memory, no more, no less.
*/
#![allow(non_upper_case_globals)]

use bilge::prelude::*;
use crate::data::{self, Field};

pub mod address {
    use super::*;

    /// register of the station address, aka the fixed slave address
    pub const fixed: Field<u16> = Field::simple(0x0010);
    /// slave address alias
    pub const alias: Field<u16> = Field::simple(0x0012);
}

/// AL (application layer) registers driving the slave lifecycle state machine
pub mod al {
    use super::*;

    pub const control: Field<AlControlRequest> = Field::simple(0x0120);
    pub const status: Field<AlStatus> = Field::simple(0x0130);
    pub const error: Field<u16> = Field::simple(0x0134);
}

/**
    DC (distributed clock) registers, used to align slave execution to the
    master's cycle start. Accessing them is a privileged, low-frequency
    configuration operation, distinct from the steady-state exchange.
*/
pub mod dc {
    use super::*;

    pub const receive_time_port0: Field<u32> = Field::simple(0x0900);
    pub const system_time: Field<u64> = Field::simple(0x0910);
    pub const system_time_offset: Field<u64> = Field::simple(0x0920);
    pub const cyclic_unit_control: Field<u8> = Field::simple(0x0980);
    pub const activation: Field<u8> = Field::simple(0x0981);
    pub const start_time: Field<u64> = Field::simple(0x0990);
    pub const sync0_cycle_time: Field<u32> = Field::simple(0x09a0);
    pub const sync1_cycle_time: Field<u32> = Field::simple(0x09a4);
}



/// AL control request, written by the master to request a state change
#[bitsize(16)]
#[derive(TryFromBits, DebugBits, Copy, Clone, Eq, PartialEq, Default)]
pub struct AlControlRequest {
    /// requested state of communication
    pub state: AlMixedState,
    /// if true, the error indication in [AlStatus] will be acknowledged
    pub ack: bool,
    reserved: u11,
}
data::bilge_busdata!(AlControlRequest, u16);

/// AL status, read back by the master to confirm a state change
#[bitsize(16)]
#[derive(TryFromBits, DebugBits, Copy, Clone, Eq, PartialEq, Default)]
pub struct AlStatus {
    /// current state of communication
    pub state: AlMixedState,
    /// true if the slave refused the requested transition, details in [al::error]
    pub error: bool,
    reserved: u11,
}
data::bilge_busdata!(AlStatus, u16);

/**
    the current operation state of one device

    This is the enum version, useful when communicating with one slave only.
    Changing to any state can only be requested from the adjacent one.
*/
#[bitsize(4)]
#[derive(TryFromBits, Debug, Copy, Clone, Eq, PartialEq)]
pub enum AlState {
    /**
        boot state, allowing to set communication registers: station address,
        mailbox setup, process image mapping. This state is the start of any
        communication, and the state an errored slave must be reset to.
    */
    Init = 0x1,
    /// mailbox communication is allowed, mandatory to configure most slaves. register setup is over
    PreOperational = 0x2,
    /// realtime exchange is running but slave outputs remain ignored, a read-only stage before [Self::Operational]
    SafeOperational = 0x4,
    /// realtime operations running, the master has full access to the slave's effector functions
    Operational = 0x8,
}

/**
    gathers the operation states of several devices at once

    This is the bitfield version, useful with broadcast commands. It does not
    tell which slave is in which state.
*/
#[bitsize(4)]
#[derive(FromBits, DebugBits, Copy, Clone, Eq, PartialEq, Default)]
pub struct AlMixedState {
    /// one slave at least is in [AlState::Init]
    pub init: bool,
    /// one slave at least is in [AlState::PreOperational]
    pub pre_operational: bool,
    /// one slave at least is in [AlState::SafeOperational]
    pub safe_operational: bool,
    /// one slave at least is in [AlState::Operational]
    pub operational: bool,
}

impl TryFrom<AlMixedState> for AlState {
    type Error = &'static str;
    fn try_from(state: AlMixedState) -> Result<Self, Self::Error> {
        Self::try_from(u4::from(state)).map_err(|_| "more than one state in the mix")
    }
}
impl From<AlState> for AlMixedState {
    fn from(state: AlState) -> Self {
        Self::from(u4::from(state))
    }
}



#[cfg(test)]
mod test {
    use super::*;
    use crate::data::BusData;

    #[test]
    fn al_control_round_trip() {
        let mut request = AlControlRequest::default();
        request.set_state(AlState::PreOperational.into());
        request.set_ack(true);

        let mut buffer = [0; 2];
        request.pack(&mut buffer).unwrap();
        assert_eq!(buffer[0], 0x12);
        assert_eq!(AlControlRequest::unpack(&buffer).unwrap(), request);
    }

    #[test]
    fn mixed_state_narrowing() {
        let mixed = AlMixedState::from(AlState::Operational);
        assert_eq!(AlState::try_from(mixed).unwrap(), AlState::Operational);

        let mut several = AlMixedState::default();
        several.set_init(true);
        several.set_operational(true);
        assert!(AlState::try_from(several).is_err());
    }
}
