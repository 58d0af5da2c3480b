/*!
    the asynchronous mailbox sub-protocol.

    A mailbox exchange is an ordinary datagram addressed to a reserved memory
    region of one slave, whose payload starts with a [MailboxHeader] naming
    the tunneled upper protocol. A slave exposes a single buffer per
    direction, which is why only one mailbox transaction per slave may be in
    flight at a time.
*/

use bilge::prelude::*;
use crate::{
    data::{self, Cursor, PackingError, PackingResult},
    datagram::{Datagram, SlaveAddress},
    };


/// mailbox size assumed when a slave descriptor does not provide one
pub const DEFAULT_MAILBOX_SIZE: u16 = 128;

/// mailbox memory regions of one slave, fixed per slave and discovered at configuration time
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct MailboxConfig {
    /// region written by the master (requests)
    pub write_offset: u16,
    pub write_size: u16,
    /// region read by the master (responses)
    pub read_offset: u16,
    pub read_size: u16,
}
impl Default for MailboxConfig {
    fn default() -> Self {
        Self {
            write_offset: 0x1000,
            write_size: DEFAULT_MAILBOX_SIZE,
            read_offset: 0x1080,
            read_size: DEFAULT_MAILBOX_SIZE,
        }
    }
}

/// header prefixing every mailbox payload
#[bitsize(48)]
#[derive(TryFromBits, DebugBits, Copy, Clone)]
pub struct MailboxHeader {
    /// length of the mailbox service data following this header
    pub length: u16,
    /// station address of the originator (master requests carry 0)
    pub address: u16,
    /// reserved channel tag
    pub channel: u6,
    /// 0 is lowest priority, 3 is highest
    pub priority: u2,
    /// which upper protocol's payload follows
    pub ty: MailboxType,
    /// session counter rolling from 1 to 7, 0 is reserved
    pub count: u3,
    reserved: u1,
}
data::bilge_busdata!(MailboxHeader, u48);

impl MailboxHeader {
    pub const fn packed_length() -> usize {6}
}

/// the upper protocols a mailbox payload can carry
#[bitsize(4)]
#[derive(TryFromBits, Debug, Copy, Clone, Eq, PartialEq)]
pub enum MailboxType {
    /// mailbox error replies
    Exception = 0x0,
    /// ethernet tunneling
    Ethernet = 0x2,
    /// object-dictionary access (CANopen application layer)
    Can = 0x3,
    /// file access
    File = 0x4,
    /// servo profile access
    Servo = 0x5,
    /// vendor specific
    Specific = 0xf,
}

/// error codes a slave reports in an [MailboxType::Exception] reply
#[bitsize(16)]
#[derive(TryFromBits, Debug, Copy, Clone, Eq, PartialEq)]
pub enum MailboxError {
    Syntax = 0x1,
    UnsupportedProtocol = 0x2,
    InvalidChannel = 0x3,
    ServiceNotSupported = 0x4,
    InvalidHeader = 0x5,
    SizeTooShort = 0x6,
    NoMoreMemory = 0x7,
    InvalidSize = 0x8,
    ServiceInWork = 0x9,
}
data::bilge_busdata!(MailboxError, u16);

/// advance the per-slave mailbox session counter, rolling from 1 to 7
pub fn next_count(count: &mut u8) -> u3 {
    *count = if *count >= 7 {1} else {*count + 1};
    u3::new(*count)
}

/**
    build the datagram writing a mailbox request into a slave's mailbox.

    The datagram covers the slave's whole write mailbox region (slaves only
    accept full-buffer writes); the content is zero-padded accordingly. A
    content exceeding the slave's configured mailbox size is rejected.
*/
pub fn request(
    slave: u16,
    config: &MailboxConfig,
    ty: MailboxType,
    priority: u2,
    count: u3,
    content: &[u8],
    ) -> PackingResult<Datagram>
{
    let capacity = usize::from(config.write_size);
    if content.len() + MailboxHeader::packed_length() > capacity
        {return Err(PackingError::BadSize(content.len(), "mailbox content exceeds the slave's mailbox size"))}

    let mut payload = vec![0; capacity];
    let mut cursor = Cursor::new(payload.as_mut_slice());
    cursor.pack(&MailboxHeader::new(
        content.len() as u16,
        0,
        u6::new(0),
        priority,
        ty,
        count,
        ))?;
    cursor.write(content)?;

    let (command, slave) = crate::datagram::DatagramCommand::writing(SlaveAddress::Fixed(slave));
    Datagram::new(command, slave, config.write_offset, payload)
}

/// build the datagram reading back a slave's read mailbox region
pub fn poll(slave: u16, config: &MailboxConfig) -> PackingResult<Datagram> {
    Datagram::read(SlaveAddress::Fixed(slave), config.read_offset, usize::from(config.read_size))
}

/// split a received mailbox payload into its header and service data
pub fn open(payload: &[u8]) -> PackingResult<(MailboxHeader, &[u8])> {
    let mut cursor = Cursor::new(payload);
    let header: MailboxHeader = cursor.unpack()?;
    let content = cursor.read(usize::from(header.length()))?;
    Ok((header, content))
}

/// interpret an [MailboxType::Exception] reply content
pub fn error_code(content: &[u8]) -> PackingResult<MailboxError> {
    let mut cursor = Cursor::new(content);
    // first word is the error frame type, always 0x01
    let _ty: u16 = cursor.unpack()?;
    cursor.unpack()
}



#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn counter_rolls_over() {
        let mut count = 0;
        let sequence = (0 .. 9).map(|_| u8::from(next_count(&mut count))).collect::<Vec<_>>();
        assert_eq!(sequence, [1, 2, 3, 4, 5, 6, 7, 1, 2]);
    }

    #[test]
    fn request_round_trip() {
        let config = MailboxConfig::default();
        let datagram = request(4, &config, MailboxType::Can, u2::new(0), u3::new(2), &[1, 2, 3, 4]).unwrap();
        assert_eq!(datagram.offset, config.write_offset);
        assert_eq!(datagram.payload().len(), usize::from(config.write_size));

        let (header, content) = open(datagram.payload()).unwrap();
        assert_eq!(header.length(), 4);
        assert_eq!(header.ty(), MailboxType::Can);
        assert_eq!(u8::from(header.count()), 2);
        assert_eq!(content, &[1, 2, 3, 4]);
    }

    #[test]
    fn oversized_content_rejected() {
        let config = MailboxConfig {write_size: 16, .. Default::default()};
        assert!(request(1, &config, MailboxType::Can, u2::new(0), u3::new(1), &[0; 16]).is_err());
    }
}
