/*!
    An industrial fieldbus master engine.

    The crate drives real-time networks of distributed I/O and motion-control
    slaves: a high-speed Ethernet-based segment through [FieldbusMaster]
    (cyclic process-data exchange, mailbox object-dictionary access, the
    slave lifecycle) and a serial differential bus through [CanOpenMaster],
    both scheduled by the [CyclicTask] realtime primitive.
*/

pub mod data;
pub mod error;
pub mod registers;
pub mod datagram;
pub mod mailbox;
pub mod coe;
pub mod transport;
pub mod link;
pub mod image;
pub mod slave;
pub mod master;
pub mod can;
pub mod task;

pub use crate::{
    can::{CanFrame, CanOpenDelegate, CanOpenMaster, CanTransport, NmtCommand},
    coe::{SdoAbortCode, SdoResponse},
    data::{BusData, Cursor, Field, PackingError},
    datagram::{Datagram, DatagramCommand, Frame, SlaveAddress},
    error::{FieldbusError, FieldbusResult},
    image::{ImageRegion, ProcessImage, Segment},
    link::{Answer, BusLink},
    mailbox::{MailboxConfig, MailboxType},
    master::{FieldbusMaster, MasterStatistics},
    slave::{LifecycleState, SlaveDelegate, SlaveDescriptor, SlaveDevice},
    task::{CyclicTask, TaskConfig},
    transport::{FieldbusTransport, UdpTransport},
    };
