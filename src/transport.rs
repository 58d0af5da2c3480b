/*!
    the physical media a fieldbus frame can travel over.

    The engine above this module only needs [FieldbusTransport]: a way to send
    one frame and to receive one frame. Anything able to carry an opaque byte
    buffer qualifies, which is how the integration tests plug a simulated
    segment underneath an unmodified master.

    The UDP encapsulation is provided here since it needs nothing beyond the
    standard network stack. Raw-ethernet transports can be implemented
    downstream against the same trait.
*/

use core::task::{Context, Poll};
use std::{
    io,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    };

use futures::future::poll_fn;

use crate::datagram::MAX_FRAME;


/**
    trait implementing the frame encapsulation into some medium

    Implementors are responsible for hiding medium-specific headers, footers,
    checks and fragmentation: the buffers exchanged here start at the fieldbus
    frame header.
*/
pub trait FieldbusTransport: Send + Sync {
    /**
        receive one frame into the given buffer, returning the number of
        bytes received.

        The buffer must be big enough for any frame the medium can carry, no
        size indication is given before reception.
    */
    fn poll_receive(&self, cx: &mut Context<'_>, data: &mut [u8]) -> Poll<io::Result<usize>>;

    /// send one complete frame, the buffer is tailed to the exact frame size
    fn poll_send(&self, cx: &mut Context<'_>, data: &[u8]) -> Poll<io::Result<()>>;

    /// maximum frame size this medium can carry in one piece
    fn max_frame(&self) -> usize {MAX_FRAME}
}

/// async convenience over the poll methods of [FieldbusTransport]
pub async fn receive(transport: &dyn FieldbusTransport, data: &mut [u8]) -> io::Result<usize> {
    poll_fn(|cx| transport.poll_receive(cx, data)).await
}
/// async convenience over the poll methods of [FieldbusTransport]
pub async fn send(transport: &dyn FieldbusTransport, data: &[u8]) -> io::Result<()> {
    poll_fn(|cx| transport.poll_send(cx, data)).await
}


/// registered port of the fieldbus-over-UDP encapsulation
const UDP_PORT: u16 = 0x88a4;

/**
    UDP encapsulation of fieldbus frames, one datagram per frame.

    It allows running a segment through regular switched ethernet, at the
    price of possible delays due to packet collisions, so it suits bench
    setups more than production machines.
*/
pub struct UdpTransport {
    socket: tokio::net::UdpSocket,
    segment: SocketAddr,
}

impl UdpTransport {
    /// only IPv4 is supported and the port is fixed, hence this function only needs the segment's host address
    pub async fn new(segment: Ipv4Addr) -> io::Result<Self> {
        let socket = tokio::net::UdpSocket::bind(
            SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), UDP_PORT),
            ).await?;
        Ok(Self {
            socket,
            segment: SocketAddr::new(IpAddr::V4(segment), UDP_PORT),
        })
    }
}

impl FieldbusTransport for UdpTransport {
    fn poll_receive(&self, cx: &mut Context<'_>, data: &mut [u8]) -> Poll<io::Result<usize>> {
        let mut buffer = tokio::io::ReadBuf::new(data);
        loop {
            match self.socket.poll_recv_from(cx, &mut buffer) {
                Poll::Ready(Ok(source)) => {
                    // frames from other hosts on the switch are not ours
                    if source.ip() != self.segment.ip() {
                        buffer.clear();
                        continue
                    }
                    return Poll::Ready(Ok(buffer.filled().len()))
                }
                Poll::Ready(Err(error)) => return Poll::Ready(Err(error)),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
    fn poll_send(&self, cx: &mut Context<'_>, data: &[u8]) -> Poll<io::Result<()>> {
        self.socket.poll_send_to(cx, data, self.segment).map_ok(|_| ())
    }
    fn max_frame(&self) -> usize {
        // fits a standard MTU once the IP and UDP headers are counted
        MAX_FRAME.min(1472)
    }
}
