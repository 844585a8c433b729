//! ICMP message generation (RFC 792)
//!
//! Stages that need to tell a sender something (time exceeded, unreachable,
//! redirect, echo reply) capture the triggering frame into a fixed-size
//! [`IcmpRequest`] and queue it for the interface the trigger arrived on.
//! [`IcmpGenerator::drain`] later turns queued requests into frames, as many
//! as there are free buffers and transmit slots.

use super::buffer::{BufferDescriptor, BufferPool};
use super::interface::InterfaceId;
use super::ring::{self, Consumer, Producer};
use crate::protocol::icmp::{self, IcmpPacket, IcmpType};
use crate::protocol::ipv4::{self, Ipv4Header, Protocol};
use crate::protocol::{ethernet, EtherType, MacAddr};
use crate::{Error, Result};
use std::net::Ipv4Addr;
use tracing::{debug, trace};

/// Largest echo payload copied into a reply
pub const ECHO_PAYLOAD_MAX: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Body {
    /// Quote of the triggering packet; `gateway` is set for redirects
    Quote { gateway: Option<Ipv4Addr> },
    Echo {
        identifier: u16,
        sequence: u16,
        data: [u8; ECHO_PAYLOAD_MAX],
        len: usize,
    },
}

/// Everything needed to build one ICMP message, copied out of the trigger
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IcmpRequest {
    icmp_type: IcmpType,
    code: u8,
    ethernet: [u8; ethernet::HEADER_SIZE],
    /// Offending IPv4 header, options included
    ip_header: [u8; ipv4::MAX_HEADER_SIZE],
    ip_header_len: usize,
    payload: [u8; icmp::QUOTED_PAYLOAD],
    payload_len: usize,
    body: Body,
}

impl IcmpRequest {
    fn capture(icmp_type: IcmpType, code: u8, frame: &[u8], body: Body) -> Result<Self> {
        let eth = ethernet::Frame::parse(frame)?;
        if eth.ethertype() != EtherType::Ipv4 as u16 {
            return Err(Error::InvalidPacket("ICMP trigger is not IPv4".into()));
        }
        let ip = Ipv4Header::parse(eth.payload())?;

        let mut ethernet = [0u8; ethernet::HEADER_SIZE];
        ethernet.copy_from_slice(eth.header());
        let ip_header_len = ip.header_len();
        let mut ip_header = [0u8; ipv4::MAX_HEADER_SIZE];
        ip_header[..ip_header_len].copy_from_slice(ip.as_bytes());

        let quoted = ip.payload();
        let payload_len = quoted.len().min(icmp::QUOTED_PAYLOAD);
        let mut payload = [0u8; icmp::QUOTED_PAYLOAD];
        payload[..payload_len].copy_from_slice(&quoted[..payload_len]);

        Ok(Self {
            icmp_type,
            code,
            ethernet,
            ip_header,
            ip_header_len,
            payload,
            payload_len,
            body,
        })
    }

    /// Error message (destination unreachable, time exceeded, ...) quoting
    /// the triggering frame.
    pub fn error(icmp_type: IcmpType, code: u8, frame: &[u8]) -> Result<Self> {
        Self::capture(icmp_type, code, frame, Body::Quote { gateway: None })
    }

    /// Redirect pointing the sender at `gateway`
    pub fn redirect(code: u8, gateway: Ipv4Addr, frame: &[u8]) -> Result<Self> {
        Self::capture(
            IcmpType::Redirect,
            code,
            frame,
            Body::Quote {
                gateway: Some(gateway),
            },
        )
    }

    /// Reply to an echo request frame
    pub fn echo_reply(frame: &[u8]) -> Result<Self> {
        let eth = ethernet::Frame::parse(frame)?;
        let ip = Ipv4Header::parse(eth.payload())?;
        if ip.protocol() != Protocol::Icmp as u8 {
            return Err(Error::InvalidPacket("echo trigger is not ICMP".into()));
        }
        let echo = IcmpPacket::parse(ip.payload())?;
        if !echo.is_echo_request() {
            return Err(Error::InvalidPacket("not an echo request".into()));
        }

        let len = echo.payload().len().min(ECHO_PAYLOAD_MAX);
        let mut data = [0u8; ECHO_PAYLOAD_MAX];
        data[..len].copy_from_slice(&echo.payload()[..len]);

        Self::capture(
            IcmpType::EchoReply,
            0,
            frame,
            Body::Echo {
                identifier: echo.identifier(),
                sequence: echo.sequence(),
                data,
                len,
            },
        )
    }

    pub fn icmp_type(&self) -> IcmpType {
        self.icmp_type
    }

    pub fn code(&self) -> u8 {
        self.code
    }

    /// Source address of the trigger, where the message is sent
    pub fn destination(&self) -> Ipv4Addr {
        let h = &self.ip_header;
        Ipv4Addr::new(h[12], h[13], h[14], h[15])
    }

    fn icmp_len(&self) -> usize {
        icmp::HEADER_SIZE
            + match self.body {
                Body::Quote { .. } => self.ip_header_len + self.payload_len,
                Body::Echo { len, .. } => len,
            }
    }

    /// Total frame size this request builds
    pub fn frame_len(&self) -> usize {
        ethernet::HEADER_SIZE + ipv4::MIN_HEADER_SIZE + self.icmp_len()
    }

    /// Write the message into `buffer`, sourced from `source`. Addresses
    /// are swapped relative to the trigger and all checksums are left zero.
    pub fn write(&self, source: Ipv4Addr, buffer: &mut [u8]) -> Result<usize> {
        let total = self.frame_len();
        if buffer.len() < total {
            return Err(Error::InvalidPacket(format!(
                "buffer too small for ICMP message ({} < {})",
                buffer.len(),
                total
            )));
        }

        let trigger_dst = MacAddr::from_slice(&self.ethernet[0..6]);
        let trigger_src = MacAddr::from_slice(&self.ethernet[6..12]);
        ethernet::write_header(buffer, trigger_src, trigger_dst, EtherType::Ipv4 as u16);

        let ip_start = ethernet::HEADER_SIZE;
        ipv4::write_header(
            &mut buffer[ip_start..],
            source,
            self.destination(),
            Protocol::Icmp,
            self.icmp_len(),
        );

        let msg = &mut buffer[ip_start + ipv4::MIN_HEADER_SIZE..total];
        match &self.body {
            Body::Quote { gateway } => {
                let rest = gateway.map_or([0; 4], |g| g.octets());
                icmp::write_header(msg, self.icmp_type, self.code, rest);
                let body = &mut msg[icmp::HEADER_SIZE..];
                let (header, payload) = body.split_at_mut(self.ip_header_len);
                header.copy_from_slice(&self.ip_header[..self.ip_header_len]);
                payload.copy_from_slice(&self.payload[..self.payload_len]);
            }
            Body::Echo {
                identifier,
                sequence,
                data,
                len,
            } => {
                let [i0, i1] = identifier.to_be_bytes();
                let [s0, s1] = sequence.to_be_bytes();
                icmp::write_header(msg, self.icmp_type, self.code, [i0, i1, s0, s1]);
                msg[icmp::HEADER_SIZE..].copy_from_slice(&data[..*len]);
            }
        }

        Ok(total)
    }
}

/// Per-interface request queues and the addresses messages are sent from
pub struct IcmpGenerator {
    queues: [(Producer<IcmpRequest>, Consumer<IcmpRequest>); 2],
    addresses: [Ipv4Addr; 2],
}

impl IcmpGenerator {
    /// `addresses` is indexed by [`InterfaceId::index`].
    pub fn new(queue_capacity: usize, addresses: [Ipv4Addr; 2]) -> Self {
        Self {
            queues: [ring::channel(queue_capacity), ring::channel(queue_capacity)],
            addresses,
        }
    }

    /// Queue a request for `interface`, handing it back if the queue is full.
    pub fn enqueue(
        &self,
        interface: InterfaceId,
        request: IcmpRequest,
    ) -> std::result::Result<(), IcmpRequest> {
        let (producer, _) = &self.queues[interface.index()];
        producer.enqueue(request).inspect_err(|request| {
            debug!(
                "ICMP queue full on {}, dropping {:?} for {}",
                interface,
                request.icmp_type(),
                request.destination()
            );
        })
    }

    pub fn pending(&self, interface: InterfaceId) -> usize {
        self.queues[interface.index()].1.len()
    }

    /// Build queued messages for `interface` into buffers and push them onto
    /// `tx`. Stops when the queue empties, the pool runs dry or `tx` fills;
    /// in the latter two cases a notification is requested on `tx` and the
    /// remainder stays queued. Returns the number of messages sent.
    pub fn drain(
        &self,
        interface: InterfaceId,
        pool: &mut BufferPool,
        tx: &Producer<BufferDescriptor>,
    ) -> usize {
        let (_, queue) = &self.queues[interface.index()];
        let source = self.addresses[interface.index()];
        let mut sent = 0;

        while !queue.is_empty() {
            if tx.is_full() {
                tx.request_notification();
                break;
            }
            let Some(mut desc) = pool.alloc() else {
                tx.request_notification();
                break;
            };
            let Some(request) = queue.dequeue() else {
                pool.free(desc);
                break;
            };

            match request.write(source, pool.slot_mut(desc)) {
                Ok(len) => desc.len = len,
                Err(e) => {
                    debug!("Dropping ICMP message on {}: {}", interface, e);
                    pool.free(desc);
                    continue;
                }
            }

            if let Err(desc) = tx.enqueue(desc) {
                pool.free(desc);
                tx.request_notification();
                break;
            }

            trace!(
                "ICMP {:?}/{} to {} on {}",
                request.icmp_type(),
                request.code(),
                request.destination(),
                interface
            );
            sent += 1;
        }

        if queue.is_empty() {
            tx.cancel_notification();
        }
        sent
    }
}
