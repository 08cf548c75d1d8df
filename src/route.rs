//! ROUTE: network port table and packet forwarding (spec.md §4.7).
//!
//! Eight fixed routing-port slots, each either unused, a local endpoint,
//! or a routing endpoint bound to a socket; [`Route::incoming`] and
//! [`Route::outgoing`] move packets between a port's bound socket and the
//! wire, using [`crate::netpkt::PacketMeta`] for the fixed trailer fields
//! the original keeps at `route_$port_t+0x00`/`+0x2E`/`+0x30`.

use crate::lock::ExclLock;
use crate::netpkt::PacketMeta;
use crate::param::{BSIZE, NROUTE_PORTS};
use crate::sock::Packet;
use crate::status::{Result, Status};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortType {
    Local,
    Routing,
}

#[derive(Debug, Clone, Copy)]
struct PortSlot {
    active: bool,
    network: u32,
    port_type: PortType,
    socket: u16,
}

impl PortSlot {
    const fn empty() -> Self {
        Self {
            active: false,
            network: 0,
            port_type: PortType::Local,
            socket: 0,
        }
    }
}

/// Compact port descriptor handed between service calls, mirroring
/// `route_$short_port_t` (network, host id, secondary network, socket).
#[derive(Debug, Clone, Copy)]
pub struct ShortPort {
    pub network: u32,
    pub host_id: u32,
    pub socket: u16,
}

pub struct Route {
    ports: ExclLock<Vec<PortSlot>>,
}

impl Default for Route {
    fn default() -> Self {
        Self::new()
    }
}

impl Route {
    pub fn new() -> Self {
        Self {
            ports: ExclLock::new("route_ports", vec![PortSlot::empty(); NROUTE_PORTS]),
        }
    }

    /// Binds port `idx` (spec.md's fixed 8-entry table) to `network`,
    /// `port_type`, and a socket number.
    pub fn bind(&self, idx: usize, network: u32, port_type: PortType, socket: u16) -> Result<()> {
        let mut ports = self.ports.lock();
        let slot = ports.get_mut(idx).ok_or(Status::UnknownNetworkPort)?;
        slot.active = true;
        slot.network = network;
        slot.port_type = port_type;
        slot.socket = socket;
        Ok(())
    }

    pub fn unbind(&self, idx: usize) {
        if let Some(slot) = self.ports.lock().get_mut(idx) {
            *slot = PortSlot::empty();
        }
    }

    /// Linear search by network id, returning the port index.
    pub fn find_port(&self, network: u32) -> Option<usize> {
        self.ports
            .lock()
            .iter()
            .position(|p| p.active && p.network == network)
    }

    /// Same search, returning a [`ShortPort`] snapshot instead of an index.
    pub fn find_portp(&self, network: u32) -> Option<ShortPort> {
        let ports = self.ports.lock();
        ports
            .iter()
            .find(|p| p.active && p.network == network)
            .map(|p| ShortPort {
                network: p.network,
                host_id: p.network,
                socket: p.socket,
            })
    }

    /// Only ports in routing mode accept service requests that forward
    /// packets; local ports reject them as not-routing.
    fn require_routing(&self, idx: usize) -> Result<u16> {
        let ports = self.ports.lock();
        let slot = ports.get(idx).ok_or(Status::UnknownNetworkPort)?;
        if !slot.active || slot.port_type != PortType::Routing {
            return Err(Status::UnknownNetworkPort);
        }
        Ok(slot.socket)
    }

    /// Accepts a packet injected by a user routing port and queues it for
    /// transmission on the matching socket (spec.md §4.7 "incoming").
    /// Rejects a packet whose declared `data_len` cannot fit the fixed
    /// payload capacity.
    pub fn incoming(&self, sock: &crate::sock::Sock, idx: usize, pkt: Packet) -> Result<()> {
        if pkt.data_len as usize > pkt.data_pages.len() * BSIZE {
            return Err(Status::InvalidBlock);
        }
        let socket = self.require_routing(idx)?;
        sock.put(socket, pkt, crate::sock::PutFlags::empty(), 0, 0)
    }

    /// Pops the next queued outgoing packet for `idx`'s socket and
    /// computes its next hop from the trailer's destination address
    /// (spec.md §4.7 "outgoing"). Returns `None` if nothing is queued.
    pub fn outgoing(&self, sock: &crate::sock::Sock, idx: usize) -> Result<Option<(u32, Packet)>> {
        let socket = self.require_routing(idx)?;
        let Some(pkt) = sock.get(socket) else {
            return Ok(None);
        };
        let meta = PacketMeta::read_from(&pkt.header);
        Ok(Some((meta.dst_addr, pkt)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sock::Sock;

    #[test]
    fn bind_then_find_port() {
        let route = Route::new();
        route.bind(0, 42, PortType::Routing, 5).unwrap();
        assert_eq!(route.find_port(42), Some(0));
        assert_eq!(route.find_port(99), None);
    }

    #[test]
    fn incoming_then_outgoing_round_trips() {
        let route = Route::new();
        let sock = Sock::new();
        sock.open(5, 2, 1024, 4).unwrap();
        route.bind(0, 42, PortType::Routing, 5).unwrap();

        let mut header = Box::new([0u8; BSIZE]);
        let meta = PacketMeta {
            dst_addr: 7,
            ..Default::default()
        };
        meta.write_to(&mut header);
        let pkt = Packet {
            header,
            data_pages: vec![],
            data_len: 0,
        };
        route.incoming(&sock, 0, pkt).unwrap();

        let (nexthop, _pkt) = route.outgoing(&sock, 0).unwrap().unwrap();
        assert_eq!(nexthop, 7);
        assert!(route.outgoing(&sock, 0).unwrap().is_none());
    }

    #[test]
    fn unbound_port_rejects_service() {
        let route = Route::new();
        let sock = Sock::new();
        assert!(matches!(route.outgoing(&sock, 3), Err(Status::UnknownNetworkPort)));
    }

    #[test]
    fn local_port_rejects_forwarding_service() {
        let route = Route::new();
        let sock = Sock::new();
        route.bind(0, 42, PortType::Local, 5).unwrap();
        assert!(matches!(route.outgoing(&sock, 0), Err(Status::UnknownNetworkPort)));
    }
}
