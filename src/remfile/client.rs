//! REM_FILE client: `do_request` (spec.md §4.8).
//!
//! Allocates a temporary socket, sends a request packet, and waits with a
//! timeout; on a mismatched reply opcode returns `unexpected_reply_type`,
//! on repeated timeout retries up to `max_retries`, after which the node
//! is marked invisible — unless the destination is the mother node, in
//! which case retries continue indefinitely and no visibility marking
//! happens (spec.md scenario 5).

use std::collections::HashSet;

use crate::clock::Clock;
use crate::ctx::{Asid, QuitTable};
use crate::hint::Hint;
use crate::lock::ExclLock;
use crate::msg::{Msg, WaitOutcome};
use crate::netpkt::PacketMeta;
use crate::param::{BSIZE, REMFILE_MAX_RETRIES, REMFILE_PROBE_AFTER_RETRIES};
use crate::sock::{Packet, PutFlags, Sock};
use crate::status::{Result, Status};

use super::wire::{Request, Response};

/// Tracks which remote nodes have stopped answering, per spec.md §4.8
/// ("marks the node invisible").
#[derive(Default)]
pub struct NodeVisibility {
    invisible: ExclLock<HashSet<u32>>,
}

impl NodeVisibility {
    pub fn new() -> Self {
        Self {
            invisible: ExclLock::new("node_visibility", HashSet::new()),
        }
    }

    pub fn mark_invisible(&self, node: u32) {
        self.invisible.lock().insert(node);
    }

    pub fn mark_visible(&self, node: u32) {
        self.invisible.lock().remove(&node);
    }

    /// A cheap local check consulted before burning through every retry
    /// against a node that is already known to be unreachable.
    pub fn is_likely_to_answer(&self, node: u32) -> bool {
        !self.invisible.lock().contains(&node)
    }
}

fn request_packet(req: &Request, dest_node: u32) -> Packet {
    let mut header = Box::new([0u8; BSIZE]);
    let body = req.encode();
    let meta = PacketMeta {
        dst_addr: dest_node,
        data_len: body.len() as u32,
        ..Default::default()
    };
    meta.write_to(&mut header);
    let mut page = Box::new([0u8; BSIZE]);
    let n = body.len().min(BSIZE);
    page[..n].copy_from_slice(&body[..n]);
    Packet {
        header,
        data_pages: vec![page],
        data_len: body.len() as u32,
    }
}

fn decode_reply(pkt: &Packet) -> Result<Response> {
    let meta = PacketMeta::read_from(&pkt.header);
    let len = (meta.data_len as usize).min(BSIZE);
    let body = pkt
        .data_pages
        .first()
        .map(|p| &p[..len])
        .unwrap_or(&[]);
    Response::decode(body)
}

/// Sends `req` to `dest_node` and waits for a matching reply, retrying on
/// timeout.
#[allow(clippy::too_many_arguments)]
pub fn do_request(
    sock: &Sock,
    msg: &Msg,
    clock: &dyn Clock,
    quit: &QuitTable,
    hint: &Hint,
    visibility: &NodeVisibility,
    asid: Asid,
    dest_node: u32,
    mother_node: u32,
    req: &Request,
    base_timeout_ticks: u64,
) -> Result<Response> {
    let n = sock.allocate(0, BSIZE as u32, 1)?;
    msg.open_msg(n, asid, 0)?;
    let result = do_request_inner(sock, msg, clock, quit, hint, visibility, asid, n, dest_node, mother_node, req, base_timeout_ticks);
    msg.close_msg(sock, n, asid);
    result
}

#[allow(clippy::too_many_arguments)]
fn do_request_inner(
    sock: &Sock,
    msg: &Msg,
    clock: &dyn Clock,
    quit: &QuitTable,
    hint: &Hint,
    visibility: &NodeVisibility,
    asid: Asid,
    n: u16,
    dest_node: u32,
    mother_node: u32,
    req: &Request,
    base_timeout_ticks: u64,
) -> Result<Response> {
    let is_mother = dest_node == mother_node;
    let mut attempt: u32 = 0;
    loop {
        sock.put(n, request_packet(req, dest_node), PutFlags::empty(), 0, 0)?;
        match msg.wait(sock, clock, quit, n, asid, base_timeout_ticks) {
            WaitOutcome::PacketReady => {
                let pkt = sock.get(n).ok_or(Status::RemoteNodeFailedToRespond)?;
                let resp = decode_reply(&pkt)?;
                if resp.opcode != req.opcode.wrapping_add(1) {
                    return Err(Status::UnexpectedReplyType);
                }
                if resp.is_stale() {
                    hint.invalidate(req.uid1);
                }
                visibility.mark_visible(dest_node);
                return Ok(resp);
            }
            WaitOutcome::QuitSignalled => return Err(Status::QuitSignalled),
            WaitOutcome::TimedOut => {
                attempt += 1;
                if is_mother {
                    continue;
                }
                if attempt > REMFILE_PROBE_AFTER_RETRIES && !visibility.is_likely_to_answer(dest_node) {
                    visibility.mark_invisible(dest_node);
                    return Err(Status::RemoteNodeFailedToRespond);
                }
                if attempt >= REMFILE_MAX_RETRIES {
                    visibility.mark_invisible(dest_node);
                    return Err(Status::RemoteNodeFailedToRespond);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use crate::remfile::wire::ServerOp;
    use crate::uid::Uid;

    fn req() -> Request {
        Request {
            msg_version: 1,
            flags1: 0,
            opcode: ServerOp::Test as u8,
            uid1: Uid::new(1, 2),
            uid2: Uid::NIL,
            uid3: Uid::NIL,
            uid4: Uid::NIL,
            data: vec![],
        }
    }

    #[test]
    fn times_out_after_max_retries_and_marks_invisible() {
        let sock = Sock::new();
        let msg = Msg::new();
        let clock = FakeClock::new();
        let quit = QuitTable::new();
        let hint = Hint::new(0, 0);
        let visibility = NodeVisibility::new();

        let result = do_request(&sock, &msg, &clock, &quit, &hint, &visibility, 0, 99, 1, &req(), 0);
        assert!(matches!(result, Err(Status::RemoteNodeFailedToRespond)));
        assert!(!visibility.is_likely_to_answer(99));
    }

    #[test]
    fn mismatched_opcode_is_unexpected_reply() {
        let sock = Sock::new();
        let msg = Msg::new();
        let clock = crate::clock::SystemClock;
        let quit = QuitTable::new();
        let hint = Hint::new(0, 0);
        let visibility = NodeVisibility::new();

        // do_request's internal sock.allocate() always hands out the
        // lowest free dynamic number on a fresh table, so a concurrent
        // "peer" thread can find the request by polling that same number
        // and answer it with a deliberately wrong opcode.
        let peer_socket = crate::param::SOCK_DYNAMIC_BASE;
        std::thread::scope(|s| {
            s.spawn(|| {
                let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
                while sock.queue_len(peer_socket) == 0 {
                    if std::time::Instant::now() > deadline {
                        return;
                    }
                    std::thread::sleep(std::time::Duration::from_millis(2));
                }
                sock.get(peer_socket);
                let bogus = Response::ok(0x50, Status::FileNotFound, vec![]);
                let mut header = Box::new([0u8; BSIZE]);
                let body = bogus.encode();
                let mut page = Box::new([0u8; BSIZE]);
                page[..body.len()].copy_from_slice(&body);
                let meta = PacketMeta { data_len: body.len() as u32, ..Default::default() };
                meta.write_to(&mut header);
                sock.put(
                    peer_socket,
                    Packet { header, data_pages: vec![page], data_len: body.len() as u32 },
                    PutFlags::empty(),
                    0,
                    0,
                )
                .unwrap();
            });

            let result = do_request(&sock, &msg, &clock, &quit, &hint, &visibility, 0, 1, 1, &req(), 2000);
            assert!(matches!(result, Err(Status::UnexpectedReplyType)));
        });
    }
}
