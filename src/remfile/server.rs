//! REM_FILE server dispatcher (spec.md §4.8).
//!
//! The actual file, ACL, and directory-namespace semantics are explicitly
//! out of scope (spec.md §1: "consumed as opaque UID-keyed lookups"), so
//! [`FileLayer`] is the narrow external-collaborator trait every opcode
//! handler calls into — the same pattern as [`crate::driver::BlockDevice`]
//! for BAT/DBUF. This module's own job is the part spec.md §4.8 actually
//! describes: receive, stamp a response header, dispatch on opcode
//! family, remap a few protection-type codes, and shape the reply
//! (magic `0x80`, `opcode + 1`, status, optional stale-entry sentinel).

use crate::status::{crash_system, Result, Status};
use crate::uid::{Uid, UidGenerator};

use super::wire::{Request, Response, ServerOp};

/// Opaque UID-keyed operations the REM_FILE server calls into; the real
/// file/ACL/directory subsystem lives outside this crate (spec.md §1).
pub trait FileLayer: Send + Sync {
    fn set_attribute(&self, uid: Uid, attr: &[u8]) -> Result<()>;
    fn truncate_or_delete(&self, uid: Uid, new_len: u64) -> Result<()>;
    fn lock(&self, uid: Uid, mode: u16, rights: u8, extended: bool) -> Result<Vec<u8>>;
    fn unlock(&self, uid: Uid) -> Result<()>;
    fn neighbors(&self, uid1: Uid, uid2: Uid) -> Result<bool>;
    fn node_crash(&self, node_id: u32) -> Result<()>;
    fn purify(&self, uid: Uid) -> Result<()>;
    fn local_read_lock(&self, uid: Uid) -> Result<Vec<u8>>;
    fn set_def_acl(&self, uid: Uid, acl: &[u8]) -> Result<()>;
    fn local_lock_verify(&self, uid: Uid) -> Result<bool>;
    fn get_entry(&self, dir: Uid, index: u32) -> Result<Vec<u8>>;
    fn get_seg_map(&self, uid: Uid) -> Result<Vec<u8>>;
    fn invalidate(&self, uid: Uid) -> Result<()>;
    fn add_hard_link(&self, dir: Uid, name_uid: Uid) -> Result<()>;
    fn drop_hard_link(&self, dir: Uid, name_uid: Uid) -> Result<()>;
    fn create_type(&self, type_uid: Uid) -> Result<Uid>;
    fn uid_exists(&self, uid: Uid) -> bool;
    fn set_prot(&self, uid: Uid, prot_type: u8, sids: &[u8]) -> Result<()>;
    fn set_attrib_with_sids(&self, uid: Uid, sids: &[u8]) -> Result<()>;
    fn create_area(&self, uid: Uid, size: u32) -> Result<()>;
    fn delete_area(&self, uid: Uid) -> Result<()>;
    fn grow_area(&self, uid: Uid, extra: u32) -> Result<()>;
}

/// Maps a `SET_PROT`/`SET_ATTRIB` wire attribute-type byte to the
/// internal protection-type code (`server.c` lines 639-646).
fn remap_prot_type(attr_type: u8) -> Option<u8> {
    Some(match attr_type {
        0x03 => 6,
        0x10 => 0,
        0x11 => 1,
        0x12 => 2,
        0x13 => 4,
        0x14 => 5,
        0x15 => 3,
        _ => return None,
    })
}

/// Status code meaning success on the wire (`status_$ok`); the shared
/// [`Status`] taxonomy only enumerates error kinds, so a clean dispatch
/// reply is built directly rather than routed through it.
const STATUS_OK: u32 = 0;

/// Dispatches one decoded request to `backend`, returning the response to
/// send back over the wire. `is_mother_node` gates the liveness family's
/// node-crash handling (spec.md: "if mother node, crash"). A `NameNotFound`
/// from `get_entry` is reported through the stale-entry sentinel so the
/// client invalidates its cache (spec.md §4.8).
pub fn dispatch(req: &Request, backend: &dyn FileLayer, uid_gen: &UidGenerator, is_mother_node: bool) -> Response {
    let Some(op) = ServerOp::from_u8(req.opcode) else {
        return Response::ok(req.opcode, Status::UnexpectedReplyType, Vec::new());
    };

    match handle(op, req, backend, uid_gen, is_mother_node) {
        Ok(data) => Response {
            resp_type: super::wire::NORMAL_REPLY,
            opcode: req.opcode.wrapping_add(1),
            status: STATUS_OK,
            data,
        },
        Err(status @ (Status::NameNotFound | Status::FileNotFound)) if op == ServerOp::GetEntry => {
            Response::stale(req.opcode, status)
        }
        Err(status) => Response::ok(req.opcode, status, Vec::new()),
    }
}

fn handle(op: ServerOp, req: &Request, backend: &dyn FileLayer, uid_gen: &UidGenerator, is_mother_node: bool) -> Result<Vec<u8>> {
    use ServerOp::*;
    match op {
        Test => Ok(Vec::new()),

        SetAttribute => {
            backend.set_attribute(req.uid1, &req.data)?;
            Ok(Vec::new())
        }

        Truncate => {
            let new_len = u64::from(req.uid2.low);
            backend.truncate_or_delete(req.uid1, new_len)?;
            Ok(Vec::new())
        }

        Lock | LockExtended => {
            let extended = op == LockExtended;
            let mode = (req.uid3.high >> 16) as u16;
            let rights = ((req.uid3.high >> 8) & 0xFF) as u8;
            backend.lock(req.uid1, mode, rights, extended)
        }

        Unlock => {
            backend.unlock(req.uid1)?;
            Ok(Vec::new())
        }

        Neighbors => {
            let same = backend.neighbors(req.uid1, req.uid2)?;
            Ok(vec![same as u8])
        }

        NodeCrash => {
            let node_id = req.uid1.high;
            backend.node_crash(node_id)?;
            if is_mother_node {
                crash_system(Status::DriverLogicErr);
            }
            Ok(Vec::new())
        }

        Purify => {
            backend.purify(req.uid1)?;
            Ok(Vec::new())
        }

        LocalReadLock => backend.local_read_lock(req.uid1),

        SetDefAcl => {
            backend.set_def_acl(req.uid1, &req.data)?;
            Ok(Vec::new())
        }

        LocalLockVerify => {
            let ok = backend.local_lock_verify(req.uid1)?;
            Ok(vec![ok as u8])
        }

        GetEntry => backend.get_entry(req.uid1, req.uid2.low),

        GetSegMap => backend.get_seg_map(req.uid1),

        Invalidate => {
            backend.invalidate(req.uid1)?;
            Ok(Vec::new())
        }

        AddHardLink => {
            backend.add_hard_link(req.uid1, req.uid2)?;
            Ok(Vec::new())
        }

        GenerateUid => {
            for _ in 0..crate::param::UID_GENERATE_RETRIES {
                let candidate = uid_gen.generate();
                if !backend.uid_exists(candidate) {
                    return Ok(candidate_to_bytes(candidate));
                }
            }
            Err(Status::DiskFull)
        }

        CreatePresr10 => backend.create_type(req.uid1).map(candidate_to_bytes),

        DropHardLink => {
            backend.drop_hard_link(req.uid1, req.uid2)?;
            Ok(Vec::new())
        }

        CreateType => backend.create_type(req.uid1).map(candidate_to_bytes),

        SetProt | SetAttrib => {
            let attr_type = req.data.first().copied().unwrap_or(0);
            let prot_type = remap_prot_type(attr_type).ok_or(Status::InvalidBlock)?;
            if op == SetProt {
                backend.set_prot(req.uid1, prot_type, &req.data[1.min(req.data.len())..])?;
            } else {
                backend.set_attrib_with_sids(req.uid1, &req.data[1.min(req.data.len())..])?;
            }
            Ok(Vec::new())
        }

        CreateArea => {
            backend.create_area(req.uid1, req.uid2.low)?;
            Ok(Vec::new())
        }

        DeleteArea => {
            backend.delete_area(req.uid1)?;
            Ok(Vec::new())
        }

        GrowArea => {
            backend.grow_area(req.uid1, req.uid2.low)?;
            Ok(Vec::new())
        }
    }
}

fn candidate_to_bytes(uid: Uid) -> Vec<u8> {
    let mut out = Vec::with_capacity(8);
    out.extend_from_slice(&uid.high.to_ne_bytes());
    out.extend_from_slice(&uid.low.to_ne_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeBackend {
        locked: Mutex<Vec<Uid>>,
        known_uids: Mutex<Vec<Uid>>,
    }

    impl FileLayer for FakeBackend {
        fn set_attribute(&self, _uid: Uid, _attr: &[u8]) -> Result<()> {
            Ok(())
        }
        fn truncate_or_delete(&self, _uid: Uid, _new_len: u64) -> Result<()> {
            Ok(())
        }
        fn lock(&self, uid: Uid, _mode: u16, _rights: u8, _extended: bool) -> Result<Vec<u8>> {
            self.locked.lock().unwrap().push(uid);
            Ok(vec![1, 2, 3])
        }
        fn unlock(&self, uid: Uid) -> Result<()> {
            self.locked.lock().unwrap().retain(|u| *u != uid);
            Ok(())
        }
        fn neighbors(&self, _uid1: Uid, _uid2: Uid) -> Result<bool> {
            Ok(true)
        }
        fn node_crash(&self, _node_id: u32) -> Result<()> {
            self.locked.lock().unwrap().clear();
            Ok(())
        }
        fn purify(&self, _uid: Uid) -> Result<()> {
            Ok(())
        }
        fn local_read_lock(&self, _uid: Uid) -> Result<Vec<u8>> {
            Ok(Vec::new())
        }
        fn set_def_acl(&self, _uid: Uid, _acl: &[u8]) -> Result<()> {
            Ok(())
        }
        fn local_lock_verify(&self, uid: Uid) -> Result<bool> {
            Ok(self.locked.lock().unwrap().contains(&uid))
        }
        fn get_entry(&self, _dir: Uid, _index: u32) -> Result<Vec<u8>> {
            Err(Status::NameNotFound)
        }
        fn get_seg_map(&self, _uid: Uid) -> Result<Vec<u8>> {
            Ok(Vec::new())
        }
        fn invalidate(&self, _uid: Uid) -> Result<()> {
            Ok(())
        }
        fn add_hard_link(&self, _dir: Uid, _name_uid: Uid) -> Result<()> {
            Ok(())
        }
        fn drop_hard_link(&self, _dir: Uid, _name_uid: Uid) -> Result<()> {
            Ok(())
        }
        fn create_type(&self, _type_uid: Uid) -> Result<Uid> {
            Ok(Uid::new(1, 42))
        }
        fn uid_exists(&self, uid: Uid) -> bool {
            self.known_uids.lock().unwrap().contains(&uid)
        }
        fn set_prot(&self, _uid: Uid, _prot_type: u8, _sids: &[u8]) -> Result<()> {
            Ok(())
        }
        fn set_attrib_with_sids(&self, _uid: Uid, _sids: &[u8]) -> Result<()> {
            Ok(())
        }
        fn create_area(&self, _uid: Uid, _size: u32) -> Result<()> {
            Ok(())
        }
        fn delete_area(&self, _uid: Uid) -> Result<()> {
            Ok(())
        }
        fn grow_area(&self, _uid: Uid, _extra: u32) -> Result<()> {
            Ok(())
        }
    }

    fn base_req(opcode: ServerOp) -> Request {
        Request {
            msg_version: 1,
            flags1: 0,
            opcode: opcode as u8,
            uid1: Uid::new(1, 2),
            uid2: Uid::NIL,
            uid3: Uid::NIL,
            uid4: Uid::NIL,
            data: Vec::new(),
        }
    }

    #[test]
    fn test_opcode_replies_ok() {
        let backend = FakeBackend::default();
        let gen = UidGenerator::new(1);
        let resp = dispatch(&base_req(ServerOp::Test), &backend, &gen, false);
        assert_eq!(resp.opcode, ServerOp::Test as u8 + 1);
        assert_eq!(resp.status, 0);
    }

    #[test]
    fn get_entry_not_found_surfaces_stale_candidate_status() {
        let backend = FakeBackend::default();
        let gen = UidGenerator::new(1);
        let resp = dispatch(&base_req(ServerOp::GetEntry), &backend, &gen, false);
        assert_eq!(resp.status, Status::NameNotFound.code());
    }

    #[test]
    fn lock_then_unlock_round_trips_through_backend() {
        let backend = FakeBackend::default();
        let gen = UidGenerator::new(1);
        let lock_resp = dispatch(&base_req(ServerOp::Lock), &backend, &gen, false);
        assert_eq!(lock_resp.status, 0);
        assert_eq!(backend.locked.lock().unwrap().len(), 1);

        let unlock_resp = dispatch(&base_req(ServerOp::Unlock), &backend, &gen, false);
        assert_eq!(unlock_resp.status, 0);
        assert!(backend.locked.lock().unwrap().is_empty());
    }

    #[test]
    fn unknown_opcode_is_rejected() {
        let backend = FakeBackend::default();
        let gen = UidGenerator::new(1);
        let req = Request {
            msg_version: 1,
            flags1: 0,
            opcode: 0xFF,
            uid1: Uid::NIL,
            uid2: Uid::NIL,
            uid3: Uid::NIL,
            uid4: Uid::NIL,
            data: Vec::new(),
        };
        let resp = dispatch(&req, &backend, &gen, false);
        assert_eq!(resp.status, Status::UnexpectedReplyType.code());
    }
}
