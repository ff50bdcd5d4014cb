//! # message
//!
//! The request taxonomy and its wire codec (component C1).
//!
//! Six message kinds flow between clients and servers. The codec is a
//! small hand-rolled binary format rather than `serde_json` (used elsewhere
//! in this crate for ambient tooling): the wire format is fixed by the
//! protocol, not negotiated, so a compact byte-for-byte encoding is the
//! right tool here.

use crate::error::ProtocolError;
use crate::owner::{MemberAddress, Owner};

/// The zero-length header tag every outgoing message carries so the up-path
/// can recognize a payload as belonging to this protocol layer before
/// attempting to decode it.
pub const PROTOCOL_HEADER: &str = "distlock";

/// One of the six message kinds exchanged between clients and servers.
///
/// Ordinal values are part of the wire format (§4.1) and must not be
/// reordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RequestType {
    GrantLock = 0,
    LockGranted = 1,
    LockDenied = 2,
    ReleaseLock = 3,
    CreateLock = 4,
    DeleteLock = 5,
}

impl RequestType {
    fn from_byte(b: u8) -> Result<Self, ProtocolError> {
        match b {
            0 => Ok(Self::GrantLock),
            1 => Ok(Self::LockGranted),
            2 => Ok(Self::LockDenied),
            3 => Ok(Self::ReleaseLock),
            4 => Ok(Self::CreateLock),
            5 => Ok(Self::DeleteLock),
            other => Err(ProtocolError::UnknownRequestType(other)),
        }
    }
}

/// A single protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub kind: RequestType,
    pub lock_name: String,
    pub owner: Owner,
    pub timeout: u64,
    pub is_trylock: bool,
}

impl Request {
    pub fn new(kind: RequestType, lock_name: impl Into<String>, owner: Owner, timeout: u64, is_trylock: bool) -> Self {
        Self { kind, lock_name: lock_name.into(), owner, timeout, is_trylock }
    }

    pub fn grant_lock(lock_name: impl Into<String>, owner: Owner, timeout: u64, is_trylock: bool) -> Self {
        Self::new(RequestType::GrantLock, lock_name, owner, timeout, is_trylock)
    }

    pub fn release_lock(lock_name: impl Into<String>, owner: Owner) -> Self {
        Self::new(RequestType::ReleaseLock, lock_name, owner, 0, false)
    }

    pub fn lock_granted(lock_name: impl Into<String>, owner: Owner) -> Self {
        Self::new(RequestType::LockGranted, lock_name, owner, 0, false)
    }

    pub fn lock_denied(lock_name: impl Into<String>, owner: Owner) -> Self {
        Self::new(RequestType::LockDenied, lock_name, owner, 0, false)
    }

    pub fn create_lock(lock_name: impl Into<String>, owner: Owner) -> Self {
        Self::new(RequestType::CreateLock, lock_name, owner, 0, false)
    }

    pub fn delete_lock(lock_name: impl Into<String>, owner: Owner) -> Self {
        Self::new(RequestType::DeleteLock, lock_name, owner, 0, false)
    }

    /// Encode this request to the wire format described in §4.1.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(32 + self.lock_name.len());
        buf.push(self.kind as u8);
        write_lp_string(&mut buf, &self.lock_name);
        write_owner(&mut buf, &self.owner);
        buf.extend_from_slice(&self.timeout.to_be_bytes());
        buf.push(if self.is_trylock { 1 } else { 0 });
        buf
    }

    /// Decode a request previously produced by [`Request::encode`].
    ///
    /// Any malformed input is reported as a [`ProtocolError`]; per §4.1 and
    /// §7 the caller is expected to log and drop, never to propagate the
    /// error to an application.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let mut cur = Cursor::new(bytes);
        let kind_byte = cur.read_u8()?;
        let kind = RequestType::from_byte(kind_byte)?;
        let lock_name = cur.read_lp_string()?;
        let owner = cur.read_owner()?;
        let timeout = cur.read_u64()?;
        let is_trylock = cur.read_u8()? != 0;
        Ok(Request { kind, lock_name, owner, timeout, is_trylock })
    }
}

/// Encode `req` prefixed with the protocol header tag (§4.1) so an
/// arbitrary payload arriving on the transport can be recognized as
/// belonging to this layer before a full decode is attempted.
pub fn encode_tagged(req: &Request) -> Vec<u8> {
    let mut buf = Vec::new();
    write_lp_string(&mut buf, PROTOCOL_HEADER);
    buf.extend_from_slice(&req.encode());
    buf
}

/// Inverse of [`encode_tagged`]: verify the header tag, then decode the
/// request that follows it.
pub fn decode_tagged(bytes: &[u8]) -> Result<Request, ProtocolError> {
    let mut cur = Cursor::new(bytes);
    let header = cur.read_lp_string()?;
    if header != PROTOCOL_HEADER {
        return Err(ProtocolError::Decode(format!("payload missing protocol header (got {header:?})")));
    }
    Request::decode(cur.remaining())
}

fn write_lp_string(buf: &mut Vec<u8>, s: &str) {
    let bytes = s.as_bytes();
    buf.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
    buf.extend_from_slice(bytes);
}

fn write_owner(buf: &mut Vec<u8>, owner: &Owner) {
    buf.push(1);
    write_lp_string(buf, &String::from_utf8_lossy(owner.address.as_bytes()));
    buf.extend_from_slice(&owner.thread_id.to_be_bytes());
}

/// A tiny cursor over a byte slice, in the spirit of the length checks this
/// corpus's hand-rolled wire codecs perform before every read.
struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn remaining(&self) -> &'a [u8] {
        &self.bytes[self.pos..]
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ProtocolError> {
        if self.pos + n > self.bytes.len() {
            return Err(ProtocolError::Decode(format!(
                "unexpected end of input: need {n} bytes at offset {}, have {}",
                self.pos,
                self.bytes.len()
            )));
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn read_u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.take(1)?[0])
    }

    fn read_u16(&mut self) -> Result<u16, ProtocolError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn read_u64(&mut self) -> Result<u64, ProtocolError> {
        let b = self.take(8)?;
        Ok(u64::from_be_bytes(b.try_into().unwrap()))
    }

    fn read_lp_string(&mut self) -> Result<String, ProtocolError> {
        let len = self.read_u16()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|e| ProtocolError::Decode(e.to_string()))
    }

    fn read_owner(&mut self) -> Result<Owner, ProtocolError> {
        let tag = self.read_u8()?;
        let address = if tag == 0 {
            MemberAddress::new(Vec::new())
        } else {
            let name = self.read_lp_string()?;
            MemberAddress::from_str(name)
        };
        let thread_id = self.read_u64()?;
        Ok(Owner { address, thread_id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_owner() -> Owner {
        Owner::new(MemberAddress::from_str("member-a"), 42)
    }

    #[test]
    fn round_trips_grant_lock() {
        let req = Request::grant_lock("x", sample_owner(), 1500, true);
        let bytes = req.encode();
        let decoded = Request::decode(&bytes).unwrap();
        assert_eq!(req, decoded);
    }

    #[test]
    fn round_trips_all_kinds() {
        let owner = sample_owner();
        let reqs = vec![
            Request::grant_lock("x", owner.clone(), 0, false),
            Request::lock_granted("x", owner.clone()),
            Request::lock_denied("x", owner.clone()),
            Request::release_lock("x", owner.clone()),
            Request::create_lock("x", owner.clone()),
            Request::delete_lock("x", owner.clone()),
        ];
        for req in reqs {
            let bytes = req.encode();
            assert_eq!(Request::decode(&bytes).unwrap(), req);
        }
    }

    #[test]
    fn decode_rejects_unknown_type() {
        let mut bytes = Request::grant_lock("x", sample_owner(), 0, false).encode();
        bytes[0] = 99;
        let err = Request::decode(&bytes).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownRequestType(99)));
    }

    #[test]
    fn decode_rejects_truncated_input() {
        let bytes = Request::grant_lock("x", sample_owner(), 0, false).encode();
        let err = Request::decode(&bytes[..bytes.len() - 2]).unwrap_err();
        assert!(matches!(err, ProtocolError::Decode(_)));
    }

    #[test]
    fn tagged_round_trip_succeeds() {
        let req = Request::grant_lock("x", sample_owner(), 10, false);
        let tagged = encode_tagged(&req);
        assert_eq!(decode_tagged(&tagged).unwrap(), req);
    }

    #[test]
    fn tagged_decode_rejects_untagged_payload() {
        let req = Request::grant_lock("x", sample_owner(), 10, false);
        let untagged = req.encode();
        let err = decode_tagged(&untagged).unwrap_err();
        assert!(matches!(err, ProtocolError::Decode(_)));
    }

    #[test]
    fn empty_lock_name_encodes_as_zero_length() {
        // Lock names are required non-empty by the data model, but the
        // codec itself must not panic on a pathological zero-length string
        // reaching it from a misbehaving peer.
        let owner = sample_owner();
        let req = Request { kind: RequestType::ReleaseLock, lock_name: String::new(), owner, timeout: 0, is_trylock: false };
        let bytes = req.encode();
        assert_eq!(Request::decode(&bytes).unwrap(), req);
    }
}
