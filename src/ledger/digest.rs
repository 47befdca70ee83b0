//! Entry Framing
//!
//! Packages an entry for transmission with a header and a CRC32 integrity
//! tag keyed by the ledger password.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

/// Computes and checks entry integrity tags for one ledger
#[derive(Clone)]
pub struct DigestManager {
    ledger_id: u64,
    password: Vec<u8>,
}

impl std::fmt::Debug for DigestManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DigestManager")
            .field("ledger_id", &self.ledger_id)
            .finish_non_exhaustive()
    }
}

impl DigestManager {
    /// ledger id, entry id, last add confirmed, length, checksum
    pub const HEADER_SIZE: usize = 8 * 4 + 4;

    pub fn new(ledger_id: u64, password: &[u8]) -> Self {
        Self {
            ledger_id,
            password: password.to_vec(),
        }
    }

    fn checksum(&self, header: &[u8], data: &[u8]) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&self.password);
        hasher.update(header);
        hasher.update(data);
        hasher.finalize()
    }

    /// Frame `data` as entry `entry_id`. `last_add_confirmed` is `None`
    /// before the first entry is confirmed.
    pub fn compute_digest_and_package(
        &self,
        entry_id: u64,
        last_add_confirmed: Option<u64>,
        length: u64,
        data: &[u8],
    ) -> Bytes {
        let mut packet = BytesMut::with_capacity(Self::HEADER_SIZE + data.len());
        packet.put_u64(self.ledger_id);
        packet.put_u64(entry_id);
        packet.put_u64(last_add_confirmed.unwrap_or(u64::MAX));
        packet.put_u64(length);

        let checksum = self.checksum(&packet, data);
        packet.put_u32(checksum);
        packet.put_slice(data);
        packet.freeze()
    }

    /// Check a framed entry and return its payload
    pub fn verify_digest_and_return_data(&self, entry_id: u64, packet: &[u8]) -> Result<Bytes> {
        if packet.len() < Self::HEADER_SIZE {
            return Err(Error::Internal(format!(
                "entry packet too short: {} bytes",
                packet.len()
            )));
        }

        let (header, rest) = packet.split_at(Self::HEADER_SIZE - 4);
        let mut fields = header;
        let ledger_id = fields.get_u64();
        let packet_entry_id = fields.get_u64();
        if ledger_id != self.ledger_id || packet_entry_id != entry_id {
            return Err(Error::Internal(format!(
                "entry ({}, {}) does not match expected ({}, {})",
                ledger_id, packet_entry_id, self.ledger_id, entry_id
            )));
        }

        let (mut checksum, data) = rest.split_at(4);
        if checksum.get_u32() != self.checksum(header, data) {
            return Err(Error::Internal(format!(
                "digest mismatch on entry ({}, {})",
                ledger_id, entry_id
            )));
        }

        Ok(Bytes::copy_from_slice(data))
    }
}
