// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Bit-exact SRT wire format: the 16-byte packet header shared by control and
//! data packets, plus the handshake/ACK/NAK CIF encodings that ride behind
//! it. Grounded on `upipe_srt_handshake.c`/`upipe_srt_receiver.c`'s packed
//! on-wire structures, restated as explicit byte-level codecs instead of
//! C bitfields over a `uint8_t*`.

use std::fmt;

/// Size in bytes of the fixed SRT packet header (control or data).
pub const SRT_HEADER_SIZE: usize = 16;

/// Magic value carried in a caller induction packet's extension field.
pub const SRT_MAGIC_CODE: u16 = 0x4A17;

/// Control packet type codes (low 15 bits of bytes 0..1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlType {
    Handshake,
    Keepalive,
    Ack,
    Nak,
    Shutdown,
    AckAck,
    DropReq,
    PeerError,
    /// Rekey key-material request: a post-handshake KMREQ sent for the
    /// currently-inactive key parity (§4.J "Rekey"). Carries a
    /// [`KeyMaterialExt`] payload; `type_specific` holds the parity (0 =
    /// even, 1 = odd) the enclosed key is for.
    KmReq,
    /// Acknowledges a [`ControlType::KmReq`]; `type_specific` echoes the
    /// parity that was accepted so the sender knows which pending rekey to
    /// clear.
    KmRsp,
    UserDefined(u16),
}

impl ControlType {
    #[must_use]
    pub fn code(self) -> u16 {
        match self {
            Self::Handshake => 0x0000,
            Self::Keepalive => 0x0001,
            Self::Ack => 0x0002,
            Self::Nak => 0x0003,
            Self::Shutdown => 0x0005,
            Self::AckAck => 0x0006,
            Self::DropReq => 0x0007,
            Self::PeerError => 0x0008,
            Self::KmReq => 0x0009,
            Self::KmRsp => 0x000A,
            Self::UserDefined(code) => code & 0x7FFF,
        }
    }

    #[must_use]
    pub fn from_code(code: u16) -> Self {
        match code & 0x7FFF {
            0x0000 => Self::Handshake,
            0x0001 => Self::Keepalive,
            0x0002 => Self::Ack,
            0x0003 => Self::Nak,
            0x0005 => Self::Shutdown,
            0x0006 => Self::AckAck,
            0x0007 => Self::DropReq,
            0x0008 => Self::PeerError,
            0x0009 => Self::KmReq,
            0x000A => Self::KmRsp,
            other => Self::UserDefined(other),
        }
    }
}

/// Encryption key-parity bits carried in a data packet (byte 4, bits 4..3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionField {
    Clear,
    Even,
    Odd,
}

impl EncryptionField {
    #[must_use]
    pub const fn bits(self) -> u8 {
        match self {
            Self::Clear => 0,
            Self::Even => 1,
            Self::Odd => 2,
        }
    }

    #[must_use]
    pub const fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            1 => Self::Even,
            2 => Self::Odd,
            _ => Self::Clear,
        }
    }
}

/// Packet position within a message (byte 4, bits 7..6). Only `Only` is used
/// by this implementation: every uref maps to exactly one SRT packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketPosition {
    First,
    Middle,
    Last,
    Only,
}

impl PacketPosition {
    #[must_use]
    pub const fn bits(self) -> u8 {
        match self {
            Self::First => 0b10,
            Self::Last => 0b01,
            Self::Middle => 0b00,
            Self::Only => 0b11,
        }
    }

    #[must_use]
    pub const fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0b10 => Self::First,
            0b01 => Self::Last,
            0b11 => Self::Only,
            _ => Self::Middle,
        }
    }
}

/// A decoded SRT packet header, control or data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SrtHeader {
    Control { control_type: ControlType, type_specific: u32, timestamp: u32, dest_sockid: u32 },
    Data {
        seq: u32,
        position: PacketPosition,
        order: bool,
        encryption: EncryptionField,
        retransmit: bool,
        msg_number: u32,
        timestamp: u32,
        dest_sockid: u32,
    },
}

/// Error returned when a buffer is too short or a field is malformed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireError(pub &'static str);

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SRT wire error: {}", self.0)
    }
}

impl std::error::Error for WireError {}

impl SrtHeader {
    /// Parse the fixed 16-byte header from the front of `buf`. Any CIF/payload
    /// bytes after the header are left for the caller to interpret.
    ///
    /// # Errors
    ///
    /// Returns [`WireError`] if `buf` is shorter than [`SRT_HEADER_SIZE`].
    pub fn parse(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < SRT_HEADER_SIZE {
            return Err(WireError("buffer shorter than SRT header"));
        }
        let w0 = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let is_control = (w0 & 0x8000_0000) != 0;
        let timestamp = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]);
        let dest_sockid = u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]);
        if is_control {
            let control_code = ((w0 >> 16) & 0x7FFF) as u16;
            let type_specific = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
            Ok(Self::Control {
                control_type: ControlType::from_code(control_code),
                type_specific,
                timestamp,
                dest_sockid,
            })
        } else {
            let seq = w0 & 0x7FFF_FFFF;
            let w1 = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
            let position = PacketPosition::from_bits(((w1 >> 30) & 0b11) as u8);
            let order = (w1 & 0x2000_0000) != 0;
            let encryption = EncryptionField::from_bits(((w1 >> 27) & 0b11) as u8);
            let retransmit = (w1 & 0x0400_0000) != 0;
            let msg_number = w1 & 0x03FF_FFFF;
            Ok(Self::Data {
                seq,
                position,
                order,
                encryption,
                retransmit,
                msg_number,
                timestamp,
                dest_sockid,
            })
        }
    }

    /// Serialize the header to a fresh 16-byte vector.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; SRT_HEADER_SIZE] {
        let mut out = [0u8; SRT_HEADER_SIZE];
        match *self {
            Self::Control { control_type, type_specific, .. } => {
                let w0 = 0x8000_0000 | (u32::from(control_type.code()) << 16);
                out[0..4].copy_from_slice(&w0.to_be_bytes());
                out[4..8].copy_from_slice(&type_specific.to_be_bytes());
            },
            Self::Data { seq, position, order, encryption, retransmit, msg_number, .. } => {
                let w0 = seq & 0x7FFF_FFFF;
                out[0..4].copy_from_slice(&w0.to_be_bytes());
                let mut w1 = u32::from(position.bits()) << 30;
                if order {
                    w1 |= 0x2000_0000;
                }
                w1 |= u32::from(encryption.bits()) << 27;
                if retransmit {
                    w1 |= 0x0400_0000;
                }
                w1 |= msg_number & 0x03FF_FFFF;
                out[4..8].copy_from_slice(&w1.to_be_bytes());
            },
        }
        let (timestamp, dest_sockid) = match *self {
            Self::Control { timestamp, dest_sockid, .. }
            | Self::Data { timestamp, dest_sockid, .. } => (timestamp, dest_sockid),
        };
        out[8..12].copy_from_slice(&timestamp.to_be_bytes());
        out[12..16].copy_from_slice(&dest_sockid.to_be_bytes());
        out
    }

    #[must_use]
    pub const fn is_control(&self) -> bool {
        matches!(self, Self::Control { .. })
    }
}

/// Handshake CIF, induction and conclusion share this shape (§6). Extension
/// blocks (HSREQ/KMREQ/SID) are appended by [`crate::transport::srt::handshake`]
/// and are not modelled here since their presence is negotiated, not fixed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeCif {
    pub version: u32,
    pub encryption_field: u16,
    pub extension_field: u16,
    pub initial_seq_num: u32,
    pub mtu: u32,
    pub max_flow_window: u32,
    /// `1` for induction, `0xFFFFFFFF` (-1) for conclusion, matching the
    /// UDT/SRT handshake type field's induction/conclusion sentinels.
    pub handshake_type: u32,
    pub srt_socket_id: u32,
    pub syn_cookie: u32,
    /// Peer IP address, stored as a 16-byte (IPv6-mapped) field regardless of
    /// the underlying address family, per the wire CIF.
    pub peer_addr: [u8; 16],
}

pub const SRT_HANDSHAKE_CIF_SIZE: usize = 48;
pub const HS_TYPE_INDUCTION: u32 = 1;
pub const HS_TYPE_CONCLUSION: u32 = 0xFFFF_FFFF;

impl HandshakeCif {
    /// Serialize the fixed-size handshake CIF (extensions are appended by the
    /// caller, since their layout depends on which are negotiated).
    #[must_use]
    pub fn to_bytes(&self) -> [u8; SRT_HANDSHAKE_CIF_SIZE] {
        let mut out = [0u8; SRT_HANDSHAKE_CIF_SIZE];
        out[0..4].copy_from_slice(&self.version.to_be_bytes());
        let enc_ext = (u32::from(self.encryption_field) << 16) | u32::from(self.extension_field);
        out[4..8].copy_from_slice(&enc_ext.to_be_bytes());
        out[8..12].copy_from_slice(&self.initial_seq_num.to_be_bytes());
        out[12..16].copy_from_slice(&self.mtu.to_be_bytes());
        out[16..20].copy_from_slice(&self.max_flow_window.to_be_bytes());
        out[20..24].copy_from_slice(&self.handshake_type.to_be_bytes());
        out[24..28].copy_from_slice(&self.srt_socket_id.to_be_bytes());
        out[28..32].copy_from_slice(&self.syn_cookie.to_be_bytes());
        out[32..48].copy_from_slice(&self.peer_addr);
        out
    }

    /// # Errors
    ///
    /// Returns [`WireError`] if `buf` is shorter than [`SRT_HANDSHAKE_CIF_SIZE`].
    pub fn parse(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < SRT_HANDSHAKE_CIF_SIZE {
            return Err(WireError("buffer shorter than handshake CIF"));
        }
        let enc_ext = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let mut peer_addr = [0u8; 16];
        peer_addr.copy_from_slice(&buf[32..48]);
        Ok(Self {
            version: u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]),
            encryption_field: (enc_ext >> 16) as u16,
            extension_field: (enc_ext & 0xFFFF) as u16,
            initial_seq_num: u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
            mtu: u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]),
            max_flow_window: u32::from_be_bytes([buf[16], buf[17], buf[18], buf[19]]),
            handshake_type: u32::from_be_bytes([buf[20], buf[21], buf[22], buf[23]]),
            srt_socket_id: u32::from_be_bytes([buf[24], buf[25], buf[26], buf[27]]),
            syn_cookie: u32::from_be_bytes([buf[28], buf[29], buf[30], buf[31]]),
            peer_addr,
        })
    }
}

/// A single NAK entry as packed into the ACK/loss-report CIF: either a
/// singleton sequence or a range `first..=last` (high bit of `first` set).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NakEntry {
    Single(u32),
    Range(u32, u32),
}

/// Encode a (sorted, deduplicated) set of missing sequences into NAK CIF
/// words, packing consecutive runs as range entries exactly as §4.K
/// specifies ("pack contiguous ranges as range NAKs ... singletons as plain").
#[must_use]
pub fn pack_nak_entries(missing: &[u32]) -> Vec<u32> {
    let mut words = Vec::new();
    let mut i = 0;
    while i < missing.len() {
        let start = missing[i];
        let mut end = start;
        let mut j = i + 1;
        while j < missing.len() && missing[j] == end.wrapping_add(1) {
            end = missing[j];
            j += 1;
        }
        if end > start {
            words.push(start | 0x8000_0000);
            words.push(end);
        } else {
            words.push(start & 0x7FFF_FFFF);
        }
        i = j;
    }
    words
}

/// Decode NAK CIF words back into individual missing sequences.
#[must_use]
pub fn unpack_nak_entries(words: &[u32]) -> Vec<NakEntry> {
    let mut entries = Vec::new();
    let mut i = 0;
    while i < words.len() {
        let word = words[i];
        if word & 0x8000_0000 != 0 {
            let first = word & 0x7FFF_FFFF;
            if i + 1 < words.len() {
                entries.push(NakEntry::Range(first, words[i + 1]));
                i += 2;
                continue;
            }
            entries.push(NakEntry::Single(first));
            i += 1;
        } else {
            entries.push(NakEntry::Single(word));
            i += 1;
        }
    }
    entries
}

/// Full ACK CIF (§4.K): acknowledged sequence plus flow statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AckCif {
    pub ack_number: u32,
    pub last_ack_seq: u32,
    pub rtt_us: u32,
    pub rtt_var_us: u32,
    pub available_buffer: u32,
    pub packets_per_second: u32,
    pub bytes_per_second: u32,
    pub estimated_link_capacity: u32,
}

pub const SRT_ACK_CIF_SIZE: usize = 28;

impl AckCif {
    #[must_use]
    pub fn to_bytes(&self) -> [u8; SRT_ACK_CIF_SIZE] {
        let mut out = [0u8; SRT_ACK_CIF_SIZE];
        out[0..4].copy_from_slice(&self.last_ack_seq.to_be_bytes());
        out[4..8].copy_from_slice(&self.rtt_us.to_be_bytes());
        out[8..12].copy_from_slice(&self.rtt_var_us.to_be_bytes());
        out[12..16].copy_from_slice(&self.available_buffer.to_be_bytes());
        out[16..20].copy_from_slice(&self.packets_per_second.to_be_bytes());
        out[20..24].copy_from_slice(&self.bytes_per_second.to_be_bytes());
        out[24..28].copy_from_slice(&self.estimated_link_capacity.to_be_bytes());
        out
    }

    /// # Errors
    ///
    /// Returns [`WireError`] if `buf` is shorter than [`SRT_ACK_CIF_SIZE`].
    pub fn parse(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < SRT_ACK_CIF_SIZE {
            return Err(WireError("buffer shorter than ACK CIF"));
        }
        Ok(Self {
            ack_number: 0,
            last_ack_seq: u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]),
            rtt_us: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
            rtt_var_us: u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
            available_buffer: u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]),
            packets_per_second: u32::from_be_bytes([buf[16], buf[17], buf[18], buf[19]]),
            bytes_per_second: u32::from_be_bytes([buf[20], buf[21], buf[22], buf[23]]),
            estimated_link_capacity: u32::from_be_bytes([buf[24], buf[25], buf[26], buf[27]]),
        })
    }
}

/// Sentinel "available buffer" advertisement (§4.K/§9): not a true
/// flow-control signal, just a nonzero placeholder so peers relying on
/// libsrt's semantics don't treat zero as a stall.
pub const AVAILABLE_BUFFER_SENTINEL: u32 = 8192;

/// HSREQ/KMREQ extension block appended after the fixed handshake CIF when
/// encryption is negotiated (§6): a 16-byte salt followed by the
/// AES-key-wrapped stream encryption key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyMaterialExt {
    pub salt: [u8; 16],
    pub wrapped_sek: Vec<u8>,
}

impl KeyMaterialExt {
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16 + self.wrapped_sek.len());
        out.extend_from_slice(&self.salt);
        out.extend_from_slice(&self.wrapped_sek);
        out
    }

    /// # Errors
    ///
    /// Returns [`WireError`] if `buf` is shorter than a 16-byte salt plus a
    /// minimal one-block (24-byte) wrapped key.
    pub fn parse(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < 16 + 24 {
            return Err(WireError("buffer shorter than KMREQ extension"));
        }
        let mut salt = [0u8; 16];
        salt.copy_from_slice(&buf[0..16]);
        Ok(Self { salt, wrapped_sek: buf[16..].to_vec() })
    }
}

/// DROPREQ CIF: the `[first, last]` sequence range the sender tells the
/// receiver to stop NAK-ing (§4.L, scenario 3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DropReqCif {
    pub first: u32,
    pub last: u32,
}

impl DropReqCif {
    #[must_use]
    pub fn to_bytes(self) -> [u8; 8] {
        let mut out = [0u8; 8];
        out[0..4].copy_from_slice(&self.first.to_be_bytes());
        out[4..8].copy_from_slice(&self.last.to_be_bytes());
        out
    }

    /// # Errors
    ///
    /// Returns [`WireError`] if `buf` is shorter than 8 bytes.
    pub fn parse(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < 8 {
            return Err(WireError("buffer shorter than DROPREQ CIF"));
        }
        Ok(Self {
            first: u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]),
            last: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_header_round_trips() {
        let header = SrtHeader::Control {
            control_type: ControlType::Ack,
            type_specific: 42,
            timestamp: 123_456,
            dest_sockid: 0xDEAD_BEEF,
        };
        let bytes = header.to_bytes();
        assert_eq!(SrtHeader::parse(&bytes).unwrap(), header);
        assert!(bytes[0] & 0x80 != 0, "control bit must be set");
    }

    #[test]
    fn data_header_round_trips() {
        let header = SrtHeader::Data {
            seq: 0x7FFF_FFFF,
            position: PacketPosition::Only,
            order: true,
            encryption: EncryptionField::Even,
            retransmit: true,
            msg_number: 0x0123_4567 & 0x03FF_FFFF,
            timestamp: 999,
            dest_sockid: 7,
        };
        let bytes = header.to_bytes();
        assert_eq!(bytes[0] & 0x80, 0, "data bit must be clear");
        assert_eq!(SrtHeader::parse(&bytes).unwrap(), header);
    }

    #[test]
    fn handshake_cif_round_trips() {
        let cif = HandshakeCif {
            version: 0x0001_0000,
            encryption_field: 2,
            extension_field: 1,
            initial_seq_num: 12345,
            mtu: 1500,
            max_flow_window: 8192,
            handshake_type: HS_TYPE_INDUCTION,
            srt_socket_id: 0xAABB_CCDD,
            syn_cookie: 0x1234_5678,
            peer_addr: [0; 16],
        };
        let bytes = cif.to_bytes();
        assert_eq!(HandshakeCif::parse(&bytes).unwrap(), cif);
    }

    #[test]
    fn nak_packs_contiguous_ranges_and_singletons() {
        // Scenario 2: sequences 4,5,6 missing (contiguous) and 9 missing (singleton).
        let missing = [4, 5, 6, 9];
        let words = pack_nak_entries(&missing);
        assert_eq!(words, vec![4 | 0x8000_0000, 6, 9]);
        let entries = unpack_nak_entries(&words);
        assert_eq!(entries, vec![NakEntry::Range(4, 6), NakEntry::Single(9)]);
    }

    #[test]
    fn nak_single_gap_has_no_range_bit() {
        let words = pack_nak_entries(&[42]);
        assert_eq!(words, vec![42]);
        assert_eq!(unpack_nak_entries(&words), vec![NakEntry::Single(42)]);
    }

    #[test]
    fn ack_cif_round_trips() {
        let cif = AckCif {
            ack_number: 0,
            last_ack_seq: 100,
            rtt_us: 5000,
            rtt_var_us: 1000,
            available_buffer: AVAILABLE_BUFFER_SENTINEL,
            packets_per_second: 50,
            bytes_per_second: 50_000,
            estimated_link_capacity: 500,
        };
        let bytes = cif.to_bytes();
        let parsed = AckCif::parse(&bytes).unwrap();
        assert_eq!(parsed.last_ack_seq, cif.last_ack_seq);
        assert_eq!(parsed.rtt_us, cif.rtt_us);
    }

    #[test]
    fn key_material_ext_round_trips() {
        let ext = KeyMaterialExt { salt: [7u8; 16], wrapped_sek: vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24] };
        let bytes = ext.to_bytes();
        assert_eq!(KeyMaterialExt::parse(&bytes).unwrap(), ext);
    }

    #[test]
    fn dropreq_cif_round_trips() {
        let cif = DropReqCif { first: 99, last: 99 };
        let bytes = cif.to_bytes();
        assert_eq!(DropReqCif::parse(&bytes).unwrap(), cif);
    }
}
