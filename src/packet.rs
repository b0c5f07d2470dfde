//! NTP wire codec.
//!
//! Layout of the fixed 48-byte header (RFC 5905 §7.3), all fields big-endian:
//!
//! ```text
//!  0      LI(2) VN(3) Mode(3)
//!  1      Stratum
//!  2      Poll (log2 s)
//!  3      Precision (signed log2 s)
//!  4..8   Root Delay
//!  8..12  Root Dispersion
//! 12..16  Reference ID
//! 16..24  Reference Timestamp
//! 24..32  Origin Timestamp
//! 32..40  Receive Timestamp
//! 40..48  Transmit Timestamp
//! ```

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

use crate::error::NtpError;

pub const NTP_PACKET_SIZE: usize = 48;

/// Seconds between 1900-01-01 (NTP era 0) and 1970-01-01 (Unix epoch).
pub const NTP_EPOCH_DELTA: i64 = 2_208_988_800;

pub const DEFAULT_NTP_PORT: u16 = 123;
pub const NTP_VERSION: u8 = 4;

pub const MODE_CLIENT: u8 = 3;
pub const MODE_SERVER: u8 = 4;

pub const LEAP_ALARM: u8 = 3;
pub const STRATUM_UNSYNCHRONIZED: u8 = 16;

const US_PER_SEC: i64 = 1_000_000;
const FRAC_SCALE: u64 = 1 << 32;

/// 64-bit NTP timestamp: seconds since 1900 plus a 2^-32 s fraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct NtpTimestamp {
    pub seconds: u32,
    pub fraction: u32,
}

impl NtpTimestamp {
    pub const ZERO: NtpTimestamp = NtpTimestamp { seconds: 0, fraction: 0 };

    /// Encodes a Unix microsecond instant. The fraction is floored, which
    /// `to_unix_us` compensates for by rounding.
    ///
    /// Only NTP era 0 (1900-01-01 to 2036-02-07) is representable: instants
    /// before or after it wrap modulo 2^32 seconds.
    pub fn from_unix_us(unix_us: i64) -> Self {
        let secs = unix_us.div_euclid(US_PER_SEC);
        let micros = unix_us.rem_euclid(US_PER_SEC) as u64;
        let fraction = (micros * FRAC_SCALE) / US_PER_SEC as u64;
        NtpTimestamp {
            seconds: (secs + NTP_EPOCH_DELTA) as u32,
            fraction: fraction as u32,
        }
    }

    /// Decodes to Unix microseconds. `None` for an unset (all-zero) stamp or
    /// one that predates the Unix epoch.
    pub fn to_unix_us(self) -> Option<i64> {
        if self.is_zero() {
            return None;
        }
        let secs = self.seconds as i64 - NTP_EPOCH_DELTA;
        if secs < 0 {
            return None;
        }
        let micros = ((self.fraction as u64 * US_PER_SEC as u64) + FRAC_SCALE / 2) >> 32;
        Some(secs * US_PER_SEC + micros as i64)
    }

    pub fn is_zero(self) -> bool {
        self.seconds == 0 && self.fraction == 0
    }

    pub fn to_bits(self) -> u64 {
        ((self.seconds as u64) << 32) | self.fraction as u64
    }

    pub fn from_bits(bits: u64) -> Self {
        NtpTimestamp {
            seconds: (bits >> 32) as u32,
            fraction: bits as u32,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NtpPacket {
    pub li_vn_mode: u8,
    pub stratum: u8,
    pub poll: i8,
    pub precision: i8,
    pub root_delay: u32,
    pub root_dispersion: u32,
    pub reference_id: u32,
    pub reference: NtpTimestamp,
    pub origin: NtpTimestamp,
    pub receive: NtpTimestamp,
    pub transmit: NtpTimestamp,
}

pub fn pack_li_vn_mode(leap: u8, version: u8, mode: u8) -> u8 {
    ((leap & 0x3) << 6) | ((version & 0x7) << 3) | (mode & 0x7)
}

impl NtpPacket {
    pub fn leap_indicator(&self) -> u8 {
        self.li_vn_mode >> 6
    }

    pub fn version(&self) -> u8 {
        (self.li_vn_mode >> 3) & 0x7
    }

    pub fn mode(&self) -> u8 {
        self.li_vn_mode & 0x7
    }

    /// Reference ID as ASCII, as carried by stratum 0/1 packets ("RATE", "GPS\0", ...).
    pub fn reference_code(&self) -> String {
        self.reference_id
            .to_be_bytes()
            .iter()
            .filter(|b| b.is_ascii_graphic())
            .map(|&b| b as char)
            .collect()
    }

    pub fn to_bytes(&self) -> [u8; NTP_PACKET_SIZE] {
        let mut buf = [0u8; NTP_PACKET_SIZE];
        {
            let mut w = &mut buf[..];
            // Writing into a fixed 48-byte slice cannot run short.
            let _ = self.write_fields(&mut w);
        }
        buf
    }

    fn write_fields<W: WriteBytesExt>(&self, w: &mut W) -> std::io::Result<()> {
        w.write_u8(self.li_vn_mode)?;
        w.write_u8(self.stratum)?;
        w.write_i8(self.poll)?;
        w.write_i8(self.precision)?;
        w.write_u32::<BigEndian>(self.root_delay)?;
        w.write_u32::<BigEndian>(self.root_dispersion)?;
        w.write_u32::<BigEndian>(self.reference_id)?;
        for ts in [self.reference, self.origin, self.receive, self.transmit] {
            w.write_u32::<BigEndian>(ts.seconds)?;
            w.write_u32::<BigEndian>(ts.fraction)?;
        }
        Ok(())
    }

    fn read_fields(buf: &[u8]) -> std::io::Result<Self> {
        let mut r = Cursor::new(buf);
        let li_vn_mode = r.read_u8()?;
        let stratum = r.read_u8()?;
        let poll = r.read_i8()?;
        let precision = r.read_i8()?;
        let root_delay = r.read_u32::<BigEndian>()?;
        let root_dispersion = r.read_u32::<BigEndian>()?;
        let reference_id = r.read_u32::<BigEndian>()?;
        let mut stamps = [NtpTimestamp::ZERO; 4];
        for ts in stamps.iter_mut() {
            ts.seconds = r.read_u32::<BigEndian>()?;
            ts.fraction = r.read_u32::<BigEndian>()?;
        }
        Ok(NtpPacket {
            li_vn_mode,
            stratum,
            poll,
            precision,
            root_delay,
            root_dispersion,
            reference_id,
            reference: stamps[0],
            origin: stamps[1],
            receive: stamps[2],
            transmit: stamps[3],
        })
    }
}

/// A client request about to be sent: the transmit stamp doubles as the
/// origin stamp the server must echo back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientRequest {
    pub version: u8,
    pub transmit: NtpTimestamp,
}

impl ClientRequest {
    pub fn at(now_us: i64) -> Self {
        ClientRequest {
            version: NTP_VERSION,
            transmit: NtpTimestamp::from_unix_us(now_us),
        }
    }
}

pub fn fill_packet(request: &ClientRequest) -> [u8; NTP_PACKET_SIZE] {
    NtpPacket {
        li_vn_mode: pack_li_vn_mode(0, request.version, MODE_CLIENT),
        transmit: request.transmit,
        ..NtpPacket::default()
    }
    .to_bytes()
}

pub fn parse_packet(buf: &[u8]) -> Result<NtpPacket, NtpError> {
    if buf.len() != NTP_PACKET_SIZE {
        return Err(NtpError::MalformedPacket(format!(
            "expected {} bytes, got {}",
            NTP_PACKET_SIZE,
            buf.len()
        )));
    }
    let packet = NtpPacket::read_fields(buf)
        .map_err(|e| NtpError::MalformedPacket(e.to_string()))?;
    if packet.mode() != MODE_SERVER {
        return Err(NtpError::MalformedPacket(format!(
            "mode {} is not a server response",
            packet.mode()
        )));
    }
    Ok(packet)
}

/// Sanity checks on a parsed server reply against the request that produced it.
pub fn validate_reply(packet: &NtpPacket, request: &ClientRequest) -> Result<(), NtpError> {
    let version = packet.version();
    if !(1..=4).contains(&version) {
        return Err(NtpError::MalformedPacket(format!("unsupported version {}", version)));
    }
    if packet.leap_indicator() == LEAP_ALARM {
        return Err(NtpError::Unsynchronized("leap indicator alarm".into()));
    }
    if packet.stratum == 0 {
        return Err(NtpError::KissOfDeath(packet.reference_code()));
    }
    if packet.stratum >= STRATUM_UNSYNCHRONIZED {
        return Err(NtpError::Unsynchronized(format!("stratum {}", packet.stratum)));
    }
    if packet.origin != request.transmit {
        return Err(NtpError::BadTimestamps(
            "origin timestamp does not echo our transmit timestamp".into(),
        ));
    }
    if packet.receive.to_unix_us().is_none() || packet.transmit.to_unix_us().is_none() {
        return Err(NtpError::BadTimestamps("server timestamps unset or out of range".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server_reply(request: &ClientRequest, recv_us: i64, tx_us: i64) -> NtpPacket {
        NtpPacket {
            li_vn_mode: pack_li_vn_mode(0, 4, MODE_SERVER),
            stratum: 2,
            poll: 6,
            precision: -20,
            reference_id: u32::from_be_bytes(*b"GPS\0"),
            origin: request.transmit,
            receive: NtpTimestamp::from_unix_us(recv_us),
            transmit: NtpTimestamp::from_unix_us(tx_us),
            ..NtpPacket::default()
        }
    }

    #[test]
    fn test_fill_packet_layout() {
        let request = ClientRequest::at(1_700_000_000_250_000);
        let bytes = fill_packet(&request);

        assert_eq!(bytes.len(), NTP_PACKET_SIZE);
        // LI=0, VN=4, Mode=3
        assert_eq!(bytes[0], 0x23);
        assert!(bytes[1..40].iter().all(|b| *b == 0));

        let secs = u32::from_be_bytes([bytes[40], bytes[41], bytes[42], bytes[43]]);
        assert_eq!(secs as i64, 1_700_000_000 + NTP_EPOCH_DELTA);
        let frac = u32::from_be_bytes([bytes[44], bytes[45], bytes[46], bytes[47]]);
        // 0.25 s
        assert_eq!(frac, 0x4000_0000);
    }

    #[test]
    fn test_transmit_timestamp_survives_encode_decode() {
        let request = ClientRequest::at(1_234_567_890_123_456);
        let mut bytes = fill_packet(&request);
        // Flip to server mode so the decoder accepts it.
        bytes[0] = pack_li_vn_mode(0, 4, MODE_SERVER);

        let parsed = parse_packet(&bytes).unwrap();
        assert_eq!(parsed.transmit, request.transmit);
        assert_eq!(parsed.transmit.to_unix_us(), Some(1_234_567_890_123_456));
    }

    #[test]
    fn test_microseconds_convert_exactly() {
        for us in [0i64, 1, 999_999, 500_000, 123_457, 1_000_001] {
            let unix = 1_600_000_000 * US_PER_SEC + us;
            assert_eq!(NtpTimestamp::from_unix_us(unix).to_unix_us(), Some(unix), "us={}", us);
        }
    }

    #[test]
    fn test_unix_epoch_maps_to_delta() {
        let ts = NtpTimestamp::from_unix_us(0);
        assert_eq!(ts.seconds as i64, NTP_EPOCH_DELTA);
        assert_eq!(ts.fraction, 0);
        assert_eq!(ts.to_unix_us(), Some(0));
        assert_eq!(NtpTimestamp::from_bits(ts.to_bits()), ts);
    }

    #[test]
    fn test_era_rollover_wraps_seconds() {
        // 2036-02-07T06:28:16Z is 2^32 s after the NTP epoch.
        let rollover_us = ((1i64 << 32) - NTP_EPOCH_DELTA) * 1_000_000;
        assert_eq!(NtpTimestamp::from_unix_us(rollover_us - 1_000_000).seconds, u32::MAX);
        assert_eq!(NtpTimestamp::from_unix_us(rollover_us).seconds, 0);
    }

    #[test]
    fn test_pre_unix_and_zero_stamps_do_not_convert() {
        assert_eq!(NtpTimestamp::ZERO.to_unix_us(), None);
        let ts = NtpTimestamp { seconds: 1_000, fraction: 0 };
        assert_eq!(ts.to_unix_us(), None);
    }

    #[test]
    fn test_parse_rejects_wrong_length() {
        let short = [0u8; 40];
        assert!(matches!(parse_packet(&short), Err(NtpError::MalformedPacket(_))));
        let long = [0u8; 68];
        assert!(matches!(parse_packet(&long), Err(NtpError::MalformedPacket(_))));
    }

    #[test]
    fn test_parse_rejects_client_mode() {
        let bytes = fill_packet(&ClientRequest::at(1));
        assert!(matches!(parse_packet(&bytes), Err(NtpError::MalformedPacket(_))));
    }

    #[test]
    fn test_parse_reads_big_endian_fields() {
        let request = ClientRequest::at(1_700_000_000_000_000);
        let mut reply = server_reply(&request, 1_700_000_000_000_500, 1_700_000_000_000_600);
        reply.root_delay = 0x0102_0304;
        reply.root_dispersion = 0x0A0B_0C0D;
        let bytes = reply.to_bytes();
        assert_eq!(&bytes[4..8], &[1, 2, 3, 4]);

        let parsed = parse_packet(&bytes).unwrap();
        assert_eq!(parsed, reply);
        assert_eq!(parsed.precision, -20);
        assert_eq!(parsed.reference_code(), "GPS");
    }

    #[test]
    fn test_validate_accepts_good_reply() {
        let request = ClientRequest::at(1_700_000_000_000_000);
        let reply = server_reply(&request, 1_700_000_000_000_500, 1_700_000_000_000_600);
        assert!(validate_reply(&reply, &request).is_ok());
    }

    #[test]
    fn test_validate_rejections() {
        let request = ClientRequest::at(1_700_000_000_000_000);
        let good = server_reply(&request, 1_700_000_000_000_500, 1_700_000_000_000_600);

        let mut kod = good;
        kod.stratum = 0;
        kod.reference_id = u32::from_be_bytes(*b"RATE");
        assert_eq!(validate_reply(&kod, &request), Err(NtpError::KissOfDeath("RATE".into())));

        let mut unsynced = good;
        unsynced.stratum = 16;
        assert!(matches!(validate_reply(&unsynced, &request), Err(NtpError::Unsynchronized(_))));

        let mut alarm = good;
        alarm.li_vn_mode = pack_li_vn_mode(LEAP_ALARM, 4, MODE_SERVER);
        assert!(matches!(validate_reply(&alarm, &request), Err(NtpError::Unsynchronized(_))));

        let mut bad_version = good;
        bad_version.li_vn_mode = pack_li_vn_mode(0, 0, MODE_SERVER);
        assert!(matches!(
            validate_reply(&bad_version, &request),
            Err(NtpError::MalformedPacket(_))
        ));

        let mut bad_origin = good;
        bad_origin.origin = NtpTimestamp::ZERO;
        assert!(matches!(validate_reply(&bad_origin, &request), Err(NtpError::BadTimestamps(_))));

        let mut unset_tx = good;
        unset_tx.transmit = NtpTimestamp::ZERO;
        assert!(matches!(validate_reply(&unset_tx, &request), Err(NtpError::BadTimestamps(_))));
    }
}
