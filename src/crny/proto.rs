//! Chrony control protocol (version 6) wire layer: request framing, reply
//! validation and the proprietary numeric encodings, for the four commands
//! this daemon sends.

use crate::error::{ErrorKind, SyncError, SyncResult};
use byteorder::{BigEndian, ByteOrder};
use log::debug;
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

pub const PROTO_VERSION: u8 = 6;
pub const PKT_TYPE_CMD_REQUEST: u8 = 1;
pub const PKT_TYPE_CMD_REPLY: u8 = 2;

pub const REQ_N_SOURCES: u16 = 14;
pub const REQ_SOURCE_DATA: u16 = 15;
pub const REQ_TRACKING: u16 = 33;
pub const REQ_NTP_DATA: u16 = 57;

pub const RPY_N_SOURCES: u16 = 2;
pub const RPY_SOURCE_DATA: u16 = 3;
pub const RPY_TRACKING: u16 = 5;
pub const RPY_NTP_DATA: u16 = 16;

/// Requests are padded to at least the longest reply the daemon may send.
pub const REQUEST_LEN: usize = 520;
pub const REPLY_LEN: usize = 540;
const REQUEST_HEADER_LEN: usize = 20;
pub const REPLY_HEADER_LEN: usize = 28;

/// Reference ids that mark the daemon as its own source.
pub const REF_ID_LOCAL_A: u32 = 0x7F7F_0101;
pub const REF_ID_LOCAL_B: u32 = 0x4C4F_434C;
pub const REF_ID_UNSYNC: u32 = 0;

/// Peer selection state codes of interest.
pub const SD_STATE_SELECTED: u16 = 0;
pub const SD_STATE_CANDIDATE: u16 = 4;

/// Source mode codes.
pub const SD_MODE_CLIENT: u16 = 0;
pub const SD_MODE_PEER: u16 = 1;
pub const SD_MODE_REF: u16 = 2;

/// NTP packet mode marking a client/server peer.
pub const NTP_MODE_SERVER: u8 = 4;

const ADDR_LEN: usize = 20;
const TIMESPEC_LEN: usize = 12;

// ============================================================================
// NUMERIC ENCODINGS
// ============================================================================

/// Interpret the low `sign_bit + 1` bits of `x` as two's complement; the
/// result lies in `[-2^sign_bit, 2^sign_bit)`.
pub fn to_signed(x: u32, sign_bit: u32) -> i32 {
    let width = sign_bit + 1;
    let mask = if width >= 32 { u32::MAX } else { (1u32 << width) - 1 };
    let x = x & mask;
    if x & (1 << sign_bit) != 0 {
        (x as i64 - (1i64 << width)) as i32
    } else {
        x as i32
    }
}

const FLOAT_EXP_BITS: u32 = 7;
const FLOAT_COEF_BITS: u32 = 32 - FLOAT_EXP_BITS;

/// Decode a chrony float: high 7 bits signed exponent, low 25 bits signed
/// coefficient, value = coef × 2^(exp − 25).
pub fn chrony_float_to_f64(bits: u32) -> f64 {
    let exp = to_signed(bits >> FLOAT_COEF_BITS, FLOAT_EXP_BITS - 1);
    let coef = to_signed(bits & ((1 << FLOAT_COEF_BITS) - 1), FLOAT_COEF_BITS - 1);
    coef as f64 * ((exp - FLOAT_COEF_BITS as i32) as f64).exp2()
}

/// Encode a chrony float from raw coefficient and exponent (test support and
/// round-trip checks; this daemon never sends floats).
pub fn chrony_float_bits(coef: i32, exp: i32) -> u32 {
    let coef = (coef as u32) & ((1 << FLOAT_COEF_BITS) - 1);
    let exp = (exp as u32) & ((1 << FLOAT_EXP_BITS) - 1);
    (exp << FLOAT_COEF_BITS) | coef
}

fn read_float(buf: &[u8]) -> f64 {
    chrony_float_to_f64(BigEndian::read_u32(buf))
}

/// Seconds carried as (high u32, low u32) plus nanoseconds.
fn read_timespec_ns(buf: &[u8]) -> i64 {
    let sec_high = BigEndian::read_u32(buf) as i64;
    let sec_low = BigEndian::read_u32(&buf[4..]) as i64;
    let nsec = BigEndian::read_u32(&buf[8..]) as i64;
    ((sec_high << 32) | sec_low) * 1_000_000_000 + nsec
}

// ============================================================================
// ADDRESSES
// ============================================================================

/// Wire address discriminators.
const ADDR_FAMILY_UNSPEC: u16 = 0;
const ADDR_FAMILY_INET4: u16 = 1;
const ADDR_FAMILY_INET6: u16 = 2;

/// A peer address as carried in the 20-byte wire structure. IPv6 addresses
/// are not v6-mapped; an unspecified family stays unspecified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerAddr {
    V4(Ipv4Addr),
    V6(Ipv6Addr),
    Unspec,
}

impl PeerAddr {
    pub fn parse(buf: &[u8]) -> Self {
        debug_assert!(buf.len() >= ADDR_LEN);
        let family = BigEndian::read_u16(&buf[16..18]);
        match family {
            ADDR_FAMILY_INET4 => PeerAddr::V4(Ipv4Addr::from(BigEndian::read_u32(&buf[0..4]))),
            ADDR_FAMILY_INET6 => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&buf[0..16]);
                PeerAddr::V6(Ipv6Addr::from(octets))
            }
            ADDR_FAMILY_UNSPEC => PeerAddr::Unspec,
            other => {
                debug!("unknown address family {} in reply, treating as unspecified", other);
                PeerAddr::Unspec
            }
        }
    }

    fn encode(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= ADDR_LEN);
        match self {
            PeerAddr::V4(a) => {
                BigEndian::write_u32(&mut buf[0..4], u32::from(*a));
                BigEndian::write_u16(&mut buf[16..18], ADDR_FAMILY_INET4);
            }
            PeerAddr::V6(a) => {
                buf[0..16].copy_from_slice(&a.octets());
                BigEndian::write_u16(&mut buf[16..18], ADDR_FAMILY_INET6);
            }
            PeerAddr::Unspec => {}
        }
    }

    pub fn is_unspec(&self) -> bool {
        matches!(self, PeerAddr::Unspec)
    }
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerAddr::V4(a) => write!(f, "{}", a),
            PeerAddr::V6(a) => write!(f, "{}", a),
            PeerAddr::Unspec => f.write_str("(unspec)"),
        }
    }
}

// ============================================================================
// REQUESTS
// ============================================================================

/// The four queries this daemon issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Query {
    Tracking,
    NumSources,
    SourceData(u32),
    NtpData(PeerAddr),
}

impl Query {
    pub fn command(&self) -> u16 {
        match self {
            Query::Tracking => REQ_TRACKING,
            Query::NumSources => REQ_N_SOURCES,
            Query::SourceData(_) => REQ_SOURCE_DATA,
            Query::NtpData(_) => REQ_NTP_DATA,
        }
    }

    pub fn expected_reply(&self) -> u16 {
        match self {
            Query::Tracking => RPY_TRACKING,
            Query::NumSources => RPY_N_SOURCES,
            Query::SourceData(_) => RPY_SOURCE_DATA,
            Query::NtpData(_) => RPY_NTP_DATA,
        }
    }
}

/// Build a fixed-size request frame for `query` under the given sequence
/// number.
pub fn encode_request(query: &Query, sequence: u32) -> [u8; REQUEST_LEN] {
    let mut buf = [0u8; REQUEST_LEN];
    buf[0] = PROTO_VERSION;
    buf[1] = PKT_TYPE_CMD_REQUEST;
    BigEndian::write_u16(&mut buf[4..6], query.command());
    BigEndian::write_u16(&mut buf[6..8], 0); // attempt
    BigEndian::write_u32(&mut buf[8..12], sequence);

    let data = &mut buf[REQUEST_HEADER_LEN..];
    match query {
        Query::Tracking | Query::NumSources => {}
        Query::SourceData(index) => BigEndian::write_u32(&mut data[0..4], *index),
        Query::NtpData(addr) => addr.encode(&mut data[0..ADDR_LEN]),
    }
    buf
}

// ============================================================================
// REPLIES
// ============================================================================

/// Validate a reply frame against the outstanding request and return its
/// payload. Any mismatch is a protocol-kind error.
pub fn check_reply<'a>(
    buf: &'a [u8],
    expect_command: u16,
    expect_sequence: u32,
    expect_reply: u16,
) -> SyncResult<&'a [u8]> {
    if buf.len() < REPLY_HEADER_LEN {
        return Err(SyncError::with(
            ErrorKind::Protocol,
            format!("short reply: {} bytes", buf.len()),
        ));
    }
    if buf[1] != PKT_TYPE_CMD_REPLY {
        return Err(SyncError::with(
            ErrorKind::Protocol,
            format!("unexpected packet type {}", buf[1]),
        ));
    }
    let command = BigEndian::read_u16(&buf[4..6]);
    let reply = BigEndian::read_u16(&buf[6..8]);
    let status = BigEndian::read_u16(&buf[8..10]);
    let sequence = BigEndian::read_u32(&buf[16..20]);

    if status != 0 {
        return Err(SyncError::with(
            ErrorKind::Protocol,
            format!("reply status {}", status),
        ));
    }
    if command != expect_command {
        return Err(SyncError::with(
            ErrorKind::Protocol,
            format!("command echo {} != {}", command, expect_command),
        ));
    }
    if sequence != expect_sequence {
        return Err(SyncError::with(
            ErrorKind::Protocol,
            format!("sequence echo {:#x} != {:#x}", sequence, expect_sequence),
        ));
    }
    if reply != expect_reply {
        return Err(SyncError::with(
            ErrorKind::Protocol,
            format!("reply type {} != {}", reply, expect_reply),
        ));
    }
    Ok(&buf[REPLY_HEADER_LEN..])
}

/// Parsed `tracking` reply: the daemon's current reference.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackingInfo {
    pub ref_id: u32,
    pub peer_addr: PeerAddr,
    pub stratum: u16,
    pub leap_status: u16,
    pub ref_time_ns: i64,
    pub current_correction: f64,
    pub last_offset: f64,
    pub rms_offset: f64,
    pub freq_ppm: f64,
    pub root_delay: f64,
    pub root_dispersion: f64,
}

impl TrackingInfo {
    /// The daemon is tracking itself (a reference clock or the local mode).
    pub fn is_self_reference(&self) -> bool {
        self.ref_id == REF_ID_LOCAL_A || self.ref_id == REF_ID_LOCAL_B
    }

    pub fn is_unsynchronised(&self) -> bool {
        self.ref_id == REF_ID_UNSYNC
    }
}

pub fn parse_tracking(payload: &[u8]) -> SyncResult<TrackingInfo> {
    const LEN: usize = 4 + ADDR_LEN + 4 + TIMESPEC_LEN + 9 * 4;
    if payload.len() < LEN {
        return Err(SyncError::with(ErrorKind::Protocol, "short tracking reply"));
    }
    Ok(TrackingInfo {
        ref_id: BigEndian::read_u32(&payload[0..4]),
        peer_addr: PeerAddr::parse(&payload[4..24]),
        stratum: BigEndian::read_u16(&payload[24..26]),
        leap_status: BigEndian::read_u16(&payload[26..28]),
        ref_time_ns: read_timespec_ns(&payload[28..40]),
        current_correction: read_float(&payload[40..44]),
        last_offset: read_float(&payload[44..48]),
        rms_offset: read_float(&payload[48..52]),
        freq_ppm: read_float(&payload[52..56]),
        // resid_freq_ppm and skew_ppm are skipped (56..64)
        root_delay: read_float(&payload[64..68]),
        root_dispersion: read_float(&payload[68..72]),
    })
}

pub fn parse_num_sources(payload: &[u8]) -> SyncResult<u32> {
    if payload.len() < 4 {
        return Err(SyncError::with(ErrorKind::Protocol, "short source count"));
    }
    Ok(BigEndian::read_u32(&payload[0..4]))
}

/// One entry of the daemon's source table.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceDatum {
    pub addr: PeerAddr,
    pub poll: i16,
    pub stratum: u16,
    pub state: u16,
    pub mode: u16,
    pub flags: u16,
    pub reachability: u16,
}

impl SourceDatum {
    /// Reference clocks count as the daemon itself.
    pub fn is_self(&self) -> bool {
        self.mode == SD_MODE_REF
    }
}

pub fn parse_source_datum(payload: &[u8]) -> SyncResult<SourceDatum> {
    const LEN: usize = ADDR_LEN + 6 * 2 + 4 + 3 * 4;
    if payload.len() < LEN {
        return Err(SyncError::with(ErrorKind::Protocol, "short source datum"));
    }
    Ok(SourceDatum {
        addr: PeerAddr::parse(&payload[0..20]),
        poll: BigEndian::read_i16(&payload[20..22]),
        stratum: BigEndian::read_u16(&payload[22..24]),
        state: BigEndian::read_u16(&payload[24..26]),
        mode: BigEndian::read_u16(&payload[26..28]),
        flags: BigEndian::read_u16(&payload[28..30]),
        reachability: BigEndian::read_u16(&payload[30..32]),
    })
}

/// Per-peer NTP measurement data.
#[derive(Debug, Clone, PartialEq)]
pub struct NtpDatum {
    pub remote_addr: PeerAddr,
    pub local_addr: PeerAddr,
    pub remote_port: u16,
    pub leap: u8,
    pub mode: u8,
    pub stratum: u8,
    pub poll: i8,
    pub precision: i8,
    pub root_delay: f64,
    pub root_dispersion: f64,
    pub ref_id: u32,
    pub offset: f64,
    pub peer_delay: f64,
    pub peer_dispersion: f64,
    pub total_tx_count: u32,
    pub total_rx_count: u32,
    pub total_valid_count: u32,
}

pub fn parse_ntp_datum(payload: &[u8]) -> SyncResult<NtpDatum> {
    const LEN: usize = 124;
    if payload.len() < LEN {
        return Err(SyncError::with(ErrorKind::Protocol, "short ntp datum"));
    }
    Ok(NtpDatum {
        remote_addr: PeerAddr::parse(&payload[0..20]),
        local_addr: PeerAddr::parse(&payload[20..40]),
        remote_port: BigEndian::read_u16(&payload[40..42]),
        leap: payload[42],
        mode: payload[44],
        stratum: payload[45],
        poll: payload[46] as i8,
        precision: payload[47] as i8,
        root_delay: read_float(&payload[48..52]),
        root_dispersion: read_float(&payload[52..56]),
        ref_id: BigEndian::read_u32(&payload[56..60]),
        offset: read_float(&payload[72..76]),
        peer_delay: read_float(&payload[76..80]),
        peer_dispersion: read_float(&payload[80..84]),
        total_tx_count: BigEndian::read_u32(&payload[96..100]),
        total_rx_count: BigEndian::read_u32(&payload[100..104]),
        total_valid_count: BigEndian::read_u32(&payload[104..108]),
    })
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_signed_ranges() {
        // Sign bit 6: 7-bit two's complement, range [-64, 64).
        assert_eq!(to_signed(0, 6), 0);
        assert_eq!(to_signed(63, 6), 63);
        assert_eq!(to_signed(64, 6), -64);
        assert_eq!(to_signed(127, 6), -1);

        // Sign bit 24: 25-bit two's complement.
        assert_eq!(to_signed((1 << 24) - 1, 24), (1 << 24) - 1);
        assert_eq!(to_signed(1 << 24, 24), -(1 << 24));
        assert_eq!(to_signed((1 << 25) - 1, 24), -1);

        // Bits above the width are ignored.
        assert_eq!(to_signed(0xFFFF_FF80 | 3, 6), 3);
    }

    #[test]
    fn test_chrony_float_round_trip() {
        let cases: [(i32, i32); 8] = [
            (0, 0),
            (1, 25),           // exactly 1.0
            (-1, 25),          // exactly -1.0
            (12345, 0),
            (-12345, 10),
            ((1 << 24) - 1, -64),
            (-(1 << 24), 63),
            (3, -1),
        ];
        for (coef, exp) in cases {
            let bits = chrony_float_bits(coef, exp);
            let want = coef as f64 * ((exp - 25) as f64).exp2();
            let got = chrony_float_to_f64(bits);
            assert!(
                (got - want).abs() <= want.abs() * 1e-12,
                "coef={} exp={} got={} want={}",
                coef,
                exp,
                got,
                want
            );
        }
    }

    #[test]
    fn test_chrony_float_known_value() {
        // coef = 1, exp = 25 encodes 1.0.
        let bits = chrony_float_bits(1, 25);
        assert_eq!(chrony_float_to_f64(bits), 1.0);
        // -1.234e-3 seconds should survive the codec to float precision.
        let val = -1.234e-3;
        let exp = 0;
        let coef = (val * (25f64 - exp as f64).exp2()) as i32;
        let approx = chrony_float_to_f64(chrony_float_bits(coef, exp));
        assert!((approx - val).abs() < 1e-7);
    }

    #[test]
    fn test_addr_codec() {
        let mut buf = [0u8; 20];
        PeerAddr::V4("192.0.2.7".parse().unwrap()).encode(&mut buf);
        assert_eq!(buf[0..4], [192, 0, 2, 7]);
        assert_eq!(
            PeerAddr::parse(&buf),
            PeerAddr::V4("192.0.2.7".parse().unwrap())
        );

        let mut buf = [0u8; 20];
        let v6: Ipv6Addr = "2001:db8::1".parse().unwrap();
        PeerAddr::V6(v6).encode(&mut buf);
        assert_eq!(PeerAddr::parse(&buf), PeerAddr::V6(v6));

        // Family 0 and unknown families stay unspecified.
        let buf = [0u8; 20];
        assert_eq!(PeerAddr::parse(&buf), PeerAddr::Unspec);
        let mut buf = [0u8; 20];
        BigEndian::write_u16(&mut buf[16..18], 99);
        assert_eq!(PeerAddr::parse(&buf), PeerAddr::Unspec);
    }

    #[test]
    fn test_request_frame_layout() {
        let req = encode_request(&Query::SourceData(3), 0xDEAD_BEEF);
        assert_eq!(req.len(), REQUEST_LEN);
        assert_eq!(req[0], PROTO_VERSION);
        assert_eq!(req[1], PKT_TYPE_CMD_REQUEST);
        assert_eq!(BigEndian::read_u16(&req[4..6]), REQ_SOURCE_DATA);
        assert_eq!(BigEndian::read_u32(&req[8..12]), 0xDEAD_BEEF);
        assert_eq!(BigEndian::read_u32(&req[20..24]), 3);
    }

    fn reply_frame(command: u16, reply: u16, status: u16, sequence: u32) -> Vec<u8> {
        let mut buf = vec![0u8; REPLY_LEN];
        buf[0] = PROTO_VERSION;
        buf[1] = PKT_TYPE_CMD_REPLY;
        BigEndian::write_u16(&mut buf[4..6], command);
        BigEndian::write_u16(&mut buf[6..8], reply);
        BigEndian::write_u16(&mut buf[8..10], status);
        BigEndian::write_u32(&mut buf[16..20], sequence);
        buf
    }

    #[test]
    fn test_reply_validation() {
        let ok = reply_frame(REQ_TRACKING, RPY_TRACKING, 0, 42);
        assert!(check_reply(&ok, REQ_TRACKING, 42, RPY_TRACKING).is_ok());

        let bad_status = reply_frame(REQ_TRACKING, RPY_TRACKING, 1, 42);
        let bad_cmd = reply_frame(REQ_N_SOURCES, RPY_TRACKING, 0, 42);
        let bad_seq = reply_frame(REQ_TRACKING, RPY_TRACKING, 0, 43);
        let bad_rpy = reply_frame(REQ_TRACKING, RPY_N_SOURCES, 0, 42);
        for frame in [bad_status, bad_cmd, bad_seq, bad_rpy] {
            let err = check_reply(&frame, REQ_TRACKING, 42, RPY_TRACKING).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Protocol);
        }

        let short = vec![0u8; 8];
        assert!(check_reply(&short, REQ_TRACKING, 42, RPY_TRACKING).is_err());
    }

    #[test]
    fn test_parse_num_sources() {
        let mut payload = vec![0u8; 4];
        BigEndian::write_u32(&mut payload, 5);
        assert_eq!(parse_num_sources(&payload).unwrap(), 5);
        assert!(parse_num_sources(&[0u8; 2]).is_err());
    }

    #[test]
    fn test_parse_source_datum() {
        let mut payload = vec![0u8; 48];
        PeerAddr::V4("10.0.0.1".parse().unwrap()).encode(&mut payload[0..20]);
        BigEndian::write_u16(&mut payload[22..24], 2); // stratum
        BigEndian::write_u16(&mut payload[24..26], SD_STATE_SELECTED);
        BigEndian::write_u16(&mut payload[26..28], SD_MODE_CLIENT);
        BigEndian::write_u16(&mut payload[30..32], 0xFF); // reachability

        let d = parse_source_datum(&payload).unwrap();
        assert_eq!(d.addr, PeerAddr::V4("10.0.0.1".parse().unwrap()));
        assert_eq!(d.stratum, 2);
        assert_eq!(d.state, SD_STATE_SELECTED);
        assert!(!d.is_self());

        BigEndian::write_u16(&mut payload[26..28], SD_MODE_REF);
        assert!(parse_source_datum(&payload).unwrap().is_self());
    }

    #[test]
    fn test_parse_ntp_datum() {
        let mut payload = vec![0u8; 124];
        PeerAddr::V4("10.0.0.1".parse().unwrap()).encode(&mut payload[0..20]);
        payload[44] = NTP_MODE_SERVER;
        payload[45] = 3; // stratum
        // offset = -1.5 ms
        let coef = (-1.5e-3 * (25f64).exp2()) as i32;
        BigEndian::write_u32(&mut payload[72..76], chrony_float_bits(coef, 0));
        BigEndian::write_u32(&mut payload[100..104], 17); // rx count

        let d = parse_ntp_datum(&payload).unwrap();
        assert_eq!(d.mode, NTP_MODE_SERVER);
        assert_eq!(d.stratum, 3);
        assert_eq!(d.total_rx_count, 17);
        assert!((d.offset - -1.5e-3).abs() < 1e-7);
    }

    #[test]
    fn test_parse_tracking_self_reference() {
        let mut payload = vec![0u8; 76];
        BigEndian::write_u32(&mut payload[0..4], REF_ID_LOCAL_A);
        let t = parse_tracking(&payload).unwrap();
        assert!(t.is_self_reference());
        assert!(!t.is_unsynchronised());

        BigEndian::write_u32(&mut payload[0..4], REF_ID_UNSYNC);
        assert!(parse_tracking(&payload).unwrap().is_unsynchronised());

        BigEndian::write_u32(&mut payload[0..4], REF_ID_LOCAL_B);
        assert!(parse_tracking(&payload).unwrap().is_self_reference());
    }
}
