use hickory_proto::op::ResponseCode;

/// DNS header fields read straight from the wire, without building a Message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuickHeader {
    pub id: u16,
    pub is_response: bool,
    pub truncated: bool,
    pub rcode: ResponseCode,
    pub qd_count: u16,
}

/// Reads the fixed 12-byte header. Returns None for anything shorter.
///
/// Used to throw away datagrams that can't be the reply we are waiting for
/// before paying for a full hickory-proto decode.
pub fn parse_header_quick(packet: &[u8]) -> Option<QuickHeader> {
    if packet.len() < 12 {
        return None;
    }

    let id = u16::from_be_bytes([packet[0], packet[1]]);

    // Flags: QR(1) Opcode(4) AA(1) TC(1) RD(1) | RA(1) Z(3) RCODE(4)
    let is_response = packet[2] & 0x80 != 0;
    let truncated = packet[2] & 0x02 != 0;
    let rcode = ResponseCode::from(0, packet[3] & 0x0F);

    let qd_count = u16::from_be_bytes([packet[4], packet[5]]);

    Some(QuickHeader {
        id,
        is_response,
        truncated,
        rcode,
        qd_count,
    })
}

/// True when `packet` looks like a reply to the query with `expected_id`.
#[inline]
pub fn is_reply_to(packet: &[u8], expected_id: u16) -> bool {
    parse_header_quick(packet).is_some_and(|h| h.is_response && h.id == expected_id)
}
