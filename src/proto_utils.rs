use anyhow::Context;
use bytes::Bytes;
use hickory_proto::op::{Message, MessageType, ResponseCode};
use hickory_proto::rr::{Name, Record, RecordType};
use hickory_proto::serialize::binary::BinDecodable;

/// 解析后的请求，创建后不可变
#[derive(Debug, Clone)]
pub struct ParsedQuery {
    pub id: u16,
    pub name: Name,
    /// 文本形式的域名，保留线格式解析得到的末尾点（如 `example.com.`）
    pub qname: String,
    pub qtype: RecordType,
    pub message: Message,
    pub raw: Bytes,
}

/// 完整解析请求包。非查询报文或没有 question 的报文视为格式错误。
pub fn parse_query(packet: &[u8]) -> anyhow::Result<ParsedQuery> {
    let message = Message::from_bytes(packet).context("parse request")?;
    if message.message_type() != MessageType::Query {
        anyhow::bail!("not a query (qr bit set)");
    }
    let question = message.queries().first().context("empty question")?;
    let name = question.name().clone();
    let qtype = question.query_type();
    Ok(ParsedQuery {
        id: message.id(),
        qname: name.to_string(),
        name,
        qtype,
        raw: Bytes::copy_from_slice(packet),
        message,
    })
}

/// 构造对请求的应答：复制 id、question 和 RD，标记为权威应答
pub fn build_reply(
    query: &ParsedQuery,
    rcode: ResponseCode,
    answers: Vec<Record>,
) -> anyhow::Result<Bytes> {
    let req = &query.message;
    let mut msg = Message::new();
    msg.set_id(req.id())
        .set_message_type(MessageType::Response)
        .set_op_code(req.op_code())
        .set_authoritative(true)
        .set_recursion_desired(req.recursion_desired())
        .set_recursion_available(true)
        .set_response_code(rcode);
    msg.add_queries(req.queries().to_vec());
    for ans in answers {
        msg.add_answer(ans);
    }
    let out = msg.to_vec().context("encode reply")?;
    Ok(Bytes::from(out))
}

#[inline]
pub fn build_nxdomain(query: &ParsedQuery) -> anyhow::Result<Bytes> {
    build_reply(query, ResponseCode::NXDomain, Vec::new())
}

/// 把缓存中的应答改写成当前请求的应答：
/// 事务 ID 与 question 名字（保留请求方的大小写，兼容 0x20 随机化）取自请求，
/// 除 OPT 外每条记录的 TTL 减去已缓存的秒数。
/// 报文结构异常或 question 名字长度不一致时返回 None，调用方按未命中处理。
pub fn refresh_cached_response(cached: &[u8], query: &[u8], elapsed_secs: u32) -> Option<Bytes> {
    if cached.len() < 12 || query.len() < 12 {
        return None;
    }
    let mut resp = cached.to_vec();
    resp[0] = query[0];
    resp[1] = query[1];

    let qd_count = u16::from_be_bytes([resp[4], resp[5]]);
    let rr_count = u16::from_be_bytes([resp[6], resp[7]]) as usize
        + u16::from_be_bytes([resp[8], resp[9]]) as usize
        + u16::from_be_bytes([resp[10], resp[11]]) as usize;

    let mut pos = 12;
    if qd_count > 0 {
        let name_end = skip_name(&resp, 12)?;
        let query_name_end = skip_name(query, 12)?;
        if name_end != query_name_end || !resp[12..name_end].eq_ignore_ascii_case(&query[12..name_end]) {
            return None;
        }
        resp[12..name_end].copy_from_slice(&query[12..name_end]);
        pos = name_end + 4;
        for _ in 1..qd_count {
            pos = skip_name(&resp, pos)? + 4;
        }
    }

    for _ in 0..rr_count {
        pos = skip_name(&resp, pos)?;
        // Type(2) Class(2) TTL(4) RDLen(2)
        if pos + 10 > resp.len() {
            return None;
        }
        let rtype = u16::from_be_bytes([resp[pos], resp[pos + 1]]);
        if rtype != u16::from(RecordType::OPT) {
            let ttl = u32::from_be_bytes([resp[pos + 4], resp[pos + 5], resp[pos + 6], resp[pos + 7]]);
            resp[pos + 4..pos + 8].copy_from_slice(&ttl.saturating_sub(elapsed_secs).to_be_bytes());
        }
        let rd_len = u16::from_be_bytes([resp[pos + 8], resp[pos + 9]]) as usize;
        pos += 10 + rd_len;
    }
    if pos > resp.len() {
        return None;
    }
    Some(Bytes::from(resp))
}

/// 快速解析响应包，仅提取 RCODE 和最小 TTL
/// 避免全量解析 Message
pub struct QuickResponse {
    pub rcode: ResponseCode,
    pub min_ttl: u32,
    pub truncated: bool,
}

/// 有应答记录时取其最小 TTL；没有应答（NXDOMAIN / NODATA）时按 RFC 2308
/// 取 authority 段 SOA 的 min(TTL, MINIMUM)，没有 SOA 则为 0。
pub fn parse_response_quick(packet: &[u8]) -> Option<QuickResponse> {
    if packet.len() < 12 {
        return None;
    }

    // Flags: QR(1) Opcode(4) AA(1) TC(1) RD(1) RA(1) Z(3) RCODE(4)
    let truncated = packet[2] & 0x02 != 0;
    let rcode = ResponseCode::from(0, packet[3] & 0x0F);

    let qd_count = u16::from_be_bytes([packet[4], packet[5]]);
    let an_count = u16::from_be_bytes([packet[6], packet[7]]);
    let ns_count = u16::from_be_bytes([packet[8], packet[9]]);

    if an_count == 0 && ns_count == 0 {
        return Some(QuickResponse {
            rcode,
            min_ttl: 0,
            truncated,
        });
    }

    let mut pos = 12;
    let packet_len = packet.len();

    for _ in 0..qd_count {
        pos = skip_name(packet, pos)?;
        // Type(2) + Class(2)
        pos += 4;
    }

    let mut min_ttl = u32::MAX;

    for _ in 0..an_count {
        pos = skip_name(packet, pos)?;
        // Type(2) Class(2) TTL(4) RDLen(2)
        if pos + 10 > packet_len {
            return None;
        }
        let ttl = u32::from_be_bytes([
            packet[pos + 4],
            packet[pos + 5],
            packet[pos + 6],
            packet[pos + 7],
        ]);
        min_ttl = min_ttl.min(ttl);
        let rd_len = u16::from_be_bytes([packet[pos + 8], packet[pos + 9]]) as usize;
        pos += 10 + rd_len;
    }

    if an_count == 0 {
        for _ in 0..ns_count {
            pos = skip_name(packet, pos)?;
            if pos + 10 > packet_len {
                return None;
            }
            let rtype = u16::from_be_bytes([packet[pos], packet[pos + 1]]);
            let ttl = u32::from_be_bytes([
                packet[pos + 4],
                packet[pos + 5],
                packet[pos + 6],
                packet[pos + 7],
            ]);
            let rd_len = u16::from_be_bytes([packet[pos + 8], packet[pos + 9]]) as usize;
            let rd_end = pos + 10 + rd_len;
            // SOA RDATA 以 MINIMUM(4) 结尾
            if rtype == u16::from(RecordType::SOA) && rd_len >= 4 && rd_end <= packet_len {
                let minimum = u32::from_be_bytes([
                    packet[rd_end - 4],
                    packet[rd_end - 3],
                    packet[rd_end - 2],
                    packet[rd_end - 1],
                ]);
                min_ttl = min_ttl.min(ttl.min(minimum));
                break;
            }
            pos = rd_end;
        }
    }

    if min_ttl == u32::MAX {
        min_ttl = 0;
    }

    Some(QuickResponse {
        rcode,
        min_ttl,
        truncated,
    })
}

#[inline]
fn skip_name(packet: &[u8], mut pos: usize) -> Option<usize> {
    loop {
        let len = *packet.get(pos)?;
        if len == 0 {
            return Some(pos + 1);
        }
        if (len & 0xC0) == 0xC0 {
            return Some(pos + 2);
        }
        pos += 1 + len as usize;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use hickory_proto::op::{OpCode, Query};
    use hickory_proto::rr::RData;
    use hickory_proto::rr::rdata::{A, SOA};
    use std::net::Ipv4Addr;
    use std::str::FromStr;

    pub(crate) fn build_query(id: u16, name: &str, qtype: RecordType) -> Vec<u8> {
        let mut msg = Message::new();
        msg.set_id(id)
            .set_message_type(MessageType::Query)
            .set_op_code(OpCode::Query)
            .set_recursion_desired(true);
        msg.add_query(Query::query(Name::from_ascii(name).unwrap(), qtype));
        msg.to_vec().unwrap()
    }

    #[test]
    fn parse_query_keeps_trailing_dot() {
        let packet = build_query(0x1234, "www.example.com.", RecordType::AAAA);
        let q = parse_query(&packet).expect("parse");
        assert_eq!(q.id, 0x1234);
        assert_eq!(q.qname, "www.example.com.");
        assert_eq!(q.qtype, RecordType::AAAA);
        assert_eq!(q.raw.as_ref(), packet.as_slice());
    }

    #[test]
    fn parse_query_rejects_garbage_and_responses() {
        assert!(parse_query(&[0u8; 5]).is_err());

        let mut msg = Message::new();
        msg.set_id(7).set_message_type(MessageType::Response);
        msg.add_query(Query::query(Name::from_str("a.b.").unwrap(), RecordType::A));
        assert!(parse_query(&msg.to_vec().unwrap()).is_err());

        let mut empty = Message::new();
        empty.set_id(8).set_message_type(MessageType::Query);
        assert!(parse_query(&empty.to_vec().unwrap()).is_err());
    }

    #[test]
    fn nxdomain_echoes_id_and_question() {
        let packet = build_query(42, "missing.lan.", RecordType::MX);
        let q = parse_query(&packet).unwrap();
        let resp = Message::from_bytes(&build_nxdomain(&q).unwrap()).unwrap();
        assert_eq!(resp.id(), 42);
        assert_eq!(resp.message_type(), MessageType::Response);
        assert_eq!(resp.response_code(), ResponseCode::NXDomain);
        assert!(resp.authoritative());
        assert!(resp.recursion_desired());
        assert_eq!(resp.queries()[0].name().to_string(), "missing.lan.");
        assert_eq!(resp.queries()[0].query_type(), RecordType::MX);
        assert!(resp.answers().is_empty());
    }

    #[test]
    fn quick_response_reads_rcode_and_min_ttl() {
        let q = parse_query(&build_query(1, "example.com.", RecordType::A)).unwrap();
        let name = Name::from_str("example.com.").unwrap();
        let answers = vec![
            Record::from_rdata(name.clone(), 300, RData::A(A(Ipv4Addr::new(1, 2, 3, 4)))),
            Record::from_rdata(name, 120, RData::A(A(Ipv4Addr::new(5, 6, 7, 8)))),
        ];
        let resp = build_reply(&q, ResponseCode::NoError, answers).unwrap();
        let quick = parse_response_quick(&resp).expect("quick parse");
        assert_eq!(quick.rcode, ResponseCode::NoError);
        assert_eq!(quick.min_ttl, 120);
        assert!(!quick.truncated);

        let nx = build_nxdomain(&q).unwrap();
        let quick = parse_response_quick(&nx).unwrap();
        assert_eq!(quick.rcode, ResponseCode::NXDomain);
        assert_eq!(quick.min_ttl, 0);

        assert!(parse_response_quick(&[0u8; 4]).is_none());
    }

    fn soa_record(zone: &str, ttl: u32, minimum: u32) -> Record {
        let zone = Name::from_str(zone).unwrap();
        let soa = SOA::new(
            Name::from_str("ns1.example.").unwrap(),
            Name::from_str("hostmaster.example.").unwrap(),
            2024010101,
            7200,
            900,
            1209600,
            minimum,
        );
        Record::from_rdata(zone, ttl, RData::SOA(soa))
    }

    #[test]
    fn negative_answers_take_ttl_from_soa() {
        let q = parse_query(&build_query(3, "missing.example.", RecordType::A)).unwrap();
        let mut msg = Message::from_bytes(&build_nxdomain(&q).unwrap()).unwrap();
        msg.add_name_server(soa_record("example.", 3600, 120));
        let quick = parse_response_quick(&msg.to_vec().unwrap()).unwrap();
        assert_eq!(quick.rcode, ResponseCode::NXDomain);
        assert_eq!(quick.min_ttl, 120);

        let mut msg = Message::from_bytes(&build_nxdomain(&q).unwrap()).unwrap();
        msg.add_name_server(soa_record("example.", 30, 900));
        let quick = parse_response_quick(&msg.to_vec().unwrap()).unwrap();
        assert_eq!(quick.min_ttl, 30);
    }

    #[test]
    fn refreshed_response_echoes_id_and_case_and_ages_ttls() {
        let first = build_query(0xAAAA, "www.example.com.", RecordType::A);
        let q = parse_query(&first).unwrap();
        let name = Name::from_str("www.example.com.").unwrap();
        let answers = vec![
            Record::from_rdata(name.clone(), 300, RData::A(A(Ipv4Addr::new(1, 2, 3, 4)))),
            Record::from_rdata(name, 5, RData::A(A(Ipv4Addr::new(5, 6, 7, 8)))),
        ];
        let mut msg = Message::from_bytes(&build_reply(&q, ResponseCode::NoError, answers).unwrap()).unwrap();
        msg.add_name_server(soa_record("example.com.", 600, 60));
        let cached = msg.to_vec().unwrap();

        let second = build_query(0x0102, "WwW.eXaMpLe.CoM.", RecordType::A);
        let out = refresh_cached_response(&cached, &second, 10).expect("refresh");
        assert_eq!(&out[..2], &[0x01u8, 0x02]);

        let resp = Message::from_bytes(&out).unwrap();
        assert_eq!(resp.queries()[0].name().to_string(), "WwW.eXaMpLe.CoM.");
        let ttls: Vec<u32> = resp.answers().iter().map(|r| r.ttl()).collect();
        assert_eq!(ttls, vec![290, 0]);
        assert_eq!(resp.name_servers()[0].ttl(), 590);
    }

    #[test]
    fn refresh_rejects_mismatched_or_broken_packets() {
        let q = parse_query(&build_query(1, "a.example.", RecordType::A)).unwrap();
        let cached = build_nxdomain(&q).unwrap();
        let other = build_query(2, "bb.example.", RecordType::A);
        assert!(refresh_cached_response(&cached, &other, 0).is_none());
        assert!(refresh_cached_response(&cached[..14], &build_query(2, "a.example.", RecordType::A), 0).is_none());
        assert!(refresh_cached_response(&[0u8; 4], &other, 0).is_none());
    }
}
