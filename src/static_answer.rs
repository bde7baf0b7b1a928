use std::collections::{BTreeMap, HashMap};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use anyhow::Context;
use bytes::Bytes;
use hickory_proto::op::ResponseCode;
use hickory_proto::rr::rdata::{A, AAAA, CNAME, MX, NS, PTR, SRV, TXT};
use hickory_proto::rr::{Name, RData, Record, RecordType};

use crate::matcher::EffectiveConfig;
use crate::proto_utils::{ParsedQuery, build_nxdomain, build_reply};

/// 本地合成记录的固定 TTL
pub const STATIC_TTL: u32 = 60;

pub type StaticAnswers = HashMap<RecordType, RData>;

/// 编译 `static` 段：记录类型名 -> 应答文本
pub fn compile_static(raw: &BTreeMap<String, String>) -> anyhow::Result<StaticAnswers> {
    let mut out = HashMap::with_capacity(raw.len());
    for (rtype, data) in raw {
        let record_type = RecordType::from_str(&rtype.to_ascii_uppercase())
            .with_context(|| format!("unknown static record type: {rtype}"))?;
        let rdata = parse_rdata(record_type, data)
            .with_context(|| format!("invalid static {rtype} data: {data:?}"))?;
        out.insert(record_type, rdata);
    }
    Ok(out)
}

/// 按 zone 文件的文本格式解析应答数据
pub fn parse_rdata(record_type: RecordType, text: &str) -> anyhow::Result<RData> {
    let text = text.trim();
    let rdata = match record_type {
        RecordType::A => RData::A(A(text.parse::<Ipv4Addr>()?)),
        RecordType::AAAA => RData::AAAA(AAAA(text.parse::<Ipv6Addr>()?)),
        RecordType::CNAME => RData::CNAME(CNAME(Name::from_str(text)?)),
        RecordType::NS => RData::NS(NS(Name::from_str(text)?)),
        RecordType::PTR => RData::PTR(PTR(Name::from_str(text)?)),
        RecordType::MX => {
            let mut parts = text.split_whitespace();
            let (Some(pref), Some(exchange), None) = (parts.next(), parts.next(), parts.next())
            else {
                anyhow::bail!("expected `<preference> <exchange>`");
            };
            RData::MX(MX::new(pref.parse()?, Name::from_str(exchange)?))
        }
        RecordType::SRV => {
            let fields: Vec<&str> = text.split_whitespace().collect();
            let [priority, weight, port, target] = fields.as_slice() else {
                anyhow::bail!("expected `<priority> <weight> <port> <target>`");
            };
            RData::SRV(SRV::new(
                priority.parse()?,
                weight.parse()?,
                port.parse()?,
                Name::from_str(target)?,
            ))
        }
        RecordType::TXT => {
            let unquoted = text
                .strip_prefix('"')
                .and_then(|s| s.strip_suffix('"'))
                .unwrap_or(text);
            RData::TXT(TXT::new(vec![unquoted.to_string()]))
        }
        other => anyhow::bail!("static answers for {other} are not supported"),
    };
    Ok(rdata)
}

/// 生效配置带有 `static` 表时在本地应答。
///
/// 表中有该 qtype：返回一条 TTL 为 [`STATIC_TTL`] 的记录；没有：权威 NXDOMAIN。
/// 返回 `None` 表示需要转发。
pub fn try_answer(cfg: &EffectiveConfig, query: &ParsedQuery) -> anyhow::Result<Option<Bytes>> {
    let Some(table) = cfg.static_answers.as_deref() else {
        return Ok(None);
    };
    let resp = match table.get(&query.qtype) {
        Some(rdata) => {
            let record = Record::from_rdata(query.name.clone(), STATIC_TTL, rdata.clone());
            build_reply(query, ResponseCode::NoError, vec![record])?
        }
        None => build_nxdomain(query)?,
    };
    Ok(Some(resp))
}
