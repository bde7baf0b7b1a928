use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::{Name, RData, RecordType};
use hickory_proto::serialize::binary::BinDecodable;
use reqwest::dns::{Addrs, Resolve, Resolving};
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, warn};

/// 解析上游 DoH 主机名的专用解析器。
///
/// 只使用配置中显式给出的 nameserver，从不经过系统解析器：
/// 本代理可能正是系统配置的 DNS，走系统解析会回环到自身。
/// 作为 `reqwest` 客户端的构造期依赖注入，只作用于出站连接。
#[derive(Debug, Clone)]
pub struct BootstrapResolver {
    nameservers: Arc<[SocketAddr]>,
    timeout: Duration,
}

impl BootstrapResolver {
    pub fn new(nameservers: Arc<[SocketAddr]>, timeout: Duration) -> Self {
        Self {
            nameservers,
            timeout,
        }
    }

    /// 解析主机名并随机返回其中一个地址（负载分摊，而非故障转移）
    pub async fn resolve_host(&self, hostname: &str) -> anyhow::Result<IpAddr> {
        let addrs = self.lookup(hostname).await?;
        let ip = addrs[fastrand::usize(..addrs.len())];
        debug!(target = "bootstrap", host = %hostname, ip = %ip, candidates = addrs.len(), "bootstrap resolved");
        Ok(ip)
    }

    /// 依次询问 nameserver，先 A 后 AAAA，返回首个非空结果
    pub async fn lookup(&self, hostname: &str) -> anyhow::Result<Vec<IpAddr>> {
        let literal = hostname.trim_start_matches('[').trim_end_matches(']');
        if let Ok(ip) = literal.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }
        if self.nameservers.is_empty() {
            anyhow::bail!("no bootstrap nameservers configured for {hostname}");
        }

        let mut name = Name::from_ascii(hostname)
            .with_context(|| format!("invalid host name: {hostname}"))?;
        name.set_fqdn(true);

        let mut last_err = None;
        for &ns in self.nameservers.iter() {
            for rtype in [RecordType::A, RecordType::AAAA] {
                match timeout(self.timeout, query_nameserver(ns, &name, rtype)).await {
                    Ok(Ok(addrs)) if !addrs.is_empty() => return Ok(addrs),
                    Ok(Ok(_)) => {}
                    Ok(Err(err)) => {
                        warn!(target = "bootstrap", nameserver = %ns, host = %hostname, qtype = %rtype, error = %err, "bootstrap query failed");
                        last_err = Some(err);
                    }
                    Err(_) => {
                        warn!(target = "bootstrap", nameserver = %ns, host = %hostname, qtype = %rtype, "bootstrap query timed out");
                        last_err = Some(anyhow::anyhow!("timeout querying {ns}"));
                    }
                }
            }
        }
        match last_err {
            Some(err) => Err(err.context(format!("bootstrap resolution failed for {hostname}"))),
            None => anyhow::bail!("no address records for {hostname}"),
        }
    }
}

async fn query_nameserver(
    ns: SocketAddr,
    name: &Name,
    rtype: RecordType,
) -> anyhow::Result<Vec<IpAddr>> {
    let bind: SocketAddr = if ns.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let socket = UdpSocket::bind(bind).await.context("bind bootstrap socket")?;
    socket.connect(ns).await.context("connect bootstrap nameserver")?;

    let id = fastrand::u16(..);
    let mut msg = Message::new();
    msg.set_id(id)
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true);
    msg.add_query(Query::query(name.clone(), rtype));
    socket.send(&msg.to_vec()?).await?;

    let mut buf = [0u8; 4096];
    loop {
        let len = socket.recv(&mut buf).await?;
        let resp = match Message::from_bytes(&buf[..len]) {
            Ok(resp) => resp,
            Err(_) => continue,
        };
        // 丢弃 ID 不匹配的包（迟到或伪造的应答）
        if resp.id() != id || resp.message_type() != MessageType::Response {
            continue;
        }
        if resp.response_code() != ResponseCode::NoError {
            anyhow::bail!("nameserver {ns} answered {}", resp.response_code());
        }
        let addrs = resp
            .answers()
            .iter()
            .filter_map(|record| match record.data() {
                Some(RData::A(a)) => Some(IpAddr::V4(a.0)),
                Some(RData::AAAA(aaaa)) => Some(IpAddr::V6(aaaa.0)),
                _ => None,
            })
            .collect();
        return Ok(addrs);
    }
}

impl Resolve for BootstrapResolver {
    fn resolve(&self, name: reqwest::dns::Name) -> Resolving {
        let this = self.clone();
        Box::pin(async move {
            let ip = this.resolve_host(name.as_str()).await?;
            // 端口由连接器按 URL 覆盖
            let addrs: Addrs = Box::new(std::iter::once(SocketAddr::new(ip, 0)));
            Ok(addrs)
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use hickory_proto::rr::Record;
    use hickory_proto::rr::rdata::{A, AAAA};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// 本地假 DNS 服务器：按名称返回固定 A/AAAA 记录，其余返回 NXDOMAIN
    pub(crate) async fn spawn_fake_nameserver(
        records: HashMap<String, Vec<IpAddr>>,
    ) -> (SocketAddr, Arc<AtomicUsize>) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        tokio::spawn(async move {
            let mut buf = [0u8; 4096];
            loop {
                let Ok((len, peer)) = socket.recv_from(&mut buf).await else {
                    return;
                };
                counter.fetch_add(1, Ordering::SeqCst);
                let Ok(req) = Message::from_bytes(&buf[..len]) else {
                    continue;
                };
                let query = req.queries()[0].clone();
                let mut resp = Message::new();
                resp.set_id(req.id())
                    .set_message_type(MessageType::Response)
                    .set_recursion_available(true);
                resp.add_query(query.clone());
                match records.get(&query.name().to_string()) {
                    Some(ips) => {
                        for ip in ips {
                            let rdata = match (ip, query.query_type()) {
                                (IpAddr::V4(v4), RecordType::A) => RData::A(A(*v4)),
                                (IpAddr::V6(v6), RecordType::AAAA) => RData::AAAA(AAAA(*v6)),
                                _ => continue,
                            };
                            resp.add_answer(Record::from_rdata(query.name().clone(), 30, rdata));
                        }
                    }
                    None => {
                        resp.set_response_code(ResponseCode::NXDomain);
                    }
                }
                let _ = socket.send_to(&resp.to_vec().unwrap(), peer).await;
            }
        });
        (addr, hits)
    }

    fn resolver(nameservers: Vec<SocketAddr>) -> BootstrapResolver {
        BootstrapResolver::new(Arc::from(nameservers), Duration::from_millis(500))
    }

    #[tokio::test]
    async fn resolves_through_configured_nameserver() {
        let mut records = HashMap::new();
        records.insert(
            "doh.example.".to_string(),
            vec!["10.1.1.1".parse().unwrap(), "10.1.1.2".parse().unwrap()],
        );
        let (ns, hits) = spawn_fake_nameserver(records).await;
        let r = resolver(vec![ns]);

        let mut addrs = r.lookup("doh.example").await.expect("lookup");
        addrs.sort();
        assert_eq!(
            addrs,
            vec!["10.1.1.1".parse::<IpAddr>().unwrap(), "10.1.1.2".parse().unwrap()]
        );

        let ip = r.resolve_host("doh.example").await.expect("resolve");
        assert!(addrs.contains(&ip));
        assert!(hits.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn falls_back_to_aaaa() {
        let mut records = HashMap::new();
        records.insert("v6only.example.".to_string(), vec!["2001:db8::53".parse().unwrap()]);
        let (ns, _) = spawn_fake_nameserver(records).await;

        let ip = resolver(vec![ns]).resolve_host("v6only.example").await.unwrap();
        assert_eq!(ip, "2001:db8::53".parse::<IpAddr>().unwrap());
    }

    #[tokio::test]
    async fn ip_literals_skip_lookup() {
        let r = resolver(Vec::new());
        assert_eq!(
            r.resolve_host("192.0.2.10").await.unwrap(),
            "192.0.2.10".parse::<IpAddr>().unwrap()
        );
        assert_eq!(
            r.resolve_host("[2001:db8::1]").await.unwrap(),
            "2001:db8::1".parse::<IpAddr>().unwrap()
        );
    }

    #[tokio::test]
    async fn never_falls_back_to_system_resolver() {
        // "localhost" 在系统解析器中必然存在，这里必须失败
        let r = resolver(Vec::new());
        assert!(r.resolve_host("localhost").await.is_err());

        let (ns, _) = spawn_fake_nameserver(HashMap::new()).await;
        assert!(resolver(vec![ns]).resolve_host("localhost").await.is_err());
    }

    #[tokio::test]
    async fn moves_to_next_nameserver_on_failure() {
        // 第一个 nameserver 不响应，超时后询问第二个
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let silent_addr = silent.local_addr().unwrap();

        let mut records = HashMap::new();
        records.insert("doh.example.".to_string(), vec!["10.9.9.9".parse().unwrap()]);
        let (ns, _) = spawn_fake_nameserver(records).await;

        let r = BootstrapResolver::new(Arc::from(vec![silent_addr, ns]), Duration::from_millis(100));
        let ip = r.resolve_host("doh.example").await.unwrap();
        assert_eq!(ip, "10.9.9.9".parse::<IpAddr>().unwrap());
        drop(silent);
    }
}
