mod bootstrap;
mod cache;
mod config;
mod engine;
mod forward;
mod matcher;
#[cfg(unix)]
mod privileges;
mod proto_utils;
mod selector;
mod static_answer;
mod watcher;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use arc_swap::ArcSwap;
use bytes::Bytes;
use clap::Parser;
use tokio::net::UdpSocket;
use tracing::{debug, error, info};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::load_config;
use crate::engine::Engine;
use crate::matcher::RuntimeConfig;

#[derive(Parser, Debug)]
#[command(author, version, about = "DNS to DNS-over-HTTPS forwarding proxy", long_about = None)]
struct Args {
    /// 配置文件路径（JSON）
    #[arg(short = 'c', long = "config", default_value = "config/dohproxy.json")]
    config: PathBuf,
    /// 启用调试日志
    #[arg(long = "debug", default_value_t = false)]
    debug: bool,
    /// UDP worker 数量（默认 CPU 核心数）
    #[arg(long = "udp-workers", default_value_t = 0)]
    udp_workers: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.debug);

    let cfg = load_config(&args.config).context("load initial config")?;
    let cfg = RuntimeConfig::from_config(cfg).context("compile rules")?;
    let bind_addr: SocketAddr = cfg.settings.bind_udp.parse().context("parse bind addr")?;
    let buffer_size = cfg.settings.udp_buffer_size;
    #[cfg(unix)]
    let service = cfg.settings.clone();

    let pipeline = Arc::new(ArcSwap::from_pointee(cfg));
    let engine = Engine::new(pipeline.clone());

    watcher::spawn(args.config.clone(), pipeline.clone());

    // UDP worker 数量：默认为 CPU 核心数，最少 1 个
    let udp_workers = if args.udp_workers > 0 {
        args.udp_workers
    } else {
        num_cpus::get().max(1)
    };

    // 先绑定全部 socket，再降权，最后才开始收包
    let mut sockets: Vec<Arc<UdpSocket>> = Vec::with_capacity(udp_workers);

    #[cfg(unix)]
    {
        // SO_REUSEPORT: one socket per worker, kernel distributes datagrams
        for worker_id in 0..udp_workers {
            let std_socket = create_reuseport_udp_socket(bind_addr)
                .with_context(|| format!("create udp socket for worker {}", worker_id))?;
            sockets.push(Arc::new(UdpSocket::from_std(std_socket)?));
        }
    }

    #[cfg(not(unix))]
    {
        // Non-Unix: one shared socket for all workers
        use socket2::{Domain, Protocol, Socket, Type};
        let domain = if bind_addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP)).context("create socket")?;
        let _ = socket.set_recv_buffer_size(4 * 1024 * 1024);
        let _ = socket.set_send_buffer_size(4 * 1024 * 1024);
        socket.set_nonblocking(true).context("set nonblocking")?;
        socket.bind(&bind_addr.into()).context("bind socket")?;

        let udp_socket = Arc::new(UdpSocket::from_std(socket.into()).context("from_std")?);
        sockets.extend(std::iter::repeat_n(udp_socket, udp_workers));
    }

    #[cfg(unix)]
    privileges::drop_privileges(&service).context("drop privileges")?;

    let mut udp_handles = Vec::with_capacity(udp_workers);
    for (worker_id, socket) in sockets.into_iter().enumerate() {
        let engine = engine.clone();
        let handle = tokio::spawn(async move {
            if let Err(err) = run_udp_worker(worker_id, socket, engine, buffer_size).await {
                error!(worker_id, error = %err, "udp worker exited");
            }
        });
        udp_handles.push(handle);
    }

    info!(bind_udp = %bind_addr, udp_workers, buffer_size, "dns proxy started");

    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    info!("shutdown signal received, stopping workers");
    for h in udp_handles {
        h.abort();
    }

    Ok(())
}

fn init_tracing(debug: bool) {
    // 默认禁用 JSON，非 debug 仅 warn
    let fmt_layer = fmt::layer()
        .with_target(false)
        .with_ansi(false)
        .with_level(debug);

    let level = if debug { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();
}

// 在 Unix 上创建带 SO_REUSEPORT 的 UDP socket
#[cfg(unix)]
fn create_reuseport_udp_socket(addr: SocketAddr) -> anyhow::Result<std::net::UdpSocket> {
    use libc::{SO_REUSEPORT, SOL_SOCKET, c_int, c_void, setsockopt, socklen_t};
    use socket2::{Domain, Protocol, Socket, Type};
    use std::os::unix::io::AsRawFd;

    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    let val: c_int = 1;
    let ret = unsafe {
        setsockopt(
            socket.as_raw_fd(),
            SOL_SOCKET,
            SO_REUSEPORT,
            &val as *const _ as *const c_void,
            std::mem::size_of_val(&val) as socklen_t,
        )
    };
    if ret != 0 {
        // non-fatal: continue without reuseport
        debug!(addr = %addr, "SO_REUSEPORT unavailable");
    }
    let _ = socket.set_recv_buffer_size(4 * 1024 * 1024);
    let _ = socket.set_send_buffer_size(4 * 1024 * 1024);
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    Ok(socket.into())
}

/// 接收循环：每个数据报派生一个任务，慢上游不阻塞后续请求。
/// 超过 `buffer_size` 的数据报会被截断，随后按格式错误丢弃。
async fn run_udp_worker(
    worker_id: usize,
    socket: Arc<UdpSocket>,
    engine: Engine,
    buffer_size: usize,
) -> anyhow::Result<()> {
    let mut buf = vec![0u8; buffer_size];
    loop {
        let (len, peer) = match socket.recv_from(&mut buf).await {
            Ok(r) => r,
            Err(err) => {
                // 继续接收，不退出
                debug!(worker_id, error = %err, "recv_from failed");
                continue;
            }
        };
        let packet = Bytes::copy_from_slice(&buf[..len]);
        let engine = engine.clone();
        let socket = Arc::clone(&socket);
        tokio::spawn(async move {
            match engine.handle(&packet).await {
                Ok(Some(resp)) => {
                    if let Err(err) = socket.send_to(&resp, peer).await {
                        debug!(peer = %peer, error = %err, "send_to failed");
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    debug!(peer = %peer, error = %format!("{err:#}"), "dropping request");
                }
            }
        });
    }
}
