use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use hickory_proto::op::{Message, ResponseCode};
use rand::Rng;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;
use tracing::{error, warn};

use crate::config::ResolverConfig;
use crate::metrics::{Metrics, STATUS_FAILED, STATUS_SUCCESS};
use crate::proto;
use crate::trace::TraceId;

const UDP_RECV_BUFFER: usize = 4096;
const MAX_TCP_FRAME: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Random,
    RoundRobin,
}

impl Mode {
    fn parse(mode: &str) -> Result<Self> {
        match mode {
            "random" => Ok(Self::Random),
            "round-robin" => Ok(Self::RoundRobin),
            other => bail!("unsupported resolver mode: {other}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Network {
    Udp,
    Tcp,
}

impl Network {
    fn parse(network: &str) -> Result<Self> {
        match network {
            "" | "udp" => Ok(Self::Udp),
            "tcp" => Ok(Self::Tcp),
            other => bail!("unsupported nameserver network: {other}"),
        }
    }
}

#[derive(Debug, Clone)]
struct Nameserver {
    address: SocketAddr,
    network: Network,
}

/// Forwards queries to one of the configured nameservers. Reentrant; the
/// only mutable state is the round-robin cursor.
pub struct Resolver {
    timeout: Duration,
    mode: Mode,
    nameservers: Vec<Nameserver>,
    metrics: Arc<Metrics>,
    index: AtomicUsize,
}

impl Resolver {
    pub fn new(config: &ResolverConfig, metrics: Arc<Metrics>) -> Result<Self> {
        let mode = Mode::parse(&config.mode)?;

        if config.nameservers.is_empty() {
            bail!("resolver needs at least one nameserver");
        }

        let nameservers = config
            .nameservers
            .iter()
            .map(|ns| {
                Ok(Nameserver {
                    address: ns
                        .address
                        .parse()
                        .with_context(|| format!("invalid nameserver address: {}", ns.address))?,
                    network: Network::parse(&ns.network)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            timeout: config.timeout,
            mode,
            nameservers,
            metrics,
            index: AtomicUsize::new(0),
        })
    }

    /// Always yields a well-formed response. The inbound packet is forwarded
    /// upstream verbatim, so EDNS and flags survive untouched; `req` is only
    /// needed to echo the question into a synthesized SERVFAIL.
    pub async fn lookup(&self, trace_id: &TraceId, packet: &[u8], req: &Message) -> Message {
        let nameserver = self.pick();

        match self.exchange(packet, nameserver).await {
            Err(err) => {
                error!(
                    trace_id = %trace_id,
                    nameserver = %nameserver.address,
                    error = %err,
                    "can't lookup DNS request"
                );
                self.metrics.inc_resolved_requests(STATUS_FAILED);

                proto::reply_with_code(req, ResponseCode::ServFail)
            }
            Ok(resp) if resp.response_code() != ResponseCode::NoError => {
                warn!(
                    trace_id = %trace_id,
                    nameserver = %nameserver.address,
                    rcode = ?resp.response_code(),
                    "invalid DNS response"
                );
                self.metrics.inc_resolved_requests(STATUS_FAILED);

                resp
            }
            Ok(resp) => {
                self.metrics.inc_resolved_requests(STATUS_SUCCESS);

                resp
            }
        }
    }

    fn pick(&self) -> &Nameserver {
        match self.mode {
            Mode::Random => {
                let index = rand::thread_rng().gen_range(0..self.nameservers.len());
                &self.nameservers[index]
            }
            Mode::RoundRobin => {
                let index = self.index.fetch_add(1, Ordering::Relaxed) % self.nameservers.len();
                &self.nameservers[index]
            }
        }
    }

    async fn exchange(&self, packet: &[u8], nameserver: &Nameserver) -> Result<Message> {
        let raw = match nameserver.network {
            Network::Udp => self.exchange_udp(packet, nameserver.address).await?,
            Network::Tcp => self.exchange_tcp(packet, nameserver.address).await?,
        };

        Message::from_vec(&raw).context("parse upstream response")
    }

    async fn exchange_udp(&self, packet: &[u8], addr: SocketAddr) -> Result<Vec<u8>> {
        let bind = if addr.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(bind)
            .await
            .context("bind upstream socket")?;
        socket
            .send_to(packet, addr)
            .await
            .context("send upstream query")?;

        let mut buf = vec![0u8; UDP_RECV_BUFFER];
        let (len, src) = timeout(self.timeout, socket.recv_from(&mut buf))
            .await
            .context("upstream timed out")?
            .context("receive upstream response")?;
        if src != addr {
            bail!("response from unexpected source: {src}");
        }
        buf.truncate(len);

        Ok(buf)
    }

    async fn exchange_tcp(&self, packet: &[u8], addr: SocketAddr) -> Result<Vec<u8>> {
        let exchange = async {
            let mut stream = TcpStream::connect(addr).await.context("connect upstream")?;

            stream
                .write_all(&(packet.len() as u16).to_be_bytes())
                .await
                .context("send frame length")?;
            stream.write_all(packet).await.context("send upstream query")?;

            let mut len_buf = [0u8; 2];
            stream
                .read_exact(&mut len_buf)
                .await
                .context("read frame length")?;
            let frame_len = u16::from_be_bytes(len_buf) as usize;
            if frame_len == 0 || frame_len > MAX_TCP_FRAME {
                bail!("invalid upstream frame length: {frame_len}");
            }

            let mut buf = vec![0u8; frame_len];
            stream
                .read_exact(&mut buf)
                .await
                .context("read upstream response")?;

            Ok(buf)
        };

        timeout(self.timeout, exchange)
            .await
            .context("upstream timed out")?
    }
}
