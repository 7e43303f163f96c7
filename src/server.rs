use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use hickory_proto::op::Message;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{error, info, warn};

use crate::config::DnsConfig;
use crate::metrics::Metrics;
use crate::proto;
use crate::resolver::Resolver;
use crate::switcher::Switcher;
use crate::trace::TraceId;

const UDP_RECV_BUFFER: usize = 4096;
/// UDP payloads above this are truncated with the TC bit set.
const UDP_MAX_PAYLOAD: usize = 1232;
const MAX_TCP_FRAME: usize = 64 * 1024;

/// Dual-stack DNS listener. Binds UDP and TCP on the same address and drives
/// every inbound message through switcher-then-resolver.
pub struct DnsServer {
    timeout: Duration,
    udp: Arc<UdpSocket>,
    tcp: TcpListener,
    handler: Arc<Handler>,
}

struct Handler {
    metrics: Arc<Metrics>,
    switcher: Arc<Switcher>,
    resolver: Arc<Resolver>,
}

struct Reply {
    bytes: Vec<u8>,
    trace_id: TraceId,
}

impl DnsServer {
    pub async fn bind(
        config: &DnsConfig,
        metrics: Arc<Metrics>,
        switcher: Arc<Switcher>,
        resolver: Arc<Resolver>,
    ) -> Result<Self> {
        let addr = format!("{}:{}", config.host, config.port);
        let udp = UdpSocket::bind(&addr)
            .await
            .with_context(|| format!("bind UDP listener {addr}"))?;
        let tcp = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("bind TCP listener {addr}"))?;
        info!(addr = %addr, "dns server listening on udp and tcp");

        Ok(Self {
            timeout: config.timeout,
            udp: Arc::new(udp),
            tcp,
            handler: Arc::new(Handler {
                metrics,
                switcher,
                resolver,
            }),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.udp.local_addr().context("udp listener address")
    }

    /// Runs both listeners until the shutdown signal flips, then waits for
    /// every in-flight handler to finish before returning, so no request is
    /// cancelled silently on the way out.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let udp_task = tokio::spawn(run_udp(self.udp, self.handler.clone(), shutdown.clone()));
        let tcp_task = tokio::spawn(run_tcp(
            self.tcp,
            self.handler.clone(),
            self.timeout,
            shutdown,
        ));

        udp_task.await.context("join udp listener")?;
        tcp_task.await.context("join tcp listener")?;
        info!("dns server stopped");

        Ok(())
    }
}

async fn run_udp(
    socket: Arc<UdpSocket>,
    handler: Arc<Handler>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut buf = vec![0u8; UDP_RECV_BUFFER];
    let mut handlers = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            Some(finished) = handlers.join_next(), if !handlers.is_empty() => {
                if let Err(err) = finished {
                    warn!(error = %err, "udp handler aborted");
                }
            }
            recv = socket.recv_from(&mut buf) => {
                let (len, peer) = match recv {
                    Ok(recv) => recv,
                    Err(err) => {
                        warn!(error = %err, "udp receive failed");
                        continue;
                    }
                };
                let packet = buf[..len].to_vec();
                let socket = socket.clone();
                let handler = handler.clone();

                handlers.spawn(async move {
                    let Some(reply) = handler.handle(&packet, peer).await else {
                        return;
                    };
                    let mut bytes = reply.bytes;
                    if bytes.len() > UDP_MAX_PAYLOAD {
                        bytes.truncate(UDP_MAX_PAYLOAD);
                        bytes[2] |= 0x02; // TC bit
                    }
                    if let Err(err) = socket.send_to(&bytes, peer).await {
                        error!(trace_id = %reply.trace_id, error = %err, "can't send DNS response");
                    }
                });
            }
        }
    }

    drain_handlers(handlers, "udp").await;
}

async fn run_tcp(
    listener: TcpListener,
    handler: Arc<Handler>,
    io_timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut handlers = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            Some(finished) = handlers.join_next(), if !handlers.is_empty() => {
                if let Err(err) = finished {
                    warn!(error = %err, "tcp handler aborted");
                }
            }
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        warn!(error = %err, "tcp accept failed");
                        continue;
                    }
                };
                let handler = handler.clone();
                let conn_shutdown = shutdown.clone();

                handlers.spawn(async move {
                    handle_tcp_conn(stream, peer, handler, io_timeout, conn_shutdown).await;
                });
            }
        }
    }

    drain_handlers(handlers, "tcp").await;
}

/// Waits for every spawned handler; a request still talking to its upstream
/// at shutdown finishes and writes its reply before the listener reports
/// stopped.
async fn drain_handlers(mut handlers: JoinSet<()>, listener: &str) {
    if !handlers.is_empty() {
        info!(listener = listener, in_flight = handlers.len(), "waiting for in-flight handlers");
    }
    while let Some(finished) = handlers.join_next().await {
        if let Err(err) = finished {
            warn!(listener = listener, error = %err, "handler cut off during shutdown");
        }
    }
}

/// Serves consecutive length-prefixed frames on one connection; every read
/// and write is bounded by the configured timeout. At shutdown the current
/// frame is answered but no further frames are accepted.
async fn handle_tcp_conn(
    mut stream: TcpStream,
    peer: SocketAddr,
    handler: Arc<Handler>,
    io_timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut len_buf = [0u8; 2];

    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            read = timeout(io_timeout, stream.read_exact(&mut len_buf)) => {
                match read {
                    Ok(Ok(_)) => {}
                    Ok(Err(_)) | Err(_) => return,
                }
            }
        }
        let frame_len = u16::from_be_bytes(len_buf) as usize;
        if frame_len == 0 || frame_len > MAX_TCP_FRAME {
            return;
        }

        let mut packet = vec![0u8; frame_len];
        match timeout(io_timeout, stream.read_exact(&mut packet)).await {
            Ok(Ok(_)) => {}
            Ok(Err(_)) | Err(_) => return,
        }

        let Some(reply) = handler.handle(&packet, peer).await else {
            continue;
        };

        let write = async {
            stream
                .write_all(&(reply.bytes.len() as u16).to_be_bytes())
                .await?;
            stream.write_all(&reply.bytes).await
        };
        match timeout(io_timeout, write).await {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => {
                error!(trace_id = %reply.trace_id, error = %err, "can't send DNS response");
                return;
            }
            Err(_) => {
                error!(trace_id = %reply.trace_id, "DNS response write timed out");
                return;
            }
        }
    }
}

impl Handler {
    /// One pass through the pipeline; at most one reply per inbound message.
    async fn handle(&self, packet: &[u8], peer: SocketAddr) -> Option<Reply> {
        let _timer = self.metrics.start_request_timer();
        let trace_id = TraceId::new();
        let addr = peer.ip();

        let req = match Message::from_vec(packet) {
            Ok(req) => req,
            Err(err) => {
                warn!(trace_id = %trace_id, client_ip = %addr, error = %err, "drop malformed DNS request");

                return None;
            }
        };

        self.metrics.inc_total_requests(addr);
        info!(
            trace_id = %trace_id,
            from = %addr,
            question = %proto::format_questions(&req),
            "handle DNS request"
        );

        let resp = match self.switcher.switch(&trace_id, addr, &req) {
            Some(resp) => resp,
            None => self.resolver.lookup(&trace_id, packet, &req).await,
        };

        info!(
            trace_id = %trace_id,
            answer = %proto::format_answers(resp.answers()),
            "send DNS response"
        );

        match resp.to_vec() {
            Ok(bytes) => Some(Reply { bytes, trace_id }),
            Err(err) => {
                error!(trace_id = %trace_id, error = %err, "can't encode DNS response");

                None
            }
        }
    }
}
