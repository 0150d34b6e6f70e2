use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::dialer::{BoxRead, BoxWrite, Dialer};
use crate::com::{AsError, AsResult};
use crate::metrics;
use crate::protocol::Protocol;
use crate::standalone::ketama::HashRing;

/// Dial, read and write deadline of a liveness check.
pub const PING_TIMEOUT: Duration = Duration::from_millis(100);

/// One liveness check against one backend.
#[async_trait]
pub trait Pinger: Send + 'static {
    async fn ping(&mut self) -> AsResult<()>;

    /// Drop the ping connection; the next ping dials again.
    fn close(&mut self);
}

/// Pings over a dedicated connection with the protocol's ping request.
pub struct ConnPinger<P: Protocol> {
    addr: String,
    dialer: Arc<dyn Dialer>,
    conn: Option<(BoxRead, BoxWrite)>,
    buf: BytesMut,
    _protocol: PhantomData<P>,
}

impl<P: Protocol> ConnPinger<P> {
    pub fn new(addr: &str, dialer: Arc<dyn Dialer>) -> Self {
        Self {
            addr: addr.to_string(),
            dialer,
            conn: None,
            buf: BytesMut::with_capacity(64),
            _protocol: PhantomData,
        }
    }

    async fn exchange(&mut self) -> AsResult<()> {
        if self.conn.is_none() {
            self.conn = Some(self.dialer.dial(&self.addr, PING_TIMEOUT).await?);
        }
        let (read, write) = match self.conn.as_mut() {
            Some(conn) => conn,
            None => return Err(AsError::BackendClosed(self.addr.clone())),
        };
        let (request, expect) = P::ping_request();

        timeout(PING_TIMEOUT, async {
            write.write_all(request).await?;
            write.flush().await
        })
        .await??;

        self.buf.clear();
        let buf = &mut self.buf;
        timeout(PING_TIMEOUT, async {
            while buf.len() < expect.len() {
                if read.read_buf(buf).await? == 0 {
                    return Err(AsError::BackendClosed("ping connection closed".to_string()));
                }
            }
            Ok(())
        })
        .await??;

        if &self.buf[..expect.len()] != expect {
            return Err(AsError::BadReply);
        }
        Ok(())
    }
}

#[async_trait]
impl<P: Protocol> Pinger for ConnPinger<P> {
    async fn ping(&mut self) -> AsResult<()> {
        let result = self.exchange().await;
        if let Err(err) = &result {
            if !err.is_timeout() {
                self.close();
            }
        }
        result
    }

    fn close(&mut self) {
        self.conn = None;
        self.buf.clear();
    }
}

/// Settings for one node monitor.
#[derive(Debug, Clone, Copy)]
pub struct MonitorOptions {
    pub fail_limit: usize,
    pub interval: Duration,
    pub quarantine: Duration,
}

/// Ejects a node from the ring after `fail_limit` consecutive ping
/// failures and re-admits it on the first success.
pub struct HealthMonitor<T: Pinger> {
    cluster: Arc<str>,
    node: Arc<str>,
    weight: usize,
    ring: Arc<HashRing>,
    pinger: T,
    options: MonitorOptions,
}

impl<T: Pinger> HealthMonitor<T> {
    pub fn new(
        cluster: Arc<str>,
        node: Arc<str>,
        weight: usize,
        ring: Arc<HashRing>,
        pinger: T,
        options: MonitorOptions,
    ) -> Self {
        Self {
            cluster,
            node,
            weight,
            ring,
            pinger,
            options,
        }
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        let mut failures = 0usize;
        let mut ejected = false;
        loop {
            let delay = if ejected {
                self.options.quarantine
            } else {
                self.options.interval
            };
            let result = tokio::select! {
                _ = cancel.cancelled() => break,
                result = async {
                    sleep(delay).await;
                    self.pinger.ping().await
                } => result,
            };

            match result {
                Ok(()) => {
                    failures = 0;
                    if ejected {
                        info!(cluster = %self.cluster, node = %self.node, "node recovered, re-adding to hash ring");
                        self.ring.add_node(&self.node, self.weight);
                        ejected = false;
                    }
                }
                Err(err) => {
                    failures += 1;
                    debug!(
                        cluster = %self.cluster,
                        node = %self.node,
                        failures,
                        error = %err,
                        "liveness check failed"
                    );
                    if !ejected && failures >= self.options.fail_limit {
                        warn!(cluster = %self.cluster, node = %self.node, failures, "ejecting node from hash ring");
                        self.ring.del_node(&self.node);
                        metrics::node_ejected_incr(&self.cluster, &self.node);
                        ejected = true;
                    }
                }
            }
        }
        self.pinger.close();
        debug!(cluster = %self.cluster, node = %self.node, "health monitor stopped");
    }
}
