use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use bytes::BytesMut;
use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::backend::client::{ClientId, FrontConnectionGuard};
use crate::com::AsError;
use crate::metrics::{self, Slowlog};
use crate::protocol::Protocol;
use crate::proxy::batch::{BatchAllocator, BatchPool};
use crate::proxy::message::{Message, MessageKind};
use crate::proxy::ForwarderHandle;

const FRONT_TCP_KEEPALIVE: Duration = Duration::from_secs(60);
const FRONT_BUFFER: usize = 16 * 1024;

/// What every client connection of one cluster shares.
pub struct FrontContext<P: Protocol> {
    cluster: Arc<str>,
    forwarder: Arc<ArcSwap<ForwarderHandle<P>>>,
    pool: Arc<BatchPool<P>>,
    slowlog: Slowlog,
}

impl<P: Protocol> FrontContext<P> {
    pub fn new(cluster: Arc<str>, forwarder: Arc<ArcSwap<ForwarderHandle<P>>>) -> Self {
        Self {
            slowlog: Slowlog::disabled(cluster.clone()),
            cluster,
            forwarder,
            pool: BatchPool::new(),
        }
    }

    pub fn with_slowlog(mut self, slowlog: Slowlog) -> Self {
        self.slowlog = slowlog;
        self
    }

    pub fn cluster(&self) -> &Arc<str> {
        &self.cluster
    }

    /// The slot the reloader swaps new forwarder generations into.
    pub fn forwarder(&self) -> &Arc<ArcSwap<ForwarderHandle<P>>> {
        &self.forwarder
    }

    /// Forward one decode cycle and wait until every command has a result.
    ///
    /// A cycle that races a reload and finds its handle closed is retried
    /// once against the newly installed generation.
    pub async fn dispatch(&self, msgs: &mut [Message<P>]) {
        if !msgs.iter().any(Message::is_forwarded) {
            return;
        }
        let _tracker = metrics::total_tracker(&self.cluster);
        let mut retried = false;
        loop {
            let handle = self.forwarder.load_full();
            let result = match handle.acquire() {
                Ok(guard) => {
                    let mut alloc = BatchAllocator::new(self.pool.clone());
                    let forwarded = guard.forward(&mut alloc, msgs).await;
                    if forwarded.is_ok() {
                        alloc.wait().await;
                    }
                    forwarded
                }
                Err(err) => Err(err),
            };

            match result {
                Ok(()) => return,
                Err(AsError::ForwarderClosed) if !retried => {
                    debug!(cluster = %self.cluster, generation = handle.generation(), "forwarder retired mid cycle, retrying");
                    retried = true;
                }
                Err(err) => {
                    metrics::global_error_incr();
                    warn!(cluster = %self.cluster, error = %err, "failed to forward decode cycle");
                    for msg in msgs.iter_mut().filter(|msg| msg.is_forwarded()) {
                        msg.set_error(err.clone());
                    }
                    return;
                }
            }
        }
    }
}

/// Serve one accepted client socket until it closes.
pub async fn handle_connection<P: Protocol>(ctx: Arc<FrontContext<P>>, socket: TcpStream) -> Result<()> {
    socket
        .set_nodelay(true)
        .context("failed to set TCP_NODELAY")?;
    let keepalive = TcpKeepalive::new()
        .with_time(FRONT_TCP_KEEPALIVE)
        .with_interval(FRONT_TCP_KEEPALIVE);
    if let Err(err) = SockRef::from(&socket).set_tcp_keepalive(&keepalive) {
        warn!(
            cluster = %ctx.cluster,
            error = %err,
            "failed to enable frontend TCP keepalive"
        );
    }
    serve(ctx, socket).await
}

/// Client session loop over any byte stream.
///
/// Each read is decoded into as many complete messages as it holds; that
/// decode cycle is forwarded as one unit and its replies are written back
/// in request order.
pub async fn serve<P, S>(ctx: Arc<FrontContext<P>>, stream: S) -> Result<()>
where
    P: Protocol,
    S: AsyncRead + AsyncWrite + Unpin,
{
    let client_id = ClientId::new();
    let _guard = FrontConnectionGuard::new(ctx.cluster.clone());
    debug!(cluster = %ctx.cluster, client = %client_id, "client connected");

    let (mut reader, mut writer) = tokio::io::split(stream);
    let mut rbuf = BytesMut::with_capacity(FRONT_BUFFER);
    let mut wbuf = BytesMut::with_capacity(FRONT_BUFFER);

    loop {
        let n = reader
            .read_buf(&mut rbuf)
            .await
            .with_context(|| format!("{client_id} read failed"))?;
        if n == 0 {
            break;
        }

        let mut msgs = Vec::new();
        let mut quit = false;
        let mut bad = None;
        loop {
            match P::decode_message(&mut rbuf) {
                Ok(Some(msg)) => {
                    quit = msg.kind() == MessageKind::Quit;
                    msgs.push(msg);
                    if quit {
                        break;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    bad = Some(err);
                    break;
                }
            }
        }

        ctx.dispatch(&mut msgs).await;
        for msg in msgs.iter_mut() {
            msg.mark_end();
        }
        for msg in &msgs {
            if !msg.subs().is_empty() {
                ctx.slowlog.maybe_record(msg.elapsed(), || describe(msg));
            }
            if let Err(err) = P::encode_message(msg, &mut wbuf) {
                metrics::global_error_incr();
                P::encode_error(&err, &mut wbuf);
            }
        }
        if let Some(err) = &bad {
            metrics::global_error_incr();
            debug!(cluster = %ctx.cluster, client = %client_id, error = %err, "closing client on undecodable input");
            P::encode_error(err, &mut wbuf);
        }

        if !wbuf.is_empty() {
            writer
                .write_all(&wbuf)
                .await
                .with_context(|| format!("{client_id} write failed"))?;
            writer.flush().await?;
            wbuf.clear();
        }
        if quit || bad.is_some() {
            break;
        }
    }

    let _ = writer.shutdown().await;
    debug!(cluster = %ctx.cluster, client = %client_id, "client disconnected");
    Ok(())
}

fn describe<P: Protocol>(msg: &Message<P>) -> String {
    msg.subs()
        .iter()
        .map(|cmd| format!("{:?}", cmd.request()))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::com::AsResult;
    use crate::protocol::redis::{RedisProtocol, RespValue};
    use crate::proxy::{Forwarder, ForwarderState};
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{duplex, DuplexStream};

    /// Replies to every command with its key prefixed by a generation tag.
    struct EchoKey {
        tag: &'static str,
        closes: AtomicUsize,
    }

    impl EchoKey {
        fn new(tag: &'static str) -> Arc<Self> {
            Arc::new(Self {
                tag,
                closes: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Forwarder<RedisProtocol> for EchoKey {
        async fn forward(
            &self,
            _alloc: &mut BatchAllocator<RedisProtocol>,
            msgs: &[Message<RedisProtocol>],
        ) -> AsResult<()> {
            for msg in msgs.iter().filter(|msg| msg.is_forwarded()) {
                for cmd in msg.subs() {
                    let mut value = self.tag.as_bytes().to_vec();
                    value.extend_from_slice(cmd.key());
                    cmd.set_reply(RespValue::BulkString(Bytes::from(value)));
                }
            }
            Ok(())
        }

        fn close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Answers like `EchoKey` after sleeping.
    struct Sluggish(Duration);

    #[async_trait]
    impl Forwarder<RedisProtocol> for Sluggish {
        async fn forward(
            &self,
            _alloc: &mut BatchAllocator<RedisProtocol>,
            msgs: &[Message<RedisProtocol>],
        ) -> AsResult<()> {
            tokio::time::sleep(self.0).await;
            for msg in msgs.iter().filter(|msg| msg.is_forwarded()) {
                for cmd in msg.subs() {
                    cmd.set_reply(RespValue::ok());
                }
            }
            Ok(())
        }

        fn close(&self) {}
    }

    fn context(fwd: Arc<EchoKey>, generation: u64) -> Arc<FrontContext<RedisProtocol>> {
        let handle = ForwarderHandle::new("handler-test".into(), generation, fwd);
        Arc::new(FrontContext::new(
            "handler-test".into(),
            Arc::new(ArcSwap::new(handle)),
        ))
    }

    async fn exchange(client: &mut DuplexStream, request: &[u8], expect: usize) -> Vec<u8> {
        client.write_all(request).await.unwrap();
        let mut out = Vec::new();
        while out.len() < expect {
            let mut buf = [0u8; 256];
            let n = client.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        out
    }

    #[tokio::test]
    async fn pipelined_cycle_replies_in_order() {
        let ctx = context(EchoKey::new("a:"), 1);
        let (mut client, server) = duplex(4096);
        let session = tokio::spawn(serve(ctx, server));

        let request = b"*2\r\n$3\r\nGET\r\n$1\r\nx\r\n*1\r\n$4\r\nPING\r\n*3\r\n$4\r\nMGET\r\n$1\r\ny\r\n$1\r\nz\r\n";
        let expected = b"$3\r\na:x\r\n+PONG\r\n*2\r\n$3\r\na:y\r\n$3\r\na:z\r\n";
        let reply = exchange(&mut client, request, expected.len()).await;
        assert_eq!(reply, expected.to_vec());

        drop(client);
        session.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn reload_swaps_generation_and_retires_old_one() {
        let old = EchoKey::new("old:");
        let ctx = context(old.clone(), 1);
        let (mut client, server) = duplex(4096);
        let session = tokio::spawn(serve(ctx.clone(), server));

        let get = b"*2\r\n$3\r\nGET\r\n$1\r\nk\r\n";
        assert_eq!(exchange(&mut client, get, 11).await, b"$5\r\nold:k\r\n".to_vec());

        let fresh = EchoKey::new("new:");
        let retired = ctx
            .forwarder()
            .swap(ForwarderHandle::new("handler-test".into(), 2, fresh));
        retired.close();
        assert_eq!(retired.state(), ForwarderState::Closed);
        assert_eq!(old.closes.load(Ordering::SeqCst), 1);

        assert_eq!(exchange(&mut client, get, 11).await, b"$5\r\nnew:k\r\n".to_vec());
        drop(client);
        session.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn closed_forwarder_fails_commands_but_keeps_session() {
        let ctx = context(EchoKey::new("x:"), 1);
        ctx.forwarder().load().close();
        let (mut client, server) = duplex(4096);
        let session = tokio::spawn(serve(ctx, server));

        let expected = b"-ERR forwarder has been closed\r\n+PONG\r\n";
        let reply = exchange(
            &mut client,
            b"*2\r\n$3\r\nGET\r\n$1\r\nk\r\n*1\r\n$4\r\nPING\r\n",
            expected.len(),
        )
        .await;
        assert_eq!(reply, expected.to_vec());
        drop(client);
        session.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn slow_messages_land_in_slowlog() {
        let handle = ForwarderHandle::<RedisProtocol>::new(
            "handler-slow".into(),
            1,
            Arc::new(Sluggish(Duration::from_millis(30))),
        );
        let ctx = Arc::new(
            FrontContext::new("handler-slow".into(), Arc::new(ArcSwap::new(handle)))
                .with_slowlog(Slowlog::new("handler-slow".into(), 20_000)),
        );
        let (mut client, server) = duplex(4096);
        let session = tokio::spawn(serve(ctx.clone(), server));

        let request = b"*2\r\n$3\r\nGET\r\n$4\r\nslow\r\n*1\r\n$4\r\nPING\r\n";
        let expected = b"+OK\r\n+PONG\r\n";
        assert_eq!(exchange(&mut client, request, expected.len()).await, expected.to_vec());

        assert_eq!(metrics::slowlog_count("handler-slow"), 1);

        drop(client);
        session.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn quit_and_garbage_close_the_session() {
        let ctx = context(EchoKey::new("q:"), 1);
        let (mut client, server) = duplex(4096);
        let session = tokio::spawn(serve(ctx.clone(), server));
        let reply = exchange(&mut client, b"*1\r\n$4\r\nQUIT\r\n*1\r\n$4\r\nPING\r\n", 64).await;
        assert_eq!(reply, b"+OK\r\n".to_vec());
        session.await.unwrap().unwrap();

        let (mut client, server) = duplex(4096);
        let session = tokio::spawn(serve(ctx, server));
        let reply = exchange(&mut client, b"?what\r\n", 64).await;
        assert_eq!(reply, b"-ERR invalid message\r\n".to_vec());
        session.await.unwrap().unwrap();
    }
}
