use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::backend::dialer::{BoxRead, BoxWrite, Dialer};
use crate::com::{AsError, AsResult};
use crate::config::ClusterConfig;
use crate::metrics;
use crate::protocol::{Protocol, Redirect};
use crate::proxy::batch::{Batch, Completion};
use crate::proxy::message::Command;

/// Batches the writer drains per flush.
pub const MAX_GROUP: usize = 64;
/// Input queue depth of one pipeline, in batches.
pub const PIPELINE_QUEUE: usize = 1024;

const BUFFER_CAPACITY: usize = 16 * 1024;

#[derive(Debug, Clone, Copy)]
pub struct PipeOptions {
    pub dial_timeout: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
}

impl PipeOptions {
    pub fn from_config(cc: &ClusterConfig) -> Self {
        Self {
            dial_timeout: cc.dial_timeout(),
            read_timeout: cc.read_timeout(),
            write_timeout: cc.write_timeout(),
        }
    }
}

/// A command diverted by a `MOVED` or `ASK` reply. `done` already carries
/// one extra count that the resend must release.
pub struct Redirection<P: Protocol> {
    pub cmd: Arc<Command<P>>,
    pub redirect: Redirect,
    pub done: Arc<Completion>,
}

/// Everything a pipeline needs besides its address.
pub struct PipeContext<P: Protocol> {
    pub cluster: Arc<str>,
    pub dialer: Arc<dyn Dialer>,
    pub options: PipeOptions,
    redirects: Option<mpsc::UnboundedSender<Redirection<P>>>,
    refresh: Option<mpsc::Sender<()>>,
}

impl<P: Protocol> Clone for PipeContext<P> {
    fn clone(&self) -> Self {
        Self {
            cluster: self.cluster.clone(),
            dialer: self.dialer.clone(),
            options: self.options,
            redirects: self.redirects.clone(),
            refresh: self.refresh.clone(),
        }
    }
}

impl<P: Protocol> PipeContext<P> {
    pub fn new(cluster: Arc<str>, dialer: Arc<dyn Dialer>, options: PipeOptions) -> Self {
        Self {
            cluster,
            dialer,
            options,
            redirects: None,
            refresh: None,
        }
    }

    /// Divert redirect replies to `tx` instead of completing the command.
    pub fn with_redirects(mut self, tx: mpsc::UnboundedSender<Redirection<P>>) -> Self {
        self.redirects = Some(tx);
        self
    }

    /// Poke `tx` on every transport error.
    pub fn with_refresh(mut self, tx: mpsc::Sender<()>) -> Self {
        self.refresh = Some(tx);
        self
    }

    fn transport_error(&self, addr: &str, err: &AsError) {
        metrics::backend_error_incr(&self.cluster, err.kind());
        if let Some(refresh) = &self.refresh {
            let _ = refresh.try_send(());
        }
        debug!(cluster = %self.cluster, backend = %addr, error = %err, "backend transport error");
    }
}

enum ReaderEvent<P: Protocol> {
    Attach(BoxRead),
    Batch(Batch<P>),
}

/// One backend connection served by a writer task and a reader task.
pub struct Pipeline<P: Protocol> {
    addr: Arc<str>,
    tx: mpsc::Sender<Batch<P>>,
}

impl<P: Protocol> Pipeline<P> {
    pub fn spawn(addr: Arc<str>, ctx: PipeContext<P>) -> Self {
        let (tx, rx) = mpsc::channel(PIPELINE_QUEUE);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let broken = Arc::new(AtomicBool::new(false));
        tokio::spawn(writer_loop(
            addr.clone(),
            ctx.clone(),
            rx,
            events_tx,
            broken.clone(),
        ));
        tokio::spawn(reader_loop(addr.clone(), ctx, events_rx, broken));
        Self { addr, tx }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub async fn send(&self, batch: Batch<P>) {
        if let Err(mpsc::error::SendError(batch)) = self.tx.send(batch).await {
            batch.fail(&AsError::BackendClosed(self.addr.to_string()));
        }
    }
}

async fn writer_loop<P: Protocol>(
    addr: Arc<str>,
    ctx: PipeContext<P>,
    mut rx: mpsc::Receiver<Batch<P>>,
    events: mpsc::UnboundedSender<ReaderEvent<P>>,
    broken: Arc<AtomicBool>,
) {
    let mut conn: Option<BoxWrite> = None;
    let mut buf = BytesMut::with_capacity(BUFFER_CAPACITY);
    let mut group: Vec<Batch<P>> = Vec::with_capacity(MAX_GROUP);

    while let Some(first) = rx.recv().await {
        group.push(first);
        while group.len() < MAX_GROUP {
            match rx.try_recv() {
                Ok(batch) => group.push(batch),
                Err(_) => break,
            }
        }

        if broken.swap(false, Ordering::AcqRel) {
            conn = None;
        }
        if conn.is_none() {
            match ctx.dialer.dial(&addr, ctx.options.dial_timeout).await {
                Ok((read, write)) => {
                    if events.send(ReaderEvent::Attach(read)).is_err() {
                        fail_group(&mut group, &AsError::BackendClosed(addr.to_string()));
                        break;
                    }
                    conn = Some(write);
                }
                Err(err) => {
                    warn!(cluster = %ctx.cluster, backend = %addr, error = %err, "failed to dial backend");
                    ctx.transport_error(&addr, &err);
                    fail_group(&mut group, &err);
                    continue;
                }
            }
        }

        buf.clear();
        for batch in &group {
            for cmd in batch.cmds() {
                P::encode_request(cmd.request(), cmd.is_asking(), &mut buf);
            }
        }

        let written = match conn.as_mut() {
            Some(writer) => write_all(writer, &buf, ctx.options.write_timeout).await,
            None => Err(AsError::BackendClosed(addr.to_string())),
        };
        if let Err(err) = written {
            warn!(cluster = %ctx.cluster, backend = %addr, error = %err, "failed to write to backend");
            ctx.transport_error(&addr, &err);
            conn = None;
            fail_group(&mut group, &err);
            continue;
        }

        for batch in group.drain(..) {
            for cmd in batch.cmds() {
                cmd.mark_write();
            }
            if let Err(mpsc::error::SendError(event)) = events.send(ReaderEvent::Batch(batch)) {
                if let ReaderEvent::Batch(batch) = event {
                    batch.fail(&AsError::BackendClosed(addr.to_string()));
                }
            }
        }
    }
    debug!(cluster = %ctx.cluster, backend = %addr, "pipeline writer exit");
}

async fn write_all(writer: &mut BoxWrite, buf: &[u8], deadline: Duration) -> AsResult<()> {
    timeout(deadline, async {
        writer.write_all(buf).await?;
        writer.flush().await
    })
    .await??;
    Ok(())
}

fn fail_group<P: Protocol>(group: &mut Vec<Batch<P>>, err: &AsError) {
    for batch in group.drain(..) {
        batch.fail(err);
    }
}

async fn reader_loop<P: Protocol>(
    addr: Arc<str>,
    ctx: PipeContext<P>,
    mut events: mpsc::UnboundedReceiver<ReaderEvent<P>>,
    broken: Arc<AtomicBool>,
) {
    let mut conn: Option<BoxRead> = None;
    let mut buf = BytesMut::with_capacity(BUFFER_CAPACITY);

    while let Some(event) = events.recv().await {
        let batch = match event {
            ReaderEvent::Attach(read) => {
                conn = Some(read);
                buf.clear();
                continue;
            }
            ReaderEvent::Batch(batch) => batch,
        };
        let reader = match conn.as_mut() {
            Some(reader) => reader,
            None => {
                batch.fail(&AsError::BackendClosed(addr.to_string()));
                continue;
            }
        };

        match read_batch(&ctx, reader, &mut buf, &batch).await {
            Ok(()) => batch.finish(),
            Err((from, err)) => {
                warn!(cluster = %ctx.cluster, backend = %addr, error = %err, "failed to read from backend");
                ctx.transport_error(&addr, &err);
                conn = None;
                buf.clear();
                broken.store(true, Ordering::Release);
                for cmd in &batch.cmds()[from..] {
                    if !cmd.is_done() {
                        cmd.set_error(err.clone());
                    }
                }
                batch.finish();
            }
        }
    }
    debug!(cluster = %ctx.cluster, backend = %addr, "pipeline reader exit");
}

/// Read one reply per command. On failure returns the index of the first
/// command left without a result.
async fn read_batch<P: Protocol>(
    ctx: &PipeContext<P>,
    reader: &mut BoxRead,
    buf: &mut BytesMut,
    batch: &Batch<P>,
) -> Result<(), (usize, AsError)> {
    let deadline = ctx.options.read_timeout;
    for (idx, cmd) in batch.cmds().iter().enumerate() {
        let acked = if cmd.is_asking() {
            let ack = read_reply::<P>(cmd.request(), reader, buf, deadline)
                .await
                .map_err(|err| (idx, err))?;
            P::asking_acked(&ack)
        } else {
            true
        };
        let reply = read_reply::<P>(cmd.request(), reader, buf, deadline)
            .await
            .map_err(|err| (idx, err))?;
        cmd.mark_read();
        if let Some(elapsed) = cmd.remote_elapsed() {
            metrics::remote_observe(&ctx.cluster, elapsed);
        }
        if !acked {
            warn!(cluster = %ctx.cluster, request = ?cmd.request(), "backend refused ASKING");
            cmd.set_error(AsError::BadReply);
            continue;
        }

        if let Some(redirects) = &ctx.redirects {
            match P::redirect(&reply) {
                Ok(Some(redirect)) => {
                    if let Some(done) = batch.completion() {
                        done.add(1);
                        let redirection = Redirection {
                            cmd: cmd.clone(),
                            redirect,
                            done: done.clone(),
                        };
                        match redirects.send(redirection) {
                            Ok(()) => continue,
                            Err(mpsc::error::SendError(redirection)) => redirection.done.done(),
                        }
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    cmd.set_error(err);
                    continue;
                }
            }
        }
        cmd.set_reply(reply);
    }
    Ok(())
}

async fn read_reply<P: Protocol>(
    req: &P::Request,
    reader: &mut BoxRead,
    buf: &mut BytesMut,
    deadline: Duration,
) -> AsResult<P::Reply> {
    timeout(deadline, async {
        loop {
            if let Some(reply) = P::decode_reply(req, buf)? {
                return Ok(reply);
            }
            if reader.read_buf(buf).await? == 0 {
                return Err(AsError::BackendClosed("connection reset by backend".to_string()));
            }
        }
    })
    .await?
}

/// The `node_connections` pipelines of one backend, used round-robin.
pub struct NodePipes<P: Protocol> {
    addr: Arc<str>,
    pipes: Vec<Pipeline<P>>,
    next: AtomicUsize,
}

impl<P: Protocol> NodePipes<P> {
    pub fn spawn(addr: &str, count: usize, ctx: &PipeContext<P>) -> Self {
        let addr: Arc<str> = addr.into();
        let pipes = (0..count.max(1))
            .map(|_| Pipeline::spawn(addr.clone(), ctx.clone()))
            .collect();
        Self {
            addr,
            pipes,
            next: AtomicUsize::new(0),
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn len(&self) -> usize {
        self.pipes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pipes.is_empty()
    }

    pub async fn send(&self, batch: Batch<P>) {
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.pipes.len();
        self.pipes[idx].send(batch).await
    }
}
