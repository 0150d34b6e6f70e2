use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::backend::pipeline::Redirection;
use crate::com::AsError;
use crate::metrics;
use crate::protocol::{Protocol, Redirect};
use crate::proxy::batch::Batch;

use super::ClusterInner;

/// Redirects a command may follow before it fails.
pub const MAX_REDIRECTS: u8 = 1;

/// Resend diverted commands until the forwarder is cancelled.
pub(crate) async fn redirect_loop<P: Protocol>(
    inner: Arc<ClusterInner<P>>,
    mut rx: mpsc::UnboundedReceiver<Redirection<P>>,
    cancel: CancellationToken,
) {
    loop {
        let redirection = tokio::select! {
            _ = cancel.cancelled() => break,
            redirection = rx.recv() => match redirection {
                Some(redirection) => redirection,
                None => break,
            },
        };
        follow(&inner, redirection).await;
    }

    rx.close();
    while let Ok(redirection) = rx.try_recv() {
        redirection.cmd.set_error(AsError::ForwarderClosed);
        redirection.done.done();
    }
    debug!(cluster = %inner.cluster, "redirect worker stopped");
}

async fn follow<P: Protocol>(inner: &ClusterInner<P>, redirection: Redirection<P>) {
    let Redirection {
        cmd,
        redirect,
        done,
    } = redirection;

    if cmd.add_redirect() > MAX_REDIRECTS {
        metrics::redirect_incr(&inner.cluster, "limit");
        cmd.set_error(AsError::RedirectLimit);
        done.done();
        return;
    }

    match &redirect {
        Redirect::Moved { slot, addr } => {
            metrics::redirect_incr(&inner.cluster, "moved");
            inner.table.apply_moved(*slot, addr);
            cmd.set_asking(false);
        }
        Redirect::Ask { .. } => {
            metrics::redirect_incr(&inner.cluster, "ask");
            cmd.set_asking(true);
        }
    }
    debug!(cluster = %inner.cluster, redirect = ?redirect, "following redirect");

    match inner.pipes_for(redirect.addr()) {
        Some(pipes) => pipes.send(Batch::single(cmd, done)).await,
        None => Batch::single(cmd, done).fail(&AsError::ForwarderClosed),
    }
}
