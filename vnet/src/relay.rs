//! Byte pump between a host-side stream and a flow's smoltcp socket.
//!
//! The dispatch task owns the socket; this side only ever sees channels. Data from the
//! guest arrives on `to_host`, and closing that channel means the guest sent FIN. Host
//! data and end-of-stream go back as [`HostEvent`]s. Every event wakes dispatch.

use std::io;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{Notify, mpsc, watch};

pub const TCP_READ_BUFFER_SIZE: usize = 64 * 1024;
/// Chunks buffered per direction between a flow task and dispatch.
pub const CHANNEL_DEPTH: usize = 64;

#[derive(Debug)]
pub enum HostEvent {
    Data(Vec<u8>),
    /// Host half-closed its side.
    Eof,
    /// Host connection failed. The guest side gets a reset.
    Error(io::Error),
}

/// Dispatch-side ends of a flow's channels.
pub struct FlowChannels {
    pub to_host: Option<mpsc::Sender<Vec<u8>>>,
    pub from_host: mpsc::Receiver<HostEvent>,
}

/// Pump-side ends of a flow's channels.
pub struct PumpChannels {
    pub to_host: mpsc::Receiver<Vec<u8>>,
    pub from_host: mpsc::Sender<HostEvent>,
}

pub fn flow_channels() -> (FlowChannels, PumpChannels) {
    let (to_host_tx, to_host_rx) = mpsc::channel(CHANNEL_DEPTH);
    let (from_host_tx, from_host_rx) = mpsc::channel(CHANNEL_DEPTH);
    (
        FlowChannels {
            to_host: Some(to_host_tx),
            from_host: from_host_rx,
        },
        PumpChannels {
            to_host: to_host_rx,
            from_host: from_host_tx,
        },
    )
}

/// Relays between `stream` and the flow's channels until both directions finish, dispatch
/// drops the flow, or `stop` fires. The stream is closed on return.
pub async fn pump<S>(stream: S, chans: PumpChannels, notify: Arc<Notify>, mut stop: watch::Receiver<()>)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut rd, mut wr) = tokio::io::split(stream);
    let PumpChannels {
        mut to_host,
        from_host,
    } = chans;
    let released = from_host.clone();

    let host_to_guest = {
        let notify = notify.clone();
        async move {
            let mut buf = vec![0u8; TCP_READ_BUFFER_SIZE];
            loop {
                let event = match rd.read(&mut buf).await {
                    Ok(0) => HostEvent::Eof,
                    Ok(n) => HostEvent::Data(buf[..n].to_vec()),
                    Err(e) => HostEvent::Error(e),
                };
                let done = !matches!(event, HostEvent::Data(_));
                if from_host.send(event).await.is_err() {
                    break;
                }
                notify.notify_one();
                if done {
                    break;
                }
            }
        }
    };

    let guest_to_host = {
        let notify = notify.clone();
        async move {
            while let Some(chunk) = to_host.recv().await {
                // Freed channel capacity lets dispatch drain more from the socket.
                notify.notify_one();
                if let Err(e) = wr.write_all(&chunk).await {
                    tracing::debug!(error = %e, "host write failed");
                    return;
                }
            }
            if let Err(e) = wr.shutdown().await {
                tracing::trace!(error = %e, "host shutdown failed");
            }
        }
    };

    tokio::select! {
        _ = async { tokio::join!(host_to_guest, guest_to_host) } => {}
        _ = released.closed() => tracing::trace!("flow released, dropping host stream"),
        _ = stop.changed() => {}
    }
}
