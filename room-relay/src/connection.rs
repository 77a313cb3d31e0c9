//! Per-connection read and write pumps.
//!
//! The reader parses lines and forwards them to the hub. The writer drains
//! the session's outbound queue onto the socket and tells the hub each time a
//! relayed file chunk has been written, which paces the chunk's sender. The
//! queue is the only thing the two tasks share. The connection ends when the peer closes, on a read
//! error, or when the writer stops (queue closed by the hub or a failed
//! write); in every case the reader unregisters the session.

use std::net::SocketAddr;

use anyhow::Result;
use tokio::{
    io::{AsyncBufRead, AsyncWrite, AsyncWriteExt, BufReader},
    net::TcpStream,
    select,
    sync::mpsc,
    task::JoinHandle,
};
use tracing::{debug, info};

use crate::{
    command::Inbound,
    hub::HubHandle,
    message::{Envelope, MessageType, read_line, write_message},
    session::SessionId,
};

pub async fn handle_connection(stream: TcpStream, hub: HubHandle, queue_capacity: usize) -> Result<()> {
    let peer = stream.peer_addr().ok();
    let (reader, writer) = stream.into_split();
    serve(BufReader::new(reader), writer, peer, hub, queue_capacity).await
}

/// Runs both pumps for one connection until it ends.
pub async fn serve<R, W>(
    mut reader: R,
    writer: W,
    peer: Option<SocketAddr>,
    hub: HubHandle,
    queue_capacity: usize,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (outbound_tx, outbound_rx) = mpsc::channel(queue_capacity);
    let id = hub.register(peer, outbound_tx).await?;
    info!(session = id, ?peer, "connection accepted");

    let mut writer_task = tokio::spawn(write_pump(id, writer, outbound_rx, hub.clone()));
    let (result, writer_done) = read_pump(id, &mut reader, &hub, &mut writer_task).await;

    hub.unregister(id).await;
    if !writer_done {
        // The hub drops the queue on unregister, so the writer drains and exits.
        let _ = writer_task.await;
    }
    info!(session = id, ?peer, "connection closed");
    result
}

/// Returns the read outcome and whether the writer task has already been joined.
async fn read_pump<R>(
    id: SessionId,
    reader: &mut R,
    hub: &HubHandle,
    writer_task: &mut JoinHandle<()>,
) -> (Result<()>, bool)
where
    R: AsyncBufRead + Unpin,
{
    loop {
        select! {
            line = read_line(reader) => match line {
                Ok(Some(line)) => {
                    debug!(session = id, bytes = line.len(), "line received");
                    if let Err(err) = hub.submit(id, Inbound::parse(&line)).await {
                        return (Err(err), false);
                    }
                }
                Ok(None) => {
                    debug!(session = id, "peer closed the connection");
                    return (Ok(()), false);
                }
                Err(err) => return (Err(err.into()), false),
            },
            _ = &mut *writer_task => {
                debug!(session = id, "write pump finished; closing reader");
                return (Ok(()), true);
            }
        }
    }
}

async fn write_pump<W>(id: SessionId, mut writer: W, mut outbound: mpsc::Receiver<Envelope>, hub: HubHandle)
where
    W: AsyncWrite + Unpin,
{
    while let Some(envelope) = outbound.recv().await {
        if let Err(err) = write_message(&mut writer, &envelope).await {
            debug!(session = id, ?err, "failed to deliver message to client");
            return;
        }
        if let (MessageType::FileChunk, Some(transfer)) = (envelope.kind, envelope.transfer_id) {
            hub.chunk_delivered(id, transfer).await;
        }
    }
    if let Err(err) = writer.shutdown().await {
        debug!(session = id, ?err, "failed to shut down writer cleanly");
    }
}
