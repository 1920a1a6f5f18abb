//! Per-connection session task.
//!
//! Reads frames off the transport, runs the handshake, then hands each
//! packet to [`dispatch`](crate::dispatch). Everything sent to the client,
//! replies and unsolicited events alike, goes through the connection's
//! outbound queue and a dedicated writer task, so packets leave in the order
//! they were queued.

use std::sync::Arc;
use std::time::Duration;

use dot_proto::{
    Frame, MIN_PROTOCOL_VERSION, PROTOCOL_VERSION, Packet, Request, Response, read_frame,
    write_packet,
};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::connection::Connection;
use crate::dispatch::handle_packet;
use crate::error::HandshakeError;
use crate::server::Server;

/// How long a closing session waits for its queued packets to drain.
const WRITER_GRACE: Duration = Duration::from_secs(1);

/// Serve one client until it disconnects or the server shuts down.
pub async fn serve_connection<S>(server: Arc<Server>, stream: S, peer: String)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut reader, mut writer) = tokio::io::split(stream);

    let (conn, outbound) = match server.accept(&peer) {
        Ok(accepted) => accepted,
        Err(code) => {
            warn!(%peer, "Refusing connection: too many unauthenticated clients");
            let _ = write_packet(&mut writer, &Response::Error(code).to_packet()).await;
            let _ = writer.shutdown().await;
            return;
        }
    };
    let writer_task = tokio::spawn(write_loop(server.clone(), writer, outbound));
    let cancel = server.cancel_token();

    let handshake = tokio::select! {
        _ = cancel.cancelled() => Err(HandshakeError::Closed),
        result = handshake(&server, &conn, &mut reader) => result,
    };

    match handshake {
        Ok(()) => {
            read_loop(&server, &conn, &mut reader).await;
        }
        Err(e) => {
            info!(conn = conn.id(), %peer, "Handshake failed: {}", e);
            server.metrics().handshake_failed();
            if let Some(code) = e.reply() {
                conn.try_send(Response::Error(code));
            }
        }
    }

    server.disconnect(&conn).await;
    drop(conn);
    let abort = writer_task.abort_handle();
    match tokio::time::timeout(WRITER_GRACE, writer_task).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(%peer, "Writer task failed: {}", e),
        Err(_) => {
            debug!(%peer, "Client stopped reading, dropping unsent packets");
            abort.abort();
        }
    }
}

async fn read_loop<R>(server: &Server, conn: &Arc<Connection>, reader: &mut R)
where
    R: AsyncRead + Unpin,
{
    let cancel = server.cancel_token();
    let max = server.config().max_packet_size;
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => {
                debug!(conn = conn.id(), "Closing session for shutdown");
                break;
            }
            frame = read_frame(reader, max) => frame,
        };

        match frame {
            Ok(None) => {
                debug!(conn = conn.id(), "Peer closed the connection");
                break;
            }
            Err(e) => {
                debug!(conn = conn.id(), "Read failed: {}", e);
                break;
            }
            Ok(Some(Frame::Oversized { ptype, len })) => {
                warn!(conn = conn.id(), ptype = format_args!("{ptype:#x}"), len, max, "Dropped oversized packet");
                server.metrics().oversized_dropped();
            }
            Ok(Some(Frame::Packet(packet))) => {
                server.metrics().packet_received();
                // Queuing the reply waits on the client draining its socket.
                let handled = tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!(conn = conn.id(), "Closing session for shutdown");
                        false
                    }
                    sent = reply_to(server, conn, &packet) => sent,
                };
                if !handled {
                    break;
                }
            }
        }
    }
}

/// Handle one packet and queue its reply. `false` once the writer is gone.
async fn reply_to(server: &Server, conn: &Arc<Connection>, packet: &Packet) -> bool {
    match handle_packet(server, conn, packet).await {
        Some(reply) => conn.send(reply).await,
        None => true,
    }
}

/// Version exchange then authentication, bounded by the auth timeout
/// counted from when the transport was accepted.
async fn handshake<R>(server: &Server, conn: &Connection, reader: &mut R) -> Result<(), HandshakeError>
where
    R: AsyncRead + Unpin,
{
    let deadline = conn.connected_at() + server.config().auth_timeout;
    tokio::time::timeout_at(deadline, exchange(server, conn, reader))
        .await
        .map_err(|_| HandshakeError::Timeout)?
}

async fn exchange<R>(server: &Server, conn: &Connection, reader: &mut R) -> Result<(), HandshakeError>
where
    R: AsyncRead + Unpin,
{
    conn.send(Response::Version(PROTOCOL_VERSION)).await;
    match next_request(server, reader).await? {
        Request::Version { version } if version >= MIN_PROTOCOL_VERSION => {
            debug!(conn = conn.id(), version, "Client version accepted");
        }
        Request::Version { version } => return Err(HandshakeError::Version(version)),
        _ => return Err(HandshakeError::Protocol("expected version")),
    }

    let authenticator = server.authenticator();
    conn.send(Response::AuthMethods(authenticator.methods())).await;
    match next_request(server, reader).await? {
        Request::Auth { method, credential } => {
            if !authenticator.authenticate(method, &credential) {
                return Err(HandshakeError::Rejected);
            }
            server.authenticated(conn);
            conn.send(Response::Ack).await;
            Ok(())
        }
        _ => Err(HandshakeError::Protocol("expected auth")),
    }
}

async fn next_request<R>(server: &Server, reader: &mut R) -> Result<Request, HandshakeError>
where
    R: AsyncRead + Unpin,
{
    match read_frame(reader, server.config().max_packet_size).await? {
        None => Err(HandshakeError::Closed),
        Some(Frame::Oversized { .. }) => Err(HandshakeError::Protocol("oversized packet")),
        Some(Frame::Packet(packet)) => {
            server.metrics().packet_received();
            Request::decode(&packet).map_err(|_| HandshakeError::Protocol("malformed packet"))
        }
    }
}

async fn write_loop<W>(server: Arc<Server>, mut writer: W, mut outbound: mpsc::Receiver<Response>)
where
    W: AsyncWrite + Unpin,
{
    let cancel = server.cancel_token();
    loop {
        let response = tokio::select! {
            _ = cancel.cancelled() => break,
            response = outbound.recv() => match response {
                Some(response) => response,
                None => break,
            },
        };
        let packet = response.to_packet();
        let written = tokio::select! {
            _ = cancel.cancelled() => break,
            written = write_packet(&mut writer, &packet) => written,
        };
        if let Err(e) = written {
            debug!("Write failed: {}", e);
            break;
        }
        server.metrics().packet_sent();
    }
    let _ = tokio::time::timeout(WRITER_GRACE, writer.shutdown()).await;
}
