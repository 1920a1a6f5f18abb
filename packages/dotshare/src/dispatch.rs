//! Request handlers for authenticated sessions.
//!
//! Each handler validates its preconditions before touching shared state.
//! A refused request leaves everything as it was and is answered with an
//! `Error`; a request whose content is wrong for the current display is
//! answered with an `Exception` echoing the packet.

use std::sync::Arc;

use dot_proto::{ErrorCode, KeyRange, Packet, ParamFlags, Request, Response, WriteRequest};
use tracing::{debug, info, warn};

use crate::connection::{Connection, KeyDelivery};
use crate::server::{Server, lock};

/// Why a request was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    /// Answered with `Error(code)`; the session carries on.
    Error(ErrorCode),
    /// Answered with `Exception(code, type, payload)` echoing the request.
    Exception(ErrorCode),
}

impl From<ErrorCode> for Failure {
    fn from(code: ErrorCode) -> Self {
        Self::Error(code)
    }
}

type HandlerResult = Result<Option<Response>, Failure>;

const ACK: HandlerResult = Ok(Some(Response::Ack));

/// Decode and run one packet. Returns the reply to send, if any.
pub async fn handle_packet(
    server: &Server,
    conn: &Arc<Connection>,
    packet: &Packet,
) -> Option<Response> {
    let result = match Request::decode(packet) {
        Ok(request) => {
            debug!(conn = conn.id(), ptype = ?request.packet_type(), "Handling request");
            handle_request(server, conn, request).await
        }
        Err(e) => {
            warn!(conn = conn.id(), "Rejected packet: {}", e);
            Err(Failure::Exception(e.error_code()))
        }
    };

    match result {
        Ok(reply) => reply,
        Err(Failure::Error(code)) => {
            debug!(conn = conn.id(), ?code, "Request refused");
            Some(Response::Error(code))
        }
        Err(Failure::Exception(code)) => Some(Response::Exception {
            code,
            ptype: packet.ptype,
            payload: packet.payload.clone(),
        }),
    }
}

async fn handle_request(server: &Server, conn: &Arc<Connection>, request: Request) -> HandlerResult {
    match request {
        Request::Version { .. } | Request::Auth { .. } => {
            Err(ErrorCode::IllegalInstruction.into())
        }
        Request::GetDriverName => Ok(Some(Response::DriverName(server.device().driver_name))),
        Request::GetModelIdentifier => {
            let device = server.device();
            let model = if device.online { device.model } else { String::new() };
            Ok(Some(Response::ModelIdentifier(model)))
        }
        Request::GetDisplaySize => {
            let geometry = server.geometry();
            Ok(Some(Response::DisplaySize {
                columns: geometry.columns,
                rows: geometry.rows,
            }))
        }
        Request::EnterTtyMode { path, keycodes } => enter_tty_mode(server, conn, &path, keycodes),
        Request::SetFocus { tty } => set_focus(server, conn, tty),
        Request::LeaveTtyMode => leave_tty_mode(server, conn),
        Request::IgnoreKeyRanges(ranges) => edit_key_ranges(conn, &ranges, false),
        Request::AcceptKeyRanges(ranges) => edit_key_ranges(conn, &ranges, true),
        Request::Write(write) => write_window(server, conn, &write),
        Request::EnterRawMode { driver } => enter_raw_mode(server, conn, &driver).await,
        Request::LeaveRawMode => leave_raw_mode(server, conn),
        Request::Packet(data) => send_raw_packet(server, conn, data).await,
        Request::SuspendDriver { driver } => suspend_driver(server, conn, &driver).await,
        Request::ResumeDriver => resume_driver(server, conn).await,
        Request::ParamValue {
            flags,
            param,
            subparam,
            value,
        } => {
            server.set_param(conn, param, subparam, flags.is_global(), &value)?;
            ACK
        }
        Request::ParamRequest {
            flags,
            param,
            subparam,
        } => param_request(server, conn, flags, param, subparam),
        Request::Synchronize => ACK,
    }
}

// =============================================================================
// Tty mode
// =============================================================================

fn enter_tty_mode(server: &Server, conn: &Connection, path: &[u32], keycodes: bool) -> HandlerResult {
    let device = server.device();
    if keycodes && !device.capabilities.keycodes {
        return Err(ErrorCode::OpNotSupp.into());
    }
    let delivery = if keycodes {
        KeyDelivery::RawKeycodes
    } else {
        KeyDelivery::Commands
    };

    {
        let mut sessions = lock(&server.sessions);
        let was_in_tty = sessions.tree.tty_of(conn.id()).is_some();
        sessions
            .tree
            .enter(conn.id(), path)
            .map_err(|e| Failure::Error(e.error_code()))?;
        if !was_in_tty {
            conn.enter_tty(delivery, device.geometry);
        }
    }
    info!(conn = conn.id(), ?path, ?delivery, "Entered tty mode");
    server.request_flush();
    ACK
}

fn set_focus(server: &Server, conn: &Connection, tty: u32) -> HandlerResult {
    lock(&server.sessions)
        .tree
        .set_focus(conn.id(), tty)
        .map_err(|e| Failure::Error(e.error_code()))?;
    debug!(conn = conn.id(), tty, "Focus set");
    server.request_flush();
    ACK
}

fn leave_tty_mode(server: &Server, conn: &Connection) -> HandlerResult {
    {
        let mut sessions = lock(&server.sessions);
        sessions
            .tree
            .leave(conn.id())
            .map_err(|e| Failure::Error(e.error_code()))?;
        conn.leave_tty();
    }
    info!(conn = conn.id(), "Left tty mode");
    server.request_flush();
    ACK
}

fn edit_key_ranges(conn: &Connection, ranges: &[KeyRange], accept: bool) -> HandlerResult {
    conn.update_ranges(|set| {
        for &range in ranges {
            if accept {
                set.add(range);
            } else {
                set.remove(range);
            }
        }
    })
    .ok_or(Failure::Error(ErrorCode::IllegalInstruction))?;
    ACK
}

fn write_window(server: &Server, conn: &Connection, write: &WriteRequest) -> HandlerResult {
    if lock(&server.ownership).raw_holder() == Some(conn.id()) {
        return Err(ErrorCode::IllegalInstruction.into());
    }
    let geometry = server.geometry();
    conn.with_window(geometry, |window| window.apply(write))
        .ok_or(Failure::Error(ErrorCode::IllegalInstruction))?
        .map_err(Failure::Exception)?;
    server.request_flush();
    ACK
}

// =============================================================================
// Exclusive ownership
// =============================================================================

/// An empty name matches whatever driver is linked.
fn check_driver_name(server: &Server, name: &str) -> Result<(), Failure> {
    if name.is_empty() || name == server.device().driver_name {
        Ok(())
    } else {
        Err(ErrorCode::InvalidParameter.into())
    }
}

async fn enter_raw_mode(server: &Server, conn: &Connection, driver: &str) -> HandlerResult {
    check_driver_name(server, driver)?;
    if !server.device().capabilities.raw_packets {
        return Err(ErrorCode::OpNotSupp.into());
    }
    lock(&server.ownership).enter_raw(conn.id())?;

    if let Err(e) = server.gateway().resume().await {
        warn!(conn = conn.id(), "Failed to open device for raw mode: {}", e);
        lock(&server.ownership).leave_raw(conn.id());
        server.request_flush();
        return Err(ErrorCode::DriverError.into());
    }
    info!(conn = conn.id(), "Entered raw mode");
    ACK
}

fn leave_raw_mode(server: &Server, conn: &Connection) -> HandlerResult {
    if !lock(&server.ownership).leave_raw(conn.id()) {
        return Err(ErrorCode::IllegalInstruction.into());
    }
    info!(conn = conn.id(), "Left raw mode");
    server.request_flush();
    ACK
}

async fn send_raw_packet(server: &Server, conn: &Connection, data: Vec<u8>) -> HandlerResult {
    if lock(&server.ownership).raw_holder() != Some(conn.id()) {
        return Err(ErrorCode::IllegalInstruction.into());
    }
    if let Err(e) = server.gateway().write_packet(data).await {
        warn!(conn = conn.id(), "Raw packet write failed: {}", e);
        return Err(ErrorCode::DriverError.into());
    }
    Ok(None)
}

async fn suspend_driver(server: &Server, conn: &Connection, driver: &str) -> HandlerResult {
    check_driver_name(server, driver)?;
    lock(&server.ownership).enter_suspend(conn.id())?;

    if let Err(e) = server.gateway().suspend().await {
        warn!(conn = conn.id(), "Failed to suspend device: {}", e);
        lock(&server.ownership).leave_suspend(conn.id());
        server.request_flush();
        return Err(ErrorCode::DriverError.into());
    }
    info!(conn = conn.id(), "Driver suspended");
    ACK
}

async fn resume_driver(server: &Server, conn: &Connection) -> HandlerResult {
    if !lock(&server.ownership).leave_suspend(conn.id()) {
        return Err(ErrorCode::IllegalInstruction.into());
    }
    let resumed = server.gateway().resume().await;
    server.request_flush();
    if let Err(e) = resumed {
        warn!(conn = conn.id(), "Failed to resume device: {}", e);
        return Err(ErrorCode::DriverError.into());
    }
    info!(conn = conn.id(), "Driver resumed");
    ACK
}

// =============================================================================
// Parameters
// =============================================================================

fn param_request(
    server: &Server,
    conn: &Connection,
    flags: ParamFlags,
    param: u32,
    subparam: u64,
) -> HandlerResult {
    let global = flags.is_global();
    if flags.contains(ParamFlags::SUBSCRIBE | ParamFlags::UNSUBSCRIBE) {
        return Err(ErrorCode::InvalidParameter.into());
    }

    if flags.contains(ParamFlags::SUBSCRIBE) {
        let self_echo = flags.contains(ParamFlags::SELF);
        server.subscribe_param(conn, param, subparam, global, self_echo)?;
    } else if flags.contains(ParamFlags::UNSUBSCRIBE) {
        server.unsubscribe_param(conn, param, subparam, global)?;
    }

    if flags.contains(ParamFlags::GET) {
        let value = server.get_param(conn, param, subparam, global)?;
        return Ok(Some(Response::ParamValue {
            flags: flags & ParamFlags::GLOBAL,
            param,
            subparam,
            value,
        }));
    }
    ACK
}
