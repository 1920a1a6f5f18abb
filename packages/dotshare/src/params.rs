//! Parameter registry.
//!
//! Each [`ParamId`] has a static descriptor: which scopes it may be
//! addressed in, how to read it, how to write it, and whether it is a detail
//! view of a larger parameter (in which case it cannot be watched on its
//! own). The registry itself only keeps the subscriber counters and the
//! few values that live nowhere else.
//!
//! Values are big-endian on the wire: integers as `u32`, flags and dot
//! patterns as one byte, strings as UTF-8.

use std::collections::HashMap;
use std::sync::atomic::Ordering;

use dot_proto::{ErrorCode, PROTOCOL_VERSION, ParamFlags, ParamId, Response};
use tracing::{debug, trace};

use crate::connection::{Connection, Subscription};
use crate::server::{Server, lock, read};

/// Where a parameter may be addressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    LocalOnly,
    GlobalOnly,
    Both,
}

impl Scope {
    pub fn permits(self, global: bool) -> bool {
        match self {
            Self::LocalOnly => !global,
            Self::GlobalOnly => global,
            Self::Both => true,
        }
    }
}

/// Settings owned by the registry itself.
#[derive(Debug, Clone, Default)]
pub struct GlobalValues {
    pub clipboard: String,
    pub literary: bool,
}

/// State behind the registry lock.
#[derive(Debug, Default)]
pub struct ParamRegistry {
    subscribers: HashMap<(ParamId, bool), usize>,
    pub(crate) values: GlobalValues,
}

impl ParamRegistry {
    /// Whether anyone watches `param` in this scope.
    pub fn is_watched(&self, param: ParamId, global: bool) -> bool {
        self.subscribers.get(&(param, global)).is_some_and(|n| *n > 0)
    }

    pub fn subscriber_count(&self, param: ParamId, global: bool) -> usize {
        self.subscribers.get(&(param, global)).copied().unwrap_or(0)
    }

    pub(crate) fn add_subscriber(&mut self, param: ParamId, global: bool) {
        *self.subscribers.entry((param, global)).or_default() += 1;
    }

    pub(crate) fn remove_subscriber(&mut self, param: ParamId, global: bool) {
        if let Some(n) = self.subscribers.get_mut(&(param, global)) {
            *n = n.saturating_sub(1);
            if *n == 0 {
                self.subscribers.remove(&(param, global));
            }
        }
    }
}

/// What a reader or writer gets to work with. The registry lock is held.
pub struct ParamContext<'a> {
    pub server: &'a Server,
    /// The requesting connection, absent for changes the core reports.
    pub conn: Option<&'a Connection>,
    pub values: &'a mut GlobalValues,
}

type Reader = fn(&ParamContext<'_>, u64) -> Vec<u8>;
type Writer = fn(&mut ParamContext<'_>, u64, &[u8]) -> Result<(), ErrorCode>;

pub struct ParamDescriptor {
    pub id: ParamId,
    pub scope: Scope,
    reader: Option<Reader>,
    writer: Option<Writer>,
    /// Set for detail views of an aggregate that is watched instead.
    pub root: Option<ParamId>,
}

impl ParamDescriptor {
    fn new(id: ParamId, scope: Scope) -> Self {
        Self {
            id,
            scope,
            reader: None,
            writer: None,
            root: None,
        }
    }

    fn read(mut self, reader: Reader) -> Self {
        self.reader = Some(reader);
        self
    }

    fn write(mut self, writer: Writer) -> Self {
        self.writer = Some(writer);
        self
    }

    fn detail_of(mut self, root: ParamId) -> Self {
        self.root = Some(root);
        self
    }

    pub fn is_readable(&self) -> bool {
        self.reader.is_some()
    }
}

pub fn descriptor(id: ParamId) -> ParamDescriptor {
    use Scope::*;
    match id {
        ParamId::ServerVersion => ParamDescriptor::new(id, Both).read(read_server_version),
        ParamId::ClientPriority => ParamDescriptor::new(id, LocalOnly)
            .read(read_client_priority)
            .write(write_client_priority),
        ParamId::RetainDots => ParamDescriptor::new(id, LocalOnly)
            .read(read_retain_dots)
            .write(write_retain_dots),
        ParamId::DriverName => ParamDescriptor::new(id, GlobalOnly).read(read_driver_name),
        ParamId::DeviceModel => ParamDescriptor::new(id, GlobalOnly).read(read_device_model),
        ParamId::DisplaySize => ParamDescriptor::new(id, GlobalOnly).read(read_display_size),
        ParamId::DisplayColumns => ParamDescriptor::new(id, GlobalOnly)
            .read(read_display_columns)
            .detail_of(ParamId::DisplaySize),
        ParamId::DisplayRows => ParamDescriptor::new(id, GlobalOnly)
            .read(read_display_rows)
            .detail_of(ParamId::DisplaySize),
        ParamId::DeviceOnline => ParamDescriptor::new(id, GlobalOnly).read(read_device_online),
        ParamId::CursorDots => ParamDescriptor::new(id, GlobalOnly)
            .read(read_cursor_dots)
            .write(write_cursor_dots),
        ParamId::CursorBlinkPeriod => ParamDescriptor::new(id, GlobalOnly)
            .read(read_cursor_blink)
            .write(write_cursor_blink),
        ParamId::ComputerBrailleCellSize => ParamDescriptor::new(id, GlobalOnly)
            .read(read_cell_size)
            .write(write_cell_size),
        ParamId::LiteraryBraille => ParamDescriptor::new(id, GlobalOnly)
            .read(read_literary)
            .write(write_literary),
        ParamId::ClipboardContent => ParamDescriptor::new(id, GlobalOnly)
            .read(read_clipboard)
            .write(write_clipboard),
        ParamId::RenderedCells => ParamDescriptor::new(id, GlobalOnly).read(read_rendered),
    }
}

// =============================================================================
// Readers and writers
// =============================================================================

fn u32_value(value: &[u8]) -> Result<u32, ErrorCode> {
    let bytes: [u8; 4] = value.try_into().map_err(|_| ErrorCode::InvalidParameter)?;
    Ok(u32::from_be_bytes(bytes))
}

fn u8_value(value: &[u8]) -> Result<u8, ErrorCode> {
    match value {
        [b] => Ok(*b),
        _ => Err(ErrorCode::InvalidParameter),
    }
}

fn bool_value(value: &[u8]) -> Result<bool, ErrorCode> {
    match u8_value(value)? {
        0 => Ok(false),
        1 => Ok(true),
        _ => Err(ErrorCode::InvalidParameter),
    }
}

fn read_server_version(_: &ParamContext<'_>, _: u64) -> Vec<u8> {
    PROTOCOL_VERSION.to_be_bytes().to_vec()
}

fn read_client_priority(ctx: &ParamContext<'_>, _: u64) -> Vec<u8> {
    let Some(conn) = ctx.conn else {
        return Vec::new();
    };
    lock(&ctx.server.sessions)
        .tree
        .priority(conn.id())
        .map(|p| p.to_be_bytes().to_vec())
        .unwrap_or_default()
}

/// Highest priority a client may ask for.
pub const MAX_PRIORITY: u32 = 100;

fn write_client_priority(ctx: &mut ParamContext<'_>, _: u64, value: &[u8]) -> Result<(), ErrorCode> {
    let priority = u32_value(value)?;
    if priority > MAX_PRIORITY {
        return Err(ErrorCode::InvalidParameter);
    }
    let conn = ctx.conn.ok_or(ErrorCode::InvalidParameter)?;
    lock(&ctx.server.sessions)
        .tree
        .set_priority(conn.id(), priority)
        .map_err(|e| e.error_code())?;
    debug!(conn = conn.id(), priority, "Client priority changed");
    ctx.server.request_flush();
    Ok(())
}

fn read_retain_dots(ctx: &ParamContext<'_>, _: u64) -> Vec<u8> {
    ctx.conn
        .map(|c| vec![u8::from(c.retains_dots())])
        .unwrap_or_default()
}

fn write_retain_dots(ctx: &mut ParamContext<'_>, _: u64, value: &[u8]) -> Result<(), ErrorCode> {
    let retain = bool_value(value)?;
    ctx.conn
        .ok_or(ErrorCode::InvalidParameter)?
        .set_retain_dots(retain);
    Ok(())
}

fn read_driver_name(ctx: &ParamContext<'_>, _: u64) -> Vec<u8> {
    read(&ctx.server.device).driver_name.clone().into_bytes()
}

fn read_device_model(ctx: &ParamContext<'_>, _: u64) -> Vec<u8> {
    let device = read(&ctx.server.device);
    if !device.online {
        return Vec::new();
    }
    device.model.clone().into_bytes()
}

fn read_display_size(ctx: &ParamContext<'_>, _: u64) -> Vec<u8> {
    let g = ctx.server.geometry();
    let mut out = g.columns.to_be_bytes().to_vec();
    out.extend_from_slice(&g.rows.to_be_bytes());
    out
}

fn read_display_columns(ctx: &ParamContext<'_>, _: u64) -> Vec<u8> {
    ctx.server.geometry().columns.to_be_bytes().to_vec()
}

fn read_display_rows(ctx: &ParamContext<'_>, _: u64) -> Vec<u8> {
    ctx.server.geometry().rows.to_be_bytes().to_vec()
}

fn read_device_online(ctx: &ParamContext<'_>, _: u64) -> Vec<u8> {
    vec![u8::from(read(&ctx.server.device).online)]
}

fn read_cursor_dots(ctx: &ParamContext<'_>, _: u64) -> Vec<u8> {
    vec![ctx.server.cursor_dots.load(Ordering::Relaxed)]
}

fn write_cursor_dots(ctx: &mut ParamContext<'_>, _: u64, value: &[u8]) -> Result<(), ErrorCode> {
    ctx.server
        .cursor_dots
        .store(u8_value(value)?, Ordering::Relaxed);
    ctx.server.request_flush();
    Ok(())
}

fn read_cursor_blink(ctx: &ParamContext<'_>, _: u64) -> Vec<u8> {
    ctx.server
        .cursor_blink_ms
        .load(Ordering::Relaxed)
        .to_be_bytes()
        .to_vec()
}

fn write_cursor_blink(ctx: &mut ParamContext<'_>, _: u64, value: &[u8]) -> Result<(), ErrorCode> {
    ctx.server
        .cursor_blink_ms
        .store(u32_value(value)?, Ordering::Relaxed);
    ctx.server.request_flush();
    Ok(())
}

fn read_cell_size(ctx: &ParamContext<'_>, _: u64) -> Vec<u8> {
    vec![ctx.server.cell_size.load(Ordering::Relaxed)]
}

fn write_cell_size(ctx: &mut ParamContext<'_>, _: u64, value: &[u8]) -> Result<(), ErrorCode> {
    let size = u8_value(value)?;
    if size != 6 && size != 8 {
        return Err(ErrorCode::InvalidParameter);
    }
    ctx.server.cell_size.store(size, Ordering::Relaxed);
    ctx.server.request_flush();
    Ok(())
}

fn read_literary(ctx: &ParamContext<'_>, _: u64) -> Vec<u8> {
    vec![u8::from(ctx.values.literary)]
}

fn write_literary(ctx: &mut ParamContext<'_>, _: u64, value: &[u8]) -> Result<(), ErrorCode> {
    ctx.values.literary = bool_value(value)?;
    Ok(())
}

fn read_clipboard(ctx: &ParamContext<'_>, _: u64) -> Vec<u8> {
    ctx.values.clipboard.clone().into_bytes()
}

fn write_clipboard(ctx: &mut ParamContext<'_>, _: u64, value: &[u8]) -> Result<(), ErrorCode> {
    let text = std::str::from_utf8(value).map_err(|_| ErrorCode::InvalidParameter)?;
    ctx.values.clipboard = text.to_string();
    Ok(())
}

fn read_rendered(ctx: &ParamContext<'_>, _: u64) -> Vec<u8> {
    lock(&ctx.server.rendered).clone()
}

// =============================================================================
// Registry operations
// =============================================================================

fn lookup(param: u32) -> Result<ParamDescriptor, ErrorCode> {
    ParamId::from_code(param)
        .map(descriptor)
        .ok_or(ErrorCode::InvalidParameter)
}

impl Server {
    /// Read a parameter on behalf of `conn`.
    pub fn get_param(
        &self,
        conn: &Connection,
        param: u32,
        subparam: u64,
        global: bool,
    ) -> Result<Vec<u8>, ErrorCode> {
        let desc = lookup(param)?;
        if !desc.scope.permits(global) {
            return Err(ErrorCode::InvalidParameter);
        }
        let reader = desc.reader.ok_or(ErrorCode::OpNotSupp)?;
        let mut registry = lock(&self.params);
        let ctx = ParamContext {
            server: self,
            conn: Some(conn),
            values: &mut registry.values,
        };
        Ok(reader(&ctx, subparam))
    }

    /// Write a parameter on behalf of `conn` and tell whoever watches it.
    pub fn set_param(
        &self,
        conn: &Connection,
        param: u32,
        subparam: u64,
        global: bool,
        value: &[u8],
    ) -> Result<(), ErrorCode> {
        let desc = lookup(param)?;
        if !desc.scope.permits(global) {
            return Err(ErrorCode::InvalidParameter);
        }
        let writer = desc.writer.ok_or(ErrorCode::ReadOnlyParameter)?;

        let mut guard = lock(&self.params);
        let registry = &mut *guard;
        let watched = registry.is_watched(desc.id, global);
        let mut ctx = ParamContext {
            server: self,
            conn: Some(conn),
            values: &mut registry.values,
        };
        writer(&mut ctx, subparam, value)?;
        debug!(conn = conn.id(), param = ?desc.id, global, "Parameter set");

        if watched {
            let current = match desc.reader {
                Some(reader) => reader(&ctx, subparam),
                None => value.to_vec(),
            };
            self.notify_locked(registry, desc.id, subparam, global, &current, Some(conn));
        }
        Ok(())
    }

    /// Start watching a parameter. Detail views are refused.
    pub fn subscribe_param(
        &self,
        conn: &Connection,
        param: u32,
        subparam: u64,
        global: bool,
        self_echo: bool,
    ) -> Result<(), ErrorCode> {
        let desc = lookup(param)?;
        if !desc.scope.permits(global) || desc.root.is_some() {
            return Err(ErrorCode::InvalidParameter);
        }
        let mut registry = lock(&self.params);
        let new = conn.subscribe(Subscription {
            param: desc.id,
            subparam,
            global,
            self_echo,
        });
        if new {
            registry.add_subscriber(desc.id, global);
        }
        Ok(())
    }

    pub fn unsubscribe_param(
        &self,
        conn: &Connection,
        param: u32,
        subparam: u64,
        global: bool,
    ) -> Result<(), ErrorCode> {
        let desc = lookup(param)?;
        if desc.root.is_some() {
            return Err(ErrorCode::InvalidParameter);
        }
        let mut registry = lock(&self.params);
        if conn.unsubscribe(desc.id, subparam, global) {
            registry.remove_subscriber(desc.id, global);
        }
        Ok(())
    }

    /// Report a changed value to watchers.
    ///
    /// Global changes reach every connection with a matching global watch.
    /// Local changes only concern `origin`. The originator itself is told
    /// only if its watch asked for self-echo.
    pub fn notify_changed(
        &self,
        param: ParamId,
        subparam: u64,
        global: bool,
        value: &[u8],
        origin: Option<&Connection>,
    ) {
        let registry = lock(&self.params);
        self.notify_locked(&registry, param, subparam, global, value, origin);
    }

    /// Report a global change whose value is computed only if someone
    /// watches it.
    pub(crate) fn notify_global(&self, param: ParamId) {
        let mut guard = lock(&self.params);
        let registry = &mut *guard;
        if !registry.is_watched(param, true) {
            return;
        }
        let Some(reader) = descriptor(param).reader else {
            return;
        };
        let ctx = ParamContext {
            server: self,
            conn: None,
            values: &mut registry.values,
        };
        let value = reader(&ctx, 0);
        self.notify_locked(registry, param, 0, true, &value, None);
    }

    fn notify_locked(
        &self,
        registry: &ParamRegistry,
        param: ParamId,
        subparam: u64,
        global: bool,
        value: &[u8],
        origin: Option<&Connection>,
    ) {
        if !registry.is_watched(param, global) {
            return;
        }

        let update = Response::ParamUpdate {
            flags: if global {
                ParamFlags::GLOBAL
            } else {
                ParamFlags::empty()
            },
            param: param.code(),
            subparam,
            value: value.to_vec(),
        };
        let wants = |conn: &Connection| {
            conn.subscription(param, subparam, global).is_some_and(|sub| {
                origin.is_none_or(|o| o.id() != conn.id()) || sub.self_echo
            })
        };

        let deliver = |conn: &Connection| {
            if conn.try_send(update.clone()) {
                self.metrics().notification_sent();
            } else {
                self.metrics().event_dropped();
            }
        };

        if global {
            let sessions = lock(&self.sessions);
            for id in sessions.tree.all_members() {
                if let Some(conn) = sessions.get(id) {
                    if wants(conn.as_ref()) {
                        deliver(conn.as_ref());
                    }
                }
            }
        } else if let Some(conn) = origin.filter(|c| wants(c)) {
            deliver(conn);
        }
        trace!(?param, global, "Parameter change delivered");
    }
}
