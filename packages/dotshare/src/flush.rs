//! Output composition and the rest of the core's callbacks.

use std::sync::atomic::Ordering;

use dot_driver::{CoreHooks, DeviceInfo, DriverError, FlushAction, Geometry, KeyEvent};
use dot_proto::keys;
use dot_proto::{ErrorCode, PacketType, ParamId, Response};
use tracing::{debug, info, trace, warn};

use crate::connection::KeyDelivery;
use crate::server::{Server, lock, write};

impl Server {
    /// Decide what the display shows.
    ///
    /// The deepest filler on the focused path gets the display, unless the
    /// owning application is using it or a client holds it exclusively.
    /// With nobody to show, an idle core releases the device.
    pub fn compose(&self, geometry: Geometry) -> FlushAction {
        if self.core_active() {
            return FlushAction::Idle;
        }

        let cell_size = self.cell_size.load(Ordering::Relaxed);
        let cursor_dots = self.cursor_dots.load(Ordering::Relaxed);
        let show_cursor = self.cursor_visible();

        let cells = {
            let sessions = lock(&self.sessions);
            if !lock(&self.ownership).is_free() {
                return FlushAction::Idle;
            }
            let filler = sessions.tree.filler(|id| {
                sessions.get(id).is_some_and(|conn| {
                    conn.with_window(geometry, |w| w.is_filled())
                        .unwrap_or(false)
                })
            });
            filler.and_then(|id| sessions.get(id)).and_then(|conn| {
                conn.with_window(geometry, |w| w.render(cell_size, cursor_dots, show_cursor))
            })
        };

        match cells {
            Some(cells) => {
                self.record_rendered(&cells);
                FlushAction::Write(cells)
            }
            None => FlushAction::Suspend,
        }
    }

    fn cursor_visible(&self) -> bool {
        let period = u128::from(self.cursor_blink_ms.load(Ordering::Relaxed));
        period == 0 || (self.started.elapsed().as_millis() / period) % 2 == 0
    }

    fn record_rendered(&self, cells: &[u8]) {
        let changed = {
            let mut rendered = lock(&self.rendered);
            if rendered.as_slice() == cells {
                false
            } else {
                *rendered = cells.to_vec();
                true
            }
        };
        if changed {
            self.notify_global(ParamId::RenderedCells);
        }
    }
}

impl CoreHooks for Server {
    fn compose(&self, geometry: Geometry) -> FlushAction {
        Server::compose(self, geometry)
    }

    fn raw_mode(&self) -> bool {
        lock(&self.ownership).raw_holder().is_some()
    }

    fn key_pressed(&self, event: KeyEvent) -> bool {
        self.handle_key(event)
    }

    fn packet_received(&self, data: Vec<u8>) {
        let Some(id) = lock(&self.ownership).raw_holder() else {
            trace!("Raw packet with no raw holder dropped");
            return;
        };
        if let Some(conn) = self.connection(id) {
            if !conn.try_send(Response::Packet(data)) {
                self.metrics().event_dropped();
            }
        }
    }

    fn device_changed(&self, info: &DeviceInfo) {
        let old = std::mem::replace(&mut *write(&self.device), info.clone());
        debug!(online = info.online, columns = info.geometry.columns, rows = info.geometry.rows, "Device changed");

        if old.driver_name != info.driver_name {
            self.notify_global(ParamId::DriverName);
        }
        if old.model != info.model || old.online != info.online {
            self.notify_global(ParamId::DeviceModel);
        }
        if old.geometry != info.geometry {
            info!(columns = info.geometry.columns, rows = info.geometry.rows, "Display size changed");
            self.notify_global(ParamId::DisplaySize);
            self.request_flush();
        }
        if old.online != info.online {
            self.notify_global(ParamId::DeviceOnline);
        }
    }

    fn device_failed(&self, error: &DriverError) {
        warn!("Device failed: {}", error);
        let was_online = {
            let mut device = write(&self.device);
            std::mem::replace(&mut device.online, false)
        };
        if was_online {
            self.notify_global(ParamId::DeviceOnline);
        }

        let holder = lock(&self.ownership).raw_holder();
        if let Some(conn) = holder.and_then(|id| self.connection(id)) {
            conn.try_send(Response::Exception {
                code: ErrorCode::DriverError,
                ptype: PacketType::Packet.code(),
                payload: Vec::new(),
            });
        }
        self.broadcast_key(keys::OFFLINE, KeyDelivery::Commands);
    }

    fn device_recovered(&self) {
        info!("Device back online");
        let was_online = {
            let mut device = write(&self.device);
            std::mem::replace(&mut device.online, true)
        };
        if !was_online {
            self.notify_global(ParamId::DeviceOnline);
        }
        self.broadcast_key(keys::ONLINE, KeyDelivery::Commands);
        self.request_flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::server::test_support::*;
    use dot_proto::WriteRequest;

    fn write_text(h: &Harness, conn: &crate::connection::Connection, text: &str) {
        let geometry = h.server.geometry();
        conn.with_window(geometry, |w| {
            w.apply(&WriteRequest {
                text: Some(text.into()),
                ..Default::default()
            })
        })
        .unwrap()
        .unwrap();
    }

    #[tokio::test]
    async fn nobody_filling_releases_the_device() {
        let h = Harness::new(ServerConfig::default());
        h.server.request_flush();
        eventually(|| !h.display.is_open()).await;
        assert_eq!(h.server.compose(Geometry::new(8, 1)), FlushAction::Suspend);
        h.stop().await;
    }

    #[tokio::test]
    async fn focused_filler_is_shown() {
        let h = Harness::new(ServerConfig::default());
        let (a, _rx_a) = h.connect();
        let (b, _rx_b) = h.connect();
        {
            let mut s = lock(&h.server.sessions);
            s.tree.enter(a.id(), &[1]).unwrap();
            s.tree.enter(b.id(), &[1, 2]).unwrap();
        }
        let g = h.server.geometry();
        a.enter_tty(KeyDelivery::Commands, g);
        b.enter_tty(KeyDelivery::Commands, g);
        write_text(&h, &a, "a");
        write_text(&h, &b, "b");

        h.server.request_flush();
        eventually(|| h.display.cells().first() == Some(&0x01)).await;

        lock(&h.server.sessions).tree.set_focus(a.id(), 2).unwrap();
        h.server.request_flush();
        eventually(|| h.display.cells().first() == Some(&0x03)).await;
        assert_eq!(*lock(&h.server.rendered), h.display.cells());
        h.stop().await;
    }

    #[tokio::test]
    async fn exclusive_holder_or_active_core_leaves_display_alone() {
        let h = Harness::new(ServerConfig::default());
        let (a, _rx) = h.connect();
        let g = Geometry::new(8, 1);
        lock(&h.server.sessions).tree.enter(a.id(), &[1]).unwrap();
        a.enter_tty(KeyDelivery::Commands, g);
        write_text(&h, &a, "x");
        assert!(matches!(h.server.compose(g), FlushAction::Write(_)));

        lock(&h.server.ownership).enter_raw(a.id()).unwrap();
        assert_eq!(h.server.compose(g), FlushAction::Idle);
        lock(&h.server.ownership).leave_raw(a.id());

        h.server.set_core_active(true);
        assert_eq!(h.server.compose(g), FlushAction::Idle);
        h.stop().await;
    }

    #[tokio::test]
    async fn disabled_priority_never_fills() {
        let h = Harness::new(ServerConfig::default());
        let (a, _rx) = h.connect();
        let g = Geometry::new(8, 1);
        {
            let mut s = lock(&h.server.sessions);
            s.tree.enter(a.id(), &[1]).unwrap();
            s.tree.set_priority(a.id(), 0).unwrap();
        }
        a.enter_tty(KeyDelivery::Commands, g);
        write_text(&h, &a, "x");
        assert_eq!(h.server.compose(g), FlushAction::Suspend);
        h.stop().await;
    }

    #[tokio::test]
    async fn read_failure_notifies_raw_holder_and_broadcasts() {
        let h = Harness::holding_display(ServerConfig::default());
        let (raw, mut rx_raw) = h.connect();
        let (watcher, mut rx_watch) = h.connect();
        lock(&h.server.sessions).tree.enter(watcher.id(), &[1]).unwrap();
        watcher.enter_tty(KeyDelivery::Commands, Geometry::new(8, 1));
        watcher.update_ranges(|r| {
            r.add(dot_proto::KeyRange::single(keys::OFFLINE));
            r.add(dot_proto::KeyRange::single(keys::ONLINE));
        });
        eventually(|| h.server.device().online).await;
        lock(&h.server.ownership).enter_raw(raw.id()).unwrap();

        h.display.fail_reads(1);
        eventually(|| !rx_raw.is_empty()).await;
        assert!(matches!(
            rx_raw.try_recv().unwrap(),
            Response::Exception { code: ErrorCode::DriverError, .. }
        ));
        eventually(|| rx_watch.len() >= 2).await;
        assert_eq!(rx_watch.try_recv().unwrap(), Response::Key(keys::OFFLINE));
        assert_eq!(rx_watch.try_recv().unwrap(), Response::Key(keys::ONLINE));
        h.stop().await;
    }
}
