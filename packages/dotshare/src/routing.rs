//! Key and command routing.

use std::sync::Arc;

use dot_driver::KeyEvent;
use dot_proto::Response;
use dot_proto::keys::{self, KeyCode, blk};
use tracing::{debug, trace};

use crate::cells;
use crate::connection::{Connection, KeyDelivery};
use crate::server::{Server, lock};

impl Server {
    /// The one connection that gets `code`, if any.
    pub fn route_key(&self, code: KeyCode, delivery: KeyDelivery) -> Option<Arc<Connection>> {
        let sessions = lock(&self.sessions);
        let id = sessions.tree.route(|id| {
            sessions
                .get(id)
                .is_some_and(|conn| conn.accepts(code, delivery))
        })?;
        sessions.get(id).cloned()
    }

    /// Deliver `code` to every matching connection anywhere in the tty tree.
    /// Returns how many got it.
    pub fn broadcast_key(&self, code: KeyCode, delivery: KeyDelivery) -> usize {
        let recipients: Vec<Arc<Connection>> = {
            let sessions = lock(&self.sessions);
            sessions
                .tree
                .tty_members()
                .into_iter()
                .filter_map(|id| sessions.get(id).cloned())
                .filter(|conn| conn.accepts(code, delivery))
                .collect()
        };
        let mut delivered = 0;
        for conn in recipients {
            if self.deliver_key(&conn, code, delivery) {
                delivered += 1;
            }
        }
        debug!(code = format_args!("{code:#x}"), delivered, "Key broadcast");
        delivered
    }

    /// Offer a key from the device to clients: first as a raw key code,
    /// then as a command. Returns `false` if nobody took it.
    pub fn handle_key(&self, event: KeyEvent) -> bool {
        let keycodes = self.device().capabilities.keycodes;
        let mut routes = Vec::with_capacity(2);
        if keycodes {
            routes.push((event.keycode, KeyDelivery::RawKeycodes));
        }
        if let Some(command) = event.command {
            routes.push((command, KeyDelivery::Commands));
        }

        for (code, delivery) in routes {
            if let Some(conn) = self.route_key(code, delivery) {
                if self.deliver_key(&conn, code, delivery) {
                    self.metrics().key_routed();
                    return true;
                }
            }
        }
        self.metrics().key_unrouted();
        false
    }

    fn deliver_key(&self, conn: &Connection, code: KeyCode, delivery: KeyDelivery) -> bool {
        let code = match delivery {
            KeyDelivery::Commands if !conn.retains_dots() => dots_to_symbol(code),
            _ => code,
        };
        trace!(conn = conn.id(), code = format_args!("{code:#x}"), "Delivering key");
        if conn.try_send(Response::Key(code)) {
            true
        } else {
            self.metrics().event_dropped();
            false
        }
    }
}

/// Turn a pass-dots command into the character those dots stand for.
fn dots_to_symbol(code: KeyCode) -> KeyCode {
    if !keys::is_command(code) || keys::command_block(code) != blk::PASSDOTS {
        return code;
    }
    let dots = (keys::command_arg(code) & 0xFF) as u8;
    keys::symbol(cells::cell_to_char(dots)) | KeyCode::from(keys::flags(code))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::server::test_support::*;
    use dot_driver::Geometry;
    use dot_proto::keys::{cmd, command};

    #[test]
    fn pass_dots_become_symbols() {
        let code = command(blk::PASSDOTS, 0x01) | 0x4;
        assert_eq!(dots_to_symbol(code), keys::symbol('a') | 0x4);
        let lnup = command(blk::BASIC, cmd::LNUP);
        assert_eq!(dots_to_symbol(lnup), lnup);
    }

    #[tokio::test]
    async fn routing_prefers_shallow_until_focused() {
        let h = Harness::holding_display(ServerConfig::default());
        let (a, mut rx_a) = h.connect();
        let (b, mut rx_b) = h.connect();
        {
            let mut s = lock(&h.server.sessions);
            s.tree.enter(a.id(), &[1]).unwrap();
            s.tree.enter(b.id(), &[1, 2]).unwrap();
        }
        a.enter_tty(KeyDelivery::Commands, Geometry::new(8, 1));
        b.enter_tty(KeyDelivery::Commands, Geometry::new(8, 1));

        let lnup = command(blk::BASIC, cmd::LNUP);
        let event = KeyEvent {
            keycode: 7,
            command: Some(lnup),
        };
        assert!(h.server.handle_key(event));
        assert!(h.server.handle_key(event));
        assert_eq!(rx_a.try_recv().unwrap(), Response::Key(lnup));
        assert_eq!(rx_a.try_recv().unwrap(), Response::Key(lnup));
        assert!(rx_b.try_recv().is_err());

        a.update_ranges(|r| r.remove(dot_proto::KeyRange::single(lnup)));
        assert!(!h.server.handle_key(event));
        h.stop().await;
    }

    #[tokio::test]
    async fn broadcast_reaches_every_node() {
        let h = Harness::holding_display(ServerConfig::default());
        let (a, mut rx_a) = h.connect();
        let (b, mut rx_b) = h.connect();
        let (c, mut rx_c) = h.connect();
        {
            let mut s = lock(&h.server.sessions);
            s.tree.enter(a.id(), &[1]).unwrap();
            s.tree.enter(b.id(), &[9, 4]).unwrap();
        }
        for conn in [&a, &b] {
            conn.enter_tty(KeyDelivery::Commands, Geometry::new(8, 1));
            conn.update_ranges(|r| r.add(dot_proto::KeyRange::single(keys::OFFLINE)));
        }
        c.enter_tty(KeyDelivery::Commands, Geometry::new(8, 1));

        assert_eq!(h.server.broadcast_key(keys::OFFLINE, KeyDelivery::Commands), 2);
        assert_eq!(rx_a.try_recv().unwrap(), Response::Key(keys::OFFLINE));
        assert_eq!(rx_b.try_recv().unwrap(), Response::Key(keys::OFFLINE));
        assert!(rx_c.try_recv().is_err());
        h.stop().await;
    }
}
