//! In-memory display used when no hardware driver is linked, and by tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, trace};

use crate::driver::{BrailleDriver, Capabilities, Geometry, KeyEvent};
use crate::error::DriverError;

#[derive(Debug, Default)]
struct VirtualState {
    open: bool,
    geometry: Geometry,
    cells: Vec<u8>,
    pending_keys: VecDeque<KeyEvent>,
    pending_packets: VecDeque<Vec<u8>>,
    sent_packets: Vec<Vec<u8>>,
    failing_reads: usize,
    failing_constructs: usize,
    failing_resets: usize,
    constructs: usize,
    destructs: usize,
    resets: usize,
    window_writes: usize,
}

/// A braille display that lives in memory.
pub struct VirtualDriver {
    name: String,
    model: String,
    capabilities: Capabilities,
    state: Arc<Mutex<VirtualState>>,
}

/// Test/inspection handle onto a [`VirtualDriver`]'s state.
#[derive(Clone)]
pub struct VirtualDisplay {
    state: Arc<Mutex<VirtualState>>,
}

fn lock(state: &Mutex<VirtualState>) -> MutexGuard<'_, VirtualState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl VirtualDriver {
    /// Create a driver with both raw packets and key codes supported.
    pub fn new(name: &str, model: &str, geometry: Geometry) -> (Self, VirtualDisplay) {
        Self::with_capabilities(
            name,
            model,
            geometry,
            Capabilities {
                raw_packets: true,
                keycodes: true,
            },
        )
    }

    pub fn with_capabilities(
        name: &str,
        model: &str,
        geometry: Geometry,
        capabilities: Capabilities,
    ) -> (Self, VirtualDisplay) {
        let state = Arc::new(Mutex::new(VirtualState {
            geometry,
            ..Default::default()
        }));
        let driver = Self {
            name: name.to_string(),
            model: model.to_string(),
            capabilities,
            state: state.clone(),
        };
        (driver, VirtualDisplay { state })
    }
}

impl BrailleDriver for VirtualDriver {
    fn name(&self) -> &str {
        &self.name
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    fn construct(&mut self) -> Result<Geometry, DriverError> {
        let mut state = lock(&self.state);
        if state.failing_constructs > 0 {
            state.failing_constructs -= 1;
            return Err(DriverError::ConstructFailed("virtual device unplugged".into()));
        }
        state.open = true;
        state.constructs += 1;
        state.cells = vec![0; state.geometry.cells()];
        debug!(driver = %self.name, "virtual display opened");
        Ok(state.geometry)
    }

    fn destruct(&mut self) {
        let mut state = lock(&self.state);
        if state.open {
            state.open = false;
            state.destructs += 1;
            debug!(driver = %self.name, "virtual display closed");
        }
    }

    fn reset(&mut self) -> Result<(), DriverError> {
        let mut state = lock(&self.state);
        state.resets += 1;
        if state.failing_resets > 0 {
            state.failing_resets -= 1;
            return Err(DriverError::Io("virtual reset failed".into()));
        }
        Ok(())
    }

    fn geometry(&self) -> Geometry {
        lock(&self.state).geometry
    }

    fn read_command(&mut self) -> Result<Option<KeyEvent>, DriverError> {
        let mut state = lock(&self.state);
        if state.failing_reads > 0 {
            state.failing_reads -= 1;
            return Err(DriverError::Io("virtual read failed".into()));
        }
        Ok(state.pending_keys.pop_front())
    }

    fn read_packet(&mut self) -> Result<Option<Vec<u8>>, DriverError> {
        let mut state = lock(&self.state);
        if state.failing_reads > 0 {
            state.failing_reads -= 1;
            return Err(DriverError::Io("virtual read failed".into()));
        }
        Ok(state.pending_packets.pop_front())
    }

    fn write_packet(&mut self, data: &[u8]) -> Result<(), DriverError> {
        let mut state = lock(&self.state);
        if !state.open {
            return Err(DriverError::NotConstructed);
        }
        state.sent_packets.push(data.to_vec());
        Ok(())
    }

    fn write_window(&mut self, cells: &[u8]) -> Result<(), DriverError> {
        let mut state = lock(&self.state);
        if !state.open {
            return Err(DriverError::NotConstructed);
        }
        trace!(cells = cells.len(), "virtual display updated");
        state.cells = cells.to_vec();
        state.window_writes += 1;
        Ok(())
    }
}

impl VirtualDisplay {
    /// Queue a key press for the core to read.
    pub fn press(&self, event: KeyEvent) {
        lock(&self.state).pending_keys.push_back(event);
    }

    /// Queue a raw packet for the core to read.
    pub fn inject_packet(&self, data: Vec<u8>) {
        lock(&self.state).pending_packets.push_back(data);
    }

    /// Make the next `n` reads fail.
    pub fn fail_reads(&self, n: usize) {
        lock(&self.state).failing_reads = n;
    }

    /// Make the next `n` opens fail.
    pub fn fail_constructs(&self, n: usize) {
        lock(&self.state).failing_constructs = n;
    }

    /// Make the next `n` resets fail.
    pub fn fail_resets(&self, n: usize) {
        lock(&self.state).failing_resets = n;
    }

    pub fn resize(&self, geometry: Geometry) {
        lock(&self.state).geometry = geometry;
    }

    pub fn is_open(&self) -> bool {
        lock(&self.state).open
    }

    pub fn cells(&self) -> Vec<u8> {
        lock(&self.state).cells.clone()
    }

    pub fn sent_packets(&self) -> Vec<Vec<u8>> {
        lock(&self.state).sent_packets.clone()
    }

    pub fn construct_count(&self) -> usize {
        lock(&self.state).constructs
    }

    pub fn destruct_count(&self) -> usize {
        lock(&self.state).destructs
    }

    pub fn reset_count(&self) -> usize {
        lock(&self.state).resets
    }

    pub fn window_writes(&self) -> usize {
        lock(&self.state).window_writes
    }
}
