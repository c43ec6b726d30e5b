//! Scripted transport used by executor, worker, and integration tests.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crate::modbus::transport::{Transport, TransportError, TransportResult};
use crate::modbus::types::{AddressRange, RegisterType};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusOp {
    Read { slave_id: u8, range: AddressRange },
    Write { slave_id: u8, range: AddressRange, values: Vec<u16> },
}

#[derive(Debug, Default)]
struct MockState {
    registers: BTreeMap<(u8, RegisterType, u16), u16>,
    read_errors: BTreeMap<(u8, RegisterType, u16), u32>,
    write_errors: BTreeMap<(u8, RegisterType, u16), u32>,
    log: Vec<BusOp>,
    connected: bool,
    connect_fails: u32,
}

/// In-memory register bank with per-register scripted failures. Clones
/// share state so a test can mutate registers while the worker owns the
/// transport.
#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        MockTransport::default()
    }

    pub fn set_register(&self, slave_id: u8, reg_type: RegisterType, number: u16, value: u16) {
        let mut state = self.state.lock().unwrap();
        state.registers.insert((slave_id, reg_type, number), value);
    }

    pub fn register(&self, slave_id: u8, reg_type: RegisterType, number: u16) -> Option<u16> {
        let state = self.state.lock().unwrap();
        state.registers.get(&(slave_id, reg_type, number)).copied()
    }

    /// Make the next `count` reads touching this register fail.
    pub fn fail_reads(&self, slave_id: u8, reg_type: RegisterType, number: u16, count: u32) {
        let mut state = self.state.lock().unwrap();
        state.read_errors.insert((slave_id, reg_type, number), count);
    }

    pub fn fail_writes(&self, slave_id: u8, reg_type: RegisterType, number: u16, count: u32) {
        let mut state = self.state.lock().unwrap();
        state.write_errors.insert((slave_id, reg_type, number), count);
    }

    /// Make the next `count` connection attempts fail.
    pub fn fail_connects(&self, count: u32) {
        self.state.lock().unwrap().connect_fails = count;
    }

    pub fn operations(&self) -> Vec<BusOp> {
        self.state.lock().unwrap().log.clone()
    }

    pub fn clear_operations(&self) {
        self.state.lock().unwrap().log.clear();
    }

    pub fn read_count(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .log
            .iter()
            .filter(|op| matches!(op, BusOp::Read { .. }))
            .count()
    }
}

impl Transport for MockTransport {
    fn connect(&mut self) -> TransportResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.connect_fails > 0 {
            state.connect_fails -= 1;
            return Err(TransportError::Context("scripted connect failure".into()));
        }
        state.connected = true;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.state.lock().unwrap().connected
    }

    fn disconnect(&mut self) {
        self.state.lock().unwrap().connected = false;
    }

    fn read(&mut self, slave_id: u8, range: &AddressRange) -> TransportResult<Vec<u16>> {
        let mut state = self.state.lock().unwrap();
        state.log.push(BusOp::Read {
            slave_id,
            range: *range,
        });
        for number in range.first..=range.last() {
            if let Some(left) = state.read_errors.get_mut(&(slave_id, range.reg_type, number)) {
                if *left > 0 {
                    *left -= 1;
                    return Err(TransportError::Read(format!(
                        "scripted read failure at {slave_id}.{number}"
                    )));
                }
            }
        }
        Ok((range.first..=range.last())
            .map(|number| {
                state
                    .registers
                    .get(&(slave_id, range.reg_type, number))
                    .copied()
                    .unwrap_or(0)
            })
            .collect())
    }

    fn write(
        &mut self,
        slave_id: u8,
        range: &AddressRange,
        values: &[u16],
    ) -> TransportResult<()> {
        let mut state = self.state.lock().unwrap();
        state.log.push(BusOp::Write {
            slave_id,
            range: *range,
            values: values.to_vec(),
        });
        for number in range.first..=range.last() {
            if let Some(left) = state.write_errors.get_mut(&(slave_id, range.reg_type, number)) {
                if *left > 0 {
                    *left -= 1;
                    return Err(TransportError::Write(format!(
                        "scripted write failure at {slave_id}.{number}"
                    )));
                }
            }
        }
        for (i, number) in (range.first..=range.last()).enumerate() {
            state
                .registers
                .insert((slave_id, range.reg_type, number), values[i]);
        }
        Ok(())
    }
}
