/*!
Scripted Modbus devices

`MockFieldBus` stands in for the Modbus/TCP bus. Each host has a register
image (one `u16` table shared by all four read kinds, non-zero reading as a
set bit) plus knobs to refuse connects or fail reads.
*/

use async_trait::async_trait;
use forgeedge_gateway::field::{
    DeviceEndpoint, FieldBus, FieldConnection, FieldError, ReadValues, RegisterKind,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadRecord {
    pub host: String,
    pub kind: RegisterKind,
    pub address: u16,
    pub count: u16,
}

#[derive(Default)]
struct Device {
    registers: HashMap<u16, u16>,
    refuse_connects: usize,
    fail_reads: bool,
    connects: usize,
}

#[derive(Default)]
struct BusState {
    devices: HashMap<String, Device>,
    reads: Vec<ReadRecord>,
}

#[derive(Clone, Default)]
pub struct MockFieldBus {
    state: Arc<Mutex<BusState>>,
}

struct MockConnection {
    host: String,
    state: Arc<Mutex<BusState>>,
}

impl MockFieldBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write `values` starting at `address` in the host's register image
    pub fn set_registers(&self, host: &str, address: u16, values: &[u16]) {
        let mut state = self.state.lock().unwrap();
        let device = state.devices.entry(host.to_string()).or_default();
        for (offset, value) in values.iter().enumerate() {
            device.registers.insert(address + offset as u16, *value);
        }
    }

    pub fn refuse_connects(&self, host: &str, n: usize) {
        let mut state = self.state.lock().unwrap();
        state.devices.entry(host.to_string()).or_default().refuse_connects = n;
    }

    pub fn fail_reads(&self, host: &str, fail: bool) {
        let mut state = self.state.lock().unwrap();
        state.devices.entry(host.to_string()).or_default().fail_reads = fail;
    }

    pub fn reads(&self) -> Vec<ReadRecord> {
        self.state.lock().unwrap().reads.clone()
    }

    pub fn reads_for(&self, host: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .reads
            .iter()
            .filter(|r| r.host == host)
            .count()
    }

    /// Successful connects to `host`
    pub fn connects(&self, host: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .devices
            .get(host)
            .map(|d| d.connects)
            .unwrap_or(0)
    }
}

#[async_trait]
impl FieldBus for MockFieldBus {
    async fn connect(&self, endpoint: &DeviceEndpoint) -> Result<Box<dyn FieldConnection>, FieldError> {
        let mut state = self.state.lock().unwrap();
        let device = state.devices.entry(endpoint.host.clone()).or_default();
        if device.refuse_connects > 0 {
            device.refuse_connects -= 1;
            return Err(FieldError::Io(std::io::ErrorKind::ConnectionRefused.into()));
        }
        device.connects += 1;
        log::debug!("[MOCK] Field connection to {}", endpoint);

        Ok(Box::new(MockConnection {
            host: endpoint.host.clone(),
            state: self.state.clone(),
        }))
    }
}

#[async_trait]
impl FieldConnection for MockConnection {
    async fn read(&mut self, kind: RegisterKind, address: u16, count: u16) -> Result<ReadValues, FieldError> {
        let mut state = self.state.lock().unwrap();
        state.reads.push(ReadRecord {
            host: self.host.clone(),
            kind,
            address,
            count,
        });

        let device = state.devices.entry(self.host.clone()).or_default();
        if device.fail_reads {
            return Err(FieldError::Io(std::io::ErrorKind::ConnectionReset.into()));
        }

        let values: Vec<u16> = (0..count)
            .map(|offset| device.registers.get(&(address + offset)).copied().unwrap_or(0))
            .collect();
        Ok(if kind.is_bit() {
            ReadValues::Bits(values.into_iter().map(|v| v != 0).collect())
        } else {
            ReadValues::Registers(values)
        })
    }

    async fn close(&mut self) {}
}
