//! I/O bus (C2): maps port numbers to device objects and forwards
//! reads/writes of 1/2/4-byte values.
//!
//! Concrete devices (serial, keyboard, PIT, VGA...) are out of scope for
//! this crate (`spec.md` §1) — only the device-facing contract lives here.

use std::collections::BTreeMap;

/// A port-mapped I/O device.
///
/// Devices run on the same thread as the instruction that triggered the
/// access and may have side effects visible to the host; they must not
/// re-enter the CPU.
pub trait IoDevice {
    fn port_in(&mut self, port: u16, size: u8) -> u32;
    fn port_out(&mut self, port: u16, value: u32, size: u8);
}

/// Binds [`IoDevice`]s to the port numbers they own.
///
/// Reads from an unbound port return 0; writes to an unbound port are
/// silently dropped, matching real port I/O on most platforms where an
/// unpopulated bus slot reads as all-ones or zero depending on the bus, and
/// writes simply vanish.
#[derive(Default)]
pub struct IoBus {
    devices: Vec<Box<dyn IoDevice>>,
    port_map: BTreeMap<u16, usize>,
}

impl IoBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `device` for every port in `ports`. Later registrations
    /// for an already-bound port replace the owner.
    pub fn register(&mut self, ports: impl IntoIterator<Item = u16>, device: Box<dyn IoDevice>) {
        let index = self.devices.len();
        self.devices.push(device);
        for port in ports {
            self.port_map.insert(port, index);
        }
    }

    #[must_use]
    pub fn port_in(&mut self, port: u16, size: u8) -> u32 {
        match self.port_map.get(&port) {
            Some(&index) => self.devices[index].port_in(port, size),
            None => 0,
        }
    }

    pub fn port_out(&mut self, port: u16, value: u32, size: u8) {
        if let Some(&index) = self.port_map.get(&port) {
            self.devices[index].port_out(port, value, size);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo {
        last_write: u32,
    }

    impl IoDevice for Echo {
        fn port_in(&mut self, _port: u16, _size: u8) -> u32 {
            self.last_write
        }

        fn port_out(&mut self, _port: u16, value: u32, _size: u8) {
            self.last_write = value;
        }
    }

    #[test]
    fn unbound_port_reads_zero_and_drops_writes() {
        let mut bus = IoBus::new();
        assert_eq!(bus.port_in(0x42, 1), 0);
        bus.port_out(0x42, 0xFF, 1); // must not panic
    }

    #[test]
    fn bound_port_dispatches_to_device() {
        let mut bus = IoBus::new();
        bus.register([0x60, 0x64], Box::new(Echo { last_write: 0 }));
        bus.port_out(0x60, 7, 1);
        assert_eq!(bus.port_in(0x64, 1), 7);
    }
}
