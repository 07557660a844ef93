//! TCP port allocation for preview servers.

use std::collections::HashSet;
use std::net::TcpListener;
use std::sync::Mutex;

use crate::error::PreviewError;

/// Hands out ports from an inclusive range.
///
/// A port is handed out only if it is not reserved by another preview and
/// can be bound right now. The bind probe is best-effort: another local
/// process may still grab the port before the dev server does.
pub struct PortAllocator {
    start: u16,
    end: u16,
    reserved: Mutex<HashSet<u16>>,
}

impl PortAllocator {
    pub fn new(start: u16, end: u16) -> Self {
        Self {
            start,
            end,
            reserved: Mutex::new(HashSet::new()),
        }
    }

    /// Reserve the first free port in the range.
    pub fn allocate(&self) -> Result<u16, PreviewError> {
        let mut reserved = self.reserved.lock().unwrap_or_else(|e| e.into_inner());
        for port in self.start..=self.end {
            if reserved.contains(&port) {
                continue;
            }
            if is_bindable(port) {
                reserved.insert(port);
                tracing::debug!("Allocated preview port {}", port);
                return Ok(port);
            }
        }
        Err(PreviewError::NoPortAvailable {
            start: self.start,
            end: self.end,
        })
    }

    /// Return a port to the pool.
    pub fn release(&self, port: u16) {
        let mut reserved = self.reserved.lock().unwrap_or_else(|e| e.into_inner());
        if reserved.remove(&port) {
            tracing::debug!("Released preview port {}", port);
        }
    }

    #[cfg(test)]
    pub fn reserved_count(&self) -> usize {
        self.reserved.lock().map(|r| r.len()).unwrap_or(0)
    }
}

fn is_bindable(port: u16) -> bool {
    TcpListener::bind(("127.0.0.1", port)).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Find a small window of currently-bindable ports to test against.
    fn free_window(len: u16) -> (u16, u16) {
        for base in (42000u16..60000).step_by(97) {
            if (base..base + len).all(is_bindable) {
                return (base, base + len - 1);
            }
        }
        panic!("no free port window found");
    }

    #[test]
    fn allocations_are_disjoint() {
        let (start, end) = free_window(4);
        let ports = PortAllocator::new(start, end);
        let a = ports.allocate().unwrap();
        let b = ports.allocate().unwrap();
        assert_ne!(a, b);
        assert_eq!(ports.reserved_count(), 2);
    }

    #[test]
    fn released_port_is_immediately_reusable() {
        let (start, _) = free_window(1);
        let ports = PortAllocator::new(start, start);
        let a = ports.allocate().unwrap();
        assert!(matches!(
            ports.allocate(),
            Err(PreviewError::NoPortAvailable { .. })
        ));
        ports.release(a);
        assert_eq!(ports.allocate().unwrap(), a);
    }

    #[test]
    fn bound_ports_are_skipped() {
        let (start, end) = free_window(2);
        let _held = TcpListener::bind(("127.0.0.1", start)).unwrap();
        let ports = PortAllocator::new(start, end);
        assert_eq!(ports.allocate().unwrap(), end);
    }
}
