// CPU and RAM accounting against the live machine picture.

use drover_core::ByteQuantity;
use parking_lot::Mutex;
use sysinfo::{MemoryRefreshKind, RefreshKind, System};
use tracing::trace;

use crate::error::{Result, SchedulerError};

#[derive(Debug)]
struct HostState {
    sys: System,
    alloc_cpus: u32,
    alloc_ram: u64,
}

/// A granted CPU/RAM slice.
#[derive(Debug)]
pub struct HostReservation {
    cpus: u32,
    ram: ByteQuantity,
}

pub struct HostLedger {
    state: Mutex<HostState>,
}

impl HostLedger {
    pub fn new() -> Self {
        let sys = System::new_with_specifics(
            RefreshKind::new()
                .with_cpu(sysinfo::CpuRefreshKind::everything())
                .with_memory(MemoryRefreshKind::everything()),
        );
        HostLedger {
            state: Mutex::new(HostState {
                sys,
                alloc_cpus: 0,
                alloc_ram: 0,
            }),
        }
    }

    /// Free CPUs and RAM after subtracting outstanding grants. Memory is
    /// re-read from the kernel so pressure from other processes shows up.
    pub fn free(&self) -> (u32, ByteQuantity) {
        let mut state = self.state.lock();
        state.sys.refresh_memory();
        let total_cpus = state.sys.cpus().len() as u32;
        let cpus = total_cpus.saturating_sub(state.alloc_cpus);
        let ram = state.sys.available_memory().saturating_sub(state.alloc_ram);
        (cpus, ByteQuantity::from_bytes(ram))
    }

    pub fn alloc(&self, cpus: u32, ram: ByteQuantity) -> Result<HostReservation> {
        let mut state = self.state.lock();
        state.sys.refresh_memory();

        let total_cpus = state.sys.cpus().len() as u32;
        let committed_cpus = state
            .alloc_cpus
            .checked_add(cpus)
            .ok_or(SchedulerError::LedgerPoisoned)?;
        if committed_cpus > total_cpus {
            return Err(SchedulerError::Insufficient { kind: "cpu" });
        }

        let committed_ram = state
            .alloc_ram
            .checked_add(ram.as_u64())
            .ok_or(SchedulerError::LedgerPoisoned)?;
        if committed_ram > state.sys.available_memory() {
            return Err(SchedulerError::Insufficient { kind: "ram" });
        }

        state.alloc_cpus = committed_cpus;
        state.alloc_ram = committed_ram;
        trace!(cpus, ram = ram.as_u64(), "host resources granted");
        Ok(HostReservation { cpus, ram })
    }

    pub fn release(&self, reservation: HostReservation) {
        let mut state = self.state.lock();
        state.alloc_cpus = state.alloc_cpus.saturating_sub(reservation.cpus);
        state.alloc_ram = state.alloc_ram.saturating_sub(reservation.ram.as_u64());
    }

    pub fn snapshot(&self) -> serde_json::Value {
        let state = self.state.lock();
        serde_json::json!({
            "total_cpus": state.sys.cpus().len(),
            "alloc_cpus": state.alloc_cpus,
            "alloc_ram": state.alloc_ram,
        })
    }
}

impl Default for HostLedger {
    fn default() -> Self {
        Self::new()
    }
}
