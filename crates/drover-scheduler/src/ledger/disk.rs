// Local disk space accounting.
//
// The ledger tracks one device. Free space is re-read from the filesystem on
// every grant so external writers are accounted for, and a soft reserve keeps
// a floor of headroom no allocation may invade. Swapping the tracked device
// clears all outstanding allocations; releases against the old device are
// refused.

use drover_core::ByteQuantity;
use nix::sys::statvfs::statvfs;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

use crate::error::{Result, SchedulerError};

/// Fraction of available space always left untouched.
const SOFT_RESERVE_FRACTION: f64 = 0.85;

#[derive(Debug, Default, Serialize)]
struct DiskState {
    device: String,
    alloc_space: u64,
    soft_min_free: u64,
}

/// A granted slice of disk, returned to [`DiskLedger::release`] when the
/// workspace it covered is gone.
#[derive(Debug)]
pub struct DiskReservation {
    device: String,
    size: ByteQuantity,
}

impl DiskReservation {
    pub fn size(&self) -> ByteQuantity {
        self.size
    }
}

#[derive(Debug, Default)]
pub struct DiskLedger {
    state: Mutex<DiskState>,
}

impl DiskLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Point the ledger at `device` and compute the soft free floor:
    /// the larger of the caller's minimum and 85% of what the filesystem
    /// currently reports available. Changing the device resets allocations.
    pub fn set_limits(&self, device: &str, min_free: ByteQuantity) -> Result<ByteQuantity> {
        let available = available_bytes(device)?;
        let soft_min_free = min_free
            .as_u64()
            .max((available as f64 * SOFT_RESERVE_FRACTION) as u64);

        let mut state = self.state.lock();
        if state.device != device {
            state.alloc_space = 0;
        }
        state.device = device.to_string();
        state.soft_min_free = soft_min_free;
        debug!(device, soft_min_free, "disk limits set");
        Ok(ByteQuantity::from_bytes(soft_min_free))
    }

    /// Grant `size` bytes if doing so still leaves more than the soft floor
    /// free on the device. Available space is re-read under the lock.
    pub fn alloc(&self, size: ByteQuantity) -> Result<DiskReservation> {
        let mut state = self.state.lock();
        if state.device.is_empty() {
            return Err(SchedulerError::NotInitialized);
        }

        let available = available_bytes(&state.device)?;
        let committed = state
            .alloc_space
            .checked_add(size.as_u64())
            .ok_or(SchedulerError::LedgerPoisoned)?;

        if available.saturating_sub(committed) <= state.soft_min_free {
            return Err(SchedulerError::InsufficientSpace {
                free: ByteQuantity::from_bytes(available.saturating_sub(state.alloc_space)),
                requested: size,
            });
        }

        state.alloc_space = committed;
        Ok(DiskReservation {
            device: state.device.clone(),
            size,
        })
    }

    pub fn release(&self, reservation: DiskReservation) -> Result<()> {
        let mut state = self.state.lock();
        if state.device.is_empty() {
            return Err(SchedulerError::NotInitialized);
        }
        if reservation.device != state.device {
            return Err(SchedulerError::ForeignDevice {
                device: reservation.device,
            });
        }
        state.alloc_space = state.alloc_space.saturating_sub(reservation.size.as_u64());
        Ok(())
    }

    /// Bytes a task could still be granted right now.
    pub fn allocatable(&self) -> ByteQuantity {
        let state = self.state.lock();
        if state.device.is_empty() {
            return ByteQuantity::ZERO;
        }
        let available = match available_bytes(&state.device) {
            Ok(a) => a,
            Err(_) => return ByteQuantity::ZERO,
        };
        ByteQuantity::from_bytes(
            available
                .saturating_sub(state.alloc_space)
                .saturating_sub(state.soft_min_free),
        )
    }

    pub fn allocated(&self) -> ByteQuantity {
        ByteQuantity::from_bytes(self.state.lock().alloc_space)
    }

    /// Opaque state dump for the monitoring surface.
    pub fn snapshot(&self) -> serde_json::Value {
        serde_json::to_value(&*self.state.lock()).unwrap_or_default()
    }
}

fn available_bytes(device: &str) -> Result<u64> {
    let fs = statvfs(device)?;
    Ok(fs.blocks_available() as u64 * fs.fragment_size() as u64)
}
