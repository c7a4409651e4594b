//! Node resource ledgers.
//!
//! Four sub-ledgers track disk, CPU, RAM, and GPU capacity. Each hands out
//! reservations that must be explicitly released; the [`Ledger`] facade
//! composes them into all-or-nothing grants for a whole task and produces
//! the free-resource picture the admission gate compares hints against.

mod disk;
mod gpu;
mod host;

pub use disk::{DiskLedger, DiskReservation};
pub use gpu::{GpuBoard, GpuLedger, GpuReservation};
pub use host::{HostLedger, HostReservation};

use drover_core::Resource;

use crate::error::Result;

/// Process-wide resource ledger, created once at startup.
pub struct Ledger {
    pub disk: DiskLedger,
    pub host: HostLedger,
    pub gpu: GpuLedger,
}

/// The combined grant backing one running task.
#[derive(Debug)]
pub struct TaskReservation {
    disk: DiskReservation,
    host: HostReservation,
    gpu: Option<GpuReservation>,
}

impl Ledger {
    pub fn new(gpu_inventory: Vec<GpuBoard>) -> Self {
        Ledger {
            disk: DiskLedger::new(),
            host: HostLedger::new(),
            gpu: GpuLedger::new(gpu_inventory),
        }
    }

    /// The node's current free picture, in the same shape tasks use to ask
    /// for resources. Users specify approximate quantities, so approximate
    /// freshness here is acceptable.
    pub fn machine_resource(&self) -> Resource {
        let (cpus, ram) = self.host.free();
        Resource {
            cpus,
            ram,
            hdd: self.disk.allocatable(),
            gpus: self.gpu.largest_free_slots(),
            gpu_mem: self.gpu.largest_free_mem(),
        }
    }

    /// Grant every dimension of `need` or nothing: a failure on a later
    /// sub-ledger rolls back the earlier grants before returning.
    pub fn alloc(&self, need: &Resource) -> Result<TaskReservation> {
        let disk = self.disk.alloc(need.hdd)?;

        let host = match self.host.alloc(need.cpus, need.ram) {
            Ok(h) => h,
            Err(err) => {
                let _ = self.disk.release(disk);
                return Err(err);
            }
        };

        let gpu = match self.gpu.alloc(need.gpus, need.gpu_mem) {
            Ok(g) => g,
            Err(err) => {
                self.host.release(host);
                let _ = self.disk.release(disk);
                return Err(err);
            }
        };

        Ok(TaskReservation { disk, host, gpu })
    }

    pub fn release(&self, reservation: TaskReservation) -> Result<()> {
        if let Some(gpu) = reservation.gpu {
            self.gpu.release(gpu)?;
        }
        self.host.release(reservation.host);
        self.disk.release(reservation.disk)
    }

    /// Opaque observability dump of all sub-ledgers.
    pub fn snapshot(&self) -> serde_json::Value {
        serde_json::json!({
            "disk": self.disk.snapshot(),
            "host": self.host.snapshot(),
            "gpu": self.gpu.snapshot(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drover_core::ByteQuantity;

    fn ledger_on_tempdir() -> (Ledger, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Ledger::new(vec![GpuBoard {
            slots: 2,
            mem: ByteQuantity::from_bytes(8_000_000_000),
        }]);
        ledger
            .disk
            .set_limits(dir.path().to_str().unwrap(), ByteQuantity::ZERO)
            .unwrap();
        (ledger, dir)
    }

    #[test]
    fn grant_is_all_or_nothing() {
        let (ledger, _dir) = ledger_on_tempdir();

        // GPU ask exceeds any board, so the disk and host grants made on the
        // way must be rolled back.
        let need = Resource {
            cpus: 1,
            gpus: 8,
            hdd: ByteQuantity::from_bytes(4096),
            ram: ByteQuantity::from_bytes(1024),
            gpu_mem: ByteQuantity::ZERO,
        };
        assert!(ledger.alloc(&need).is_err());
        assert_eq!(ledger.disk.allocated().as_u64(), 0);
        assert_eq!(ledger.gpu.largest_free_slots(), 2);
    }

    #[test]
    fn grant_release_restores_the_picture() {
        let (ledger, _dir) = ledger_on_tempdir();
        let before = ledger.machine_resource();

        let need = Resource {
            cpus: 1,
            gpus: 1,
            hdd: ByteQuantity::from_bytes(4096),
            ram: ByteQuantity::from_bytes(1024),
            gpu_mem: ByteQuantity::from_bytes(1_000_000_000),
        };
        let res = ledger.alloc(&need).unwrap();

        let during = ledger.machine_resource();
        assert_eq!(during.cpus, before.cpus - 1);
        assert_eq!(during.gpus, 1);

        ledger.release(res).unwrap();
        let after = ledger.machine_resource();
        assert_eq!(after.cpus, before.cpus);
        assert_eq!(after.gpus, 2);
    }

    #[test]
    fn machine_resource_reflects_gpu_inventory() {
        let (ledger, _dir) = ledger_on_tempdir();
        let have = ledger.machine_resource();
        assert_eq!(have.gpus, 2);
        assert_eq!(have.gpu_mem.as_u64(), 8_000_000_000);
        assert!(have.cpus >= 1);
    }
}
