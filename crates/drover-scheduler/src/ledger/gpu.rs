// GPU slot and memory accounting.
//
// GPUs are granted board-wise: a task's slot and memory ask must land on a
// single board, never spread across several. The inventory is handed in at
// startup by whatever enumerated the hardware; this ledger only does the
// bookkeeping.

use drover_core::ByteQuantity;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SchedulerError};

/// One physical board as configured at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GpuBoard {
    pub slots: u32,
    pub mem: ByteQuantity,
}

#[derive(Debug, Serialize)]
struct BoardState {
    total_slots: u32,
    total_mem: u64,
    free_slots: u32,
    free_mem: u64,
}

/// A grant against a single board.
#[derive(Debug)]
pub struct GpuReservation {
    board: usize,
    slots: u32,
    mem: ByteQuantity,
}

#[derive(Debug, Default)]
pub struct GpuLedger {
    boards: Mutex<Vec<BoardState>>,
}

impl GpuLedger {
    pub fn new(inventory: Vec<GpuBoard>) -> Self {
        let boards = inventory
            .into_iter()
            .map(|b| BoardState {
                total_slots: b.slots,
                total_mem: b.mem.as_u64(),
                free_slots: b.slots,
                free_mem: b.mem.as_u64(),
            })
            .collect();
        GpuLedger {
            boards: Mutex::new(boards),
        }
    }

    /// The largest slot count any single board could still grant. This is
    /// the most a task may ask for, since grants never span boards.
    pub fn largest_free_slots(&self) -> u32 {
        self.boards
            .lock()
            .iter()
            .map(|b| b.free_slots)
            .max()
            .unwrap_or(0)
    }

    /// The largest free memory on any single board.
    pub fn largest_free_mem(&self) -> ByteQuantity {
        ByteQuantity::from_bytes(
            self.boards
                .lock()
                .iter()
                .map(|b| b.free_mem)
                .max()
                .unwrap_or(0),
        )
    }

    /// Grant `slots` and `mem` on one board, first fit. A zero-slot ask
    /// needs no grant and returns `None`.
    pub fn alloc(&self, slots: u32, mem: ByteQuantity) -> Result<Option<GpuReservation>> {
        if slots == 0 {
            return Ok(None);
        }
        let mut boards = self.boards.lock();
        for (index, board) in boards.iter_mut().enumerate() {
            if board.free_slots >= slots && board.free_mem >= mem.as_u64() {
                board.free_slots -= slots;
                board.free_mem -= mem.as_u64();
                return Ok(Some(GpuReservation { board: index, slots, mem }));
            }
        }
        Err(SchedulerError::Insufficient { kind: "gpu" })
    }

    pub fn release(&self, reservation: GpuReservation) -> Result<()> {
        let mut boards = self.boards.lock();
        let board = boards.get_mut(reservation.board).ok_or_else(|| {
            SchedulerError::ForeignDevice {
                device: format!("gpu-board-{}", reservation.board),
            }
        })?;
        board.free_slots = (board.free_slots + reservation.slots).min(board.total_slots);
        board.free_mem = (board.free_mem + reservation.mem.as_u64()).min(board.total_mem);
        Ok(())
    }

    pub fn snapshot(&self) -> serde_json::Value {
        serde_json::to_value(&*self.boards.lock()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_boards() -> GpuLedger {
        GpuLedger::new(vec![
            GpuBoard {
                slots: 4,
                mem: ByteQuantity::from_bytes(16_000_000_000),
            },
            GpuBoard {
                slots: 2,
                mem: ByteQuantity::from_bytes(8_000_000_000),
            },
        ])
    }

    #[test]
    fn largest_free_is_the_max_over_boards() {
        let ledger = two_boards();
        assert_eq!(ledger.largest_free_slots(), 4);
        assert_eq!(ledger.largest_free_mem().as_u64(), 16_000_000_000);
    }

    #[test]
    fn grants_never_span_boards() {
        let ledger = two_boards();
        // Six slots exist in total but no single board has them.
        let r = ledger.alloc(6, ByteQuantity::ZERO);
        assert!(matches!(r, Err(SchedulerError::Insufficient { kind: "gpu" })));
    }

    #[test]
    fn zero_slots_needs_no_grant() {
        let ledger = two_boards();
        assert!(ledger.alloc(0, ByteQuantity::ZERO).unwrap().is_none());
    }

    #[test]
    fn grant_shrinks_the_largest_free_picture() {
        let ledger = two_boards();
        let res = ledger
            .alloc(4, ByteQuantity::from_bytes(16_000_000_000))
            .unwrap()
            .unwrap();
        assert_eq!(ledger.largest_free_slots(), 2);
        assert_eq!(ledger.largest_free_mem().as_u64(), 8_000_000_000);

        ledger.release(res).unwrap();
        assert_eq!(ledger.largest_free_slots(), 4);
    }

    #[test]
    fn empty_inventory_reports_zero() {
        let ledger = GpuLedger::new(Vec::new());
        assert_eq!(ledger.largest_free_slots(), 0);
        assert!(ledger.largest_free_mem().is_zero());
    }
}
