//! Single-slot detection mailbox shared by the vision loop and arm A.
//!
//! Four `f64` cells `[x_mm, y_mm, theta_deg, object_id]`, each stored as raw
//! bits in an `AtomicU64`. A cell-0 value of [`SENTINEL`] means empty.
//!
//! Only the vision loop writes into an empty slot and only arm A empties a
//! full one. Cell 0 is published last in both directions, so a reader that
//! sees a non-sentinel cell 0 also sees the matching cells 1..3.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::smoothing::SmoothedDetection;

pub const SENTINEL: f64 = -1.0;

/// Region of the tray plane where the arm may reach. Bounds are exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkspaceFence {
    pub min_x_mm: f64,
    pub max_x_mm: f64,
    pub min_y_mm: f64,
    pub max_y_mm: f64,
}

impl WorkspaceFence {
    pub fn contains(&self, x: f64, y: f64) -> bool {
        self.min_x_mm < x && x < self.max_x_mm && self.min_y_mm < y && y < self.max_y_mm
    }

    pub fn validate(&self) -> Result<(), String> {
        let vals = [self.min_x_mm, self.max_x_mm, self.min_y_mm, self.max_y_mm];
        if vals.iter().any(|v| !v.is_finite()) {
            return Err("fence bounds must be finite".into());
        }
        if self.min_x_mm >= self.max_x_mm || self.min_y_mm >= self.max_y_mm {
            return Err("fence minimums must be below maximums".into());
        }
        Ok(())
    }
}

/// Contents of a full slot.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SlotRecord {
    pub x_mm: f64,
    pub y_mm: f64,
    pub theta_deg: f64,
    pub object_id: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    Claimed,
    /// Slot still holds an unconsumed detection.
    Occupied,
    OutsideFence,
    /// `x` equals the empty marker and cannot be stored.
    Unrepresentable,
}

#[derive(Debug)]
pub struct SharedCoordinateSlot {
    cells: [AtomicU64; 4],
}

impl Default for SharedCoordinateSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedCoordinateSlot {
    pub fn new() -> Self {
        let empty = SENTINEL.to_bits();
        Self {
            cells: [
                AtomicU64::new(empty),
                AtomicU64::new(empty),
                AtomicU64::new(empty),
                AtomicU64::new(empty),
            ],
        }
    }

    fn load(&self, i: usize, order: Ordering) -> f64 {
        f64::from_bits(self.cells[i].load(order))
    }

    fn store(&self, i: usize, v: f64, order: Ordering) {
        self.cells[i].store(v.to_bits(), order);
    }

    pub fn is_empty(&self) -> bool {
        self.load(0, Ordering::Acquire) == SENTINEL
    }

    /// Publish a detection if it is inside `fence` and the slot is empty.
    /// Must only be called from the single producer.
    pub fn try_claim(&self, det: &SmoothedDetection, fence: &WorkspaceFence) -> ClaimOutcome {
        if !fence.contains(det.x_mm, det.y_mm) {
            return ClaimOutcome::OutsideFence;
        }
        if det.x_mm == SENTINEL {
            return ClaimOutcome::Unrepresentable;
        }
        if !self.is_empty() {
            return ClaimOutcome::Occupied;
        }
        self.store(1, det.y_mm, Ordering::Relaxed);
        self.store(2, det.theta_deg, Ordering::Relaxed);
        self.store(3, det.class_id as f64, Ordering::Relaxed);
        self.store(0, det.x_mm, Ordering::Release);
        ClaimOutcome::Claimed
    }

    pub fn read(&self) -> Option<SlotRecord> {
        let x_mm = self.load(0, Ordering::Acquire);
        if x_mm == SENTINEL {
            return None;
        }
        Some(SlotRecord {
            x_mm,
            y_mm: self.load(1, Ordering::Relaxed),
            theta_deg: self.load(2, Ordering::Relaxed),
            object_id: self.load(3, Ordering::Relaxed).max(0.0) as u32,
        })
    }

    pub fn object_id(&self) -> Option<u32> {
        self.read().map(|r| r.object_id)
    }

    /// Return every cell to the sentinel. Must only be called by the
    /// consumer.
    pub fn clear(&self) {
        for i in 1..4 {
            self.store(i, SENTINEL, Ordering::Relaxed);
        }
        self.store(0, SENTINEL, Ordering::Release);
    }

    /// Raw cell values, for status displays.
    pub fn raw(&self) -> [f64; 4] {
        let x = self.load(0, Ordering::Acquire);
        [
            x,
            self.load(1, Ordering::Relaxed),
            self.load(2, Ordering::Relaxed),
            self.load(3, Ordering::Relaxed),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn fence() -> WorkspaceFence {
        WorkspaceFence {
            min_x_mm: 0.0,
            max_x_mm: 300.0,
            min_y_mm: 0.0,
            max_y_mm: 200.0,
        }
    }

    fn det(x: f64, y: f64) -> SmoothedDetection {
        SmoothedDetection {
            x_mm: x,
            y_mm: y,
            theta_deg: 45.0,
            class_id: 2,
        }
    }

    #[test]
    fn starts_empty_with_sentinels() {
        let slot = SharedCoordinateSlot::new();
        assert!(slot.is_empty());
        assert_eq!(slot.raw(), [SENTINEL; 4]);
        assert!(slot.read().is_none());
    }

    #[test]
    fn claim_then_occupied_until_cleared() {
        let slot = SharedCoordinateSlot::new();
        assert_eq!(slot.try_claim(&det(120.0, 80.0), &fence()), ClaimOutcome::Claimed);
        assert_eq!(
            slot.read(),
            Some(SlotRecord {
                x_mm: 120.0,
                y_mm: 80.0,
                theta_deg: 45.0,
                object_id: 2
            })
        );
        assert_eq!(slot.try_claim(&det(10.0, 10.0), &fence()), ClaimOutcome::Occupied);
        assert_eq!(slot.read().unwrap().x_mm, 120.0);
        slot.clear();
        assert_eq!(slot.raw(), [SENTINEL; 4]);
        assert_eq!(slot.try_claim(&det(10.0, 10.0), &fence()), ClaimOutcome::Claimed);
    }

    #[test]
    fn fence_bounds_are_exclusive() {
        let slot = SharedCoordinateSlot::new();
        for (x, y) in [(0.0, 50.0), (300.0, 50.0), (50.0, 0.0), (50.0, 200.0), (300.5, 50.0)] {
            assert_eq!(slot.try_claim(&det(x, y), &fence()), ClaimOutcome::OutsideFence, "{x},{y}");
        }
        assert!(slot.is_empty());
        assert_eq!(slot.try_claim(&det(299.9, 199.9), &fence()), ClaimOutcome::Claimed);
    }

    #[test]
    fn sentinel_x_cannot_be_stored() {
        let wide = WorkspaceFence {
            min_x_mm: -10.0,
            ..fence()
        };
        let slot = SharedCoordinateSlot::new();
        assert_eq!(slot.try_claim(&det(-1.0, 5.0), &wide), ClaimOutcome::Unrepresentable);
        assert!(slot.is_empty());
    }

    #[test]
    fn fence_validation() {
        assert!(fence().validate().is_ok());
        let bad = WorkspaceFence {
            max_x_mm: 0.0,
            ..fence()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn consumer_sees_whole_record_across_threads() {
        let slot = Arc::new(SharedCoordinateSlot::new());
        let producer = {
            let slot = Arc::clone(&slot);
            std::thread::spawn(move || {
                let mut claimed = 0;
                while claimed < 200 {
                    let d = SmoothedDetection {
                        x_mm: 1.0 + claimed as f64,
                        y_mm: 2.0 * (1.0 + claimed as f64),
                        theta_deg: 0.0,
                        class_id: 0,
                    };
                    let wide = WorkspaceFence {
                        min_x_mm: 0.0,
                        max_x_mm: 1e6,
                        min_y_mm: 0.0,
                        max_y_mm: 1e6,
                    };
                    if slot.try_claim(&d, &wide) == ClaimOutcome::Claimed {
                        claimed += 1;
                    } else {
                        std::thread::yield_now();
                    }
                }
            })
        };
        let mut consumed = 0;
        while consumed < 200 {
            if let Some(r) = slot.read() {
                assert_eq!(r.y_mm, 2.0 * r.x_mm);
                slot.clear();
                consumed += 1;
            } else {
                std::thread::yield_now();
            }
        }
        producer.join().unwrap();
    }
}
