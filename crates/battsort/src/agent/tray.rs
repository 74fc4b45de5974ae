use serde::{Deserialize, Serialize};

use crate::config::TrayConfig;

/// Where B puts one object down.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DepositTarget {
    pub row: u32,
    pub col: u32,
    pub x_mm: f64,
    pub y_mm: f64,
    pub approach_z_mm: f64,
    pub drop_z_mm: f64,
    pub retract_z_mm: f64,
    pub accel_mm_s2: f64,
}

/// Row-by-column tray grid. The object id picks the row.
#[derive(Debug, Clone, PartialEq)]
pub struct TrayLayout {
    cfg: TrayConfig,
}

impl TrayLayout {
    pub fn new(cfg: TrayConfig) -> Self {
        Self { cfg }
    }

    pub fn rows(&self) -> u32 {
        self.cfg.rows
    }

    pub fn cols(&self) -> u32 {
        self.cfg.cols
    }

    /// Slot center in the arm-B user frame.
    pub fn slot_xy(&self, row: u32, col: u32) -> [f64; 2] {
        let c = &self.cfg;
        [
            c.start_mm[0] + c.start_offset_mm[0] + (c.cell_size_mm[0] / 2.0 + c.spacing_mm[0]) * row as f64,
            c.start_mm[1] + c.start_offset_mm[1] + (c.cell_size_mm[1] / 2.0 + c.spacing_mm[1]) * col as f64,
        ]
    }

    /// All slot centers, row-major.
    pub fn slots(&self) -> Vec<[f64; 2]> {
        (0..self.rows())
            .flat_map(|r| (0..self.cols()).map(move |c| (r, c)))
            .map(|(r, c)| self.slot_xy(r, c))
            .collect()
    }

    /// Row for an object id; ids past the last row wrap around.
    pub fn row_for(&self, object_id: u32) -> u32 {
        object_id % self.rows().max(1)
    }

    fn target(&self, row: u32, col: u32) -> DepositTarget {
        let [x_mm, y_mm] = self.slot_xy(row, col);
        DepositTarget {
            row,
            col,
            x_mm,
            y_mm,
            approach_z_mm: self.cfg.approach_z_mm,
            drop_z_mm: self.cfg.drop_z_mm,
            retract_z_mm: self.cfg.retract_z_mm,
            accel_mm_s2: self.cfg.deposit_accel_mm_s2,
        }
    }
}

/// Fills each row's columns in order, wrapping to column 0.
#[derive(Debug, Clone)]
pub struct TrayCursor {
    layout: TrayLayout,
    next_col: Vec<u32>,
}

impl TrayCursor {
    pub fn new(layout: TrayLayout) -> Self {
        let rows = layout.rows().max(1) as usize;
        Self {
            layout,
            next_col: vec![0; rows],
        }
    }

    pub fn layout(&self) -> &TrayLayout {
        &self.layout
    }

    /// Swap the geometry after a reload. Fill positions are kept where the
    /// row still exists.
    pub fn set_layout(&mut self, layout: TrayLayout) {
        let rows = layout.rows().max(1) as usize;
        let cols = layout.cols().max(1);
        self.next_col.resize(rows, 0);
        for c in &mut self.next_col {
            *c %= cols;
        }
        self.layout = layout;
    }

    /// Next free slot for `object_id`, without consuming it.
    pub fn peek(&self, object_id: u32) -> DepositTarget {
        let row = self.layout.row_for(object_id);
        self.layout.target(row, self.next_col[row as usize])
    }

    /// Mark the slot returned by `peek` as used.
    pub fn commit(&mut self, object_id: u32) {
        let row = self.layout.row_for(object_id) as usize;
        self.next_col[row] = (self.next_col[row] + 1) % self.layout.cols().max(1);
    }
}
