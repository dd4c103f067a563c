use crate::types::{ColumnInfo, ColumnType};
use crate::COL_DATA_BUF_SIZE;

/// Opaque LOB locator handle issued by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LobId(pub u64);

/// Opaque datetime descriptor handle issued by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DateTimeId(pub u64);

/// Output buffers for one result column across a fetch block.
///
/// String-ish columns carry a contiguous `block_rows × width` data buffer;
/// LOB and TIMESTAMP columns carry descriptor arrays instead. The slot is
/// reused across fetch blocks of the same statement.
#[derive(Debug)]
pub struct DefineSlot {
    pub col_type: ColumnType,
    pub width: usize,
    pub block_rows: usize,
    pub data: Vec<u8>,
    /// Bytes actually written per row.
    pub lengths: Vec<usize>,
    /// -1 marks NULL.
    pub indicators: Vec<i16>,
    pub lobs: Vec<Option<LobId>>,
    pub datetimes: Vec<Option<DateTimeId>>,
}

/// One row/column cell as seen by the fetch pipeline.
#[derive(Debug)]
pub struct ColumnOutput<'a> {
    pub col_type: ColumnType,
    pub is_null: bool,
    pub data: &'a [u8],
    pub str_size: usize,
    pub lob: Option<LobId>,
    pub datetime: Option<DateTimeId>,
}

impl DefineSlot {
    pub fn new(col: &ColumnInfo, block_rows: usize) -> Self {
        let uses_descriptors = col.col_type.is_lob() || col.col_type.is_temporal_descriptor();
        let width = if uses_descriptors {
            0
        } else {
            // room for a terminating NUL, as the v1 string path expects
            col.width as usize + 1
        };
        DefineSlot {
            col_type: col.col_type,
            width,
            block_rows,
            data: vec![0u8; width * block_rows],
            lengths: vec![0; block_rows],
            indicators: vec![0; block_rows],
            lobs: vec![None; block_rows],
            datetimes: vec![None; block_rows],
        }
    }

    pub fn clear_indicators(&mut self) {
        for ind in &mut self.indicators {
            *ind = 0;
        }
        for len in &mut self.lengths {
            *len = 0;
        }
    }

    pub fn get_column(&self, row: usize) -> ColumnOutput<'_> {
        let start = row * self.width;
        ColumnOutput {
            col_type: self.col_type,
            is_null: self.indicators[row] == -1,
            data: &self.data[start..start + self.width],
            str_size: self.lengths[row],
            lob: self.lobs[row],
            datetime: self.datetimes[row],
        }
    }

    /// Driver-side helper: write one cell.
    pub fn store_bytes(&mut self, row: usize, value: &[u8]) {
        let start = row * self.width;
        let n = value.len().min(self.width.saturating_sub(1));
        self.data[start..start + n].copy_from_slice(&value[..n]);
        // NUL-terminate for the v1 strlen-style read
        self.data[start + n] = 0;
        self.lengths[row] = n;
        self.indicators[row] = 0;
    }

    pub fn store_null(&mut self, row: usize) {
        self.indicators[row] = -1;
        self.lengths[row] = 0;
    }

    pub fn store_lob(&mut self, row: usize, lob: LobId) {
        self.lobs[row] = Some(lob);
        self.indicators[row] = 0;
    }

    pub fn store_datetime(&mut self, row: usize, dt: DateTimeId) {
        self.datetimes[row] = Some(dt);
        self.indicators[row] = 0;
    }
}

/// Builds the define slots for a column set, clamping the block size so
/// the combined string/raw buffers stay inside the shared arena budget.
pub fn build_define_slots(columns: &[ColumnInfo], requested_rows: usize) -> (Vec<DefineSlot>, usize) {
    let row_bytes: usize = columns
        .iter()
        .filter(|c| !c.col_type.is_lob() && !c.col_type.is_temporal_descriptor())
        .map(|c| c.width as usize + 1)
        .sum();
    let mut block_rows = requested_rows.max(1);
    if row_bytes > 0 {
        block_rows = block_rows.min((COL_DATA_BUF_SIZE / row_bytes).max(1));
    }
    let slots = columns
        .iter()
        .map(|c| DefineSlot::new(c, block_rows))
        .collect();
    (slots, block_rows)
}

#[cfg(test)]
mod test {
    use super::*;

    fn col(name: &str, col_type: ColumnType, width: u32) -> ColumnInfo {
        ColumnInfo {
            name: name.to_string(),
            col_type,
            width,
            precision: 0,
            scale: 0,
        }
    }

    #[test]
    fn store_and_read_back() {
        let mut slot = DefineSlot::new(&col("id", ColumnType::Str, 8), 4);
        slot.store_bytes(0, b"7");
        slot.store_null(1);
        let out = slot.get_column(0);
        assert!(!out.is_null);
        assert_eq!(&out.data[..out.str_size], b"7");
        assert!(slot.get_column(1).is_null);
    }

    #[test]
    fn lob_columns_use_descriptors() {
        let slot = DefineSlot::new(&col("doc", ColumnType::Clob, 4000), 4);
        assert_eq!(slot.width, 0);
        assert!(slot.data.is_empty());
    }

    #[test]
    fn arena_budget_clamps_block() {
        let cols = vec![col("a", ColumnType::Str, 50_000)];
        let (_slots, rows) = build_define_slots(&cols, 512);
        assert!(rows >= 1);
        assert!(rows * 50_001 <= COL_DATA_BUF_SIZE);
    }

    #[test]
    fn at_least_one_row_even_for_wide_columns() {
        let cols = vec![col("a", ColumnType::Str, 1_000_000)];
        let (_slots, rows) = build_define_slots(&cols, 16);
        assert_eq!(rows, 1);
    }
}
