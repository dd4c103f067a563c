use crate::types::DataType;
use crate::{MAX_DYNAMIC_BIND_ROWS, MAX_OUT_BIND_VAR_SIZE};

/// One bind variable. Owns all row values up front; `None` rows are NULL.
#[derive(Debug, Clone)]
pub struct BindSlot {
    /// As sent by the client, with or without the leading colon.
    pub name: String,
    pub data_type: DataType,
    /// One entry per row; a single-row bind has exactly one.
    pub rows: Vec<Option<Vec<u8>>>,
    /// Max element size for array binds; equals the value length for a
    /// single-row bind.
    pub max_data_size: usize,
}

impl BindSlot {
    pub fn single(name: impl Into<String>, data_type: DataType, value: Option<Vec<u8>>) -> Self {
        let max_data_size = value.as_ref().map(Vec::len).unwrap_or(0);
        BindSlot {
            name: name.into(),
            data_type,
            rows: vec![value],
            max_data_size,
        }
    }

    pub fn array(
        name: impl Into<String>,
        data_type: DataType,
        rows: Vec<Option<Vec<u8>>>,
        max_data_size: usize,
    ) -> Self {
        BindSlot {
            name: name.into(),
            data_type,
            rows,
            max_data_size,
        }
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Name without the colon sigil.
    pub fn bare_name(&self) -> &str {
        self.name.strip_prefix(':').unwrap_or(&self.name)
    }

    /// A temporal bind with an empty string value binds as NULL.
    pub fn normalize_temporal_nulls(&mut self) {
        if !self.data_type.is_temporal() {
            return;
        }
        for row in &mut self.rows {
            if matches!(row.as_deref(), Some(b) if b.is_empty()) {
                *row = None;
            }
        }
    }
}

/// An OUT / IN-OUT placeholder. All row buffers are allocated up front at
/// `max_len`; the driver fills lengths, indicators and per-row return
/// codes when the statement executes.
#[derive(Debug, Clone)]
pub struct OutBindSlot {
    pub name: String,
    pub data_type: DataType,
    /// Position in the RETURNING clause, 0-based.
    pub pos: usize,
    pub max_len: usize,
    /// Rows actually returned; capped at `MAX_DYNAMIC_BIND_ROWS`.
    pub rows_returned: usize,
    pub buffers: Vec<Vec<u8>>,
    pub lengths: Vec<usize>,
    /// -1 marks NULL.
    pub indicators: Vec<i16>,
    pub return_codes: Vec<u16>,
}

impl OutBindSlot {
    pub fn new(name: impl Into<String>, data_type: DataType, pos: usize, max_len: usize) -> Self {
        let max_len = if max_len == 0 {
            MAX_OUT_BIND_VAR_SIZE
        } else {
            max_len
        };
        OutBindSlot {
            name: name.into(),
            data_type,
            pos,
            max_len,
            rows_returned: 0,
            buffers: vec![vec![0u8; max_len]; MAX_DYNAMIC_BIND_ROWS],
            lengths: vec![0; MAX_DYNAMIC_BIND_ROWS],
            // the IN side of an OUT bind starts as NULL
            indicators: vec![-1; MAX_DYNAMIC_BIND_ROWS],
            return_codes: vec![0; MAX_DYNAMIC_BIND_ROWS],
        }
    }

    /// The value for one returned row, or None when NULL.
    pub fn value(&self, row: usize) -> Option<&[u8]> {
        if self.indicators[row] == -1 {
            None
        } else {
            Some(&self.buffers[row][..self.lengths[row]])
        }
    }

    /// Driver-side helper: store one returned row.
    pub fn store(&mut self, row: usize, value: Option<&[u8]>) {
        match value {
            None => {
                self.indicators[row] = -1;
                self.lengths[row] = 0;
            }
            Some(v) => {
                let n = v.len().min(self.max_len);
                self.buffers[row][..n].copy_from_slice(&v[..n]);
                self.lengths[row] = n;
                self.indicators[row] = 0;
            }
        }
        if row >= self.rows_returned {
            self.rows_returned = row + 1;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn single_bind_sizes() {
        let slot = BindSlot::single(":id", DataType::String, Some(b"2050".to_vec()));
        assert_eq!(slot.row_count(), 1);
        assert_eq!(slot.max_data_size, 4);
        assert_eq!(slot.bare_name(), "id");
    }

    #[test]
    fn temporal_empty_is_null() {
        let mut slot = BindSlot::single(":ts", DataType::Timestamp, Some(Vec::new()));
        slot.normalize_temporal_nulls();
        assert!(slot.rows[0].is_none());

        // non-temporal empty strings stay empty strings
        let mut s2 = BindSlot::single(":s", DataType::String, Some(Vec::new()));
        s2.normalize_temporal_nulls();
        assert_eq!(s2.rows[0].as_deref(), Some(&b""[..]));
    }

    #[test]
    fn out_slot_rows() {
        let mut slot = OutBindSlot::new(":out1", DataType::String, 0, 8);
        assert!(slot.value(0).is_none());
        slot.store(0, Some(b"abcdefghij"));
        assert_eq!(slot.value(0).unwrap(), b"abcdefgh"); // truncated at max_len
        assert_eq!(slot.rows_returned, 1);
        slot.store(0, None);
        assert!(slot.value(0).is_none());
    }
}
