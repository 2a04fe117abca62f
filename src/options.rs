use encoding_rs::Encoding;

/// Caller-side knobs for one decode.
#[derive(Debug, Clone, Default)]
pub struct DecodeOptions {
    /// Decode text with this encoding instead of the one the file declares.
    pub encoding: Option<&'static Encoding>,
    /// Number of leading rows to skip.
    pub row_offset: u64,
    /// Maximum number of rows to emit.
    pub row_limit: Option<u64>,
}

impl DecodeOptions {
    pub fn with_encoding(mut self, encoding: &'static Encoding) -> Self {
        self.encoding = Some(encoding);
        self
    }

    pub fn with_row_offset(mut self, row_offset: u64) -> Self {
        self.row_offset = row_offset;
        self
    }

    pub fn with_row_limit(mut self, row_limit: u64) -> Self {
        self.row_limit = Some(row_limit);
        self
    }

    /// The rows of a file holding `declared` rows that this decode emits.
    pub fn window(&self, declared: u64) -> RowWindow {
        let start = self.row_offset.min(declared);
        let available = declared - start;
        let count = match self.row_limit {
            Some(limit) => limit.min(available),
            None => available,
        };
        RowWindow { start, count }
    }
}

/// Maps source rows onto emitted rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowWindow {
    start: u64,
    count: u64,
}

impl RowWindow {
    /// Rows emitted; this is the metadata row count.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// First source row past the window.
    pub fn end(&self) -> u64 {
        self.start + self.count
    }

    /// Emitted row index of source row `row`, if it is inside the window.
    pub fn map(&self, row: u64) -> Option<u64> {
        if row >= self.start && row < self.end() {
            Some(row - self.start)
        } else {
            None
        }
    }

    pub fn is_done(&self, row: u64) -> bool {
        row >= self.end()
    }
}
