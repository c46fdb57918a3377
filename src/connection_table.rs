use crate::{Error, Result};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Which output channels read which input channels.
///
/// Rows are output channels, columns are input channels. An empty table
/// connects every pair.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ConnectionTable {
    rows: usize,
    cols: usize,
    connected: Vec<bool>,
}

impl ConnectionTable {
    /// A fully connected table.
    pub fn new() -> Self {
        Self::default()
    }
    /// Creates a table from a row major `rows x cols` slice.
    ///
    /// **Errors**
    ///
    /// The slice must have `rows * cols` entries.
    pub fn from_slice(connected: &[bool], rows: usize, cols: usize) -> Result<Self> {
        if rows.checked_mul(cols) != Some(connected.len()) {
            return Err(Error::Config(format!(
                "connection table of {} entries is not {rows}x{cols}",
                connected.len()
            )));
        }
        Ok(Self {
            rows,
            cols,
            connected: connected.to_vec(),
        })
    }
    /// Splits channels into `groups` independent blocks.
    ///
    /// **Errors**
    ///
    /// Both `rows` and `cols` must be divisible by `groups`.
    pub fn from_groups(groups: usize, rows: usize, cols: usize) -> Result<Self> {
        if groups == 0 || rows % groups != 0 || cols % groups != 0 {
            return Err(Error::Config(format!(
                "invalid group size {groups} for {rows}x{cols} connection table"
            )));
        }
        let rows_per_group = rows / groups;
        let cols_per_group = cols / groups;
        let connected = (0..rows)
            .flat_map(|r| (0..cols).map(move |c| r / rows_per_group == c / cols_per_group))
            .collect();
        Ok(Self {
            rows,
            cols,
            connected,
        })
    }
    /// Whether `output` reads `input`.
    pub fn is_connected(&self, output: usize, input: usize) -> bool {
        self.is_empty() || self.connected[output * self.cols + input]
    }
    pub fn is_empty(&self) -> bool {
        self.rows == 0 && self.cols == 0
    }
    pub fn rows(&self) -> usize {
        self.rows
    }
    pub fn cols(&self) -> usize {
        self.cols
    }
}
