use crate::{Error, Result};
use std::str::SplitWhitespace;

/// Reads whitespace separated parameter values.
pub struct WeightReader<'a> {
    tokens: SplitWhitespace<'a>,
    read: usize,
    expected: usize,
}

impl<'a> WeightReader<'a> {
    /// Reads `expected` values from `text`.
    pub fn new(text: &'a str, expected: usize) -> Self {
        Self {
            tokens: text.split_whitespace(),
            read: 0,
            expected,
        }
    }
    /// The next value.
    ///
    /// **Errors**
    ///
    /// If the stream is exhausted or the token is not a number.
    pub fn next_value(&mut self) -> Result<f32> {
        let token = self.tokens.next().ok_or(Error::UnexpectedEof {
            read: self.read,
            expected: self.expected,
        })?;
        let value = token.parse().map_err(|_| Error::Parse {
            position: self.read,
            message: format!("{token:?} is not a number"),
        })?;
        self.read += 1;
        Ok(value)
    }
    /// Number of values read so far.
    pub fn read(&self) -> usize {
        self.read
    }
}
