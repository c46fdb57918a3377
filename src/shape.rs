use crate::{Error, Result};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

/// Width x height x depth of a port.
///
/// Values are stored channel major: see [`Shape3d::get_index`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(try_from = "RawShape3d")
)]
pub struct Shape3d {
    width: usize,
    height: usize,
    depth: usize,
}

/// Unchecked [`Shape3d`] fields, validated by [`Shape3d::new`].
#[cfg(feature = "serde")]
#[derive(Deserialize)]
#[serde(rename = "Shape3d")]
struct RawShape3d {
    width: usize,
    height: usize,
    depth: usize,
}

#[cfg(feature = "serde")]
impl TryFrom<RawShape3d> for Shape3d {
    type Error = Error;
    fn try_from(raw: RawShape3d) -> Result<Self> {
        Self::new(raw.width, raw.height, raw.depth)
    }
}

impl Shape3d {
    /// Creates a new shape.
    ///
    /// **Errors**
    ///
    /// The number of elements must fit in `usize`.
    pub fn new(width: usize, height: usize, depth: usize) -> Result<Self> {
        width
            .checked_mul(height)
            .and_then(|area| area.checked_mul(depth))
            .ok_or_else(|| {
                Error::Config(format!("shape {width}x{height}x{depth} overflows usize"))
            })?;
        Ok(Self {
            width,
            height,
            depth,
        })
    }
    /// A flat vector of `len` elements, ie `len x 1 x 1`.
    pub fn vector(len: usize) -> Self {
        Self {
            width: len,
            height: 1,
            depth: 1,
        }
    }
    pub fn width(&self) -> usize {
        self.width
    }
    pub fn height(&self) -> usize {
        self.height
    }
    pub fn depth(&self) -> usize {
        self.depth
    }
    /// `width * height`.
    pub fn area(&self) -> usize {
        self.width * self.height
    }
    /// Number of elements.
    pub fn size(&self) -> usize {
        self.area() * self.depth
    }
    /// The flat index of `(x, y, c)`.
    pub fn get_index(&self, x: usize, y: usize, c: usize) -> usize {
        debug_assert!(x < self.width && y < self.height && c < self.depth);
        (self.height * c + y) * self.width + x
    }
}

impl Display for Shape3d {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}x{}x{}", self.width, self.height, self.depth)
    }
}

/// The role of a layer port.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum PortKind {
    /// Activations flowing between layers.
    Data,
    /// Trainable weights.
    Weight,
    /// Trainable bias.
    Bias,
    /// Targets.
    Label,
    /// Intermediate values kept for the backward pass.
    Aux,
}

impl PortKind {
    /// Whether the optimizer updates ports of this kind.
    pub fn is_trainable(&self) -> bool {
        matches!(self, Self::Weight | Self::Bias)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shape3d_index() {
        let shape = Shape3d::new(4, 3, 2).unwrap();
        assert_eq!(shape.size(), 24);
        assert_eq!(shape.area(), 12);
        assert_eq!(shape.get_index(0, 0, 0), 0);
        assert_eq!(shape.get_index(3, 0, 0), 3);
        assert_eq!(shape.get_index(0, 1, 0), 4);
        assert_eq!(shape.get_index(1, 2, 1), 21);
        assert_eq!(shape.to_string(), "4x3x2");
    }

    #[test]
    fn shape3d_overflow() {
        assert!(Shape3d::new(usize::MAX, 2, 1).is_err());
        assert!(Shape3d::new(usize::MAX, 1, 1).is_ok());
    }

    #[test]
    fn port_kind_trainable() {
        assert!(PortKind::Weight.is_trainable());
        assert!(PortKind::Bias.is_trainable());
        assert!(!PortKind::Data.is_trainable());
        assert!(!PortKind::Aux.is_trainable());
        assert!(!PortKind::Label.is_trainable());
    }

    #[cfg(feature = "serde")]
    #[test]
    fn shape3d_serde() {
        use serde_test::{assert_tokens, Token};
        let shape = Shape3d::new(2, 3, 4).unwrap();
        assert_tokens(
            &shape,
            &[
                Token::Struct {
                    name: "Shape3d",
                    len: 3,
                },
                Token::Str("width"),
                Token::U64(2),
                Token::Str("height"),
                Token::U64(3),
                Token::Str("depth"),
                Token::U64(4),
                Token::StructEnd,
            ],
        );
    }

    #[cfg(feature = "serde")]
    #[test]
    fn shape3d_serde_overflow() {
        use serde_test::{assert_de_tokens_error, Token};
        assert_de_tokens_error::<Shape3d>(
            &[
                Token::Struct {
                    name: "Shape3d",
                    len: 3,
                },
                Token::Str("width"),
                Token::U64(u64::MAX),
                Token::Str("height"),
                Token::U64(2),
                Token::Str("depth"),
                Token::U64(1),
                Token::StructEnd,
            ],
            &format!("invalid configuration: shape {}x2x1 overflows usize", usize::MAX),
        );
    }
}
