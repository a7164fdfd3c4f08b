use std::fmt;

// Shape — dimension sizes of a tensor
//
// A Shape lists the size of each dimension. Every operator entry point in
// this runtime accepts ranks 1 through 4; an empty shape is the sentinel for
// an uninitialized tensor and is rejected everywhere else.
//
// The shape determines:
//   1. The element count (product of all dims)
//   2. The rows × last-dim view used by the port-width padding scheme
//   3. Operator shape rules (matmul contraction, concat widths, ...)

/// Maximum rank accepted by any operator entry point.
pub const MAX_RANK: usize = 4;

/// N-dimensional shape of a tensor.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Shape(Vec<usize>);

impl Shape {
    /// Create a new shape from a vector of dimension sizes.
    pub fn new(dims: Vec<usize>) -> Self {
        Shape(dims)
    }

    /// The empty shape used as the uninitialized-tensor sentinel.
    pub fn empty() -> Self {
        Shape(Vec::new())
    }

    /// The dimension sizes as a slice.
    pub fn dims(&self) -> &[usize] {
        &self.0
    }

    /// Number of dimensions.
    pub fn rank(&self) -> usize {
        self.0.len()
    }

    /// Whether this is the uninitialized sentinel.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Total number of elements (product of all dimensions).
    /// The empty sentinel has 0 elements.
    pub fn elem_count(&self) -> usize {
        if self.0.is_empty() {
            0
        } else {
            self.0.iter().product()
        }
    }

    /// Size of a specific dimension.
    pub fn dim(&self, d: usize) -> crate::Result<usize> {
        self.0.get(d).copied().ok_or(crate::Error::DimOutOfRange {
            dim: d,
            rank: self.rank(),
        })
    }

    /// Size of the last dimension. 0 for the empty sentinel.
    pub fn last_dim(&self) -> usize {
        self.0.last().copied().unwrap_or(0)
    }

    /// Number of rows in the rows × last-dim view used by padding:
    /// the product of all dimensions except the last.
    pub fn row_count(&self) -> usize {
        if self.0.is_empty() {
            0
        } else {
            self.0[..self.0.len() - 1].iter().product()
        }
    }

    /// The same shape with the last dimension replaced.
    pub fn with_last_dim(&self, last: usize) -> Shape {
        let mut dims = self.0.clone();
        if let Some(d) = dims.last_mut() {
            *d = last;
        }
        Shape(dims)
    }

    /// Prepend singleton dimensions until the shape has `rank` dimensions.
    /// Used by operator rank normalization; a no-op when already at `rank`.
    pub fn lead_expand(&self, rank: usize) -> Shape {
        if self.rank() >= rank {
            return self.clone();
        }
        let mut dims = vec![1usize; rank - self.rank()];
        dims.extend_from_slice(&self.0);
        Shape(dims)
    }

    /// Drop `n` leading singleton dimensions, undoing [`lead_expand`].
    /// Dimensions that are not 1 are kept.
    ///
    /// [`lead_expand`]: Shape::lead_expand
    pub fn lead_squeeze(&self, n: usize) -> Shape {
        let mut skip = 0;
        for &d in self.0.iter().take(n) {
            if d == 1 {
                skip += 1;
            } else {
                break;
            }
        }
        Shape(self.0[skip..].to_vec())
    }

    /// Validate that this shape is usable at an operator boundary:
    /// rank in [1, MAX_RANK] and no zero-sized dimensions.
    pub fn check_operand(&self) -> crate::Result<()> {
        if self.is_empty() || self.rank() > MAX_RANK {
            return Err(crate::Error::RankMismatch {
                expected: MAX_RANK,
                got: self.rank(),
            });
        }
        if self.0.contains(&0) {
            return Err(crate::Error::msg(format!(
                "zero-sized dimension in shape {self}"
            )));
        }
        Ok(())
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, d) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", d)?;
        }
        write!(f, "]")
    }
}

// Convenient From implementations so call sites can write
// Shape::from((2, 3)) instead of Shape::new(vec![2, 3]).

impl From<usize> for Shape {
    fn from(d: usize) -> Self {
        Shape(vec![d])
    }
}

impl From<(usize, usize)> for Shape {
    fn from((d0, d1): (usize, usize)) -> Self {
        Shape(vec![d0, d1])
    }
}

impl From<(usize, usize, usize)> for Shape {
    fn from((d0, d1, d2): (usize, usize, usize)) -> Self {
        Shape(vec![d0, d1, d2])
    }
}

impl From<(usize, usize, usize, usize)> for Shape {
    fn from((d0, d1, d2, d3): (usize, usize, usize, usize)) -> Self {
        Shape(vec![d0, d1, d2, d3])
    }
}

impl From<Vec<usize>> for Shape {
    fn from(v: Vec<usize>) -> Self {
        Shape(v)
    }
}

impl From<&[usize]> for Shape {
    fn from(s: &[usize]) -> Self {
        Shape(s.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vector_shape() {
        let s = Shape::from(5);
        assert_eq!(s.rank(), 1);
        assert_eq!(s.elem_count(), 5);
        assert_eq!(s.row_count(), 1);
        assert_eq!(s.last_dim(), 5);
    }

    #[test]
    fn test_matrix_rows() {
        let s = Shape::from((3, 4));
        assert_eq!(s.elem_count(), 12);
        assert_eq!(s.row_count(), 3);
        assert_eq!(s.last_dim(), 4);
    }

    #[test]
    fn test_empty_sentinel() {
        let s = Shape::empty();
        assert!(s.is_empty());
        assert_eq!(s.elem_count(), 0);
        assert!(s.check_operand().is_err());
    }

    #[test]
    fn test_lead_expand_squeeze() {
        let s = Shape::from((2, 3));
        let e = s.lead_expand(4);
        assert_eq!(e.dims(), &[1, 1, 2, 3]);
        assert_eq!(e.lead_squeeze(2), s);
        // Expanding to a smaller rank is a no-op.
        assert_eq!(s.lead_expand(1), s);
    }

    #[test]
    fn test_lead_squeeze_keeps_real_dims() {
        let s = Shape::from((2, 1, 3));
        // First dim is 2, not 1 — nothing to drop.
        assert_eq!(s.lead_squeeze(2), s);
    }

    #[test]
    fn test_check_operand_rank_bounds() {
        assert!(Shape::from((2, 3)).check_operand().is_ok());
        assert!(Shape::new(vec![1; 5]).check_operand().is_err());
        assert!(Shape::from((2, 0)).check_operand().is_err());
    }

    #[test]
    fn test_display() {
        assert_eq!(format!("{}", Shape::from((3, 4))), "[3, 4]");
    }
}
