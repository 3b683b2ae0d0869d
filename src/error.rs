use std::fmt;

use crate::os::OsError;

#[derive(Debug)]
pub enum SegmentError {
  /// No segment could be produced for a request of this size.
  OutOfMemory { size: usize },
  Os(OsError),
  /// Every slot of the pool's segment table is in use.
  SlotsExhausted { capacity: usize },
  InvalidAlignment { alignment: usize },
}

impl fmt::Display for SegmentError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      SegmentError::OutOfMemory { size } => {
        write!(f, "out of memory allocating a page of {size} bytes")
      }
      SegmentError::Os(e) => write!(f, "OS error: {e}"),
      SegmentError::SlotsExhausted { capacity } => {
        write!(f, "segment table full ({capacity} segments)")
      }
      SegmentError::InvalidAlignment { alignment } => {
        write!(f, "alignment {alignment} is not a power of two")
      }
    }
  }
}

impl std::error::Error for SegmentError {
  fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
    match self {
      SegmentError::Os(e) => Some(e),
      _ => None,
    }
  }
}

impl From<OsError> for SegmentError {
  fn from(e: OsError) -> Self {
    SegmentError::Os(e)
  }
}
