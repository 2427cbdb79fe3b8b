//! Normalized image operations and the canonical request key.
//!
//! A client request is turned into an [`OperationList`]: an identifier, a
//! scale constraint and a set of operations kept in a fixed order
//! regardless of how they were added:
//!
//! ```text
//! Crop -> Redact -> Scale -> Rotate -> ColorTransform -> Overlay -> Encode
//! ```
//!
//! The list is built once through [`OperationListBuilder`] and is immutable
//! afterwards. Its canonical string lists only operations that change the
//! output, so requests that differ solely in no-ops share one cache entry.
//! The SHA-256 of that string is the variant cache key.

mod list;
mod ops;
mod types;

pub use list::{OperationList, OperationListBuilder, ProcessingPlan};
pub use ops::{
    ColorTransform, Crop, Encode, Operation, Overlay, Position, Redact, Rotate, Scale, ScaleMode,
};
pub use types::{Dimension, Identifier, Orientation, Rectangle, ScaleConstraint};
