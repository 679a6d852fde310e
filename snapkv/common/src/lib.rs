//! Common data model shared by the storage and transaction layers.
//!
//! Everything stored by snapkv is addressed by a [`TableRef`] and a [`Cell`]
//! (row and column), and every stored [`Value`] carries the [`Timestamp`] of the
//! transaction that wrote it.

pub mod cell;
pub mod range;
pub mod timestamp;

pub use cell::{Cell, TableRef, Value};
pub use range::{ColumnSelection, RangeRequest, RowResult};
pub use timestamp::Timestamp;
