//! Field-delta engine.
//!
//! Translates aggregate snapshots into the stored field form and computes
//! the minimal write/delete mutations between two snapshots. No I/O.

mod encode;
mod field_delta;

pub use encode::{
    decode_metric, encode_metric, format_timestamp, parse_timestamp, truncate, FieldValues,
    TRUNCATION_MARKER,
};
pub use field_delta::{fields_to_delete, fields_to_write, FieldDelta};
