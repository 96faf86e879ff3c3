//! Sample dictionaries
//!
//! The data model threaded through every pipeline stage: a nested,
//! path-addressable map of tagged values.

pub mod array;
pub mod dict;
pub mod value;

pub use array::{ArrayData, NdArray};
pub use dict::{SampleDict, OP_INFO_KEY, SAMPLE_ID_KEY};
pub use value::Value;
