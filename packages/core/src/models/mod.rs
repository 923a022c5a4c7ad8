//! Object model: value types and the component selector
//!
//! Everything in this module is pure data, with no I/O.

mod blob;
mod metadata;
mod object;
mod selector;
pub mod validation;

pub use blob::{Blob, BlobContent};
pub use metadata::Metadata;
pub use object::{new_object_id, new_vtag, Fields, Object, ObjectKey, DEFAULT_NAMESPACE};
pub use selector::ComponentSelector;
