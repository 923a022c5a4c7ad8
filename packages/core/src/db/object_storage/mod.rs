//! Object storage backend: bucket contract, reference signing and the
//! saga-based datastore built on them.

mod bucket;
mod signer;
mod store;

pub use bucket::{Bucket, BucketError, LocalBucket, ObjectMeta, PutOptions};
pub use signer::ReferenceSigner;
pub use store::ObjectStorageStore;
