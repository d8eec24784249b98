pub mod backend;
pub mod janitor;
pub mod local;
pub mod object_store;

pub use backend::StorageBackend;
pub use janitor::StaleSessionJanitor;
pub use local::LocalBackend;
pub use object_store::ObjectStoreBackend;
