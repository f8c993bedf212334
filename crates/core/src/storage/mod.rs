pub mod store;

pub use store::RedbStore;
