//! Typed stores over the generic record store

pub mod original_store;
pub mod provenance_store;
pub mod request_store;

pub use original_store::OriginalRequestStore;
pub use provenance_store::ProvenanceStore;
pub use request_store::RequestStore;
