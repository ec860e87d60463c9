// Storage engines implementing the TenantStore port
pub mod in_memory_store;
pub mod postgres_store;

pub use in_memory_store::InMemoryTenantStore;
pub use postgres_store::PostgresTenantStore;
