pub mod memory_account_repository;
pub mod memory_job_definition_repository;
pub mod memory_job_execution_repository;
pub mod memory_job_request_repository;
pub mod memory_lease_store;

pub use memory_account_repository::MemoryAccountRepository;
pub use memory_job_definition_repository::MemoryJobDefinitionRepository;
pub use memory_job_execution_repository::MemoryJobExecutionRepository;
pub use memory_job_request_repository::MemoryJobRequestRepository;
pub use memory_lease_store::MemoryLeaseStore;
