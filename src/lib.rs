#![forbid(unsafe_code)]

pub mod error;
pub mod inmemory;
pub mod model;
pub mod monitor;
#[cfg(feature = "redis")]
pub mod redis_store;
pub mod store;
pub mod unified;
pub mod validator;
pub mod workflow;

pub use error::{SessionError, SessionResult, ValidationError};
pub use model::{ContractState, ContractStatus, SessionContext, SessionId, StoredSession};
pub use monitor::{MonitorConfig, TransitionMonitor};
pub use store::{create_backing_store, BackendConfig, BackingStore};
pub use unified::{PerformanceMetrics, StoreConfig, UnifiedSessionStore};
pub use workflow::{ContractWorkflow, WorkflowFactory};
