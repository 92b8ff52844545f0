// ABOUTME: Cross-session request registry and cron scheduling core for agent gateways
// ABOUTME: Collaborators (agent runtime, channels, clock, stores) are injected; nothing here talks to a model

pub mod clock;
pub mod config;
pub mod cron;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod metrics;
pub mod paths;
pub mod requests;
pub mod store;

// Re-export the core surface for convenient access
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{CronConfig, RequestLimits};
pub use cron::{
    CronService, DeliveryMode, JobDelivery, JobPatch, JobPayload, JobPayloadPatch, JobRecord,
    JobRunState, JobSchedule, NewJob, SessionTarget,
};
pub use dispatch::{AgentDispatcher, JobRunOutcome, RunStatus, SystemEvent};
pub use error::{ErrorKind, RegistryError, RegistryResult};
pub use events::{GatewayEvent, Observers};
pub use requests::{NewRequest, RequestPriority, RequestRecord, RequestRegistry, RequestStatus};
pub use store::{
    FileJobStore, FileRequestStore, JobStore, MemoryJobStore, MemoryRequestStore, RequestStore,
};
