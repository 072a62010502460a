pub mod estimator;
pub mod events;
pub mod health;
pub mod lifecycle;
pub mod metrics;
pub mod placement;
pub mod queue;
pub mod registry;
pub mod service;
pub mod worker;

pub use estimator::{MemoryEstimate, MemoryEstimator};
pub use events::EventBus;
pub use health::{HealthMonitor, WorkerFailure, WorkerRecord};
pub use lifecycle::{CancelOutcome, LifecycleManager, SupervisionReport, TaskOutcome};
pub use metrics::SchedulerMetrics;
pub use placement::{Placement, Scheduler, TickReport};
pub use queue::{PriorityQueue, QueueEntry, QueueStats};
pub use registry::{GpuRegistry, GpuSummary, GpuTelemetry, GpuView};
pub use service::{SchedulerService, ServiceStatus, ServiceTick, SharedService};
pub use worker::{Assignment, ChannelWorkerControl, WorkerCommand, WorkerControl};
