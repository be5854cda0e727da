//! # Flotilla Core
//!
//! Domain types and plan configuration for the Flotilla fleet deployment
//! orchestrator.
//!
//! - [`DeploymentPlan`] - validated, immutable configuration for one run
//! - [`Server`] - inventory entry plus traffic and deploy state
//! - [`DeploymentRecord`] - history entry; the last `Success` record is the rollback target
//! - [`MetricSample`] and [`RollbackDecision`] - inputs and outputs of the metrics watch
//! - [`RunState`] - orchestrator state machine
//!
//! ## Example
//!
//! ```rust
//! use flotilla_core::{DeploymentPlan, ServerSpec, Strategy};
//!
//! let plan = DeploymentPlan::builder("staging", "1.4.0")
//!     .strategy(Strategy::Rolling)
//!     .batch_size(2)
//!     .server(ServerSpec::new("web-1", "10.0.0.1:8080"))
//!     .server(ServerSpec::new("web-2", "10.0.0.2:8080"))
//!     .build()
//!     .unwrap();
//! assert_eq!(plan.worker_limit(), 2);
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod plan;
pub mod record;
pub mod run;
pub mod server;
pub mod validation;


pub use error::{ConfigError, Result};
pub use plan::{
    is_valid_environment_name, load_inventory, load_plan, read_plan_file, DeploymentPlan,
    DeploymentPlanBuilder, HealthCheckPolicy, Integrations, PlanLoader, RetrySettings,
    RollbackThresholds, Strategy, MAX_DURATION_SECONDS,
};
pub use record::{
    DeploymentRecord, DeploymentStatus, MetricSample, RollbackDecision, RollbackScope,
    RollbackTrigger,
};
pub use run::RunState;
pub use server::{DeployState, Server, ServerId, ServerSpec, Slot, TrafficState, TransitionError};
pub use validation::{Validate, ValidationError, ValidationErrorKind, ValidationErrors};
