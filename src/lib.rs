//! Revision history and lifecycle for feature flags.
//!
//! A flag owns an ordered log of revisions. At most one of them is `live`;
//! proposals start as `draft`, approval promotes a draft and archives the
//! previous live revision, rollback undoes the last promotion. Every change is
//! recorded in the flag's timeline.
//!
//! # Examples
//! ```
//! use std::sync::Arc;
//! use flagvault_lib::{Caller, FlagService, FlagType, MemoryStore, NewFlag, TransitionPolicy};
//!
//! # tokio_test_block(async {
//! let service = FlagService::new(Arc::new(MemoryStore::new()), TransitionPolicy::Strict);
//! let caller = Caller::new(uuid::Uuid::new_v4().into(), uuid::Uuid::new_v4().into());
//! let flag = service
//!     .create_flag(
//!         caller,
//!         &NewFlag {
//!             name: "new-checkout".into(),
//!             flag_type: FlagType::Boolean,
//!             default_value: "false".into(),
//!             rules: vec![],
//!             environment: "production".into(),
//!             project: None,
//!             tags: vec![],
//!         },
//!     )
//!     .await
//!     .unwrap();
//! assert_eq!(flag.version, 1);
//! # });
//! # fn tokio_test_block<F: std::future::Future>(f: F) -> F::Output {
//! #     tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(f)
//! # }
//! ```

pub mod clock;
pub mod engine;
pub mod error;
pub mod ids;
pub mod model;
pub mod revisions;
pub mod service;
pub mod store;
pub mod timeline;

pub use clock::{Clock, SteppingClock, SystemClock};
pub use engine::{Outcome, Transition, TransitionPolicy, VersioningEngine};
pub use error::{FlagError, Result};
pub use ids::{IdGenerator, RandomIds, SequentialIds};
pub use model::{
    Environment, FeatureFlag, FlagId, FlagType, NewFlag, OrganizationId, Revision, RevisionId,
    RevisionStatus, Rule, RuleId, RuleSpec, UserId,
};
pub use revisions::RevisionLog;
pub use service::{Caller, FlagService};
pub use store::{
    FlagPage, FlagRepository, FlagStore, MemoryStore, Page, TimelineLog, Visibility,
};
#[cfg(feature = "sled")]
pub use store::SledStore;
pub use timeline::{Action, TimelineEntry, TimelineRecord};
