//! Routing core of the basket router.
//!
//! One logical endpoint in front of many backend connections:
//! - `AdapterRouter`: picks destination backends for a request
//! - `ParentChildMap`: fan-out bookkeeping and outcome aggregation
//! - `SubscriptionRoutingState`: failover retries after "not supported"
//! - `OrderRoutingState`: portfolio/security pins and order ownership
//! - `ConnectionManager`: connect/disconnect/reset and pending buffers
//! - `BasketRoutingManager`: request dispatch and reply rewriting
//! - `BasketRouter`: the public façade with per-backend reply tasks

pub mod basket;
pub mod config;
pub mod connection_manager;
pub mod connection_state;
pub mod error;
pub mod manager;
pub mod order_routing;
pub mod parent_child;
pub mod pending;
pub mod router;
pub mod subscription_routing;

pub use basket::BasketRouter;
pub use config::RouterConfig;
pub use connection_manager::{BoundConnection, ConnectionManager, Dispatch};
pub use connection_state::{BasketEvent, ConnectionSnapshot, ConnectionState, ConnectionStateTracker};
pub use error::{RoutingError, RoutingResult};
pub use manager::{BasketRoutingManager, ProcessOutput, RoutingState};
pub use order_routing::OrderRoutingState;
pub use parent_child::{ChildOutcome, ChildState, ParentChildMap, ParentEvent, Resolution, Translation};
pub use pending::PendingMessageBuffer;
pub use router::{AdapterRouter, Destination};
pub use subscription_routing::{FailoverEntry, SubscriptionRoutingState};
