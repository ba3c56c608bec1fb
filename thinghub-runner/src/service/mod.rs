//! Device-facing collaborators
//!
//! The runner reaches devices only through these traits. Transports (MQTT
//! broker, shadow store, presence tracker) implement them elsewhere.
//!
//! All collaborators are trait-based to enable testing and dependency injection.

mod connectivity;
mod desired;
mod method;

pub use connectivity::ConnectivityChecker;
pub use desired::{DesiredStateRequest, DesiredStateSetter};
pub use method::{MethodInvoker, MethodRequest, MethodResponse};

use std::sync::Arc;

/// The collaborator set a runner is built with
#[derive(Clone)]
pub struct Collaborators {
    pub invoker: Arc<dyn MethodInvoker>,
    pub desired: Arc<dyn DesiredStateSetter>,
    pub connectivity: Arc<dyn ConnectivityChecker>,
}
