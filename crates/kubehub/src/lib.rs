//! mcpsync kubehub: discovery of watchable types and the informers feeding
//! object changes into the sync pipeline.

#![forbid(unsafe_code)]

mod discovery;
mod forward;
mod informer;
mod secret;

pub use discovery::{crd_resource, discover, gather_groups, is_crd_resource, merge_discovered, DiscoveryError, WatchedResource};
pub use forward::{raw_object, ChangeForwarder};
pub use informer::{dispatch, Informer, ResourceEventHandler};
pub use secret::SecretTokenSource;
