//! Namespace ownership lookup.
//!
//! Resolution walks the coordination service: the namespace's bundle, the
//! bundle owner's lookup data, then that broker's advertised listener for
//! this protocol. Any missing link is `BrokerNotFound`; results are cached
//! per namespace behind a single-flight guard.

mod advertisement;
mod cache;
mod client;
mod coordination;
mod namespace;

pub use advertisement::{
    lookup_data_path, BrokerEndpoint, ServiceLookupData, DEFAULT_AMQP_PORT,
    LOADBALANCE_BROKERS_ROOT,
};
pub use cache::{Ownership, OwnershipCache};
pub use client::LookupClient;
pub use coordination::{BundleDescriptor, CoordinationClient, InMemoryCoordination, FULL_BUNDLE_RANGE};
pub use namespace::{NamespaceName, DEFAULT_NAMESPACE};
