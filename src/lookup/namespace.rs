//! Virtual host to namespace naming.

use std::fmt;

/// Namespace used when the client opens the root virtual host.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Cluster namespace a client session addresses.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NamespaceName(String);

impl NamespaceName {
    /// Map an AMQP virtual host onto a namespace.
    ///
    /// The leading `/` is dropped, an empty host becomes `default`, and a
    /// configured tenant is prefixed: `("/vhostA", Some("public"))` gives
    /// `public/vhostA`.
    pub fn from_virtual_host(virtual_host: &str, tenant: Option<&str>) -> Self {
        let trimmed = virtual_host.strip_prefix('/').unwrap_or(virtual_host);
        let local = if trimmed.is_empty() {
            DEFAULT_NAMESPACE
        } else {
            trimmed
        };
        match tenant.filter(|t| !t.is_empty()) {
            Some(tenant) => Self(format!("{tenant}/{local}")),
            None => Self(local.to_owned()),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NamespaceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for NamespaceName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
