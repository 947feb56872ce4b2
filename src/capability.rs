//! Capability gate consulted before outbound requests.
//!
//! The policy decides whether the peer advertised support for a method.
//! It is only consulted when strict enforcement is enabled on the engine;
//! a rejection aborts the send before a request ID is allocated.

use std::collections::HashSet;

use crate::error::{Result, RpcError};

/// Decides whether a method may be sent to the peer.
pub trait CapabilityPolicy: Send + Sync + 'static {
    fn assert_capability_for_method(&self, method: &str) -> Result<()>;
}

impl<F> CapabilityPolicy for F
where
    F: Fn(&str) -> Result<()> + Send + Sync + 'static,
{
    fn assert_capability_for_method(&self, method: &str) -> Result<()> {
        self(method)
    }
}

/// Allows only an explicit set of methods.
#[derive(Debug, Clone, Default)]
pub struct MethodAllowList {
    methods: HashSet<String>,
}

impl MethodAllowList {
    pub fn new<I, S>(methods: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            methods: methods.into_iter().map(Into::into).collect(),
        }
    }

    pub fn allow(&mut self, method: impl Into<String>) {
        self.methods.insert(method.into());
    }
}

impl CapabilityPolicy for MethodAllowList {
    fn assert_capability_for_method(&self, method: &str) -> Result<()> {
        if self.methods.contains(method) {
            Ok(())
        } else {
            Err(RpcError::Capability {
                method: method.to_string(),
                reason: "peer did not advertise this capability".into(),
            })
        }
    }
}
