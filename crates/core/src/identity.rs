use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Who a running service instance is.
///
/// `name` is shared by every instance of a deployment. `service_id` tells
/// instances apart on the wire and is what master-job negotiation compares;
/// `instance_id` is unique per process start.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceIdentity {
    pub name: String,
    pub service_id: String,
    pub instance_id: Uuid,
}

impl ServiceIdentity {
    pub fn new(name: impl Into<String>, service_id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            service_id: service_id.into(),
            instance_id: Uuid::new_v4(),
        }
    }

    /// Identity with a generated service id, for single-process setups and tests.
    pub fn generated(name: impl Into<String>) -> Self {
        let name = name.into();
        let service_id = format!("{}-{}", name, &Uuid::new_v4().simple().to_string()[..8]);
        Self::new(name, service_id)
    }
}

impl fmt::Display for ServiceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name, self.service_id)
    }
}
