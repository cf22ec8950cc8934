use crate::error::ReconcileError;
use std::fmt;
use std::str::FromStr;

const DELIMITER: char = ':';

/// Composite key of one remote resource: `<parent>:<discriminant>`.
///
/// For a listener the parent is the load balancer and the discriminant its
/// frontend port, for a virtual network the region and the network id.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ResourceIdentity {
    parent: String,
    discriminant: String,
}

impl ResourceIdentity {
    pub fn new<P: Into<String>, D: ToString>(parent: P, discriminant: D) -> Self {
        Self {
            parent: parent.into(),
            discriminant: discriminant.to_string(),
        }
    }

    pub fn parent(&self) -> &str {
        &self.parent
    }

    pub fn discriminant(&self) -> &str {
        &self.discriminant
    }

    /// The discriminant interpreted as a port number.
    pub fn port(&self) -> Result<u16, ReconcileError> {
        match self.discriminant.parse::<u16>() {
            Ok(port) if port > 0 => Ok(port),
            _ => Err(ReconcileError::malformed(
                &self.to_string(),
                format!("'{}' is not a valid port", self.discriminant),
            )),
        }
    }
}

impl fmt::Display for ResourceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.parent, DELIMITER, self.discriminant)
    }
}

impl FromStr for ResourceIdentity {
    type Err = ReconcileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(DELIMITER).collect();
        match parts.as_slice() {
            [parent, discriminant] if !parent.is_empty() && !discriminant.is_empty() => {
                Ok(Self::new(*parent, discriminant))
            }
            [_, _] => Err(ReconcileError::malformed(s, "empty component")),
            _ => Err(ReconcileError::malformed(
                s,
                format!("expected exactly two components separated by '{DELIMITER}'"),
            )),
        }
    }
}
