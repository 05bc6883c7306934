use crate::host::{HostError, PeerConnection};
use std::collections::HashMap;
use thiserror::Error;
use tracing::debug;

/// Errors from attribute table lookups.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TableError {
    /// The handle was never discovered on this peer.
    #[error("handle 0x{0:04X} not present in the attribute table")]
    UnknownHandle(u16),
}

/// Position of an attribute in the peer's capability tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttributeKind {
    Service,
    Characteristic,
    Descriptor,
}

/// One addressable entity on the peer.
///
/// Handles are peer-assigned and stable for the lifetime of the session.
/// `children` holds the handles of directly nested attributes (a service's
/// characteristics, a characteristic's descriptors).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub handle: u16,
    pub kind: AttributeKind,
    pub children: Vec<u16>,
}

/// Flattened, handle-indexed view of the peer's discovered capability tree.
///
/// Built once per session, immutable afterwards. The flat sequence preserves
/// depth-first discovery order: each service, then its characteristics, then
/// each characteristic's descriptors.
#[derive(Debug, Default)]
pub struct AttributeTable {
    attributes: Vec<Attribute>,
    index: HashMap<u16, usize>,
}

impl AttributeTable {
    /// Run one full discovery pass over `conn` and build the table.
    ///
    /// Enumeration of each tree level is delegated to the host stack; this
    /// type owns only the flattening and the handle index.
    pub async fn discover<C>(conn: &mut C) -> Result<Self, HostError>
    where
        C: PeerConnection + ?Sized,
    {
        let mut table = Self::default();

        for service in conn.discover_services().await? {
            let characteristics = conn.discover_characteristics(service).await?;
            table.push(service, AttributeKind::Service, characteristics.clone());

            for characteristic in characteristics {
                let descriptors = conn.discover_descriptors(characteristic).await?;
                table.push(
                    characteristic,
                    AttributeKind::Characteristic,
                    descriptors.clone(),
                );

                for descriptor in descriptors {
                    table.push(descriptor, AttributeKind::Descriptor, Vec::new());
                }
            }
        }

        debug!(attributes = table.len(), "attribute discovery complete");
        Ok(table)
    }

    fn push(&mut self, handle: u16, kind: AttributeKind, children: Vec<u16>) {
        self.index.insert(handle, self.attributes.len());
        self.attributes.push(Attribute {
            handle,
            kind,
            children,
        });
    }

    /// Resolve a handle. Absent handles are a defined failure, never a
    /// default value.
    pub fn lookup(&self, handle: u16) -> Result<&Attribute, TableError> {
        self.index
            .get(&handle)
            .map(|&i| &self.attributes[i])
            .ok_or(TableError::UnknownHandle(handle))
    }

    /// All discovered attributes in discovery order.
    pub fn attributes(&self) -> &[Attribute] {
        &self.attributes
    }

    pub fn len(&self) -> usize {
        self.attributes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }
}
