//! Device identity.
//!
//! The source keeps a dictionary keyed on Python object identity and lets
//! routers and devices hold cyclic references to one another. Here a device
//! is nothing but a stable integer handle issued by [`crate::router::MessageRouter`]
//! at registration time; devices hold only their own handle, never a
//! back-reference to the router. `process` calls take the router(s) they
//! need as borrowed parameters instead.

/// A stable handle identifying a device registered on a [`crate::router::MessageRouter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceId(pub(crate) u32);

impl DeviceId {
    pub fn index(self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "device#{}", self.0)
    }
}

/// Anything that participates on a router and tracks its own stall cycles.
///
/// A stall cycle is a tick in which the device's top-of-pipeline could not
/// make forward progress because of back-pressure from a downstream queue —
/// one uniform definition, replacing the source's inconsistent per-device
/// accounting.
pub trait Device {
    fn device_id(&self) -> DeviceId;

    fn stalled_cycles(&self) -> u64;
}
