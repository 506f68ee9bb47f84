//! Driver interface (C7).
//!
//! A device driver exposes PDO receive callbacks, an EMCY callback, an
//! opaque context, and a free-callback invoked when the driver is unbound.
//! The original ABI (see `co_drv` in the retained C reference) is a
//! dynamically loaded shared object's init symbol filling these fields in;
//! this implementation substitutes a static, compile-time registry keyed by
//! `(vendor_id, product_code)` for the dynamic loader
//! decision recorded in DESIGN.md). The callback-record shape is unchanged
//! either way, so a dynamic-loading backend could be dropped in later
//! without touching the node supervisor or runtime.

use crate::eds::EdsRecord;
use crate::node::Quirks;
use std::collections::HashMap;
use std::fmt;

/// A PDO receive callback: node id, PDO slot (1..=4), raw payload.
pub type PdoFn = Box<dyn Fn(u8, u8, &[u8]) + Send + Sync>;
/// An EMCY callback: node id, raw 8-byte emergency payload.
pub type EmcyFn = Box<dyn Fn(u8, &[u8; 8]) + Send + Sync>;
/// Invoked when a driver instance is unbound: dropping its context and
/// calling this is the compiled-in equivalent of `dlclose`.
pub type FreeFn = Box<dyn FnOnce() + Send>;

/// One bound driver instance for a node.
pub struct DriverInstance {
    pub pdo1: Option<PdoFn>,
    pub pdo2: Option<PdoFn>,
    pub pdo3: Option<PdoFn>,
    pub pdo4: Option<PdoFn>,
    pub emcy: Option<EmcyFn>,
    free_fn: Option<FreeFn>,
}

impl fmt::Debug for DriverInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverInstance")
            .field("pdo1", &self.pdo1.is_some())
            .field("pdo2", &self.pdo2.is_some())
            .field("pdo3", &self.pdo3.is_some())
            .field("pdo4", &self.pdo4.is_some())
            .field("emcy", &self.emcy.is_some())
            .finish()
    }
}

impl DriverInstance {
    pub fn dispatch_pdo(&self, slot: u8, node_id: u8, data: &[u8]) {
        let cb = match slot {
            1 => &self.pdo1,
            2 => &self.pdo2,
            3 => &self.pdo3,
            4 => &self.pdo4,
            _ => return,
        };
        if let Some(cb) = cb {
            cb(node_id, slot, data);
        }
    }

    pub fn dispatch_emcy(&self, node_id: u8, data: &[u8; 8]) {
        if let Some(cb) = &self.emcy {
            cb(node_id, data);
        }
    }
}

impl Drop for DriverInstance {
    fn drop(&mut self) {
        if let Some(free_fn) = self.free_fn.take() {
            free_fn();
        }
    }
}

/// Builds a [`DriverInstance`] plus the [`Quirks`] this device needs, given
/// the identity read back during boot and (if one matched) its EDS record.
pub type DriverFactory =
    fn(node_id: u8, eds: Option<&EdsRecord>) -> (DriverInstance, Quirks);

fn generic_factory(_node_id: u8, _eds: Option<&EdsRecord>) -> (DriverInstance, Quirks) {
    (
        DriverInstance {
            pdo1: None,
            pdo2: None,
            pdo3: None,
            pdo4: None,
            emcy: None,
            free_fn: None,
        },
        Quirks::empty(),
    )
}

/// The static driver registry: `(vendor_id, product_code) -> DriverFactory`.
/// Built fresh on each lookup since the table is tiny and has no meaningful
/// lifetime to amortise; callers needing a persistent handle should hold the
/// returned `DriverFactory` (it's a plain function pointer) rather than the
/// map itself.
pub fn registry() -> HashMap<(u32, u32), DriverFactory> {
    let mut map: HashMap<(u32, u32), DriverFactory> = HashMap::new();
    // Real deployments register concrete device factories here, e.g.:
    // map.insert((0x0000_00a3, 0x0001_0002), acme_pump::factory);
    map.insert((0, 0), generic_factory as DriverFactory);
    map
}

/// Bind a driver for a node given its resolved identity. Falls back to the
/// generic no-op driver when no factory is registered for the
/// `(vendor_id, product_code)` pair, so every node ends up with a driver
/// instance even absent a device-specific one.
pub fn bind(
    node_id: u8,
    vendor_id: u32,
    product_code: u32,
    eds: Option<&EdsRecord>,
) -> (DriverInstance, Quirks) {
    let reg = registry();
    let factory = reg
        .get(&(vendor_id, product_code))
        .copied()
        .unwrap_or(generic_factory as DriverFactory);
    factory(node_id, eds)
}
