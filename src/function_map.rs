//! Instruction-pointer-to-method map (§4.5), used by the stack walker and by
//! security-frame/exception-dispatch lookups.

use std::collections::BTreeMap;

use spin::Mutex;

use crate::vm::VmId;

/// Opaque per-method descriptor registered in the function map. The substrate does
/// not interpret its contents beyond the owning VM and the code range it spans;
/// name/debug-info/bytecode lookups belong to the owning VM (§1, out of scope).
#[derive(Debug, Clone)]
pub struct MethodInfo {
    /// The VM that registered this method, used for `remove_method_infos`.
    pub owner: VmId,
    /// Start address of the method's code, inclusive (the map's key).
    pub start: usize,
    /// End address of the method's code, exclusive. `None` means unbounded (extends
    /// until the next registered method) — used by front ends that don't know a
    /// method's end address at registration time.
    pub end: Option<usize>,
    /// Opaque handle the owning VM can use to recover richer debug info for this
    /// method (class name, source line, etc).
    pub token: usize,
}

impl MethodInfo {
    pub fn contains(&self, ip: usize) -> bool {
        ip >= self.start && self.end.map_or(true, |end| ip < end)
    }
}

/// Ordered map from code start addresses to [`MethodInfo`], queried by "largest key
/// less than or equal to" lookup (§4.5).
#[derive(Default)]
pub struct FunctionMap {
    inner: Mutex<BTreeMap<usize, MethodInfo>>,
}

impl FunctionMap {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(BTreeMap::new()),
        }
    }

    /// Register a method's code range. Overwrites any previous entry at the same
    /// start address (§4.5 invariant: keys are non-overlapping, so callers must not
    /// register overlapping ranges).
    pub fn add_method_info(&self, info: MethodInfo) {
        let mut map = self.inner.lock();
        map.insert(info.start, info);
    }

    /// Find the method whose code range contains `ip`, if any.
    pub fn ip_to_method_info(&self, ip: usize) -> Option<MethodInfo> {
        let map = self.inner.lock();
        map.range(..=ip)
            .next_back()
            .map(|(_, info)| info.clone())
            .filter(|info| info.contains(ip))
    }

    /// Remove every method registered by `owner` (used when a class loader / VM is
    /// torn down).
    pub fn remove_method_infos(&self, owner: VmId) {
        let mut map = self.inner.lock();
        map.retain(|_, info| info.owner != owner);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn method(owner: usize, start: usize, end: usize) -> MethodInfo {
        MethodInfo {
            owner: VmId(owner),
            start,
            end: Some(end),
            token: start,
        }
    }

    #[test]
    fn finds_enclosing_method_by_largest_key_leq() {
        let map = FunctionMap::new();
        map.add_method_info(method(0, 0x1000, 0x1100));
        map.add_method_info(method(0, 0x2000, 0x2200));

        let found = map.ip_to_method_info(0x2050).unwrap();
        assert_eq!(found.start, 0x2000);

        let found = map.ip_to_method_info(0x1050).unwrap();
        assert_eq!(found.start, 0x1000);
    }

    #[test]
    fn ip_outside_any_range_returns_none() {
        let map = FunctionMap::new();
        map.add_method_info(method(0, 0x1000, 0x1100));
        assert!(map.ip_to_method_info(0x1200).is_none());
        assert!(map.ip_to_method_info(0x0500).is_none());
    }

    #[test]
    fn remove_by_owner_drops_only_that_owners_methods() {
        let map = FunctionMap::new();
        map.add_method_info(method(0, 0x1000, 0x1100));
        map.add_method_info(method(1, 0x2000, 0x2100));

        map.remove_method_infos(VmId(0));

        assert!(map.ip_to_method_info(0x1050).is_none());
        assert!(map.ip_to_method_info(0x2050).is_some());
        assert_eq!(map.len(), 1);
    }
}
