pub mod post;
pub mod ram;
pub mod rom;

use std::any::Any;

/// Opaque owner token handed back to handlers and timer callbacks so they
/// can find their device state again without captures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DevId(u32);

impl DevId {
    /// Owner of machine-level resources that belong to no device.
    pub const NONE: DevId = DevId(u32::MAX);

    #[cfg(test)]
    pub fn new_for_test(v: u32) -> DevId {
        DevId(v)
    }
}

pub trait Device: Any {
    fn name(&self) -> &'static str;

    /// Device-local state reset. Bus topology is untouched.
    fn reset(&mut self) {}

    fn speed_changed(&mut self, _hz: u64) {}

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Slot table of installed devices. Ids stay stable across removals.
pub struct DeviceTable {
    slots: Vec<Option<Box<dyn Device>>>,
}

impl DeviceTable {
    pub fn new() -> DeviceTable {
        DeviceTable { slots: Vec::new() }
    }

    pub fn add(&mut self, dev: Box<dyn Device>) -> DevId {
        self.slots.push(Some(dev));
        DevId((self.slots.len() - 1) as u32)
    }

    pub fn get_mut(&mut self, id: DevId) -> Option<&mut dyn Device> {
        self.slots
            .get_mut(id.0 as usize)?
            .as_deref_mut()
            .map(|d| d as &mut dyn Device)
    }

    /// Typed access for handlers that know their own device.
    pub fn downcast_mut<T: Device>(&mut self, id: DevId) -> Option<&mut T> {
        self.get_mut(id)?.as_any_mut().downcast_mut::<T>()
    }

    pub fn take(&mut self, id: DevId) -> Option<Box<dyn Device>> {
        self.slots.get_mut(id.0 as usize)?.take()
    }

    pub fn ids(&self) -> impl Iterator<Item = DevId> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_some())
            .map(|(i, _)| DevId(i as u32))
    }

    pub fn for_each_mut(&mut self, mut f: impl FnMut(&mut dyn Device)) {
        for slot in self.slots.iter_mut() {
            if let Some(d) = slot {
                f(d.as_mut());
            }
        }
    }
}

impl Default for DeviceTable {
    fn default() -> Self {
        DeviceTable::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Dummy {
        resets: u32,
    }

    impl Device for Dummy {
        fn name(&self) -> &'static str {
            "dummy"
        }

        fn reset(&mut self) {
            self.resets += 1;
        }

        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    #[test]
    fn downcast_finds_the_right_device() {
        let mut t = DeviceTable::new();
        let a = t.add(Box::new(Dummy { resets: 0 }));
        let b = t.add(Box::new(Dummy { resets: 9 }));
        assert_eq!(t.downcast_mut::<Dummy>(b).unwrap().resets, 9);
        t.downcast_mut::<Dummy>(a).unwrap().resets = 3;
        assert_eq!(t.downcast_mut::<Dummy>(a).unwrap().resets, 3);
    }

    #[test]
    fn take_leaves_ids_stable() {
        let mut t = DeviceTable::new();
        let a = t.add(Box::new(Dummy { resets: 0 }));
        let b = t.add(Box::new(Dummy { resets: 1 }));
        assert!(t.take(a).is_some());
        assert!(t.take(a).is_none());
        assert!(t.get_mut(a).is_none());
        assert_eq!(t.downcast_mut::<Dummy>(b).unwrap().resets, 1);
    }
}
