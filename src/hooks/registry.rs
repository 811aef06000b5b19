//! Ownership of engine hook handles.
//!
//! The registry is the only holder of [`HookHandle`]s. Everything else
//! refers to hooks by their [`RegisterDescriptor`].

use log::{debug, error, warn};

use crate::engine::{Engine, HookHandle, WriteCallback};
use crate::error::{Error, HookRemoveFailure, Result};
use crate::regmap::RegisterDescriptor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct HookEntry {
    descriptor: RegisterDescriptor,
    handle: HookHandle,
}

#[derive(Debug, Default)]
pub struct HookRegistry {
    entries: Vec<HookEntry>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install one write hook per descriptor.
    ///
    /// Any hooks held from an earlier install are removed first. If the
    /// engine rejects a descriptor, every hook installed by this call is
    /// removed again before [`Error::HookInstallFailed`] is returned, so a
    /// failed install leaves the registry and the engine without hooks.
    pub fn install<E, I, F>(&mut self, engine: &mut E, descriptors: I, mut handler_for: F) -> Result<usize>
    where
        E: Engine + ?Sized,
        I: IntoIterator<Item = RegisterDescriptor>,
        F: FnMut(&RegisterDescriptor) -> WriteCallback,
    {
        self.remove_all(engine)?;

        let mut installed: Vec<HookEntry> = Vec::new();
        for descriptor in descriptors {
            match engine.add_write_hook(descriptor.begin, descriptor.end, handler_for(&descriptor)) {
                Ok(handle) => {
                    debug!("Installed {} for {}", handle, descriptor);
                    installed.push(HookEntry { descriptor, handle });
                }
                Err(reason) => {
                    let rolled_back = installed.len();
                    warn!("Installing hook for {} failed: {}; rolling back {} hook(s)", descriptor, reason, rolled_back);
                    for entry in installed.into_iter().rev() {
                        if let Err(e) = engine.remove_hook(entry.handle) {
                            error!("Rollback could not remove {} for {}: {}", entry.handle, entry.descriptor, e);
                        }
                    }
                    return Err(Error::HookInstallFailed { descriptor, rolled_back, reason });
                }
            }
        }

        self.entries = installed;
        Ok(self.entries.len())
    }

    /// Remove every hook. Removal continues past failures; all of them are
    /// reported together as [`Error::HookRemoveFailed`]. The registry is
    /// empty afterwards either way.
    pub fn remove_all<E: Engine + ?Sized>(&mut self, engine: &mut E) -> Result<()> {
        let mut failures = Vec::new();
        for entry in self.entries.drain(..) {
            match engine.remove_hook(entry.handle) {
                Ok(()) => debug!("Removed {} for {}", entry.handle, entry.descriptor),
                Err(reason) => {
                    warn!("Removing {} for {} failed: {}", entry.handle, entry.descriptor, reason);
                    failures.push(HookRemoveFailure { descriptor: entry.descriptor, reason });
                }
            }
        }
        if failures.is_empty() { Ok(()) } else { Err(Error::HookRemoveFailed(failures)) }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_installed(&self, descriptor: &RegisterDescriptor) -> bool {
        self.entries.iter().any(|e| e.descriptor == *descriptor)
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &RegisterDescriptor> {
        self.entries.iter().map(|e| &e.descriptor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::SimEngine;
    use crate::regmap::Role;
    use crate::regmap::strategies::disjoint_descriptors;
    use proptest::prelude::*;

    fn descriptors() -> Vec<RegisterDescriptor> {
        vec![
            RegisterDescriptor::single(0x1000, Role::Data),
            RegisterDescriptor::single(0x1004, Role::Status),
            RegisterDescriptor::single(0x1008, Role::Data),
        ]
    }

    fn noop(_: &RegisterDescriptor) -> WriteCallback {
        Box::new(|_, _| {})
    }

    #[test]
    fn install_then_remove_all_leaves_nothing() {
        let mut engine = SimEngine::new(vec![]);
        let mut registry = HookRegistry::new();

        assert_eq!(registry.install(&mut engine, descriptors(), noop).unwrap(), 3);
        assert_eq!(engine.hook_count(), 3);
        assert!(registry.is_installed(&descriptors()[1]));

        registry.remove_all(&mut engine).unwrap();
        assert!(registry.is_empty());
        assert_eq!(engine.hook_count(), 0);
    }

    #[test]
    fn remove_all_on_empty_registry_is_noop() {
        let mut engine = SimEngine::new(vec![]);
        let mut registry = HookRegistry::new();
        registry.remove_all(&mut engine).unwrap();
        registry.remove_all(&mut engine).unwrap();
    }

    #[test]
    fn failed_install_rolls_back_earlier_hooks() {
        let mut engine = SimEngine::new(vec![]).with_unmapped(0x1008, 0x100b);
        let mut registry = HookRegistry::new();

        let err = registry.install(&mut engine, descriptors(), noop).unwrap_err();
        match err {
            Error::HookInstallFailed { descriptor, rolled_back, .. } => {
                assert_eq!(descriptor.begin, 0x1008);
                assert_eq!(rolled_back, 2);
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(registry.is_empty());
        assert_eq!(engine.hook_count(), 0);
    }

    #[test]
    fn failed_first_install_has_nothing_to_roll_back() {
        let mut engine = SimEngine::new(vec![]).with_unmapped(0x1000, 0x1000);
        let mut registry = HookRegistry::new();
        assert!(matches!(
            registry.install(&mut engine, descriptors(), noop),
            Err(Error::HookInstallFailed { rolled_back: 0, .. })
        ));
        assert_eq!(engine.hook_count(), 0);
    }

    #[test]
    fn stuck_hook_does_not_block_the_others() {
        let mut engine = SimEngine::new(vec![]).with_stuck_hook(0x1004);
        let mut registry = HookRegistry::new();
        registry.install(&mut engine, descriptors(), noop).unwrap();

        match registry.remove_all(&mut engine).unwrap_err() {
            Error::HookRemoveFailed(failures) => {
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].descriptor.begin, 0x1004);
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(registry.is_empty());
        assert!(!engine.has_hook_at(0x1000));
        assert!(!engine.has_hook_at(0x1008));
        assert!(engine.has_hook_at(0x1004));
    }

    #[test]
    fn reinstall_replaces_previous_hooks() {
        let mut engine = SimEngine::new(vec![]);
        let mut registry = HookRegistry::new();
        registry.install(&mut engine, descriptors(), noop).unwrap();
        registry
            .install(&mut engine, vec![RegisterDescriptor::single(0x2000, Role::Data)], noop)
            .unwrap();
        assert_eq!(registry.len(), 1);
        assert_eq!(engine.hook_count(), 1);
        assert!(engine.has_hook_at(0x2000));
    }

    proptest! {
        #[test]
        fn install_then_remove_all_round_trips(descriptors in disjoint_descriptors(32)) {
            let mut engine = SimEngine::new(vec![]);
            let mut registry = HookRegistry::new();

            prop_assert_eq!(registry.install(&mut engine, descriptors.clone(), noop).unwrap(), descriptors.len());
            prop_assert_eq!(engine.hook_count(), descriptors.len());
            for d in &descriptors {
                prop_assert!(registry.is_installed(d));
                prop_assert!(engine.has_hook_at(d.begin));
            }

            registry.remove_all(&mut engine).unwrap();
            prop_assert!(registry.is_empty());
            prop_assert_eq!(engine.hook_count(), 0);
        }

        #[test]
        fn failure_partway_leaves_no_hooks(
            (descriptors, failing) in disjoint_descriptors(32)
                .prop_flat_map(|d| { let n = d.len(); (Just(d), 0..n) })
        ) {
            let target = descriptors[failing];
            let mut engine = SimEngine::new(vec![]).with_unmapped(target.begin, target.end);
            let mut registry = HookRegistry::new();

            match registry.install(&mut engine, descriptors.clone(), noop) {
                Err(Error::HookInstallFailed { descriptor, rolled_back, .. }) => {
                    prop_assert_eq!(descriptor, target);
                    prop_assert_eq!(rolled_back, failing);
                }
                other => {
                    prop_assert!(false, "expected HookInstallFailed, got {:?}", other);
                }
            }
            prop_assert!(registry.is_empty());
            prop_assert_eq!(engine.hook_count(), 0);
        }
    }
}
