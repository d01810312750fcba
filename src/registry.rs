use crate::hook::{Event, EventKind, Hook, HookAction};
use std::any::Any;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, trace};

static NEXT_REGISTRY_ID: AtomicU64 = AtomicU64::new(1);

/// A registry shared between several processors.
pub type SharedRegistry = Arc<Mutex<HookRegistry>>;

/// Type-erased view of a `Hook<C>`.
trait DynHook: Send {
    fn dispatch(&mut self, event: &Event<'_>) -> Option<HookAction>;
    fn observes(&self, kind: EventKind) -> bool;
    fn clear_all(&mut self);
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
    fn into_any(self: Box<Self>) -> Box<dyn Any>;
}

impl<C: Send + 'static> DynHook for Hook<C> {
    fn dispatch(&mut self, event: &Event<'_>) -> Option<HookAction> {
        Hook::dispatch(self, event)
    }

    fn observes(&self, kind: EventKind) -> bool {
        Hook::observes(self, kind)
    }

    fn clear_all(&mut self) {
        Hook::clear_all(self);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

/// Proof of registration for a `Hook<C>`.
///
/// Not `Clone`: giving the handle back to [`HookRegistry::unregister`] is
/// the only way to get the hook out again.
#[must_use = "dropping the handle leaves the hook registered with no way to remove it"]
pub struct HookHandle<C> {
    registry: u64,
    key: u64,
    _hook: PhantomData<fn() -> C>,
}

impl<C> HookHandle<C> {
    /// Registration order key, unique within the registry.
    pub fn key(&self) -> u64 {
        self.key
    }
}

impl<C> fmt::Debug for HookHandle<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookHandle")
            .field("registry", &self.registry)
            .field("key", &self.key)
            .finish()
    }
}

/// Ordered collection of hooks that events are dispatched to.
pub struct HookRegistry {
    id: u64,
    next_key: u64,
    // Sorted by key; keys are never reused.
    entries: Vec<(u64, Box<dyn DynHook>)>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self {
            id: NEXT_REGISTRY_ID.fetch_add(1, Ordering::Relaxed),
            next_key: 0,
            entries: Vec::new(),
        }
    }

    pub fn shared() -> SharedRegistry {
        Arc::new(Mutex::new(Self::new()))
    }

    /// Append `hook` to the dispatch order.
    pub fn register<C: Send + 'static>(&mut self, hook: Hook<C>) -> HookHandle<C> {
        let key = self.next_key;
        self.next_key += 1;
        debug!(
            "registering hook {} observing {:?}",
            key,
            hook.observed().collect::<Vec<_>>()
        );
        self.entries.push((key, Box::new(hook)));
        HookHandle {
            registry: self.id,
            key,
            _hook: PhantomData,
        }
    }

    /// Remove a hook and give it back, context included.
    pub fn unregister<C: Send + 'static>(&mut self, handle: HookHandle<C>) -> Hook<C> {
        let index = self.position(&handle);
        let (_, hook) = self.entries.remove(index);
        debug!("unregistered hook {}", handle.key);
        match hook.into_any().downcast::<Hook<C>>() {
            Ok(hook) => *hook,
            Err(_) => unreachable!("hook handle type does not match its entry"),
        }
    }

    pub fn hook<C: Send + 'static>(&self, handle: &HookHandle<C>) -> &Hook<C> {
        let index = self.position(handle);
        match self.entries[index].1.as_any().downcast_ref::<Hook<C>>() {
            Some(hook) => hook,
            None => unreachable!("hook handle type does not match its entry"),
        }
    }

    pub fn hook_mut<C: Send + 'static>(&mut self, handle: &HookHandle<C>) -> &mut Hook<C> {
        let index = self.position(handle);
        match self.entries[index].1.as_any_mut().downcast_mut::<Hook<C>>() {
            Some(hook) => hook,
            None => unreachable!("hook handle type does not match its entry"),
        }
    }

    fn position<C>(&self, handle: &HookHandle<C>) -> usize {
        assert_eq!(
            handle.registry, self.id,
            "hook handle belongs to a different registry"
        );
        match self.entries.binary_search_by_key(&handle.key, |(key, _)| *key) {
            Ok(index) => index,
            Err(_) => unreachable!("live hook handle with no entry"),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Empty every slot of every hook. Hooks stay registered.
    pub fn clear_all_hooks(&mut self) {
        for (_, hook) in &mut self.entries {
            hook.clear_all();
        }
    }

    pub fn is_observed(&self, kind: EventKind) -> bool {
        self.entries.iter().any(|(_, hook)| hook.observes(kind))
    }

    /// Deliver `event` to every hook observing its kind, in registration
    /// order. Returns `Stop` if any callback asked for it; the remaining
    /// hooks still see the event.
    pub fn dispatch(&mut self, event: &Event<'_>) -> HookAction {
        let mut action = HookAction::Continue;
        for (key, hook) in &mut self.entries {
            if let Some(answer) = hook.dispatch(event) {
                if answer == HookAction::Stop {
                    trace!("hook {} requested stop on {:?}", key, event.kind());
                }
                action = action.merge(answer);
            }
        }
        action
    }
}

impl Default for HookRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookRegistry")
            .field("id", &self.id)
            .field("hooks", &self.entries.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hook::{Hlt, Wrmsr};

    fn hlt() -> Event<'static> {
        Event::Hlt(Hlt { cpu: 0 })
    }

    #[test]
    fn test_dispatch_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = HookRegistry::new();

        for name in ["a", "b", "c"] {
            let log = log.clone();
            let mut hook = Hook::new(name);
            hook.on_hlt(move |name, _| log.lock().unwrap().push(*name));
            let _ = registry.register(hook);
        }

        assert_eq!(registry.dispatch(&hlt()), HookAction::Continue);
        assert_eq!(*log.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_stop_still_reaches_later_hooks() {
        let mut registry = HookRegistry::new();

        let mut first = Hook::new(0u32);
        first.on_hlt(|count, _| {
            *count += 1;
            HookAction::Stop
        });
        let first = registry.register(first);

        let mut second = Hook::new(0u32);
        second.on_hlt(|count, _| *count += 1);
        let second = registry.register(second);

        assert_eq!(registry.dispatch(&hlt()), HookAction::Stop);
        assert_eq!(*registry.hook(&first).ctx(), 1);
        assert_eq!(*registry.hook(&second).ctx(), 1);
    }

    #[test]
    fn test_unregister_returns_context() {
        let mut registry = HookRegistry::new();
        let mut hook = Hook::new(Vec::new());
        hook.on_wrmsr(|msrs: &mut Vec<u32>, w| msrs.push(w.msr));
        let handle = registry.register(hook);

        registry.dispatch(&Event::Wrmsr(Wrmsr {
            cpu: 0,
            msr: 0xc000_0080,
            value: 0x500,
        }));

        let hook = registry.unregister(handle);
        assert!(registry.is_empty());
        assert_eq!(hook.into_ctx(), vec![0xc000_0080]);
    }

    #[test]
    fn test_unregister_middle_keeps_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = HookRegistry::new();

        let mut handles = Vec::new();
        for n in 0..3u32 {
            let log = log.clone();
            let mut hook = Hook::new(n);
            hook.on_hlt(move |n, _| log.lock().unwrap().push(*n));
            handles.push(registry.register(hook));
        }

        let middle = handles.remove(1);
        registry.unregister(middle);
        let mut hook = Hook::new(3u32);
        let log2 = log.clone();
        hook.on_hlt(move |n, _| log2.lock().unwrap().push(*n));
        let _ = registry.register(hook);

        registry.dispatch(&hlt());
        assert_eq!(*log.lock().unwrap(), vec![0, 2, 3]);
    }

    #[test]
    fn test_hook_mut_updates_slots() {
        let mut registry = HookRegistry::new();
        let handle = registry.register(Hook::new(0u32));
        assert!(!registry.is_observed(EventKind::Hlt));

        registry.hook_mut(&handle).on_hlt(|n, _| *n += 1);
        assert!(registry.is_observed(EventKind::Hlt));
        registry.dispatch(&hlt());
        assert_eq!(*registry.hook(&handle).ctx(), 1);
    }

    #[test]
    fn test_clear_all_hooks_keeps_registrations() {
        let mut registry = HookRegistry::new();
        let mut hook = Hook::new(0u32);
        hook.on_hlt(|n, _| *n += 1);
        let handle = registry.register(hook);

        registry.clear_all_hooks();
        assert!(!registry.is_observed(EventKind::Hlt));
        assert_eq!(registry.len(), 1);
        registry.dispatch(&hlt());
        assert_eq!(*registry.hook(&handle).ctx(), 0);
    }

    #[test]
    #[should_panic(expected = "different registry")]
    fn test_foreign_handle_panics() {
        let mut a = HookRegistry::new();
        let b = HookRegistry::new();
        let handle = a.register(Hook::new(()));
        b.hook(&handle);
    }
}
