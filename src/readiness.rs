/// Per-process record of which contexts have completed their readiness handshake.
///
/// A target moves from not-ready to ready only when its handshake arrives.
/// Nothing moves it back except `forget_tab` (tab closed) or a process restart;
/// the state is never persisted.
use crate::message::Handshake;
use crate::transport::TabId;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReadyTarget {
    Background,
    Popup,
    Tab(TabId),
}

#[derive(Debug, Default)]
struct ReadinessState {
    background: bool,
    popup: bool,
    tabs: HashMap<TabId, bool>,
}

/// Cloneable handle; clones observe the same state
#[derive(Debug, Clone, Default)]
pub struct ReadinessTracker {
    state: Rc<RefCell<ReadinessState>>,
}

impl ReadinessTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_ready(&self, target: ReadyTarget) {
        let mut state = self.state.borrow_mut();
        match target {
            ReadyTarget::Background => state.background = true,
            ReadyTarget::Popup => state.popup = true,
            ReadyTarget::Tab(tab) => {
                state.tabs.insert(tab, true);
            }
        }
        log::debug!("{:?} is ready", target);
    }

    pub fn is_ready(&self, target: ReadyTarget) -> bool {
        let state = self.state.borrow();
        match target {
            ReadyTarget::Background => state.background,
            ReadyTarget::Popup => state.popup,
            ReadyTarget::Tab(tab) => state.tabs.get(&tab).copied().unwrap_or(false),
        }
    }

    pub fn apply(&self, handshake: Handshake) -> ReadyTarget {
        let target = match handshake {
            Handshake::ContentScript(tab) => ReadyTarget::Tab(tab),
            Handshake::Popup => ReadyTarget::Popup,
            Handshake::Background => ReadyTarget::Background,
        };
        self.mark_ready(target);
        target
    }

    /// Drop a closed tab so its id can't be mistaken for a live receiver
    pub fn forget_tab(&self, tab: TabId) {
        self.state.borrow_mut().tabs.remove(&tab);
    }

    pub fn ready_tabs(&self) -> Vec<TabId> {
        let mut tabs: Vec<TabId> = self
            .state
            .borrow()
            .tabs
            .iter()
            .filter(|(_, ready)| **ready)
            .map(|(tab, _)| *tab)
            .collect();
        tabs.sort_unstable();
        tabs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_targets_are_not_ready() {
        let tracker = ReadinessTracker::new();

        assert!(!tracker.is_ready(ReadyTarget::Background));
        assert!(!tracker.is_ready(ReadyTarget::Popup));
        assert!(!tracker.is_ready(ReadyTarget::Tab(7)));
    }

    #[test]
    fn test_handshake_marks_ready() {
        let tracker = ReadinessTracker::new();

        assert_eq!(tracker.apply(Handshake::ContentScript(7)), ReadyTarget::Tab(7));
        tracker.apply(Handshake::Popup);

        assert!(tracker.is_ready(ReadyTarget::Tab(7)));
        assert!(tracker.is_ready(ReadyTarget::Popup));
        assert!(!tracker.is_ready(ReadyTarget::Tab(8)));
        assert!(!tracker.is_ready(ReadyTarget::Background));
    }

    #[test]
    fn test_forget_tab() {
        let tracker = ReadinessTracker::new();
        tracker.mark_ready(ReadyTarget::Tab(1));
        tracker.mark_ready(ReadyTarget::Tab(2));

        tracker.forget_tab(1);

        assert!(!tracker.is_ready(ReadyTarget::Tab(1)));
        assert_eq!(tracker.ready_tabs(), vec![2]);
    }

    #[test]
    fn test_instances_do_not_share_state() {
        let a = ReadinessTracker::new();
        let b = ReadinessTracker::new();
        let a_clone = a.clone();

        a.mark_ready(ReadyTarget::Popup);

        assert!(a_clone.is_ready(ReadyTarget::Popup));
        assert!(!b.is_ready(ReadyTarget::Popup));
    }
}
