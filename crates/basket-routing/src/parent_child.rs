//! Parent/child transaction map.
//!
//! A request fanned out to several backends becomes one parent entry
//! holding one child per backend. Each child carries a fresh id; replies
//! bearing a child id are folded into the parent, which answers the
//! caller exactly once when every child has reached a terminal outcome:
//! success if any child succeeded, an aggregate error otherwise.
//!
//! After the response, subscriptions additionally report `Online` once
//! every surviving child is online and `Finished` once every surviving
//! child has finished. Ids of closed parents are remembered for a while
//! so late data under them can be dropped instead of leaking child ids.

use crate::error::{RoutingError, RoutingResult};
use basket_core::{
    AdapterId, DataKind, ErrorMessage, Message, ReplyError, ReplyErrorKind, SubscriptionFinished,
    SubscriptionIds, SubscriptionOnline, SubscriptionResponse, TransactionId,
};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::{debug, trace};

/// Lifecycle of one child.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChildState {
    /// Sent, no answer yet.
    Pending,
    Active,
    Online,
    Finished,
    NotSupported,
    Failed,
    /// Torn down by an unsubscribe of its parent.
    Unsubscribed,
}

impl ChildState {
    /// Accepted by the backend and not failed since.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Active | Self::Online | Self::Finished)
    }

    /// May still produce traffic at the backend.
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Pending | Self::Active | Self::Online)
    }
}

/// What a backend said about one child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChildOutcome {
    Accepted,
    Declined(ReplyError),
    Failed(ReplyError),
    Online,
    Finished,
}

impl ChildOutcome {
    /// Outcome carried by a subscription reply.
    pub fn from_reply(message: &Message) -> Option<Self> {
        match message {
            Message::SubscriptionResponse(r) => Some(match &r.error {
                None => Self::Accepted,
                Some(e) if e.is_not_supported() => Self::Declined(e.clone()),
                Some(e) => Self::Failed(e.clone()),
            }),
            Message::SubscriptionOnline(_) => Some(Self::Online),
            Message::SubscriptionFinished(_) => Some(Self::Finished),
            _ => None,
        }
    }
}

/// Reply owed to the caller for a parent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParentEvent {
    Response {
        parent: TransactionId,
        error: Option<ReplyError>,
    },
    Online {
        parent: TransactionId,
    },
    Finished {
        parent: TransactionId,
    },
    /// Every accepted child failed after the parent was answered.
    Failed {
        parent: TransactionId,
        error: ReplyError,
    },
}

impl ParentEvent {
    pub fn parent(&self) -> TransactionId {
        match self {
            Self::Response { parent, .. }
            | Self::Online { parent }
            | Self::Finished { parent }
            | Self::Failed { parent, .. } => *parent,
        }
    }

    /// Metric label.
    pub fn outcome(&self) -> &'static str {
        match self {
            Self::Response { error: None, .. } => "success",
            Self::Response {
                error: Some(e), ..
            } if e.kind == ReplyErrorKind::Canceled => "canceled",
            Self::Response { .. } => "error",
            Self::Online { .. } => "online",
            Self::Finished { .. } => "finished",
            Self::Failed { .. } => "failed",
        }
    }

    pub fn into_message(self) -> Message {
        match self {
            Self::Response {
                parent,
                error: None,
            } => SubscriptionResponse::ok(parent).into(),
            Self::Response {
                parent,
                error: Some(error),
            } => SubscriptionResponse::error(parent, error).into(),
            Self::Online { parent } => SubscriptionOnline {
                original_transaction_id: parent,
            }
            .into(),
            Self::Finished { parent } => SubscriptionFinished {
                original_transaction_id: parent,
            }
            .into(),
            Self::Failed { parent, error } => ErrorMessage {
                original_transaction_id: Some(parent),
                error,
            }
            .into(),
        }
    }
}

/// Result of feeding a child outcome into the map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// The id is not a child of any parent.
    NotChild,
    /// The id belonged to a parent that is already closed.
    Retired,
    /// The id is a live child; these replies are now owed to the caller.
    Events(Vec<ParentEvent>),
}

/// Where an id lives in parent space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Translation {
    Parent(TransactionId),
    Retired,
    Unknown,
}

struct ParentEntry {
    request: Message,
    children: Vec<TransactionId>,
    sealed: bool,
    canceled: bool,
    response_sent: bool,
    online_sent: bool,
}

struct ChildEntry {
    parent: TransactionId,
    adapter: AdapterId,
    state: ChildState,
    error: Option<ReplyError>,
}

struct MapState {
    parents: HashMap<TransactionId, ParentEntry>,
    children: HashMap<TransactionId, ChildEntry>,
    retired: HashMap<TransactionId, ChildState>,
    retired_order: VecDeque<TransactionId>,
}

pub struct ParentChildMap {
    state: Mutex<MapState>,
    retired_capacity: usize,
}

impl ParentChildMap {
    pub fn new(retired_capacity: usize) -> Self {
        Self {
            state: Mutex::new(MapState {
                parents: HashMap::new(),
                children: HashMap::new(),
                retired: HashMap::new(),
                retired_order: VecDeque::new(),
            }),
            retired_capacity,
        }
    }

    /// Open a parent entry for a request about to be fanned out.
    pub fn begin(&self, request: &Message) -> RoutingResult<TransactionId> {
        let parent = request.transaction_id().ok_or_else(|| {
            RoutingError::invariant(format!("{} request without transaction id", request.kind()))
        })?;
        let mut state = self.state.lock();
        if state.parents.contains_key(&parent) {
            return Err(RoutingError::DuplicateParent(parent));
        }
        state.parents.insert(
            parent,
            ParentEntry {
                request: request.clone(),
                children: Vec::new(),
                sealed: false,
                canceled: false,
                response_sent: false,
                online_sent: false,
            },
        );
        Ok(parent)
    }

    /// Record a child sent to `adapter` on behalf of `parent`.
    pub fn add_mapping(
        &self,
        parent: TransactionId,
        child: TransactionId,
        adapter: AdapterId,
    ) -> RoutingResult<()> {
        if !child.is_valid() {
            return Err(RoutingError::InvalidChildId(child));
        }
        let mut state = self.state.lock();
        if state.children.contains_key(&child)
            || state.parents.contains_key(&child)
            || state.retired.contains_key(&child)
        {
            return Err(RoutingError::InvalidChildId(child));
        }
        let entry = state
            .parents
            .get_mut(&parent)
            .ok_or(RoutingError::UnknownParent(parent))?;
        if entry.sealed {
            return Err(RoutingError::invariant(format!(
                "child {child} added to sealed parent {parent}"
            )));
        }
        entry.children.push(child);
        state.children.insert(
            child,
            ChildEntry {
                parent,
                adapter,
                state: ChildState::Pending,
                error: None,
            },
        );
        trace!(%parent, %child, %adapter, "Mapped child");
        Ok(())
    }

    /// No more children will be added.
    pub fn seal(&self, parent: TransactionId) -> Vec<ParentEvent> {
        let mut state = self.state.lock();
        match state.parents.get_mut(&parent) {
            Some(entry) => entry.sealed = true,
            None => return Vec::new(),
        }
        self.evaluate(&mut state, parent)
    }

    /// Stop dispatching; the parent answers `canceled` once its sent
    /// children have answered, or right away if none were sent.
    pub fn cancel(&self, parent: TransactionId) -> Vec<ParentEvent> {
        let mut state = self.state.lock();
        match state.parents.get_mut(&parent) {
            Some(entry) => {
                entry.sealed = true;
                entry.canceled = true;
            }
            None => return Vec::new(),
        }
        debug!(%parent, "Parent canceled during dispatch");
        self.evaluate(&mut state, parent)
    }

    /// Fold a backend's answer for `child` into its parent.
    pub fn resolve(
        &self,
        child: TransactionId,
        adapter: AdapterId,
        outcome: ChildOutcome,
    ) -> RoutingResult<Resolution> {
        let mut state = self.state.lock();
        if !state.children.contains_key(&child) {
            return Ok(if state.retired.contains_key(&child) {
                Resolution::Retired
            } else {
                Resolution::NotChild
            });
        }
        let Some(entry) = state.children.get_mut(&child) else {
            return Ok(Resolution::NotChild);
        };
        if entry.adapter != adapter {
            return Err(RoutingError::invariant(format!(
                "child {child} answered by {adapter}, owned by {}",
                entry.adapter
            )));
        }
        apply_outcome(entry, outcome);
        let parent = entry.parent;
        Ok(Resolution::Events(self.evaluate(&mut state, parent)))
    }

    /// Fail every open child owned by `adapter`.
    pub fn fail_adapter(&self, adapter: AdapterId, error: &ReplyError) -> Vec<ParentEvent> {
        let mut state = self.state.lock();
        let mut parents = Vec::new();
        for entry in state.children.values_mut() {
            if entry.adapter == adapter && entry.state.is_open() {
                apply_outcome(entry, ChildOutcome::Failed(error.clone()));
                if !parents.contains(&entry.parent) {
                    parents.push(entry.parent);
                }
            }
        }
        let mut events = Vec::new();
        for parent in parents {
            events.extend(self.evaluate(&mut state, parent));
        }
        events
    }

    pub fn translate(&self, id: TransactionId) -> Translation {
        let state = self.state.lock();
        if let Some(child) = state.children.get(&id) {
            Translation::Parent(child.parent)
        } else if state.retired.contains_key(&id) {
            Translation::Retired
        } else {
            Translation::Unknown
        }
    }

    /// Rewrite child ids to parent ids in place.
    ///
    /// Ids that are neither live children nor listed in `owned` are
    /// removed, so a child id forgotten by the retired ring never reaches
    /// the caller. Returns `false` when nothing is left to deliver.
    pub fn rewrite(&self, ids: &mut SubscriptionIds, owned: &HashSet<TransactionId>) -> bool {
        let state = self.state.lock();
        let map = |id: TransactionId| -> Option<TransactionId> {
            match state.children.get(&id) {
                Some(child) => Some(child.parent),
                None if state.retired.contains_key(&id) => None,
                None if owned.contains(&id) => Some(id),
                None => None,
            }
        };

        let had_any = !ids.is_empty();
        let original = ids.original_transaction_id.and_then(map);
        let mut rewritten: Vec<TransactionId> = Vec::with_capacity(ids.subscription_ids.len());
        for id in ids.subscription_ids.iter().copied().filter_map(map) {
            if !rewritten.contains(&id) {
                rewritten.push(id);
            }
        }
        ids.original_transaction_id = original.or_else(|| rewritten.first().copied());
        ids.subscription_ids = rewritten;
        !had_any || !ids.is_empty()
    }

    /// Children that may still produce traffic, with their backends.
    pub fn active_children(&self, parent: TransactionId) -> Vec<(TransactionId, AdapterId)> {
        let state = self.state.lock();
        let Some(entry) = state.parents.get(&parent) else {
            return Vec::new();
        };
        entry
            .children
            .iter()
            .filter_map(|id| state.children.get(id).map(|c| (*id, c)))
            .filter(|(_, c)| c.state.is_open())
            .map(|(id, c)| (id, c.adapter))
            .collect()
    }

    /// Close a parent for an unsubscribe.
    ///
    /// Returns the original request and the children still open at their
    /// backends; those become `Unsubscribed`.
    pub fn retire_parent(
        &self,
        parent: TransactionId,
    ) -> Option<(Message, Vec<(TransactionId, AdapterId)>)> {
        let mut state = self.state.lock();
        let entry = state.parents.get(&parent)?;
        let open: Vec<(TransactionId, AdapterId)> = entry
            .children
            .iter()
            .filter_map(|id| state.children.get(id).map(|c| (*id, c)))
            .filter(|(_, c)| c.state.is_open())
            .map(|(id, c)| (id, c.adapter))
            .collect();
        for (id, _) in &open {
            if let Some(child) = state.children.get_mut(id) {
                child.state = ChildState::Unsubscribed;
            }
        }
        let request = self.close(&mut state, parent)?;
        debug!(%parent, children = open.len(), "Retired parent for unsubscribe");
        Some((request, open))
    }

    /// Remember an id whose late traffic must be dropped.
    pub fn retire(&self, id: TransactionId, final_state: ChildState) {
        let mut state = self.state.lock();
        self.push_retired(&mut state, id, final_state);
    }

    pub fn contains_parent(&self, parent: TransactionId) -> bool {
        self.state.lock().parents.contains_key(&parent)
    }

    pub fn child_state(&self, child: TransactionId) -> Option<ChildState> {
        let state = self.state.lock();
        state
            .children
            .get(&child)
            .map(|c| c.state)
            .or_else(|| state.retired.get(&child).copied())
    }

    /// Open parents subscribed to `data_kind`.
    pub fn subscribers(&self, data_kind: DataKind) -> Vec<TransactionId> {
        let mut parents: Vec<TransactionId> = self
            .state
            .lock()
            .parents
            .iter()
            .filter(|(_, p)| p.request.is_subscribe() && p.request.data_kind() == Some(data_kind))
            .map(|(id, _)| *id)
            .collect();
        parents.sort();
        parents
    }

    pub fn parent_count(&self) -> usize {
        self.state.lock().parents.len()
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.parents.clear();
        state.children.clear();
        state.retired.clear();
        state.retired_order.clear();
    }

    fn evaluate(&self, state: &mut MapState, parent: TransactionId) -> Vec<ParentEvent> {
        let mut events = Vec::new();
        let Some(entry) = state.parents.get(&parent) else {
            return events;
        };
        if !entry.sealed {
            return events;
        }
        let child_states: Vec<(ChildState, Option<ReplyError>)> = entry
            .children
            .iter()
            .filter_map(|id| state.children.get(id))
            .map(|c| (c.state, c.error.clone()))
            .collect();
        if child_states.iter().any(|(s, _)| *s == ChildState::Pending) {
            return events;
        }

        let live: Vec<ChildState> = child_states
            .iter()
            .map(|(s, _)| *s)
            .filter(|s| s.is_live())
            .collect();
        let is_subscribe = entry.request.is_subscribe();
        let response_sent = entry.response_sent;
        let online_sent = entry.online_sent;

        if entry.canceled {
            events.push(ParentEvent::Response {
                parent,
                error: Some(ReplyError::canceled()),
            });
            self.close(state, parent);
            return events;
        }

        if !response_sent {
            if live.is_empty() {
                let inner: Vec<ReplyError> =
                    child_states.into_iter().filter_map(|(_, e)| e).collect();
                let error = ReplyError::aggregate(
                    format!("all {} destinations failed", inner.len()),
                    inner,
                );
                events.push(ParentEvent::Response {
                    parent,
                    error: Some(error),
                });
                self.close(state, parent);
                return events;
            }
            events.push(ParentEvent::Response {
                parent,
                error: None,
            });
            if let Some(entry) = state.parents.get_mut(&parent) {
                entry.response_sent = true;
            }
            if !is_subscribe {
                self.close(state, parent);
                return events;
            }
        }

        if live.is_empty() {
            let inner: Vec<ReplyError> = child_states.into_iter().filter_map(|(_, e)| e).collect();
            events.push(ParentEvent::Failed {
                parent,
                error: ReplyError::aggregate("every destination failed", inner),
            });
            self.close(state, parent);
            return events;
        }

        let all_finished = live.iter().all(|s| *s == ChildState::Finished);
        let any_online = live.iter().any(|s| *s == ChildState::Online);
        let settled = live
            .iter()
            .all(|s| matches!(s, ChildState::Online | ChildState::Finished));
        if !online_sent && settled && any_online {
            events.push(ParentEvent::Online { parent });
            if let Some(entry) = state.parents.get_mut(&parent) {
                entry.online_sent = true;
            }
        }
        if all_finished {
            events.push(ParentEvent::Finished { parent });
            self.close(state, parent);
        }
        events
    }

    /// Remove a parent, retiring its child ids.
    fn close(&self, state: &mut MapState, parent: TransactionId) -> Option<Message> {
        let entry = state.parents.remove(&parent)?;
        for id in &entry.children {
            if let Some(child) = state.children.remove(id) {
                self.push_retired(state, *id, child.state);
            }
        }
        trace!(%parent, children = entry.children.len(), "Closed parent");
        Some(entry.request)
    }

    fn push_retired(&self, state: &mut MapState, id: TransactionId, final_state: ChildState) {
        if state.retired.insert(id, final_state).is_none() {
            state.retired_order.push_back(id);
        }
        while state.retired_order.len() > self.retired_capacity {
            if let Some(oldest) = state.retired_order.pop_front() {
                state.retired.remove(&oldest);
            }
        }
    }
}

fn apply_outcome(entry: &mut ChildEntry, outcome: ChildOutcome) {
    let next = match (&outcome, entry.state) {
        (_, ChildState::NotSupported | ChildState::Failed | ChildState::Unsubscribed) => None,
        (ChildOutcome::Accepted, ChildState::Pending) => Some(ChildState::Active),
        (ChildOutcome::Accepted, _) => None,
        (ChildOutcome::Declined(_), _) => Some(ChildState::NotSupported),
        (ChildOutcome::Failed(_), ChildState::Finished) => None,
        (ChildOutcome::Failed(_), _) => Some(ChildState::Failed),
        (ChildOutcome::Online, ChildState::Pending | ChildState::Active) => Some(ChildState::Online),
        (ChildOutcome::Online, _) => None,
        (ChildOutcome::Finished, ChildState::Finished) => None,
        (ChildOutcome::Finished, _) => Some(ChildState::Finished),
    };
    if let Some(next) = next {
        entry.state = next;
        if let ChildOutcome::Declined(e) | ChildOutcome::Failed(e) = outcome {
            entry.error = Some(e);
        }
    }
}
