//! Access control: who may write, who may read what.
//!
//! The relay's write and read policy is layered on three identity sets
//! derived from stored events:
//!
//! - **owners**: configured public keys
//! - **followed**: owners plus everyone reachable through owners' follow
//!   lists, up to `follow_depth` hops
//! - **muted**: keys on owners' mute lists, never part of `followed`
//!
//! The sets are rebuilt lazily. Accepting a follow or mute list from a
//! followed author marks them stale; the next decision rebuilds them outside
//! the lock and swaps the result in. A failed rebuild keeps the previous sets.

use crate::config::AccessConfig;
use crate::publish;
use crate::server::unix_now;
use crate::storage::EventStore;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use strand_types::kind::{self, DIRECTORY};
use strand_types::{Event, Filter, FilterSet, Kind, PublicKey, Reason};
use tokio::sync::RwLock;

/// Work to run after an accepted event is durably stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostCommit {
    /// Recompute followed and muted sets.
    RebuildAccessLists,
}

/// Outcome of [`AccessControl::accept_event`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Store the event, then run these actions in order.
    Accept(Vec<PostCommit>),
    /// Refuse with a reason.
    Reject(Reason),
}

/// Outcome of [`AccessControl::accept_read`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadDecision {
    /// Serve these filters.
    Allow {
        /// Possibly narrowed filters.
        filters: FilterSet,
        /// Whether anything was removed from the request.
        narrowed: bool,
    },
    /// Refuse with a reason.
    Reject(Reason),
}

/// Derived identity sets.
#[derive(Debug, Default, Clone)]
struct AccessLists {
    followed: HashSet<PublicKey>,
    owners_followed: HashSet<PublicKey>,
    muted: HashSet<PublicKey>,
    /// Generation the sets were built from.
    generation: u64,
    built: bool,
}

/// Process-wide access control state.
pub struct AccessControl {
    owners: HashSet<PublicKey>,
    auth_required: bool,
    public_readable: bool,
    follow_depth: u32,
    store: Arc<dyn EventStore>,
    lists: RwLock<AccessLists>,
    /// Bumped on every invalidation.
    generation: AtomicU64,
}

impl std::fmt::Debug for AccessControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessControl")
            .field("owners", &self.owners.len())
            .field("auth_required", &self.auth_required)
            .field("public_readable", &self.public_readable)
            .field("follow_depth", &self.follow_depth)
            .finish_non_exhaustive()
    }
}

/// Whether `identity` may see `event` under the privileged-kind rule.
///
/// Privileged events are visible only to their author and to keys named
/// in their `p` tags.
pub fn can_see(event: &Event, identity: Option<&PublicKey>) -> bool {
    if !event.kind.is_privileged() {
        return true;
    }
    match identity {
        Some(id) => event.pubkey == *id || event.mentions(id),
        None => false,
    }
}

impl AccessControl {
    /// Build access control over `store`.
    pub fn new(config: &AccessConfig, owners: Vec<PublicKey>, store: Arc<dyn EventStore>) -> Self {
        Self {
            owners: owners.into_iter().collect(),
            auth_required: config.auth_required,
            public_readable: config.public_readable,
            follow_depth: config.follow_depth,
            store,
            lists: RwLock::new(AccessLists::default()),
            generation: AtomicU64::new(0),
        }
    }

    /// Whether any write restriction is configured.
    pub fn is_restricted(&self) -> bool {
        !self.owners.is_empty() || self.auth_required
    }

    /// Whether reads need no authentication at all.
    pub fn is_open_for_reading(&self) -> bool {
        self.public_readable && !self.auth_required
    }

    /// Whether `pubkey` is a configured owner.
    pub fn is_owner(&self, pubkey: &PublicKey) -> bool {
        self.owners.contains(pubkey)
    }

    /// Whether `pubkey` is an owner or transitively followed by one.
    pub async fn is_followed(&self, pubkey: &PublicKey) -> bool {
        if self.is_owner(pubkey) {
            return true;
        }
        self.refresh().await;
        self.lists.read().await.followed.contains(pubkey)
    }

    /// Whether `pubkey` is directly followed by an owner.
    pub async fn is_owner_followed(&self, pubkey: &PublicKey) -> bool {
        self.refresh().await;
        self.lists.read().await.owners_followed.contains(pubkey)
    }

    /// Whether `pubkey` is on an owner's mute list.
    pub async fn is_muted(&self, pubkey: &PublicKey) -> bool {
        self.refresh().await;
        self.lists.read().await.muted.contains(pubkey)
    }

    /// Mark the sets stale; the next decision rebuilds them.
    pub fn invalidate(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Run post-commit actions returned by [`Self::accept_event`].
    pub async fn run_post_commit(&self, actions: &[PostCommit]) {
        for action in actions {
            match action {
                PostCommit::RebuildAccessLists => {
                    self.invalidate();
                    self.refresh().await;
                }
            }
        }
    }

    /// Rebuild the sets if they are stale. Failure keeps the current sets.
    async fn refresh(&self) {
        if self.owners.is_empty() {
            return;
        }
        let wanted = self.generation.load(Ordering::SeqCst);
        {
            let lists = self.lists.read().await;
            if lists.built && lists.generation == wanted {
                return;
            }
        }

        match self.build_lists().await {
            Ok(mut fresh) => {
                fresh.generation = wanted;
                fresh.built = true;
                let mut lists = self.lists.write().await;
                // A concurrent rebuild may have finished with a newer generation
                if !lists.built || lists.generation <= wanted {
                    tracing::info!(
                        "Access lists rebuilt: followed={}, muted={}",
                        fresh.followed.len(),
                        fresh.muted.len()
                    );
                    *lists = fresh;
                }
            }
            Err(e) => {
                tracing::error!("Access list rebuild failed, keeping previous lists: {}", e);
            }
        }
    }

    /// Compute the sets from stored follow and mute lists.
    async fn build_lists(&self) -> Result<AccessLists, crate::error::StorageError> {
        let now = unix_now();
        let owners: Vec<PublicKey> = self.owners.iter().copied().collect();

        let mut followed: HashSet<PublicKey> = self.owners.clone();
        let mut owners_followed = HashSet::new();
        let mut frontier = owners.clone();

        for hop in 0..self.follow_depth {
            if frontier.is_empty() {
                break;
            }
            let filter = Filter::new().authors(frontier).kinds([kind::FOLLOW_LIST]);
            let lists = publish::query(self.store.as_ref(), &filter, now).await?;

            let mut next = Vec::new();
            for list in &lists {
                for pubkey in list.tags.iter().filter_map(|t| t.pubkey_ref()) {
                    if hop == 0 {
                        owners_followed.insert(pubkey);
                    }
                    if followed.insert(pubkey) {
                        next.push(pubkey);
                    }
                }
            }
            frontier = next;
        }

        let filter = Filter::new().authors(owners).kinds([kind::MUTE_LIST]);
        let mut muted = HashSet::new();
        for list in publish::query(self.store.as_ref(), &filter, now).await? {
            muted.extend(list.tags.iter().filter_map(|t| t.pubkey_ref()));
        }
        muted.retain(|pk| !self.owners.contains(pk));

        followed.retain(|pk| !muted.contains(pk));
        owners_followed.retain(|pk| !muted.contains(pk));

        Ok(AccessLists {
            followed,
            owners_followed,
            muted,
            generation: 0,
            built: false,
        })
    }

    /// Decide whether to accept an inbound event.
    pub async fn accept_event(
        &self,
        event: &Event,
        identity: Option<&PublicKey>,
        remote: &str,
    ) -> Verdict {
        let verdict = self.decide_event(event, identity).await;
        match &verdict {
            Verdict::Accept(_) => {
                tracing::debug!(remote, event = %event.id, kind = %event.kind, "Event accepted");
            }
            Verdict::Reject(reason) => {
                tracing::warn!(remote, event = %event.id, author = %event.pubkey, "Event rejected: {}", reason);
            }
        }
        verdict
    }

    async fn decide_event(&self, event: &Event, identity: Option<&PublicKey>) -> Verdict {
        if !self.is_restricted() {
            return Verdict::Accept(Vec::new());
        }

        if self.is_muted(&event.pubkey).await {
            return Verdict::Reject(Reason::blocked("muted"));
        }

        if event.kind.is_deletion() {
            if let Some(reason) = self.check_deletion(event).await {
                return Verdict::Reject(reason);
            }
        }

        let author_followed = self.is_followed(&event.pubkey).await;

        if event.kind.is_access_list() && author_followed {
            return Verdict::Accept(vec![PostCommit::RebuildAccessLists]);
        }

        if author_followed {
            return Verdict::Accept(Vec::new());
        }

        if identity.is_some() {
            return Verdict::Accept(Vec::new());
        }

        Verdict::Reject(Reason::auth_required("authentication required to publish"))
    }

    /// Validate the references of a deletion event.
    async fn check_deletion(&self, event: &Event) -> Option<Reason> {
        let protected = |kind: Kind, target: &PublicKey| {
            kind.is_access_list() && (*target == event.pubkey || self.is_owner(target))
        };

        for tag in event.tags.iter().filter(|t| t.is("a")) {
            let Some((kind, target, _)) = tag.coordinate_ref() else {
                return Some(Reason::invalid("malformed a tag"));
            };
            if !kind.is_replaceable() && !kind.is_parameterized_replaceable() {
                return Some(Reason::invalid("invalid target kind"));
            }
            if protected(kind, &target) {
                return Some(Reason::blocked(
                    "owners may not delete their own lists, replace them instead",
                ));
            }
        }

        let ids: Vec<_> = event.tags.iter().filter_map(|t| t.event_ref()).collect();
        if ids.is_empty() {
            return None;
        }
        let targets = match self.store.query(&Filter::new().ids(ids)).await {
            Ok(targets) => targets,
            Err(e) => {
                tracing::error!("Could not resolve deletion targets: {}", e);
                return Some(Reason::error("could not check deletion targets"));
            }
        };
        for target in &targets {
            if target.kind.is_deletion() {
                return Some(Reason::invalid("deletion events cannot be deleted"));
            }
            if protected(target.kind, &target.pubkey) {
                return Some(Reason::blocked(
                    "owners may not delete their own lists, replace them instead",
                ));
            }
        }
        None
    }

    /// Decide which of the requested filters a caller may read.
    pub async fn accept_read(
        &self,
        filters: &FilterSet,
        identity: Option<&PublicKey>,
        remote: &str,
    ) -> ReadDecision {
        let decision = self.decide_read(filters, identity).await;
        match &decision {
            ReadDecision::Allow { narrowed: true, filters } => {
                tracing::debug!(remote, kept = filters.len(), "Read narrowed");
            }
            ReadDecision::Allow { .. } => {}
            ReadDecision::Reject(reason) => {
                tracing::debug!(remote, "Read rejected: {}", reason);
            }
        }
        decision
    }

    async fn decide_read(&self, filters: &FilterSet, identity: Option<&PublicKey>) -> ReadDecision {
        // Open relays serve everyone alike; `can_see` still hides private kinds
        if self.is_open_for_reading() {
            return ReadDecision::Allow {
                filters: filters.clone(),
                narrowed: false,
            };
        }

        let Some(id) = identity else {
            return self.narrow_unauthenticated(filters);
        };

        if !self.owners.is_empty() && !self.is_followed(id).await {
            // Never less than an anonymous caller would get
            if self.public_readable {
                return self.narrow_unauthenticated(filters);
            }
            return ReadDecision::Reject(Reason::restricted("not a member of this relay"));
        }

        let hex = id.to_hex();
        for filter in filters {
            if !filter.requested_kinds().iter().any(|k| k.is_privileged()) {
                continue;
            }
            let is_author = filter
                .authors
                .as_ref()
                .is_some_and(|authors| authors.contains(id));
            let is_recipient = filter
                .tag_values('p')
                .is_some_and(|values| values.iter().any(|v| v.eq_ignore_ascii_case(&hex)));
            if !is_author && !is_recipient {
                return ReadDecision::Reject(Reason::restricted(
                    "private kinds are only readable by their author or recipient",
                ));
            }
        }

        ReadDecision::Allow {
            filters: filters.clone(),
            narrowed: false,
        }
    }

    /// Restrict each filter to the kinds an anonymous caller may read.
    fn narrow_unauthenticated(&self, filters: &FilterSet) -> ReadDecision {
        let mut kept = Vec::with_capacity(filters.len());
        let mut narrowed = false;

        for filter in filters {
            let requested = filter.requested_kinds();
            let allowed: Vec<Kind> = if self.public_readable {
                if requested.is_empty() {
                    // Privileged events are hidden at delivery by `can_see`
                    kept.push(filter.clone());
                    continue;
                }
                requested.iter().copied().filter(|k| !k.is_privileged()).collect()
            } else if requested.is_empty() {
                DIRECTORY.to_vec()
            } else {
                requested.iter().copied().filter(|k| k.is_directory()).collect()
            };

            if allowed.len() != requested.len() {
                narrowed = true;
            }
            if allowed.is_empty() {
                continue;
            }
            let mut filter = filter.clone();
            filter.kinds = Some(allowed);
            kept.push(filter);
        }

        if kept.is_empty() {
            return ReadDecision::Reject(Reason::auth_required(
                "authentication required to read these events",
            ));
        }
        ReadDecision::Allow {
            filters: FilterSet::new(kept),
            narrowed,
        }
    }
}
