use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Name of the ticket field holding the raw parent-id list.
pub const PARENTS_FIELD: &str = "parents";

/// Status value that marks a ticket as closed in the host taxonomy.
pub const CLOSED_STATUS: &str = "closed";

/// Defensive bound on ancestor walks and subtree recursion. The stored edge
/// graph is acyclic by invariant; the cap only matters if that invariant has
/// been violated out-of-band.
const MAX_RELATION_DEPTH: usize = 64;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum RelationError {
    #[error("backing store failure: {0}")]
    Store(String),
    #[error("parents field is not a valid list of ticket ids: {0}")]
    ParentsParse(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TicketId(pub i64);

impl Display for TicketId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Read-model of a host ticket, as far as the relation engine cares.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct TicketSnapshot {
    pub id: TicketId,
    pub kind: String,
    pub owner: String,
    pub status: String,
    pub summary: String,
    pub parents: String,
}

impl TicketSnapshot {
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.status == CLOSED_STATUS
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowAction {
    Resolve,
    Reopen,
}

impl WorkflowAction {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Resolve => "resolve",
            Self::Reopen => "reopen",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "resolve" => Some(Self::Resolve),
            "reopen" => Some(Self::Reopen),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RejectionReason {
    SelfReference,
    UnknownTicket,
    Circularity,
    ClosedParent,
    OpenChild,
    MalformedList,
}

/// One user-facing reason a save or transition must be blocked.
///
/// A `Some("parents")` field scopes the rejection to the parents field; a
/// `None` field blocks the whole operation.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Rejection {
    pub field: Option<String>,
    pub reason: RejectionReason,
    pub message: String,
}

impl Rejection {
    #[must_use]
    pub fn on_field(reason: RejectionReason, message: String) -> Self {
        Self { field: Some(PARENTS_FIELD.to_string()), reason, message }
    }

    #[must_use]
    pub fn on_ticket(reason: RejectionReason, message: String) -> Self {
        Self { field: None, reason, message }
    }
}

/// Outcome of validating a raw parents field.
///
/// `rewritten` carries the canonical form to persist (ids ascending, joined
/// with `", "`). It is `None` when validation failed closed and nothing may
/// be persisted.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ParentsValidation {
    pub accepted: BTreeSet<TicketId>,
    pub rewritten: Option<String>,
    pub rejections: Vec<Rejection>,
}

impl ParentsValidation {
    #[must_use]
    pub fn is_accepted(&self) -> bool {
        self.rejections.is_empty()
    }

    fn failed_closed() -> Self {
        Self {
            accepted: BTreeSet::new(),
            rewritten: None,
            rejections: vec![Rejection::on_field(
                RejectionReason::MalformedList,
                "Not a valid list of ticket IDs.".to_string(),
            )],
        }
    }
}

/// Extract candidate parent ids as the distinct maximal runs of ASCII digits
/// in `raw`. Tolerates free-form separators ("#1, #2 and #3").
///
/// # Errors
/// Returns [`RelationError::ParentsParse`] when a digit run does not fit a
/// ticket id; callers fail closed on that.
pub fn parse_parent_ids(raw: &str) -> Result<BTreeSet<TicketId>, RelationError> {
    fn flush(ids: &mut BTreeSet<TicketId>, run: &mut String) -> Result<(), RelationError> {
        if run.is_empty() {
            return Ok(());
        }
        let id =
            run.parse::<i64>().map_err(|_| RelationError::ParentsParse(run.clone()))?;
        ids.insert(TicketId(id));
        run.clear();
        Ok(())
    }

    let mut ids = BTreeSet::new();
    let mut run = String::new();
    for ch in raw.chars() {
        if ch.is_ascii_digit() {
            run.push(ch);
        } else {
            flush(&mut ids, &mut run)?;
        }
    }
    flush(&mut ids, &mut run)?;
    Ok(ids)
}

/// Canonical form of a parent set: ids ascending, joined with `", "`.
#[must_use]
pub fn format_parent_ids(ids: &BTreeSet<TicketId>) -> String {
    ids.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
}

/// Per-ticket-type display and inheritance options.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct TypeOptions {
    /// Fields copied from a parent ticket into a newly created child.
    pub child_inherits: Vec<String>,
    /// Fields shown for each child when listing subtickets.
    pub table_columns: Vec<String>,
}

impl Default for TypeOptions {
    fn default() -> Self {
        Self {
            child_inherits: Vec::new(),
            table_columns: vec!["status".to_string(), "owner".to_string()],
        }
    }
}

/// Read-only policy inputs to the engine, populated at startup.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RelationConfig {
    /// Block any modification of a child whose parent is closed.
    pub block_when_parent_closed: bool,
    /// Workflow actions exempt from closure validation.
    pub skip_closure_validation: BTreeSet<WorkflowAction>,
    /// Recursion limit when listing subtickets: `-1` unbounded, `0` direct
    /// children only, `N` means N additional levels.
    pub recursion_depth: i64,
    type_options: BTreeMap<String, TypeOptions>,
}

impl Default for RelationConfig {
    fn default() -> Self {
        Self {
            block_when_parent_closed: false,
            skip_closure_validation: BTreeSet::new(),
            recursion_depth: -1,
            type_options: BTreeMap::new(),
        }
    }
}

impl RelationConfig {
    /// Build a config with the per-type registry seeded from the full ticket
    /// type list of the host.
    #[must_use]
    pub fn with_types<'a>(type_names: impl IntoIterator<Item = &'a str>) -> Self {
        let mut config = Self::default();
        for name in type_names {
            config.register_type(name);
        }
        config
    }

    /// Register a newly added ticket type with default options. Existing
    /// options for the type are kept.
    pub fn register_type(&mut self, name: &str) {
        self.type_options.entry(name.to_string()).or_default();
    }

    pub fn set_type_options(&mut self, name: &str, options: TypeOptions) {
        self.type_options.insert(name.to_string(), options);
    }

    #[must_use]
    pub fn type_options(&self, name: &str) -> Option<&TypeOptions> {
        self.type_options.get(name)
    }

    #[must_use]
    pub fn skips_closure_validation(&self, action: WorkflowAction) -> bool {
        self.skip_closure_validation.contains(&action)
    }

    /// Whether the closed-parent block applies to a save performed under
    /// `action`. The workflow layer resolves this and hands the validator a
    /// plain flag.
    #[must_use]
    pub fn enforces_closed_parent(&self, action: Option<WorkflowAction>) -> bool {
        if !self.block_when_parent_closed {
            return false;
        }
        !action.is_some_and(|action| self.skips_closure_validation(action))
    }
}

/// Read side of the host ticket store.
pub trait TicketStore {
    /// # Errors
    /// Returns [`RelationError::Store`] on a backing-store fault.
    fn exists(&self, id: TicketId) -> Result<bool, RelationError>;

    /// # Errors
    /// Returns [`RelationError::Store`] on a backing-store fault.
    fn get(&self, id: TicketId) -> Result<Option<TicketSnapshot>, RelationError>;

    /// # Errors
    /// Returns [`RelationError::Store`] on a backing-store fault.
    fn append_comment(
        &mut self,
        id: TicketId,
        author: &str,
        body: &str,
    ) -> Result<(), RelationError>;
}

/// Durable `(parent, child)` edge table.
///
/// The transaction hooks default to no-ops; transactional implementations
/// override them so one lifecycle event maps to one store transaction.
pub trait EdgeStore {
    /// # Errors
    /// Returns [`RelationError::Store`] on a backing-store fault.
    fn add_edge(&mut self, parent: TicketId, child: TicketId) -> Result<(), RelationError>;

    /// Deletes the pair if present; absent pairs are not an error.
    ///
    /// # Errors
    /// Returns [`RelationError::Store`] on a backing-store fault.
    fn remove_edge(&mut self, parent: TicketId, child: TicketId) -> Result<(), RelationError>;

    /// # Errors
    /// Returns [`RelationError::Store`] on a backing-store fault.
    fn remove_edges_for_child(&mut self, child: TicketId) -> Result<(), RelationError>;

    /// # Errors
    /// Returns [`RelationError::Store`] on a backing-store fault.
    fn children_of(&self, parent: TicketId) -> Result<BTreeSet<TicketId>, RelationError>;

    /// # Errors
    /// Returns [`RelationError::Store`] on a backing-store fault.
    fn parents_of(&self, child: TicketId) -> Result<BTreeSet<TicketId>, RelationError>;

    /// # Errors
    /// Returns [`RelationError::Store`] on a backing-store fault.
    fn begin(&mut self) -> Result<(), RelationError> {
        Ok(())
    }

    /// # Errors
    /// Returns [`RelationError::Store`] on a backing-store fault.
    fn commit(&mut self) -> Result<(), RelationError> {
        Ok(())
    }

    /// # Errors
    /// Returns [`RelationError::Store`] on a backing-store fault.
    fn rollback(&mut self) -> Result<(), RelationError> {
        Ok(())
    }
}

/// Fire-and-forget change notification dispatch. Failures are logged by the
/// engine and never propagated.
pub trait Notifier {
    /// # Errors
    /// Implementations may fail; the engine absorbs the error.
    fn notify(
        &mut self,
        ticket: &TicketSnapshot,
        author: &str,
        changetime: OffsetDateTime,
    ) -> Result<(), RelationError>;
}

/// Notifier that drops every request.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullNotifier;

impl Notifier for NullNotifier {
    fn notify(
        &mut self,
        _ticket: &TicketSnapshot,
        _author: &str,
        _changetime: OffsetDateTime,
    ) -> Result<(), RelationError> {
        Ok(())
    }
}

/// Validate a raw parents field for `subject` (`None` while the ticket is
/// not yet created). `enforce_closed_parent` is the already-resolved policy
/// flag for the current workflow action.
///
/// Never fails: unexpected faults collapse into the single generic
/// `MalformedList` rejection with no rewrite, and the fault is logged.
pub fn validate_parents<S>(
    store: &S,
    subject: Option<TicketId>,
    raw: &str,
    enforce_closed_parent: bool,
) -> ParentsValidation
where
    S: TicketStore + EdgeStore,
{
    match validate_parents_inner(store, subject, raw, enforce_closed_parent) {
        Ok(validation) => validation,
        Err(err) => {
            tracing::error!(error = %err, "parents validation failed closed");
            ParentsValidation::failed_closed()
        }
    }
}

fn validate_parents_inner<S>(
    store: &S,
    subject: Option<TicketId>,
    raw: &str,
    enforce_closed_parent: bool,
) -> Result<ParentsValidation, RelationError>
where
    S: TicketStore + EdgeStore,
{
    let candidates = parse_parent_ids(raw)?;
    let mut invalid: BTreeSet<TicketId> = BTreeSet::new();
    let mut rejections: Vec<Rejection> = Vec::new();

    for &id in &candidates {
        if subject == Some(id) {
            invalid.insert(id);
            rejections.push(Rejection::on_field(
                RejectionReason::SelfReference,
                "A ticket cannot be a parent of itself".to_string(),
            ));
            continue;
        }
        if !store.exists(id)? {
            invalid.insert(id);
            rejections.push(Rejection::on_field(
                RejectionReason::UnknownTicket,
                format!("Ticket #{id} does not exist"),
            ));
        }
    }

    // Candidate iteration order is ascending by construction, which keeps
    // the rejection list reproducible.
    let remaining: Vec<TicketId> =
        candidates.iter().copied().filter(|id| !invalid.contains(id)).collect();
    for id in remaining {
        match store.get(id)? {
            Some(parent) => {
                if enforce_closed_parent && parent.is_closed() {
                    invalid.insert(id);
                    rejections.push(Rejection::on_ticket(
                        RejectionReason::ClosedParent,
                        format!("Cannot modify ticket because parent ticket #{id} is closed"),
                    ));
                }
                let mut path = Vec::new();
                if let Some(subject) = subject {
                    path.push(subject);
                }
                walk_ancestors(store, id, &mut path, &mut invalid, &mut rejections)?;
            }
            None => {
                // The candidate vanished between the existence check and the
                // policy checks. Treat it like step 3, not like a crash.
                invalid.insert(id);
                rejections.push(Rejection::on_field(
                    RejectionReason::UnknownTicket,
                    format!("Ticket #{id} does not exist"),
                ));
            }
        }
    }

    let accepted: BTreeSet<TicketId> = candidates.difference(&invalid).copied().collect();
    let rewritten = Some(format_parent_ids(&accepted));
    Ok(ParentsValidation { accepted, rewritten, rejections })
}

/// Depth-first walk over the stored ancestor chain of `id`, with the visited
/// path kept as an explicit stack. Any ancestor already on the path closes a
/// cycle through the proposed edge.
fn walk_ancestors<S: EdgeStore>(
    store: &S,
    id: TicketId,
    path: &mut Vec<TicketId>,
    invalid: &mut BTreeSet<TicketId>,
    rejections: &mut Vec<Rejection>,
) -> Result<(), RelationError> {
    if path.len() >= MAX_RELATION_DEPTH {
        tracing::warn!(ticket = %id, depth = path.len(), "ancestor walk depth cap reached");
        return Ok(());
    }
    path.push(id);
    for parent in store.parents_of(id)? {
        if path.contains(&parent) {
            invalid.insert(parent);
            let cycle = path
                .iter()
                .chain(std::iter::once(&parent))
                .map(|node| format!("#{node}"))
                .collect::<Vec<_>>()
                .join(" > ");
            rejections.push(Rejection::on_field(
                RejectionReason::Circularity,
                format!("Circularity error: {cycle}"),
            ));
        } else {
            walk_ancestors(store, parent, path, invalid, rejections)?;
        }
    }
    path.pop();
    Ok(())
}

/// Nested descendant listing: direct child id mapped to its own subtree.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct Subtree(pub BTreeMap<TicketId, Subtree>);

impl Subtree {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Synchronization and query engine: reacts to ticket lifecycle events,
/// keeps the edge table in sync with the parents field, and answers
/// descendant queries and workflow-gating checks.
pub struct RelationEngine<S, N> {
    store: S,
    notifier: N,
    config: RelationConfig,
}

impl<S, N> RelationEngine<S, N>
where
    S: TicketStore + EdgeStore,
    N: Notifier,
{
    pub fn new(store: S, notifier: N, config: RelationConfig) -> Self {
        Self { store, notifier, config }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    #[must_use]
    pub fn config(&self) -> &RelationConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut RelationConfig {
        &mut self.config
    }

    /// Validation hook for a ticket save. `subject` is `None` while the
    /// ticket has no id yet; `action` is the workflow action driving the
    /// save, when one is.
    pub fn validate_parents_field(
        &self,
        subject: Option<TicketId>,
        raw: &str,
        action: Option<WorkflowAction>,
    ) -> ParentsValidation {
        let enforce = self.config.enforces_closed_parent(action);
        validate_parents(&self.store, subject, raw, enforce)
    }

    /// Lifecycle hook: a ticket was created. Every parent in its initial
    /// parents field counts as new.
    ///
    /// # Errors
    /// Returns [`RelationError`] when an edge mutation fails; comment and
    /// notification faults are absorbed.
    pub fn ticket_created(
        &mut self,
        ticket: &TicketSnapshot,
        author: &str,
        changetime: OffsetDateTime,
    ) -> Result<(), RelationError> {
        self.ticket_changed(ticket, author, changetime, Some(""))
    }

    /// Lifecycle hook: a ticket changed. `old_parents` is the previous value
    /// of the parents field, or `None` when that field was not among the
    /// changed ones (in which case this is a no-op).
    ///
    /// # Errors
    /// Returns [`RelationError`] when parsing or an edge mutation fails; the
    /// transaction is rolled back in that case.
    pub fn ticket_changed(
        &mut self,
        ticket: &TicketSnapshot,
        author: &str,
        changetime: OffsetDateTime,
        old_parents: Option<&str>,
    ) -> Result<(), RelationError> {
        let Some(old_raw) = old_parents else {
            return Ok(());
        };
        let old = parse_parent_ids(old_raw)?;
        let new = parse_parent_ids(&ticket.parents)?;
        if old == new {
            return Ok(());
        }

        self.store.begin()?;
        let touched = match self.apply_parent_diff(ticket, author, &old, &new) {
            Ok(touched) => touched,
            Err(err) => {
                if let Err(rollback_err) = self.store.rollback() {
                    tracing::error!(error = %rollback_err, "rollback failed after sync fault");
                }
                return Err(err);
            }
        };
        self.store.commit()?;

        // Notification dispatch is decoupled from the transaction: failures
        // here must not disturb the committed edge mutations.
        for parent in touched {
            match self.store.get(parent) {
                Ok(Some(snapshot)) => {
                    if let Err(err) = self.notifier.notify(&snapshot, author, changetime) {
                        tracing::warn!(
                            ticket = %parent,
                            error = %err,
                            "failure sending notification on change to ticket",
                        );
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(ticket = %parent, error = %err, "notification lookup failed");
                }
            }
        }
        Ok(())
    }

    fn apply_parent_diff(
        &mut self,
        ticket: &TicketSnapshot,
        author: &str,
        old: &BTreeSet<TicketId>,
        new: &BTreeSet<TicketId>,
    ) -> Result<Vec<TicketId>, RelationError> {
        let mut touched = Vec::new();

        for &parent in old.difference(new) {
            self.store.remove_edge(parent, ticket.id)?;
            let body = format!("Remove a subticket #{} ({}).", ticket.id, ticket.summary);
            if let Err(err) = self.store.append_comment(parent, author, &body) {
                tracing::warn!(ticket = %parent, error = %err, "failed to append removal comment");
            }
            touched.push(parent);
        }

        for &parent in new.difference(old) {
            self.store.add_edge(parent, ticket.id)?;
            let body = format!("Add a subticket #{} ({}).", ticket.id, ticket.summary);
            if let Err(err) = self.store.append_comment(parent, author, &body) {
                tracing::warn!(ticket = %parent, error = %err, "failed to append addition comment");
            }
            touched.push(parent);
        }

        Ok(touched)
    }

    /// Lifecycle hook: a ticket was deleted. Removes the edges where it is
    /// the child; edges where it is a parent are left in place.
    ///
    /// # Errors
    /// Returns [`RelationError`] when the cascade fails; the transaction is
    /// rolled back in that case.
    pub fn ticket_deleted(&mut self, id: TicketId) -> Result<(), RelationError> {
        self.store.begin()?;
        if let Err(err) = self.store.remove_edges_for_child(id) {
            if let Err(rollback_err) = self.store.rollback() {
                tracing::error!(error = %rollback_err, "rollback failed after delete fault");
            }
            return Err(err);
        }
        self.store.commit()
    }

    /// # Errors
    /// Returns [`RelationError::Store`] on a backing-store fault.
    pub fn children_of(&self, id: TicketId) -> Result<BTreeSet<TicketId>, RelationError> {
        self.store.children_of(id)
    }

    /// # Errors
    /// Returns [`RelationError::Store`] on a backing-store fault.
    pub fn parents_of(&self, id: TicketId) -> Result<BTreeSet<TicketId>, RelationError> {
        self.store.parents_of(id)
    }

    /// Recursive descendant listing for `id`, bounded by the configured
    /// recursion depth.
    ///
    /// # Errors
    /// Returns [`RelationError::Store`] on a backing-store fault.
    pub fn children_tree(&self, id: TicketId) -> Result<Subtree, RelationError> {
        self.collect_children(id, 0)
    }

    fn collect_children(&self, id: TicketId, depth: usize) -> Result<Subtree, RelationError> {
        let mut children: BTreeMap<TicketId, Subtree> = self
            .store
            .children_of(id)?
            .into_iter()
            .map(|child| (child, Subtree::default()))
            .collect();

        let depth_i64 = i64::try_from(depth).unwrap_or(i64::MAX);
        let descend = self.config.recursion_depth == -1 || self.config.recursion_depth > depth_i64;
        if descend {
            if depth >= MAX_RELATION_DEPTH {
                tracing::warn!(ticket = %id, depth, "subtree recursion depth cap reached");
                return Ok(Subtree(children));
            }
            for (child, subtree) in &mut children {
                *subtree = self.collect_children(*child, depth + 1)?;
            }
        }
        Ok(Subtree(children))
    }

    /// Workflow gate for `resolve`: every direct child must be closed.
    /// Children that no longer resolve to a ticket are skipped.
    ///
    /// # Errors
    /// Returns [`RelationError::Store`] on a backing-store fault.
    pub fn check_resolve(&self, id: TicketId) -> Result<Vec<Rejection>, RelationError> {
        if self.config.skips_closure_validation(WorkflowAction::Resolve) {
            return Ok(Vec::new());
        }
        let mut rejections = Vec::new();
        for child in self.store.children_of(id)? {
            match self.store.get(child)? {
                Some(snapshot) if !snapshot.is_closed() => {
                    rejections.push(Rejection::on_ticket(
                        RejectionReason::OpenChild,
                        format!("Cannot close/resolve because child ticket #{child} is still open"),
                    ));
                }
                Some(_) => {}
                None => {
                    tracing::warn!(ticket = %child, "child ticket vanished; skipping resolve check");
                }
            }
        }
        Ok(rejections)
    }

    /// Workflow gate for `reopen`: every direct parent, parsed from the
    /// parents text rather than the edge table, must not be closed. Parents
    /// that no longer exist (deletion asymmetry) are skipped.
    ///
    /// # Errors
    /// Returns [`RelationError::Store`] on a backing-store fault.
    pub fn check_reopen(&self, ticket: &TicketSnapshot) -> Result<Vec<Rejection>, RelationError> {
        if self.config.skips_closure_validation(WorkflowAction::Reopen) {
            return Ok(Vec::new());
        }
        let mut rejections = Vec::new();
        for parent in parse_parent_ids(&ticket.parents)? {
            match self.store.get(parent)? {
                Some(snapshot) if snapshot.is_closed() => {
                    rejections.push(Rejection::on_ticket(
                        RejectionReason::ClosedParent,
                        format!("Cannot reopen because parent ticket #{parent} is closed"),
                    ));
                }
                Some(_) => {}
                None => {
                    tracing::warn!(ticket = %parent, "parent ticket vanished; skipping reopen check");
                }
            }
        }
        Ok(rejections)
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[derive(Debug, Default)]
    struct MemoryHost {
        tickets: BTreeMap<TicketId, TicketSnapshot>,
        edges: BTreeSet<(TicketId, TicketId)>,
        comments: Vec<(TicketId, String, String)>,
    }

    impl MemoryHost {
        fn insert(&mut self, id: i64, status: &str) {
            self.insert_full(id, status, "");
        }

        fn insert_full(&mut self, id: i64, status: &str, parents: &str) {
            self.tickets.insert(
                TicketId(id),
                TicketSnapshot {
                    id: TicketId(id),
                    kind: "defect".to_string(),
                    owner: "bob".to_string(),
                    status: status.to_string(),
                    summary: format!("ticket {id}"),
                    parents: parents.to_string(),
                },
            );
        }

        fn comments_for(&self, id: i64) -> Vec<&str> {
            self.comments
                .iter()
                .filter(|(ticket, _, _)| *ticket == TicketId(id))
                .map(|(_, _, body)| body.as_str())
                .collect()
        }
    }

    impl TicketStore for MemoryHost {
        fn exists(&self, id: TicketId) -> Result<bool, RelationError> {
            Ok(self.tickets.contains_key(&id))
        }

        fn get(&self, id: TicketId) -> Result<Option<TicketSnapshot>, RelationError> {
            Ok(self.tickets.get(&id).cloned())
        }

        fn append_comment(
            &mut self,
            id: TicketId,
            author: &str,
            body: &str,
        ) -> Result<(), RelationError> {
            self.comments.push((id, author.to_string(), body.to_string()));
            Ok(())
        }
    }

    impl EdgeStore for MemoryHost {
        fn add_edge(&mut self, parent: TicketId, child: TicketId) -> Result<(), RelationError> {
            self.edges.insert((parent, child));
            Ok(())
        }

        fn remove_edge(&mut self, parent: TicketId, child: TicketId) -> Result<(), RelationError> {
            self.edges.remove(&(parent, child));
            Ok(())
        }

        fn remove_edges_for_child(&mut self, child: TicketId) -> Result<(), RelationError> {
            self.edges.retain(|(_, edge_child)| *edge_child != child);
            Ok(())
        }

        fn children_of(&self, parent: TicketId) -> Result<BTreeSet<TicketId>, RelationError> {
            Ok(self
                .edges
                .iter()
                .filter(|(edge_parent, _)| *edge_parent == parent)
                .map(|(_, child)| *child)
                .collect())
        }

        fn parents_of(&self, child: TicketId) -> Result<BTreeSet<TicketId>, RelationError> {
            Ok(self
                .edges
                .iter()
                .filter(|(_, edge_child)| *edge_child == child)
                .map(|(parent, _)| *parent)
                .collect())
        }
    }

    #[derive(Debug, Default)]
    struct RecordingNotifier {
        sent: Vec<TicketId>,
    }

    impl Notifier for RecordingNotifier {
        fn notify(
            &mut self,
            ticket: &TicketSnapshot,
            _author: &str,
            _changetime: OffsetDateTime,
        ) -> Result<(), RelationError> {
            self.sent.push(ticket.id);
            Ok(())
        }
    }

    struct FailingNotifier;

    impl Notifier for FailingNotifier {
        fn notify(
            &mut self,
            _ticket: &TicketSnapshot,
            _author: &str,
            _changetime: OffsetDateTime,
        ) -> Result<(), RelationError> {
            Err(RelationError::Store("smtp unreachable".to_string()))
        }
    }

    fn tid(id: i64) -> TicketId {
        TicketId(id)
    }

    fn ids(raw: &[i64]) -> BTreeSet<TicketId> {
        raw.iter().copied().map(TicketId).collect()
    }

    fn fixture_time() -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + time::Duration::seconds(1_700_000_000)
    }

    fn snapshot(id: i64, parents: &str) -> TicketSnapshot {
        TicketSnapshot {
            id: tid(id),
            kind: "defect".to_string(),
            owner: "bob".to_string(),
            status: "new".to_string(),
            summary: format!("ticket {id}"),
            parents: parents.to_string(),
        }
    }

    fn engine(host: MemoryHost) -> RelationEngine<MemoryHost, RecordingNotifier> {
        RelationEngine::new(host, RecordingNotifier::default(), RelationConfig::default())
    }

    #[test]
    fn tokenizer_extracts_maximal_digit_runs() {
        let parsed = match parse_parent_ids("#1, #2 and #3") {
            Ok(parsed) => parsed,
            Err(err) => panic!("tokenizer failed: {err}"),
        };
        assert_eq!(parsed, ids(&[1, 2, 3]));

        let parsed = match parse_parent_ids("a12b3c") {
            Ok(parsed) => parsed,
            Err(err) => panic!("tokenizer failed: {err}"),
        };
        assert_eq!(parsed, ids(&[3, 12]));

        let parsed = match parse_parent_ids("5 5, 5") {
            Ok(parsed) => parsed,
            Err(err) => panic!("tokenizer failed: {err}"),
        };
        assert_eq!(parsed, ids(&[5]));

        let parsed = match parse_parent_ids("") {
            Ok(parsed) => parsed,
            Err(err) => panic!("tokenizer failed: {err}"),
        };
        assert!(parsed.is_empty());
    }

    #[test]
    fn tokenizer_rejects_overflowing_runs() {
        assert!(parse_parent_ids("99999999999999999999").is_err());
    }

    #[test]
    fn canonical_form_sorts_numerically() {
        assert_eq!(format_parent_ids(&ids(&[10, 2, 1])), "1, 2, 10");
        assert_eq!(format_parent_ids(&BTreeSet::new()), "");
    }

    #[test]
    fn validator_rejects_self_parent() {
        let mut host = MemoryHost::default();
        host.insert(5, "new");

        let validation = validate_parents(&host, Some(tid(5)), "5", false);

        assert!(!validation.is_accepted());
        assert_eq!(validation.rejections.len(), 1);
        assert_eq!(validation.rejections[0].reason, RejectionReason::SelfReference);
        assert_eq!(validation.rejections[0].field.as_deref(), Some(PARENTS_FIELD));
        assert!(validation.accepted.is_empty());
        assert_eq!(validation.rewritten.as_deref(), Some(""));
    }

    #[test]
    fn validator_rejects_unknown_ticket() {
        let mut host = MemoryHost::default();
        host.insert(1, "new");

        let validation = validate_parents(&host, Some(tid(1)), "9", false);

        assert_eq!(validation.rejections.len(), 1);
        assert_eq!(validation.rejections[0].reason, RejectionReason::UnknownTicket);
        assert_eq!(validation.rejections[0].message, "Ticket #9 does not exist");
    }

    #[test]
    fn validator_reports_circularity_with_path() {
        // Stored chain: 1 is parent of 2, 2 is parent of 3. Making 3 a
        // parent of 1 would close the loop.
        let mut host = MemoryHost::default();
        for id in [1, 2, 3] {
            host.insert(id, "new");
        }
        host.edges.insert((tid(1), tid(2)));
        host.edges.insert((tid(2), tid(3)));

        let validation = validate_parents(&host, Some(tid(1)), "3", false);

        assert!(!validation.is_accepted());
        assert_eq!(validation.rejections.len(), 1);
        assert_eq!(validation.rejections[0].reason, RejectionReason::Circularity);
        assert_eq!(
            validation.rejections[0].message,
            "Circularity error: #1 > #3 > #2 > #1"
        );
    }

    #[test]
    fn validator_accepts_diamond_without_cycle() {
        // 1 is parent of both 2 and 3; a ticket may point at 2 and 3 at once.
        let mut host = MemoryHost::default();
        for id in [1, 2, 3, 4] {
            host.insert(id, "new");
        }
        host.edges.insert((tid(1), tid(2)));
        host.edges.insert((tid(1), tid(3)));

        let validation = validate_parents(&host, Some(tid(4)), "2 3", false);

        assert!(validation.is_accepted());
        assert_eq!(validation.accepted, ids(&[2, 3]));
        assert_eq!(validation.rewritten.as_deref(), Some("2, 3"));
    }

    #[test]
    fn validator_blocks_closed_parent_when_enforced() {
        let mut host = MemoryHost::default();
        host.insert(7, "closed");
        host.insert(8, "new");

        let blocked = validate_parents(&host, Some(tid(8)), "7", true);
        assert_eq!(blocked.rejections.len(), 1);
        assert_eq!(blocked.rejections[0].reason, RejectionReason::ClosedParent);
        assert_eq!(blocked.rejections[0].field, None);
        assert_eq!(
            blocked.rejections[0].message,
            "Cannot modify ticket because parent ticket #7 is closed"
        );

        let allowed = validate_parents(&host, Some(tid(8)), "7", false);
        assert!(allowed.is_accepted());
        assert_eq!(allowed.accepted, ids(&[7]));
    }

    #[test]
    fn closed_parent_policy_is_skippable_per_action() {
        let config = RelationConfig {
            block_when_parent_closed: true,
            skip_closure_validation: [WorkflowAction::Resolve].into_iter().collect(),
            ..RelationConfig::default()
        };

        assert!(config.enforces_closed_parent(None));
        assert!(config.enforces_closed_parent(Some(WorkflowAction::Reopen)));
        assert!(!config.enforces_closed_parent(Some(WorkflowAction::Resolve)));

        let mut host = MemoryHost::default();
        host.insert(7, "closed");
        host.insert(8, "new");
        let mut engine = engine(host);
        engine.config_mut().block_when_parent_closed = true;
        engine.config_mut().skip_closure_validation.insert(WorkflowAction::Resolve);

        let skipped =
            engine.validate_parents_field(Some(tid(8)), "7", Some(WorkflowAction::Resolve));
        assert!(skipped.is_accepted());

        let blocked = engine.validate_parents_field(Some(tid(8)), "7", None);
        assert!(!blocked.is_accepted());
    }

    #[test]
    fn validator_rewrites_to_canonical_order() {
        let mut host = MemoryHost::default();
        for id in [1, 2, 3, 4] {
            host.insert(id, "new");
        }

        let validation = validate_parents(&host, Some(tid(4)), "3 1,2", false);

        assert!(validation.is_accepted());
        assert_eq!(validation.rewritten.as_deref(), Some("1, 2, 3"));
    }

    #[test]
    fn validator_fails_closed_on_overflow() {
        let mut host = MemoryHost::default();
        host.insert(5, "new");

        let validation = validate_parents(&host, Some(tid(1)), "5 99999999999999999999", false);

        assert_eq!(validation.rejections.len(), 1);
        assert_eq!(validation.rejections[0].reason, RejectionReason::MalformedList);
        assert_eq!(validation.rejections[0].message, "Not a valid list of ticket IDs.");
        assert!(validation.accepted.is_empty());
        assert_eq!(validation.rewritten, None);
    }

    #[test]
    fn created_ticket_inserts_edges_and_comments() {
        let mut host = MemoryHost::default();
        host.insert(1, "new");
        let mut engine = engine(host);

        let child = snapshot(2, "1");
        if let Err(err) = engine.ticket_created(&child, "bob", fixture_time()) {
            panic!("ticket_created failed: {err}");
        }

        assert!(engine.store().edges.contains(&(tid(1), tid(2))));
        assert_eq!(engine.store().comments_for(1), vec!["Add a subticket #2 (ticket 2)."]);
        assert_eq!(engine.notifier.sent, vec![tid(1)]);
    }

    #[test]
    fn changed_ticket_applies_exact_diff() {
        let mut host = MemoryHost::default();
        for id in [1, 2, 3, 4] {
            host.insert(id, "new");
        }
        host.edges.insert((tid(1), tid(4)));
        host.edges.insert((tid(2), tid(4)));
        let mut engine = engine(host);

        let child = snapshot(4, "2, 3");
        if let Err(err) = engine.ticket_changed(&child, "alice", fixture_time(), Some("1, 2")) {
            panic!("ticket_changed failed: {err}");
        }

        assert_eq!(
            engine.store().edges,
            [(tid(2), tid(4)), (tid(3), tid(4))].into_iter().collect()
        );
        assert_eq!(engine.store().comments_for(1), vec!["Remove a subticket #4 (ticket 4)."]);
        assert_eq!(engine.store().comments_for(3), vec!["Add a subticket #4 (ticket 4)."]);
        assert!(engine.store().comments_for(2).is_empty());
        assert_eq!(engine.notifier.sent, vec![tid(1), tid(3)]);
    }

    #[test]
    fn unchanged_parent_set_is_a_no_op() {
        let mut host = MemoryHost::default();
        host.insert(1, "new");
        host.edges.insert((tid(1), tid(2)));
        let mut engine = engine(host);

        let child = snapshot(2, "1");
        // Field not among the changed ones.
        if let Err(err) = engine.ticket_changed(&child, "bob", fixture_time(), None) {
            panic!("ticket_changed failed: {err}");
        }
        // Same id set spelled differently.
        let child = snapshot(2, " 1,");
        if let Err(err) = engine.ticket_changed(&child, "bob", fixture_time(), Some("1")) {
            panic!("ticket_changed failed: {err}");
        }

        assert_eq!(engine.store().edges, [(tid(1), tid(2))].into_iter().collect());
        assert!(engine.store().comments.is_empty());
        assert!(engine.notifier.sent.is_empty());
    }

    #[test]
    fn resubmitting_same_parents_emits_nothing_new() {
        let mut host = MemoryHost::default();
        host.insert(1, "new");
        let mut engine = engine(host);

        let child = snapshot(2, "1");
        if let Err(err) = engine.ticket_changed(&child, "bob", fixture_time(), Some("")) {
            panic!("first save failed: {err}");
        }
        if let Err(err) = engine.ticket_changed(&child, "bob", fixture_time(), Some("1")) {
            panic!("second save failed: {err}");
        }

        assert_eq!(engine.store().comments_for(1).len(), 1);
        assert_eq!(engine.notifier.sent.len(), 1);
    }

    #[test]
    fn deleted_ticket_cascades_child_side_only() {
        let mut host = MemoryHost::default();
        host.edges.insert((tid(5), tid(9)));
        host.edges.insert((tid(9), tid(2)));
        let mut engine = engine(host);

        if let Err(err) = engine.ticket_deleted(tid(9)) {
            panic!("ticket_deleted failed: {err}");
        }

        assert_eq!(engine.store().edges, [(tid(9), tid(2))].into_iter().collect());
    }

    #[test]
    fn notification_failure_does_not_block_sync() {
        let mut host = MemoryHost::default();
        host.insert(1, "new");
        let mut engine =
            RelationEngine::new(host, FailingNotifier, RelationConfig::default());

        let child = snapshot(2, "1");
        if let Err(err) = engine.ticket_created(&child, "bob", fixture_time()) {
            panic!("ticket_created failed: {err}");
        }

        assert!(engine.store().edges.contains(&(tid(1), tid(2))));
    }

    #[test]
    fn resolve_is_gated_on_open_children() {
        let mut host = MemoryHost::default();
        host.insert(1, "new");
        host.insert(2, "new");
        host.insert(3, "closed");
        host.edges.insert((tid(1), tid(2)));
        host.edges.insert((tid(1), tid(3)));
        let mut engine = engine(host);

        let rejections = match engine.check_resolve(tid(1)) {
            Ok(rejections) => rejections,
            Err(err) => panic!("check_resolve failed: {err}"),
        };
        assert_eq!(rejections.len(), 1);
        assert_eq!(rejections[0].reason, RejectionReason::OpenChild);
        assert_eq!(
            rejections[0].message,
            "Cannot close/resolve because child ticket #2 is still open"
        );

        if let Some(child) = engine.store_mut().tickets.get_mut(&tid(2)) {
            child.status = CLOSED_STATUS.to_string();
        }
        let rejections = match engine.check_resolve(tid(1)) {
            Ok(rejections) => rejections,
            Err(err) => panic!("check_resolve failed: {err}"),
        };
        assert!(rejections.is_empty());
    }

    #[test]
    fn resolve_gate_respects_skip_list() {
        let mut host = MemoryHost::default();
        host.insert(1, "new");
        host.insert(2, "new");
        host.edges.insert((tid(1), tid(2)));
        let mut engine = engine(host);
        engine.config_mut().skip_closure_validation.insert(WorkflowAction::Resolve);

        let rejections = match engine.check_resolve(tid(1)) {
            Ok(rejections) => rejections,
            Err(err) => panic!("check_resolve failed: {err}"),
        };
        assert!(rejections.is_empty());
    }

    #[test]
    fn reopen_is_gated_on_closed_parents() {
        let mut host = MemoryHost::default();
        host.insert(7, "closed");
        let engine = engine(host);

        let child = snapshot(2, "7");
        let rejections = match engine.check_reopen(&child) {
            Ok(rejections) => rejections,
            Err(err) => panic!("check_reopen failed: {err}"),
        };
        assert_eq!(rejections.len(), 1);
        assert_eq!(rejections[0].reason, RejectionReason::ClosedParent);
        assert_eq!(rejections[0].message, "Cannot reopen because parent ticket #7 is closed");
    }

    #[test]
    fn reopen_gate_tolerates_vanished_parents() {
        // Deletion keeps parent-side edges and never rewrites children's
        // parents text, so a reopened child may name a parent that is gone.
        let host = MemoryHost::default();
        let engine = engine(host);

        let child = snapshot(2, "7");
        let rejections = match engine.check_reopen(&child) {
            Ok(rejections) => rejections,
            Err(err) => panic!("check_reopen failed: {err}"),
        };
        assert!(rejections.is_empty());
    }

    #[test]
    fn children_tree_honors_recursion_depth() {
        let mut host = MemoryHost::default();
        host.edges.insert((tid(1), tid(2)));
        host.edges.insert((tid(2), tid(3)));
        host.edges.insert((tid(3), tid(4)));
        let mut engine = engine(host);

        let tree = match engine.children_tree(tid(1)) {
            Ok(tree) => tree,
            Err(err) => panic!("children_tree failed: {err}"),
        };
        let level2 = tree.0.get(&tid(2)).map(|sub| sub.0.contains_key(&tid(3)));
        assert_eq!(level2, Some(true));

        engine.config_mut().recursion_depth = 0;
        let tree = match engine.children_tree(tid(1)) {
            Ok(tree) => tree,
            Err(err) => panic!("children_tree failed: {err}"),
        };
        assert_eq!(tree.0.get(&tid(2)), Some(&Subtree::default()));

        engine.config_mut().recursion_depth = 1;
        let tree = match engine.children_tree(tid(1)) {
            Ok(tree) => tree,
            Err(err) => panic!("children_tree failed: {err}"),
        };
        let grandchild = tree.0.get(&tid(2)).map(|sub| sub.0.clone());
        assert_eq!(grandchild, Some([(tid(3), Subtree::default())].into_iter().collect()));
    }

    #[test]
    fn type_registry_is_explicit_and_refreshable() {
        let mut config = RelationConfig::with_types(["defect", "task"]);
        assert!(config.type_options("defect").is_some());
        assert!(config.type_options("story").is_none());

        config.register_type("story");
        let options = match config.type_options("story") {
            Some(options) => options.clone(),
            None => panic!("story type missing after register_type"),
        };
        assert_eq!(options.table_columns, vec!["status", "owner"]);

        config.set_type_options(
            "story",
            TypeOptions {
                child_inherits: vec!["owner".to_string()],
                table_columns: vec!["status".to_string()],
            },
        );
        config.register_type("story");
        let options = match config.type_options("story") {
            Some(options) => options.clone(),
            None => panic!("story type missing after re-register"),
        };
        assert_eq!(options.child_inherits, vec!["owner"]);
    }

    fn is_acyclic(edges: &BTreeSet<(TicketId, TicketId)>) -> bool {
        fn walk(
            edges: &BTreeSet<(TicketId, TicketId)>,
            node: TicketId,
            path: &mut Vec<TicketId>,
        ) -> bool {
            if path.contains(&node) {
                return false;
            }
            path.push(node);
            for (parent, child) in edges {
                if *parent == node && !walk(edges, *child, path) {
                    return false;
                }
            }
            path.pop();
            true
        }

        let nodes: BTreeSet<TicketId> =
            edges.iter().flat_map(|(parent, child)| [*parent, *child]).collect();
        nodes.iter().all(|node| walk(edges, *node, &mut Vec::new()))
    }

    proptest! {
        // Any sequence of saves that pass validation leaves the edge graph
        // acyclic.
        #[test]
        fn validated_saves_never_form_a_cycle(
            ops in proptest::collection::vec((1_i64..=8, proptest::collection::btree_set(1_i64..=8, 0..3)), 1..24)
        ) {
            let mut host = MemoryHost::default();
            for id in 1..=8 {
                host.insert_full(id, "new", "");
            }
            let mut engine = engine(host);

            for (child, parents) in ops {
                let raw = parents
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(", ");
                let validation = engine.validate_parents_field(Some(tid(child)), &raw, None);
                if !validation.is_accepted() {
                    continue;
                }
                let Some(canonical) = validation.rewritten else { continue };
                let old = engine
                    .store()
                    .tickets
                    .get(&tid(child))
                    .map(|snapshot| snapshot.parents.clone())
                    .unwrap_or_default();
                let updated = snapshot(child, &canonical);
                if let Err(err) = engine.ticket_changed(&updated, "bob", fixture_time(), Some(&old)) {
                    panic!("sync failed: {err}");
                }
                if let Some(stored) = engine.store_mut().tickets.get_mut(&tid(child)) {
                    stored.parents = canonical;
                }
                prop_assert!(is_acyclic(&engine.store().edges));
            }
        }
    }
}
