use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::convert::Infallible;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use ulid::Ulid;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum CoreError {
    #[error("validation error: {0}")]
    Validation(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct RecipeId(pub String);

impl RecipeId {
    /// Mint a fresh identifier for a newly created record.
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RecipeId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for RecipeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for RecipeId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct ViewerId(pub String);

impl ViewerId {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ViewerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ViewerId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Closed role hierarchy: `guest < read < comment < edit < admin`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Guest,
    Read,
    Comment,
    Edit,
    Admin,
}

impl Role {
    #[must_use]
    pub fn level(self) -> u8 {
        match self {
            Self::Guest => 1,
            Self::Read => 2,
            Self::Comment => 3,
            Self::Edit => 4,
            Self::Admin => 5,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Guest => "guest",
            Self::Read => "read",
            Self::Comment => "comment",
            Self::Edit => "edit",
            Self::Admin => "admin",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "guest" => Some(Self::Guest),
            "read" => Some(Self::Read),
            "comment" => Some(Self::Comment),
            "edit" => Some(Self::Edit),
            "admin" => Some(Self::Admin),
            _ => None,
        }
    }
}

/// Level of an optional role; missing or unrecognised roles sit below `guest`.
#[must_use]
pub fn role_level(role: Option<Role>) -> u8 {
    role.map_or(0, Role::level)
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Viewer {
    pub id: ViewerId,
    #[serde(default, deserialize_with = "lenient_role")]
    pub role: Option<Role>,
}

impl Viewer {
    #[must_use]
    pub fn new(id: impl Into<String>, role: Role) -> Self {
        Self { id: ViewerId(id.into()), role: Some(role) }
    }
}

fn lenient_role<'de, D>(deserializer: D) -> Result<Option<Role>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(raw.as_ref().and_then(serde_json::Value::as_str).and_then(Role::parse))
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct RecipeDetails {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub ingredients: Vec<String>,
    #[serde(default)]
    pub steps: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub source_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RecipeRecord {
    pub id: RecipeId,
    #[serde(default)]
    pub parent_id: Option<RecipeId>,
    pub author_id: ViewerId,
    #[serde(default, with = "lenient_rfc3339")]
    pub created_at: Option<OffsetDateTime>,
    pub title: String,
    #[serde(default)]
    pub details: RecipeDetails,
}

impl RecipeRecord {
    #[must_use]
    pub fn is_original(&self) -> bool {
        self.parent_id.is_none()
    }

    /// Timestamp used to order versions; records without one sort as the Unix epoch.
    #[must_use]
    pub fn creation_key(&self) -> OffsetDateTime {
        self.created_at.unwrap_or(OffsetDateTime::UNIX_EPOCH)
    }

    /// Validate identity and authorship fields before a record is persisted.
    ///
    /// # Errors
    /// Returns [`CoreError::Validation`] when the id, author or title is blank, or when
    /// the record names itself as its parent.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.id.0.trim().is_empty() {
            return Err(CoreError::Validation("id MUST be non-empty".to_string()));
        }

        if self.author_id.0.trim().is_empty() {
            return Err(CoreError::Validation("author_id MUST be non-empty".to_string()));
        }

        if self.title.trim().is_empty() {
            return Err(CoreError::Validation("title MUST be non-empty".to_string()));
        }

        if let Some(parent_id) = &self.parent_id {
            if parent_id.0.trim().is_empty() {
                return Err(CoreError::Validation(
                    "parent_id MUST be non-empty when present".to_string(),
                ));
            }
            if parent_id == &self.id {
                return Err(CoreError::Validation(
                    "parent_id MUST NOT reference the record itself".to_string(),
                ));
            }
        }

        Ok(())
    }
}

/// Parse a creation timestamp; anything that is not RFC 3339 yields `None`.
#[must_use]
pub fn parse_created_at(raw: &str) -> Option<OffsetDateTime> {
    OffsetDateTime::parse(raw.trim(), &time::format_description::well_known::Rfc3339).ok()
}

mod lenient_rfc3339 {
    use serde::{Deserialize, Deserializer, Serializer};
    use time::OffsetDateTime;

    pub fn serialize<S>(value: &Option<OffsetDateTime>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        time::serde::rfc3339::option::serialize(value, serializer)
    }

    // Strings are RFC 3339, integers are Unix milliseconds; everything else is dropped.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<OffsetDateTime>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Option::<serde_json::Value>::deserialize(deserializer)?;
        Ok(match raw {
            Some(serde_json::Value::String(value)) => super::parse_created_at(&value),
            Some(serde_json::Value::Number(value)) => value.as_i64().and_then(|millis| {
                OffsetDateTime::from_unix_timestamp_nanos(i128::from(millis) * 1_000_000).ok()
            }),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RecipeGroup {
    pub original: RecipeRecord,
    pub members: Vec<RecipeRecord>,
    pub version_count: usize,
}

// ---------------------------------------------------------------------------
// Capability model
// ---------------------------------------------------------------------------

#[must_use]
pub fn has_permission(viewer: Option<&Viewer>, required: Role) -> bool {
    viewer.is_some_and(|viewer| role_level(viewer.role) >= required.level())
}

#[must_use]
pub fn can_directly_edit(viewer: Option<&Viewer>, record: Option<&RecipeRecord>) -> bool {
    let (Some(viewer), Some(record)) = (viewer, record) else {
        return false;
    };
    viewer.role == Some(Role::Admin) || record.author_id == viewer.id
}

/// Forking is not tied to a record: any viewer at `edit` or above may fork what they see.
#[must_use]
pub fn can_create_version(viewer: Option<&Viewer>) -> bool {
    has_permission(viewer, Role::Edit)
}

/// Only admins delete. Authorship is deliberately not enough.
#[must_use]
pub fn can_delete(viewer: Option<&Viewer>, record: Option<&RecipeRecord>) -> bool {
    record.is_some() && viewer.is_some_and(|viewer| viewer.role == Some(Role::Admin))
}

#[must_use]
pub fn can_view(viewer: Option<&Viewer>) -> bool {
    has_permission(viewer, Role::Read)
}

#[must_use]
pub fn can_comment(viewer: Option<&Viewer>) -> bool {
    has_permission(viewer, Role::Comment)
}

#[must_use]
pub fn can_favorite(viewer: Option<&Viewer>) -> bool {
    has_permission(viewer, Role::Read)
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct Capabilities {
    pub can_edit: bool,
    pub can_create_version: bool,
    pub can_delete: bool,
    pub can_comment: bool,
    pub can_favorite: bool,
}

impl Capabilities {
    #[must_use]
    pub fn resolve(viewer: Option<&Viewer>, record: Option<&RecipeRecord>) -> Self {
        Self {
            can_edit: can_directly_edit(viewer, record),
            can_create_version: can_create_version(viewer),
            can_delete: can_delete(viewer, record),
            can_comment: can_comment(viewer),
            can_favorite: can_favorite(viewer),
        }
    }
}

// ---------------------------------------------------------------------------
// Version graph
// ---------------------------------------------------------------------------

fn sorted_siblings<'a>(
    all_records: &'a [RecipeRecord],
    parent_id: &RecipeId,
) -> Vec<&'a RecipeRecord> {
    let mut siblings = all_records
        .iter()
        .filter(|candidate| candidate.parent_id.as_ref() == Some(parent_id))
        .collect::<Vec<_>>();
    // Stable: siblings created at the same instant keep collection order.
    siblings.sort_by_key(|candidate| candidate.creation_key());
    siblings
}

/// Ordinal of `record` within its group: 0 for originals, then 1, 2, ... for versions in
/// ascending creation order. A version that is missing from `all_records` gets 0.
#[must_use]
pub fn compute_version_ordinal(all_records: &[RecipeRecord], record: &RecipeRecord) -> u32 {
    let Some(parent_id) = &record.parent_id else {
        return 0;
    };

    sorted_siblings(all_records, parent_id)
        .iter()
        .position(|sibling| sibling.id == record.id)
        .map_or(0, |index| u32::try_from(index + 1).unwrap_or(u32::MAX))
}

/// Ordinals for every record in the collection, keyed by id.
#[must_use]
pub fn version_ordinals(all_records: &[RecipeRecord]) -> BTreeMap<RecipeId, u32> {
    let mut siblings_by_parent: BTreeMap<&RecipeId, Vec<&RecipeRecord>> = BTreeMap::new();
    let mut ordinals = BTreeMap::new();

    for record in all_records {
        match &record.parent_id {
            None => {
                ordinals.entry(record.id.clone()).or_insert(0);
            }
            Some(parent_id) => siblings_by_parent.entry(parent_id).or_default().push(record),
        }
    }

    for siblings in siblings_by_parent.values_mut() {
        siblings.sort_by_key(|candidate| candidate.creation_key());
        for (index, sibling) in siblings.iter().enumerate() {
            ordinals
                .entry(sibling.id.clone())
                .or_insert_with(|| u32::try_from(index + 1).unwrap_or(u32::MAX));
        }
    }

    ordinals
}

fn index_originals(all_records: &[RecipeRecord]) -> BTreeMap<&RecipeId, &RecipeRecord> {
    let mut originals = BTreeMap::new();
    for record in all_records.iter().filter(|record| record.is_original()) {
        originals.entry(&record.id).or_insert(record);
    }
    originals
}

fn index_children(all_records: &[RecipeRecord]) -> BTreeMap<&RecipeId, Vec<&RecipeRecord>> {
    let mut children: BTreeMap<&RecipeId, Vec<&RecipeRecord>> = BTreeMap::new();
    for record in all_records {
        if let Some(parent_id) = &record.parent_id {
            children.entry(parent_id).or_default().push(record);
        }
    }
    children
}

fn build_group<'a>(
    original: &'a RecipeRecord,
    children: Option<&Vec<&'a RecipeRecord>>,
    processed: &mut BTreeSet<&'a RecipeId>,
) -> RecipeGroup {
    processed.insert(&original.id);
    let mut members = vec![original.clone()];
    for &child in children.into_iter().flatten() {
        if processed.insert(&child.id) {
            members.push(child.clone());
        }
    }

    RecipeGroup { original: original.clone(), version_count: members.len(), members }
}

/// Partition the collection into groups of one original plus its direct versions.
///
/// Groups appear in the order their first member is met while walking `all_records`.
/// Members are the original followed by its versions in collection order. Records whose
/// parent is not an original in the collection are left out (see [`find_orphans`]).
#[must_use]
pub fn group_by_original(all_records: &[RecipeRecord]) -> Vec<RecipeGroup> {
    let originals = index_originals(all_records);
    let children = index_children(all_records);
    let mut processed: BTreeSet<&RecipeId> = BTreeSet::new();
    let mut groups = Vec::new();

    for record in all_records {
        if processed.contains(&record.id) {
            continue;
        }

        let original = match &record.parent_id {
            None => record,
            Some(parent_id) => match originals.get(parent_id) {
                Some(original) if !processed.contains(&original.id) => *original,
                _ => continue,
            },
        };

        groups.push(build_group(original, children.get(&original.id), &mut processed));
    }

    groups
}

/// Versions whose parent is missing from the collection or is itself a version.
#[must_use]
pub fn find_orphans(all_records: &[RecipeRecord]) -> Vec<&RecipeRecord> {
    let originals = index_originals(all_records);
    all_records
        .iter()
        .filter(|record| {
            record.parent_id.as_ref().is_some_and(|parent_id| !originals.contains_key(parent_id))
        })
        .collect()
}

/// Original of the group `recipe_id` belongs to, or `None` for unknown ids and orphans.
#[must_use]
pub fn root_of<'a>(all_records: &'a [RecipeRecord], recipe_id: &RecipeId) -> Option<&'a RecipeRecord> {
    let record = all_records.iter().find(|record| &record.id == recipe_id)?;
    match &record.parent_id {
        None => Some(record),
        Some(parent_id) => {
            all_records.iter().find(|candidate| &candidate.id == parent_id && candidate.is_original())
        }
    }
}

// ---------------------------------------------------------------------------
// Ranking
// ---------------------------------------------------------------------------

pub trait FavoritePredicate {
    fn is_favorite(&self, viewer_id: &ViewerId, recipe_id: &RecipeId) -> bool;
}

impl<F> FavoritePredicate for F
where
    F: Fn(&ViewerId, &RecipeId) -> bool,
{
    fn is_favorite(&self, viewer_id: &ViewerId, recipe_id: &RecipeId) -> bool {
        self(viewer_id, recipe_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RankedMember {
    pub rank: usize,
    pub recipe_id: RecipeId,
    pub author_id: ViewerId,
    pub ordinal: Option<u32>,
    pub favorite: Option<bool>,
    pub owned: Option<bool>,
}

#[derive(Debug, Clone)]
struct RankCandidate<'a> {
    record: &'a RecipeRecord,
    favorite: Option<bool>,
    owned: Option<bool>,
    ordinal: Option<u32>,
}

impl RankCandidate<'_> {
    // Disabled tiers carry `None` on both sides and compare equal.
    fn cmp(lhs: &Self, rhs: &Self) -> Ordering {
        rhs.favorite
            .cmp(&lhs.favorite)
            .then_with(|| rhs.owned.cmp(&lhs.owned))
            .then_with(|| lhs.ordinal.cmp(&rhs.ordinal))
    }
}

#[must_use]
pub fn ranking_tie_breakers() -> Vec<String> {
    vec![
        "favorited_by_viewer first".to_string(),
        "authored_by_viewer first".to_string(),
        "version_ordinal asc".to_string(),
        "input_order (stable)".to_string(),
    ]
}

fn rank_candidates<'a>(
    members: &'a [RecipeRecord],
    viewer_id: Option<&ViewerId>,
    is_favorite: Option<&dyn FavoritePredicate>,
    all_records: Option<&[RecipeRecord]>,
) -> Vec<RankCandidate<'a>> {
    let favorites = viewer_id.zip(is_favorite);
    let mut candidates = members
        .iter()
        .map(|record| RankCandidate {
            record,
            favorite: favorites
                .map(|(viewer_id, predicate)| predicate.is_favorite(viewer_id, &record.id)),
            owned: viewer_id.map(|viewer_id| &record.author_id == viewer_id),
            ordinal: all_records.map(|all_records| compute_version_ordinal(all_records, record)),
        })
        .collect::<Vec<_>>();

    candidates.sort_by(RankCandidate::cmp);
    candidates
}

/// Order a group's members for one viewer: favorites first, then the viewer's own
/// records, then ascending version ordinal. Ties keep their input order.
///
/// Without a viewer or predicate the favorite tier is skipped; without a viewer the
/// ownership tier is skipped; without `all_records` the ordinal tier is skipped.
#[must_use]
pub fn rank_group(
    members: &[RecipeRecord],
    viewer_id: Option<&ViewerId>,
    is_favorite: Option<&dyn FavoritePredicate>,
    all_records: Option<&[RecipeRecord]>,
) -> Vec<RecipeRecord> {
    rank_candidates(members, viewer_id, is_favorite, all_records)
        .into_iter()
        .map(|candidate| candidate.record.clone())
        .collect()
}

/// Same order as [`rank_group`], with the tier values that produced it.
#[must_use]
pub fn rank_group_explained(
    members: &[RecipeRecord],
    viewer_id: Option<&ViewerId>,
    is_favorite: Option<&dyn FavoritePredicate>,
    all_records: Option<&[RecipeRecord]>,
) -> Vec<RankedMember> {
    rank_candidates(members, viewer_id, is_favorite, all_records)
        .into_iter()
        .enumerate()
        .map(|(index, candidate)| RankedMember {
            rank: index + 1,
            recipe_id: candidate.record.id.clone(),
            author_id: candidate.record.author_id.clone(),
            ordinal: candidate.ordinal,
            favorite: candidate.favorite,
            owned: candidate.owned,
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Favorites
// ---------------------------------------------------------------------------

/// Snapshot of one viewer's favorites, usable directly as a [`FavoritePredicate`].
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct FavoriteSet {
    pub viewer_id: ViewerId,
    pub recipe_ids: BTreeSet<RecipeId>,
}

impl FavoriteSet {
    #[must_use]
    pub fn empty(viewer_id: ViewerId) -> Self {
        Self { viewer_id, recipe_ids: BTreeSet::new() }
    }

    #[must_use]
    pub fn contains(&self, recipe_id: &RecipeId) -> bool {
        self.recipe_ids.contains(recipe_id)
    }
}

impl FavoritePredicate for FavoriteSet {
    fn is_favorite(&self, viewer_id: &ViewerId, recipe_id: &RecipeId) -> bool {
        &self.viewer_id == viewer_id && self.contains(recipe_id)
    }
}

pub trait FavoritesStore {
    type Error;

    /// Current favorites of one viewer.
    ///
    /// # Errors
    /// Returns the backend error when the set cannot be read.
    fn favorite_set(&self, viewer_id: &ViewerId) -> Result<FavoriteSet, Self::Error>;

    /// Mark or unmark one recipe as a favorite. Idempotent.
    ///
    /// # Errors
    /// Returns the backend error when the change cannot be recorded.
    fn set_favorite(
        &mut self,
        viewer_id: &ViewerId,
        recipe_id: &RecipeId,
        favorite: bool,
    ) -> Result<(), Self::Error>;

    /// Flip the favorite flag and return the new state.
    ///
    /// # Errors
    /// Returns the backend error from either the read or the write.
    fn toggle_favorite(
        &mut self,
        viewer_id: &ViewerId,
        recipe_id: &RecipeId,
    ) -> Result<bool, Self::Error> {
        let next = !self.favorite_set(viewer_id)?.contains(recipe_id);
        self.set_favorite(viewer_id, recipe_id, next)?;
        Ok(next)
    }
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryFavorites {
    by_viewer: BTreeMap<ViewerId, BTreeSet<RecipeId>>,
}

impl InMemoryFavorites {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl FavoritesStore for InMemoryFavorites {
    type Error = Infallible;

    fn favorite_set(&self, viewer_id: &ViewerId) -> Result<FavoriteSet, Self::Error> {
        Ok(FavoriteSet {
            viewer_id: viewer_id.clone(),
            recipe_ids: self.by_viewer.get(viewer_id).cloned().unwrap_or_default(),
        })
    }

    fn set_favorite(
        &mut self,
        viewer_id: &ViewerId,
        recipe_id: &RecipeId,
        favorite: bool,
    ) -> Result<(), Self::Error> {
        if favorite {
            self.by_viewer.entry(viewer_id.clone()).or_default().insert(recipe_id.clone());
        } else if let Some(ids) = self.by_viewer.get_mut(viewer_id) {
            ids.remove(recipe_id);
            if ids.is_empty() {
                self.by_viewer.remove(viewer_id);
            }
        }
        Ok(())
    }
}

impl FavoritePredicate for InMemoryFavorites {
    fn is_favorite(&self, viewer_id: &ViewerId, recipe_id: &RecipeId) -> bool {
        self.by_viewer.get(viewer_id).is_some_and(|ids| ids.contains(recipe_id))
    }
}
