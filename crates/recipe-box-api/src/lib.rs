use std::fmt::{Display, Formatter};
use std::path::PathBuf;

use anyhow::Result;
use recipe_box_core::{
    can_create_version, can_delete, can_directly_edit, can_favorite, find_orphans,
    group_by_original, has_permission, rank_group_explained, ranking_tie_breakers, Capabilities,
    FavoritePredicate, FavoriteSet, FavoritesStore, RankedMember, RecipeDetails, RecipeGroup,
    RecipeId, RecipeRecord, Role, Viewer, ViewerId,
};
use recipe_box_store_sqlite::{IntegrityReport, SchemaStatus, SqliteStore};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{info, warn};

pub const API_CONTRACT_VERSION: &str = "api.v1";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    CreateRecipe,
    CreateVersion,
    Edit,
    Delete,
    Favorite,
}

impl Action {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CreateRecipe => "create_recipe",
            Self::CreateVersion => "create_version",
            Self::Edit => "edit",
            Self::Delete => "delete",
            Self::Favorite => "favorite",
        }
    }
}

impl Display for Action {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failures callers are expected to branch on. Everything else surfaces as a plain
/// `anyhow::Error` from the store.
#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum ApiError {
    #[error("permission denied: viewer {viewer_id} may not {action}")]
    PermissionDenied { action: Action, viewer_id: ViewerId },
    #[error("recipe not found: {0}")]
    NotFound(RecipeId),
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CreateRecipeRequest {
    pub viewer: Viewer,
    pub title: String,
    #[serde(default)]
    pub details: RecipeDetails,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub created_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ForkRecipeRequest {
    pub viewer: Viewer,
    pub parent_id: RecipeId,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub details: Option<RecipeDetails>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub created_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpdateRecipeRequest {
    pub viewer: Viewer,
    pub recipe_id: RecipeId,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub details: Option<RecipeDetails>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecipeRequest {
    pub viewer: Viewer,
    pub recipe_id: RecipeId,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BrowseRequest {
    #[serde(default)]
    pub viewer: Option<Viewer>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ShowGroupRequest {
    #[serde(default)]
    pub viewer: Option<Viewer>,
    pub recipe_id: RecipeId,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeleteResult {
    pub recipe_id: RecipeId,
    pub deleted: bool,
    pub orphaned_version_ids: Vec<RecipeId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FavoriteToggleResult {
    pub viewer_id: ViewerId,
    pub recipe_id: RecipeId,
    pub favorite: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GroupView {
    pub original_id: RecipeId,
    pub title: String,
    pub version_count: usize,
    pub display: RecipeRecord,
    pub display_ordinal: u32,
    pub members: Vec<RankedMember>,
    pub capabilities: Capabilities,
    pub tie_breakers: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BrowseResult {
    pub viewer_id: Option<ViewerId>,
    pub groups: Vec<GroupView>,
    pub orphaned_recipe_ids: Vec<RecipeId>,
}

#[derive(Debug, Clone)]
pub struct RecipeBoxApi {
    db_path: PathBuf,
}

impl RecipeBoxApi {
    #[must_use]
    pub fn new(db_path: PathBuf) -> Self {
        Self { db_path }
    }

    fn open_store(&self) -> Result<SqliteStore> {
        SqliteStore::open(&self.db_path)
    }

    fn open_migrated_store(&self) -> Result<SqliteStore> {
        let mut store = self.open_store()?;
        store.migrate()?;
        Ok(store)
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let store = self.open_store()?;
        store.schema_status()
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult> {
        let mut store = self.open_store()?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                after_version: None,
                up_to_date: None,
            });
        }

        let planned_versions = before.pending_versions;
        store.migrate()?;
        let after = store.schema_status()?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: planned_versions,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// Run store health probes.
    ///
    /// # Errors
    /// Returns an error when any probe query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let store = self.open_migrated_store()?;
        store.integrity_check()
    }

    /// Create a new original recipe authored by the viewer.
    ///
    /// # Errors
    /// Returns [`ApiError::PermissionDenied`] below the `edit` role, or a store error.
    pub fn create_recipe(&self, input: CreateRecipeRequest) -> Result<RecipeRecord> {
        if !has_permission(Some(&input.viewer), Role::Edit) {
            return Err(denied(Action::CreateRecipe, &input.viewer));
        }

        let mut store = self.open_migrated_store()?;
        let record = RecipeRecord {
            id: RecipeId::new(),
            parent_id: None,
            author_id: input.viewer.id,
            created_at: Some(input.created_at.unwrap_or_else(OffsetDateTime::now_utc)),
            title: input.title,
            details: input.details,
        };
        validate_record(&record)?;
        store.write_recipe(&record)?;

        info!(recipe_id = %record.id, author_id = %record.author_id, "created recipe");
        Ok(record)
    }

    /// Fork a recipe into a new version owned by the viewer. Forking a version attaches
    /// the new record to that version's original, so lineage is always one level deep.
    ///
    /// # Errors
    /// Returns [`ApiError::PermissionDenied`] when the viewer may not create versions,
    /// [`ApiError::NotFound`] for an unknown target, and [`ApiError::InvalidInput`] when
    /// the target is an orphan whose original is gone.
    pub fn fork_recipe(&self, input: ForkRecipeRequest) -> Result<RecipeRecord> {
        if !can_create_version(Some(&input.viewer)) {
            return Err(denied(Action::CreateVersion, &input.viewer));
        }

        let mut store = self.open_migrated_store()?;
        let target = load_recipe(&store, &input.parent_id)?;
        let original_id = match &target.parent_id {
            None => target.id.clone(),
            Some(parent_id) => match store.get_recipe(parent_id)? {
                Some(original) if original.is_original() => original.id,
                _ => {
                    return Err(ApiError::InvalidInput(format!(
                        "recipe {} has no original to fork from",
                        target.id
                    ))
                    .into());
                }
            },
        };

        let record = RecipeRecord {
            id: RecipeId::new(),
            parent_id: Some(original_id),
            author_id: input.viewer.id,
            created_at: Some(input.created_at.unwrap_or_else(OffsetDateTime::now_utc)),
            title: input.title.unwrap_or_else(|| target.title.clone()),
            details: input.details.unwrap_or_else(|| target.details.clone()),
        };
        validate_record(&record)?;
        store.write_recipe(&record)?;

        info!(
            recipe_id = %record.id,
            forked_from = %target.id,
            author_id = %record.author_id,
            "created recipe version"
        );
        Ok(record)
    }

    /// Edit a recipe in place.
    ///
    /// # Errors
    /// Returns [`ApiError::NotFound`] for an unknown recipe and
    /// [`ApiError::PermissionDenied`] unless the viewer is its author or an admin.
    pub fn update_recipe(&self, input: UpdateRecipeRequest) -> Result<RecipeRecord> {
        let mut store = self.open_migrated_store()?;
        let current = load_recipe(&store, &input.recipe_id)?;
        if !can_directly_edit(Some(&input.viewer), Some(&current)) {
            return Err(denied(Action::Edit, &input.viewer));
        }

        let title = input.title.unwrap_or_else(|| current.title.clone());
        let details = input.details.unwrap_or_else(|| current.details.clone());
        if title.trim().is_empty() {
            return Err(ApiError::InvalidInput("title MUST be non-empty".to_string()).into());
        }
        if !store.update_recipe_content(&current.id, &title, &details)? {
            return Err(ApiError::NotFound(current.id).into());
        }

        info!(recipe_id = %current.id, editor_id = %input.viewer.id, "updated recipe");
        Ok(RecipeRecord { title, details, ..current })
    }

    /// Delete a recipe. Its versions are kept and reported as orphaned.
    ///
    /// # Errors
    /// Returns [`ApiError::NotFound`] for an unknown recipe and
    /// [`ApiError::PermissionDenied`] for non-admin viewers.
    pub fn delete_recipe(&self, input: RecipeRequest) -> Result<DeleteResult> {
        let mut store = self.open_migrated_store()?;
        let record = load_recipe(&store, &input.recipe_id)?;
        if !can_delete(Some(&input.viewer), Some(&record)) {
            return Err(denied(Action::Delete, &input.viewer));
        }

        let deleted = store.delete_recipe(&record.id)?;
        let orphaned_version_ids = store
            .list_recipes()?
            .into_iter()
            .filter(|candidate| candidate.parent_id.as_ref() == Some(&record.id))
            .map(|candidate| candidate.id)
            .collect::<Vec<_>>();

        info!(recipe_id = %record.id, orphaned = orphaned_version_ids.len(), "deleted recipe");
        Ok(DeleteResult { recipe_id: record.id, deleted, orphaned_version_ids })
    }

    /// Flip the viewer's favorite mark on a recipe.
    ///
    /// # Errors
    /// Returns [`ApiError::PermissionDenied`] below the `read` role and
    /// [`ApiError::NotFound`] for an unknown recipe.
    pub fn toggle_favorite(&self, input: RecipeRequest) -> Result<FavoriteToggleResult> {
        if !can_favorite(Some(&input.viewer)) {
            return Err(denied(Action::Favorite, &input.viewer));
        }

        let mut store = self.open_migrated_store()?;
        let record = load_recipe(&store, &input.recipe_id)?;
        let favorite = store.toggle_favorite(&input.viewer.id, &record.id)?;
        Ok(FavoriteToggleResult { viewer_id: input.viewer.id, recipe_id: record.id, favorite })
    }

    /// Current favorites of one viewer.
    ///
    /// # Errors
    /// Returns an error when the store cannot be read.
    pub fn list_favorites(&self, viewer_id: &ViewerId) -> Result<FavoriteSet> {
        let store = self.open_migrated_store()?;
        store.favorite_set(viewer_id)
    }

    /// Every group, ranked for the viewer and sorted by the original's title.
    ///
    /// # Errors
    /// Returns an error when the store cannot be read.
    pub fn browse(&self, input: BrowseRequest) -> Result<BrowseResult> {
        let store = self.open_migrated_store()?;
        let records = store.list_recipes()?;
        let favorites = viewer_favorites(&store, input.viewer.as_ref())?;

        let orphaned_recipe_ids = report_orphans(&records);
        let mut groups = group_by_original(&records)
            .into_iter()
            .filter_map(|group| {
                group_view(&group, &records, input.viewer.as_ref(), favorites.as_ref())
            })
            .collect::<Vec<_>>();
        groups.sort_by(|lhs, rhs| {
            lhs.title
                .to_lowercase()
                .cmp(&rhs.title.to_lowercase())
                .then_with(|| lhs.original_id.cmp(&rhs.original_id))
        });

        Ok(BrowseResult {
            viewer_id: input.viewer.map(|viewer| viewer.id),
            groups,
            orphaned_recipe_ids,
        })
    }

    /// The ranked group containing one recipe.
    ///
    /// # Errors
    /// Returns [`ApiError::NotFound`] when the recipe is unknown or belongs to no group.
    pub fn show_group(&self, input: ShowGroupRequest) -> Result<GroupView> {
        let store = self.open_migrated_store()?;
        let records = store.list_recipes()?;
        let favorites = viewer_favorites(&store, input.viewer.as_ref())?;

        group_by_original(&records)
            .iter()
            .find(|group| group.members.iter().any(|member| member.id == input.recipe_id))
            .and_then(|group| {
                group_view(group, &records, input.viewer.as_ref(), favorites.as_ref())
            })
            .ok_or_else(|| ApiError::NotFound(input.recipe_id).into())
    }
}

fn denied(action: Action, viewer: &Viewer) -> anyhow::Error {
    warn!(%action, viewer_id = %viewer.id, role = ?viewer.role, "permission denied");
    ApiError::PermissionDenied { action, viewer_id: viewer.id.clone() }.into()
}

fn validate_record(record: &RecipeRecord) -> Result<()> {
    record.validate().map_err(|err| ApiError::InvalidInput(err.to_string()).into())
}

fn load_recipe(store: &SqliteStore, recipe_id: &RecipeId) -> Result<RecipeRecord> {
    store.get_recipe(recipe_id)?.ok_or_else(|| ApiError::NotFound(recipe_id.clone()).into())
}

fn viewer_favorites(store: &SqliteStore, viewer: Option<&Viewer>) -> Result<Option<FavoriteSet>> {
    viewer.map(|viewer| store.favorite_set(&viewer.id)).transpose()
}

fn report_orphans(records: &[RecipeRecord]) -> Vec<RecipeId> {
    let orphans = find_orphans(records);
    for orphan in &orphans {
        warn!(
            recipe_id = %orphan.id,
            parent_id = ?orphan.parent_id,
            "recipe version has no original in the collection; left ungrouped"
        );
    }
    orphans.into_iter().map(|orphan| orphan.id.clone()).collect()
}

fn group_view(
    group: &RecipeGroup,
    records: &[RecipeRecord],
    viewer: Option<&Viewer>,
    favorites: Option<&FavoriteSet>,
) -> Option<GroupView> {
    let predicate = favorites.map(|favorites| favorites as &dyn FavoritePredicate);
    let members =
        rank_group_explained(&group.members, viewer.map(|viewer| &viewer.id), predicate, Some(records));
    let top = members.first()?;
    let display = group.members.iter().find(|member| member.id == top.recipe_id)?.clone();

    Some(GroupView {
        original_id: group.original.id.clone(),
        title: group.original.title.clone(),
        version_count: group.version_count,
        display_ordinal: top.ordinal.unwrap_or(0),
        capabilities: Capabilities::resolve(viewer, Some(&display)),
        display,
        members,
        tie_breakers: ranking_tie_breakers(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Duration;

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("recipe-box-api-{}.sqlite3", ulid::Ulid::new()))
    }

    fn fixture_time(offset_secs: i64) -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + Duration::seconds(1_700_000_000 + offset_secs)
    }

    fn expect_api_error(result: Result<impl std::fmt::Debug>) -> ApiError {
        let err = match result {
            Ok(value) => panic!("expected ApiError, got {value:?}"),
            Err(err) => err,
        };
        match err.downcast::<ApiError>() {
            Ok(api_error) => api_error,
            Err(other) => panic!("expected ApiError, got {other}"),
        }
    }

    struct Scenario {
        original: RecipeRecord,
        v1: RecipeRecord,
        v2: RecipeRecord,
    }

    // Original by u1, v1 by u2, v2 by u1; u1 favorites v1.
    fn seed_tier_scenario(api: &RecipeBoxApi) -> Result<Scenario> {
        let u1 = Viewer::new("u1", Role::Edit);
        let u2 = Viewer::new("u2", Role::Edit);

        let original = api.create_recipe(CreateRecipeRequest {
            viewer: u1.clone(),
            title: "Tomato soup".to_string(),
            details: RecipeDetails::default(),
            created_at: Some(fixture_time(0)),
        })?;
        let v1 = api.fork_recipe(ForkRecipeRequest {
            viewer: u2,
            parent_id: original.id.clone(),
            title: Some("Tomato soup, roasted".to_string()),
            details: None,
            created_at: Some(fixture_time(10)),
        })?;
        let v2 = api.fork_recipe(ForkRecipeRequest {
            viewer: u1.clone(),
            parent_id: original.id.clone(),
            title: None,
            details: None,
            created_at: Some(fixture_time(20)),
        })?;
        let toggled = api.toggle_favorite(RecipeRequest { viewer: u1, recipe_id: v1.id.clone() })?;
        assert!(toggled.favorite);

        Ok(Scenario { original, v1, v2 })
    }

    fn member_ids(view: &GroupView) -> Vec<RecipeId> {
        view.members.iter().map(|member| member.recipe_id.clone()).collect()
    }

    #[test]
    fn browse_ranks_favorite_then_owned_then_ordinal() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = RecipeBoxApi::new(db_path.clone());
        let scenario = seed_tier_scenario(&api)?;

        let result = api.browse(BrowseRequest { viewer: Some(Viewer::new("u1", Role::Edit)) })?;
        assert_eq!(result.groups.len(), 1);
        let view = &result.groups[0];
        assert_eq!(view.version_count, 3);
        assert_eq!(member_ids(view), vec![
            scenario.v1.id.clone(),
            scenario.original.id.clone(),
            scenario.v2.id.clone()
        ]);
        assert_eq!(view.display.id, scenario.v1.id);
        assert_eq!(view.display_ordinal, 1);
        assert!(!view.capabilities.can_edit);
        assert!(view.capabilities.can_create_version);
        assert!(!view.capabilities.can_delete);

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    #[test]
    fn anonymous_browse_orders_by_ordinal_only() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = RecipeBoxApi::new(db_path.clone());
        let scenario = seed_tier_scenario(&api)?;

        let result = api.browse(BrowseRequest::default())?;
        let view = &result.groups[0];
        assert_eq!(member_ids(view), vec![scenario.original.id, scenario.v1.id, scenario.v2.id]);
        assert_eq!(view.display_ordinal, 0);
        assert_eq!(view.capabilities, Capabilities::default());

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    #[test]
    fn forking_a_version_attaches_to_its_original() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = RecipeBoxApi::new(db_path.clone());
        let scenario = seed_tier_scenario(&api)?;

        let nested = api.fork_recipe(ForkRecipeRequest {
            viewer: Viewer::new("u3", Role::Admin),
            parent_id: scenario.v1.id.clone(),
            title: None,
            details: None,
            created_at: Some(fixture_time(30)),
        })?;
        assert_eq!(nested.parent_id, Some(scenario.original.id.clone()));
        assert_eq!(nested.title, scenario.v1.title);

        let view = api.show_group(ShowGroupRequest { viewer: None, recipe_id: nested.id.clone() })?;
        assert_eq!(view.original_id, scenario.original.id);
        assert_eq!(view.version_count, 4);

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    #[test]
    fn low_roles_cannot_create_or_fork() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = RecipeBoxApi::new(db_path.clone());
        let scenario = seed_tier_scenario(&api)?;

        let err = expect_api_error(api.create_recipe(CreateRecipeRequest {
            viewer: Viewer::new("u9", Role::Comment),
            title: "Nope".to_string(),
            details: RecipeDetails::default(),
            created_at: None,
        }));
        assert!(matches!(err, ApiError::PermissionDenied { action: Action::CreateRecipe, .. }));

        let err = expect_api_error(api.fork_recipe(ForkRecipeRequest {
            viewer: Viewer::new("u9", Role::Comment),
            parent_id: scenario.original.id,
            title: None,
            details: None,
            created_at: None,
        }));
        assert!(matches!(err, ApiError::PermissionDenied { action: Action::CreateVersion, .. }));

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    #[test]
    fn authors_edit_but_only_admins_delete() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = RecipeBoxApi::new(db_path.clone());
        let scenario = seed_tier_scenario(&api)?;

        let updated = api.update_recipe(UpdateRecipeRequest {
            viewer: Viewer::new("u2", Role::Read),
            recipe_id: scenario.v1.id.clone(),
            title: Some("Roasted tomato soup".to_string()),
            details: None,
        })?;
        assert_eq!(updated.title, "Roasted tomato soup");
        assert_eq!(updated.parent_id, Some(scenario.original.id.clone()));

        let err = expect_api_error(api.update_recipe(UpdateRecipeRequest {
            viewer: Viewer::new("u2", Role::Edit),
            recipe_id: scenario.original.id.clone(),
            title: Some("Hijacked".to_string()),
            details: None,
        }));
        assert!(matches!(err, ApiError::PermissionDenied { action: Action::Edit, .. }));

        let err = expect_api_error(api.delete_recipe(RecipeRequest {
            viewer: Viewer::new("u2", Role::Edit),
            recipe_id: scenario.v1.id.clone(),
        }));
        assert!(matches!(err, ApiError::PermissionDenied { action: Action::Delete, .. }));

        let deleted = api.delete_recipe(RecipeRequest {
            viewer: Viewer::new("boss", Role::Admin),
            recipe_id: scenario.original.id.clone(),
        })?;
        assert!(deleted.deleted);
        assert_eq!(deleted.orphaned_version_ids, vec![scenario.v1.id.clone(), scenario.v2.id.clone()]);

        let result = api.browse(BrowseRequest::default())?;
        assert!(result.groups.is_empty());
        assert_eq!(result.orphaned_recipe_ids, vec![scenario.v1.id, scenario.v2.id]);

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    #[test]
    fn unknown_recipes_report_not_found() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = RecipeBoxApi::new(db_path.clone());
        let missing = RecipeId::from("missing");

        let err = expect_api_error(api.toggle_favorite(RecipeRequest {
            viewer: Viewer::new("u1", Role::Read),
            recipe_id: missing.clone(),
        }));
        assert_eq!(err, ApiError::NotFound(missing.clone()));

        let err = expect_api_error(api.show_group(ShowGroupRequest {
            viewer: None,
            recipe_id: missing.clone(),
        }));
        assert_eq!(err, ApiError::NotFound(missing));

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    #[test]
    fn browse_sorts_groups_by_title_case_insensitively() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = RecipeBoxApi::new(db_path.clone());
        let cook = Viewer::new("cook", Role::Edit);
        for title in ["banana bread", "Apple pie", "carrot cake"] {
            api.create_recipe(CreateRecipeRequest {
                viewer: cook.clone(),
                title: title.to_string(),
                details: RecipeDetails::default(),
                created_at: None,
            })?;
        }

        let result = api.browse(BrowseRequest { viewer: Some(cook) })?;
        let titles = result.groups.iter().map(|group| group.title.as_str()).collect::<Vec<_>>();
        assert_eq!(titles, vec!["Apple pie", "banana bread", "carrot cake"]);
        assert!(result.groups.iter().all(|group| group.capabilities.can_edit));

        let favorites = api.list_favorites(&ViewerId::from("cook"))?;
        assert!(favorites.recipe_ids.is_empty());

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    #[test]
    fn blank_titles_are_invalid_input() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = RecipeBoxApi::new(db_path.clone());
        let cook = Viewer::new("cook", Role::Edit);

        let err = expect_api_error(api.create_recipe(CreateRecipeRequest {
            viewer: cook.clone(),
            title: "   ".to_string(),
            details: RecipeDetails::default(),
            created_at: None,
        }));
        assert!(matches!(err, ApiError::InvalidInput(_)));

        let record = api.create_recipe(CreateRecipeRequest {
            viewer: cook.clone(),
            title: "Flatbread".to_string(),
            details: RecipeDetails::default(),
            created_at: None,
        })?;
        let err = expect_api_error(api.update_recipe(UpdateRecipeRequest {
            viewer: cook,
            recipe_id: record.id,
            title: Some(String::new()),
            details: None,
        }));
        assert!(matches!(err, ApiError::InvalidInput(_)));

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    #[test]
    fn dry_run_migration_reports_pending_versions() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = RecipeBoxApi::new(db_path.clone());

        let planned = api.migrate(true)?;
        assert_eq!(planned.would_apply_versions, vec![1, 2]);
        assert_eq!(planned.after_version, None);

        let applied = api.migrate(false)?;
        assert_eq!(applied.after_version, Some(2));
        assert_eq!(applied.up_to_date, Some(true));

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }
}
