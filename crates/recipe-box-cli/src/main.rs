use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use recipe_box_api::{
    BrowseRequest, CreateRecipeRequest, ForkRecipeRequest, RecipeBoxApi, RecipeRequest,
    ShowGroupRequest, UpdateRecipeRequest, API_CONTRACT_VERSION,
};
use recipe_box_core::{parse_created_at, RecipeDetails, RecipeId, Role, Viewer, ViewerId};
use serde_json::Value;
use time::OffsetDateTime;
use tracing::debug;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "rb")]
#[command(about = "Recipe Box CLI")]
struct Cli {
    #[arg(long, env = "RECIPE_BOX_DB", default_value = "./recipe_box.sqlite3")]
    db: PathBuf,

    /// Log filter directives, e.g. `debug` or `recipe_box_api=info`.
    #[arg(long, env = "RECIPE_BOX_LOG")]
    log: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    Recipe {
        #[command(subcommand)]
        command: Box<RecipeCommand>,
    },
    Favorite {
        #[command(subcommand)]
        command: FavoriteCommand,
    },
    Browse(BrowseArgs),
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    IntegrityCheck,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct ViewerArgs {
    #[arg(long)]
    viewer_id: String,
    /// One of guest, read, comment, edit, admin. Anything else grants nothing.
    #[arg(long)]
    role: Option<String>,
}

#[derive(Debug, Args)]
struct OptionalViewerArgs {
    #[arg(long)]
    viewer_id: Option<String>,
    #[arg(long, requires = "viewer_id")]
    role: Option<String>,
}

#[derive(Debug, Args)]
struct DetailsArgs {
    #[arg(long)]
    description: Option<String>,
    #[arg(long = "ingredient")]
    ingredients: Vec<String>,
    #[arg(long = "step")]
    steps: Vec<String>,
    #[arg(long = "tag")]
    tags: Vec<String>,
    #[arg(long)]
    source_url: Option<String>,
}

#[derive(Debug, Subcommand)]
enum RecipeCommand {
    Add(RecipeAddArgs),
    Fork(RecipeForkArgs),
    Update(RecipeUpdateArgs),
    Delete(RecipeIdArgs),
    List,
}

#[derive(Debug, Args)]
struct RecipeAddArgs {
    #[command(flatten)]
    viewer: ViewerArgs,
    #[arg(long)]
    title: String,
    #[command(flatten)]
    details: DetailsArgs,
    #[arg(long)]
    created_at: Option<String>,
}

#[derive(Debug, Args)]
struct RecipeForkArgs {
    #[command(flatten)]
    viewer: ViewerArgs,
    #[arg(long)]
    parent_id: String,
    #[arg(long)]
    title: Option<String>,
    #[command(flatten)]
    details: DetailsArgs,
    #[arg(long)]
    created_at: Option<String>,
}

#[derive(Debug, Args)]
struct RecipeUpdateArgs {
    #[command(flatten)]
    viewer: ViewerArgs,
    #[arg(long)]
    recipe_id: String,
    #[arg(long)]
    title: Option<String>,
    #[command(flatten)]
    details: DetailsArgs,
}

#[derive(Debug, Args)]
struct RecipeIdArgs {
    #[command(flatten)]
    viewer: ViewerArgs,
    #[arg(long)]
    recipe_id: String,
}

#[derive(Debug, Subcommand)]
enum FavoriteCommand {
    Toggle(RecipeIdArgs),
    List(FavoriteListArgs),
}

#[derive(Debug, Args)]
struct FavoriteListArgs {
    #[arg(long)]
    viewer_id: String,
}

#[derive(Debug, Args)]
struct BrowseArgs {
    #[command(flatten)]
    viewer: OptionalViewerArgs,
    /// Show only the group containing this recipe.
    #[arg(long)]
    recipe_id: Option<String>,
}

impl ViewerArgs {
    fn to_viewer(&self) -> Viewer {
        Viewer { id: ViewerId(self.viewer_id.clone()), role: parse_role(self.role.as_deref()) }
    }
}

impl OptionalViewerArgs {
    fn to_viewer(&self) -> Option<Viewer> {
        self.viewer_id.as_ref().map(|viewer_id| Viewer {
            id: ViewerId(viewer_id.clone()),
            role: parse_role(self.role.as_deref()),
        })
    }
}

impl DetailsArgs {
    fn is_empty(&self) -> bool {
        self.description.is_none()
            && self.ingredients.is_empty()
            && self.steps.is_empty()
            && self.tags.is_empty()
            && self.source_url.is_none()
    }

    fn into_details(self) -> RecipeDetails {
        RecipeDetails {
            description: self.description,
            ingredients: self.ingredients,
            steps: self.steps,
            tags: self.tags,
            source_url: self.source_url,
        }
    }

    fn into_optional_details(self) -> Option<RecipeDetails> {
        if self.is_empty() {
            None
        } else {
            Some(self.into_details())
        }
    }
}

fn parse_role(raw: Option<&str>) -> Option<Role> {
    let role = raw.and_then(Role::parse);
    if role.is_none() {
        debug!(role = ?raw, "viewer has no recognised role");
    }
    role
}

fn parse_rfc3339(raw: Option<&str>) -> Result<Option<OffsetDateTime>> {
    raw.map(|value| {
        parse_created_at(value).ok_or_else(|| anyhow!("invalid RFC3339 timestamp: {value}"))
    })
    .transpose()
}

fn install_tracing(directives: Option<&str>) {
    let filter = directives.map_or_else(
        || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        EnvFilter::new,
    );
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn emit<T: serde::Serialize>(value: &T) -> Result<()> {
    emit_json(serde_json::to_value(value).context("failed to serialize command output")?)
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    install_tracing(cli.log.as_deref());

    let api = RecipeBoxApi::new(cli.db);
    match cli.command {
        Command::Db { command } => run_db(command, &api),
        Command::Recipe { command } => run_recipe(*command, &api),
        Command::Favorite { command } => run_favorite(command, &api),
        Command::Browse(args) => run_browse(&args, &api),
    }
}

fn run_db(command: DbCommand, api: &RecipeBoxApi) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = api.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty(),
                "api_contract_version": API_CONTRACT_VERSION
            }))
        }
        DbCommand::Migrate(args) => emit(&api.migrate(args.dry_run)?),
        DbCommand::IntegrityCheck => emit(&api.integrity_check()?),
    }
}

fn run_recipe(command: RecipeCommand, api: &RecipeBoxApi) -> Result<()> {
    match command {
        RecipeCommand::Add(args) => {
            let created_at = parse_rfc3339(args.created_at.as_deref())?;
            let record = api.create_recipe(CreateRecipeRequest {
                viewer: args.viewer.to_viewer(),
                title: args.title,
                details: args.details.into_details(),
                created_at,
            })?;
            emit(&record)
        }
        RecipeCommand::Fork(args) => {
            let created_at = parse_rfc3339(args.created_at.as_deref())?;
            let record = api.fork_recipe(ForkRecipeRequest {
                viewer: args.viewer.to_viewer(),
                parent_id: RecipeId(args.parent_id),
                title: args.title,
                details: args.details.into_optional_details(),
                created_at,
            })?;
            emit(&record)
        }
        RecipeCommand::Update(args) => {
            let record = api.update_recipe(UpdateRecipeRequest {
                viewer: args.viewer.to_viewer(),
                recipe_id: RecipeId(args.recipe_id),
                title: args.title,
                details: args.details.into_optional_details(),
            })?;
            emit(&record)
        }
        RecipeCommand::Delete(args) => emit(&api.delete_recipe(RecipeRequest {
            viewer: args.viewer.to_viewer(),
            recipe_id: RecipeId(args.recipe_id),
        })?),
        RecipeCommand::List => {
            let browse = api.browse(BrowseRequest::default())?;
            let recipes = browse
                .groups
                .into_iter()
                .flat_map(|group| {
                    let original_id = group.original_id;
                    group.members.into_iter().map(move |member| {
                        serde_json::json!({
                            "recipe_id": member.recipe_id,
                            "original_id": original_id,
                            "author_id": member.author_id,
                            "version_ordinal": member.ordinal,
                        })
                    })
                })
                .collect::<Vec<_>>();
            emit_json(serde_json::json!({
                "recipes": recipes,
                "orphaned_recipe_ids": browse.orphaned_recipe_ids
            }))
        }
    }
}

fn run_favorite(command: FavoriteCommand, api: &RecipeBoxApi) -> Result<()> {
    match command {
        FavoriteCommand::Toggle(args) => emit(&api.toggle_favorite(RecipeRequest {
            viewer: args.viewer.to_viewer(),
            recipe_id: RecipeId(args.recipe_id),
        })?),
        FavoriteCommand::List(args) => emit(&api.list_favorites(&ViewerId(args.viewer_id))?),
    }
}

fn run_browse(args: &BrowseArgs, api: &RecipeBoxApi) -> Result<()> {
    let viewer = args.viewer.to_viewer();
    match &args.recipe_id {
        Some(recipe_id) => emit(&api.show_group(ShowGroupRequest {
            viewer,
            recipe_id: RecipeId(recipe_id.clone()),
        })?),
        None => emit(&api.browse(BrowseRequest { viewer })?),
    }
}
