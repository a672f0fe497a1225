//! Operator CLI for distributions and queue items.
use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use contentsync::app;
use contentsync::config;
use contentsync::connection::check_connection_map;
use contentsync::db;
use contentsync::destination::{DestinationKey, DestinationOverrides};
use contentsync::distributor::DistributionInput;
use contentsync::model::{BlogId, ConflictAction, ExportOptions, ImportAction, ItemStatus, PostId};
use contentsync::post::archive::{read_archive, write_archive};
use contentsync::post::{export_posts, get_posts_with_conflicts, ConflictDecisions, Importer, MediaSource};
use contentsync::store::{BlogSwitch, PostStore};
use indexmap::IndexMap;
use serde_json::json;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "syncctl", author, version, about = "Content sync operator CLI")]
struct Cli {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, clap::Args)]
struct DestinationArgs {
    /// Destination keys: a blog ID or `blog_id|https://remote.network`
    #[arg(long = "to", required = true)]
    destinations: Vec<String>,
    #[arg(long, value_parser = parse_import_action)]
    import_action: Option<ImportAction>,
    #[arg(long, value_parser = parse_conflict_action)]
    conflict_action: Option<ConflictAction>,
}

#[derive(Debug, clap::Args)]
struct ExportArgs {
    #[arg(long)]
    append_nested: bool,
    #[arg(long)]
    whole_posttype: bool,
    #[arg(long)]
    all_terms: bool,
    #[arg(long)]
    resolve_menus: bool,
    #[arg(long)]
    translations: bool,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Distribute a root post to destinations and to its existing copies
    Distribute {
        /// Blog the root post lives on (defaults to the main blog)
        #[arg(long)]
        blog: Option<BlogId>,
        post: PostId,
        #[command(flatten)]
        dest: DestinationArgs,
        #[command(flatten)]
        export: ExportArgs,
    },
    /// Distribute an arbitrary set of posts in chunks
    DistributePosts {
        #[arg(long)]
        blog: Option<BlogId>,
        #[arg(required = true)]
        posts: Vec<PostId>,
        #[command(flatten)]
        dest: DestinationArgs,
        #[command(flatten)]
        export: ExportArgs,
    },
    /// Reset an item to init and queue it again
    Reschedule { item: i64 },
    /// List distribution items, newest first
    Items {
        #[arg(long, value_parser = parse_item_status)]
        status: Option<ItemStatus>,
        #[arg(long, default_value = "50")]
        limit: i64,
    },
    /// Delete items past the retention period
    Sweep,
    /// Prune stale entries from a root post's connection map
    CheckConnections {
        #[arg(long)]
        blog: Option<BlogId>,
        root: PostId,
    },
    /// Write posts to a transport archive directory
    Export {
        #[arg(long)]
        blog: Option<BlogId>,
        #[arg(long)]
        out: PathBuf,
        #[arg(required = true)]
        posts: Vec<PostId>,
        #[command(flatten)]
        export: ExportArgs,
    },
    /// Import a transport archive into a blog
    Import {
        #[arg(long)]
        to: BlogId,
        #[arg(long)]
        archive: PathBuf,
        /// Leave the archive on disk after the import
        #[arg(long)]
        keep_archive: bool,
        #[arg(long, value_parser = parse_conflict_action)]
        conflict_action: Option<ConflictAction>,
    },
    /// Show which posts would collide on a destination blog
    Conflicts {
        #[arg(long)]
        from: Option<BlogId>,
        #[arg(long)]
        to: BlogId,
        #[arg(required = true)]
        posts: Vec<PostId>,
    },
}

fn parse_import_action(raw: &str) -> Result<ImportAction, String> {
    serde_json::from_value(json!(raw)).map_err(|_| format!("unknown import action '{raw}'"))
}

fn parse_conflict_action(raw: &str) -> Result<ConflictAction, String> {
    serde_json::from_value(json!(raw)).map_err(|_| format!("unknown conflict action '{raw}'"))
}

fn parse_item_status(raw: &str) -> Result<ItemStatus, String> {
    ItemStatus::parse_status(raw).ok_or_else(|| format!("unknown status '{raw}'"))
}

impl DestinationArgs {
    fn requests(&self) -> Result<IndexMap<String, DestinationOverrides>> {
        let overrides = DestinationOverrides {
            import_action: self.import_action,
            conflict_action: self.conflict_action,
            export_arguments: None,
        };
        let mut requests = IndexMap::new();
        for key in &self.destinations {
            key.parse::<DestinationKey>()?;
            requests.insert(key.clone(), overrides.clone());
        }
        Ok(requests)
    }
}

impl From<&ExportArgs> for ExportOptions {
    fn from(args: &ExportArgs) -> Self {
        ExportOptions {
            append_nested: args.append_nested,
            whole_posttype: args.whole_posttype,
            all_terms: args.all_terms,
            resolve_menus: args.resolve_menus,
            translations: args.translations,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let cli = Cli::parse();
    let cfg = config::load(Some(&cli.config))?;
    let app = app::build(&cfg).await?;
    let distributor = &app.distributor;
    let store: &dyn PostStore = app.store.as_ref();
    let main_blog = cfg.site.blog_id;

    match cli.command {
        Commands::Distribute {
            blog,
            post,
            dest,
            export,
        } => {
            let _switch = BlogSwitch::enter(store, blog.unwrap_or(main_blog));
            let items = distributor
                .distribute_root_post(post, &dest.requests()?, Some((&export).into()))
                .await?;
            print_json(&json!({ "items": items }))?;
        }
        Commands::DistributePosts {
            blog,
            posts,
            dest,
            export,
        } => {
            let _switch = BlogSwitch::enter(store, blog.unwrap_or(main_blog));
            let inputs: Vec<DistributionInput> = posts.into_iter().map(DistributionInput::from).collect();
            let items = distributor
                .distribute_posts(&inputs, &dest.requests()?, &(&export).into())
                .await?;
            print_json(&json!({ "items": items }))?;
        }
        Commands::Reschedule { item } => {
            distributor.reschedule_item(item).await?;
            print_json(&json!({ "rescheduled": item }))?;
        }
        Commands::Items { status, limit } => {
            let items = db::list_items(&app.pool, status, limit).await?;
            let rows: Vec<_> = items
                .iter()
                .map(|item| {
                    json!({
                        "ID": item.id,
                        "status": item.status,
                        "destination": item.destination.key(),
                        "posts": item.posts.keys().collect::<Vec<_>>(),
                        "origin": item.origin,
                        "error": item.error,
                        "time": item.time.to_string(),
                    })
                })
                .collect();
            print_json(&json!(rows))?;
        }
        Commands::Sweep => {
            let removed = distributor.sweep().await?;
            print_json(&json!({ "removed": removed }))?;
        }
        Commands::CheckConnections { blog, root } => {
            let _switch = BlogSwitch::enter(store, blog.unwrap_or(main_blog));
            let pruned = check_connection_map(store, root).await?;
            let pruned: Vec<String> = pruned.iter().map(|t| format!("{t:?}")).collect();
            print_json(&json!({ "pruned": pruned }))?;
        }
        Commands::Export {
            blog,
            out,
            posts,
            export,
        } => {
            let _switch = BlogSwitch::enter(store, blog.unwrap_or(main_blog));
            let prepared = export_posts(store, distributor.translations(), &posts, (&export).into()).await?;
            write_archive(&out, &prepared).await?;
            print_json(&json!({ "archive": out, "posts": prepared.keys().collect::<Vec<_>>() }))?;
        }
        Commands::Import {
            to,
            archive,
            keep_archive,
            conflict_action,
        } => {
            if !store.blog_exists(to).await? {
                return Err(anyhow!("blog {} does not exist", to));
            }
            let mut posts = read_archive(&archive).await?;
            if conflict_action.is_some() {
                for post in posts.values_mut() {
                    post.conflict_action = conflict_action;
                }
            }
            let _switch = BlogSwitch::enter(store, to);
            let table = Importer::new(store, distributor.translations(), distributor.hooks())
                .with_media(MediaSource::Archive {
                    dir: archive,
                    cleanup: !keep_archive,
                })
                .import_posts(&posts, &ConflictDecisions::new())
                .await?;
            print_json(&json!(table.into_map()))?;
        }
        Commands::Conflicts { from, to, posts } => {
            if !store.blog_exists(to).await? {
                return Err(anyhow!("blog {} does not exist", to));
            }
            let prepared = {
                let _switch = BlogSwitch::enter(store, from.unwrap_or(main_blog));
                export_posts(store, distributor.translations(), &posts, ExportOptions::default()).await?
            };
            let _switch = BlogSwitch::enter(store, to);
            let checked = get_posts_with_conflicts(store, distributor.hooks().conflicts.as_ref(), prepared).await?;
            let conflicts: IndexMap<PostId, _> = checked
                .iter()
                .filter_map(|(id, post)| post.existing_post.as_ref().map(|existing| (*id, existing)))
                .collect();
            print_json(&json!(conflicts))?;
        }
    }
    Ok(())
}

fn print_json(value: &serde_json::Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
