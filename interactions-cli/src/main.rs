//! Terminal client for the social backend: browses the feed and drives the
//! optimistic vote/save flow end to end.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context as _;
use clap::{Parser, Subcommand, ValueEnum};
use envconfig::Envconfig;
use tracing::warn;

use interactions::client::{ApiClient, HttpApiClient};
use interactions::config::Config;
use interactions::dispatcher::{DisplayState, EntityInteractions, InteractionError};
use interactions::entity::{Comment, EntityKind, Post};
use interactions::reconciler::VoteValue;
use interactions::session::Session;
use interactions::store::{FileStorage, OverrideStore, StorageBackend};

#[derive(Parser)]
#[command(name = "interactions-cli", about = "Vote on and save posts and comments")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List the post feed with reconciled scores.
    Feed {
        #[arg(long, default_value = "new")]
        sort: String,
    },
    /// Show one post and its comments.
    Show { id: i64 },
    /// Upvote a post or comment.
    Upvote { kind: KindArg, id: i64 },
    /// Downvote a post or comment.
    Downvote { kind: KindArg, id: i64 },
    /// Save a post or comment.
    Save { kind: KindArg, id: i64 },
    /// Unsave a post or comment.
    Unsave { kind: KindArg, id: i64 },
    /// Print the signed-in viewer.
    Whoami,
}

#[derive(Clone, Copy, ValueEnum)]
enum KindArg {
    Post,
    Comment,
}

impl From<KindArg> for EntityKind {
    fn from(kind: KindArg) -> EntityKind {
        match kind {
            KindArg::Post => EntityKind::Post,
            KindArg::Comment => EntityKind::Comment,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let subscriber = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(tracing::Level::WARN.into())
                .from_env_lossy(),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("failed to set tracing subscriber");

    let cli = Cli::parse();
    let config = Config::init_from_env().expect("invalid configuration");

    match run(cli, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            let mut chain = e.chain().skip(1).peekable();
            if chain.peek().is_some() {
                eprintln!("caused by:");
                for (index, err) in chain.enumerate() {
                    eprintln!("    {index}: {err}");
                }
            }
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli, config: Config) -> anyhow::Result<()> {
    let storage: Arc<dyn StorageBackend> = Arc::new(
        FileStorage::open(config.storage_path.clone()).context("failed to open override storage")?,
    );
    let api: Arc<dyn ApiClient> =
        Arc::new(HttpApiClient::new(&config).context("failed to build api client")?);
    let overrides = OverrideStore::new(storage.clone());

    let mut session = Session::new(api.clone(), storage);
    match &config.api_key {
        Some(key) => {
            session.login(key).await.context("sign-in failed")?;
        }
        None => {
            // Fall back to a credential persisted by an earlier run; a stale
            // one just leaves us browsing signed out.
            if let Err(e) = session.resume().await {
                warn!("stored credential rejected: {e}");
            }
        }
    }

    match cli.command {
        Command::Feed { sort } => feed(&api, &overrides, &session, &sort).await,
        Command::Show { id } => show(&api, &overrides, &session, id).await,
        Command::Upvote { kind, id } => {
            act(&api, &overrides, &session, kind.into(), id, Action::Upvote).await
        }
        Command::Downvote { kind, id } => {
            act(&api, &overrides, &session, kind.into(), id, Action::Downvote).await
        }
        Command::Save { kind, id } => {
            act(&api, &overrides, &session, kind.into(), id, Action::Save).await
        }
        Command::Unsave { kind, id } => {
            act(&api, &overrides, &session, kind.into(), id, Action::Unsave).await
        }
        Command::Whoami => {
            match session.viewer() {
                Some(viewer) => println!("{} (id {})", viewer.username, viewer.id),
                None => println!("signed out"),
            }
            Ok(())
        }
    }
}

async fn feed(
    api: &Arc<dyn ApiClient>,
    overrides: &OverrideStore,
    session: &Session,
    sort: &str,
) -> anyhow::Result<()> {
    let posts = api.posts(sort).await.context("failed to fetch posts")?;
    if posts.is_empty() {
        println!("no posts");
        return Ok(());
    }
    for post in &posts {
        let interactions = EntityInteractions::for_post(
            api.clone(),
            overrides.clone(),
            session.viewer_id(),
            post,
        );
        println!("{}", render_post(&interactions.snapshot(), post));
    }
    Ok(())
}

async fn show(
    api: &Arc<dyn ApiClient>,
    overrides: &OverrideStore,
    session: &Session,
    id: i64,
) -> anyhow::Result<()> {
    let post = api.post(id).await.context("failed to fetch post")?;
    let interactions = EntityInteractions::for_post(
        api.clone(),
        overrides.clone(),
        session.viewer_id(),
        &post,
    );
    println!("{}", render_post(&interactions.snapshot(), &post));

    let comments = api
        .post_comments(id, "top")
        .await
        .context("failed to fetch comments")?;
    for comment in &comments {
        let interactions = EntityInteractions::for_comment(
            api.clone(),
            overrides.clone(),
            session.viewer_id(),
            comment,
        );
        println!("  {}", render_comment(&interactions.snapshot(), comment));
    }
    Ok(())
}

enum Action {
    Upvote,
    Downvote,
    Save,
    Unsave,
}

async fn act(
    api: &Arc<dyn ApiClient>,
    overrides: &OverrideStore,
    session: &Session,
    kind: EntityKind,
    id: i64,
    action: Action,
) -> anyhow::Result<()> {
    if session.viewer().is_none() {
        anyhow::bail!("sign in to vote or save (set API_KEY)");
    }

    let interactions = match kind {
        EntityKind::Post => {
            let post = api.post(id).await.context("failed to fetch post")?;
            EntityInteractions::for_post(api.clone(), overrides.clone(), session.viewer_id(), &post)
        }
        EntityKind::Comment => {
            let comment = api.comment(id).await.context("failed to fetch comment")?;
            EntityInteractions::for_comment(
                api.clone(),
                overrides.clone(),
                session.viewer_id(),
                &comment,
            )
        }
    };

    let result = match action {
        Action::Upvote => interactions.upvote().await,
        Action::Downvote => interactions.downvote().await,
        Action::Save | Action::Unsave => {
            let wanted = matches!(action, Action::Save);
            if interactions.displayed_saved() == wanted {
                println!(
                    "{} is already {}",
                    interactions.entity(),
                    if wanted { "saved" } else { "unsaved" }
                );
                return Ok(());
            }
            interactions.toggle_save().await
        }
    };

    match result {
        Ok(state) => {
            println!(
                "{}: score {} vote {} {}",
                interactions.entity(),
                state.score,
                vote_marker(state.vote),
                if state.saved { "[saved]" } else { "" }
            );
            Ok(())
        }
        Err(error @ InteractionError::Api(_)) => {
            let state = interactions.snapshot();
            eprintln!(
                "action failed, reverted to score {} vote {}",
                state.score,
                vote_marker(state.vote)
            );
            Err(error.into())
        }
        Err(error) => Err(error.into()),
    }
}

fn render_post(state: &DisplayState, post: &Post) -> String {
    let author = post
        .user
        .as_ref()
        .map(|u| u.username.as_str())
        .unwrap_or("unknown");
    let community = post.community_name.as_deref().unwrap_or("-");
    format!(
        "{:>5} {} {} | {} | by {} in {} | {} comments [post {}]",
        state.score,
        vote_marker(state.vote),
        if state.saved { "*" } else { " " },
        post.title,
        author,
        community,
        post.comments_count,
        post.id
    )
}

fn render_comment(state: &DisplayState, comment: &Comment) -> String {
    let author = comment
        .user
        .as_ref()
        .map(|u| u.username.as_str())
        .unwrap_or("unknown");
    format!(
        "{:>4} {} {} | {} by {} [comment {}]",
        state.score,
        vote_marker(state.vote),
        if state.saved { "*" } else { " " },
        comment.content,
        author,
        comment.id
    )
}

fn vote_marker(vote: VoteValue) -> &'static str {
    match vote {
        VoteValue::Up => "^",
        VoteValue::Down => "v",
        VoteValue::None => "-",
    }
}
