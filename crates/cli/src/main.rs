use anyhow::{bail, Context, Result};
use chrono::TimeZone;
use clap::{Parser, Subcommand};
use collaboration::{
    AuthBackend, Config, Credentials, Dashboard, DocumentClient, DocumentId, DocumentPhase,
    DocumentSummary, EditorSession, RemoteClient, Role, SaveStatus,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

mod session;

use session::SavedSession;

#[derive(Parser)]
#[command(name = "collab")]
#[command(about = "Collaborative document editor - command line client")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (defaults to ~/.config/collab/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Server URL, overriding the config
    #[arg(long, global = true)]
    server: Option<String>,

    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Create an account and sign in
    Signup {
        email: String,

        #[arg(short, long)]
        password: String,
    },

    /// Sign in to an existing account
    Login {
        email: String,

        #[arg(short, long)]
        password: String,
    },

    /// Forget the saved session
    Logout,

    /// Show the signed-in user
    Whoami,

    /// List owned and shared documents, most recent first
    List,

    /// Create a new document
    New {
        /// Document title
        #[arg(default_value = "")]
        title: String,
    },

    /// Print a document
    Show { id: DocumentId },

    /// Change a document's title or content
    Edit {
        id: DocumentId,

        #[arg(long)]
        title: Option<String>,

        /// Replace the content
        #[arg(long, conflicts_with = "append")]
        content: Option<String>,

        /// Append a line to the content
        #[arg(long)]
        append: Option<String>,
    },

    /// Give someone access to a document
    Share {
        id: DocumentId,
        email: String,

        /// viewer or editor
        #[arg(long, default_value = "viewer")]
        role: Role,
    },

    /// Remove someone's access to a document
    Revoke { id: DocumentId, email: String },

    /// Delete a document
    Delete { id: DocumentId },

    /// Follow live changes to a document, or to the listing when no id is given
    Watch { id: Option<DocumentId> },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::WARN
    };

    tracing_subscriber::fmt().with_max_level(level).init();

    let mut config = Config::load_from(cli.config).context("failed to load configuration")?;
    if let Some(server) = cli.server {
        config.client.server_url = server;
    }

    match cli.command {
        Commands::Signup { email, password } => {
            sign_in_command(&config, Credentials::new(email, password), true).await
        }
        Commands::Login { email, password } => {
            sign_in_command(&config, Credentials::new(email, password), false).await
        }
        Commands::Logout => logout_command(&config).await,
        Commands::Whoami => whoami_command(&config).await,
        Commands::List => list_command(&config).await,
        Commands::New { title } => new_command(&config, title).await,
        Commands::Show { id } => show_command(&config, id).await,
        Commands::Edit {
            id,
            title,
            content,
            append,
        } => edit_command(&config, id, title, content, append).await,
        Commands::Share { id, email, role } => share_command(&config, id, email, role).await,
        Commands::Revoke { id, email } => revoke_command(&config, id, email).await,
        Commands::Delete { id } => delete_command(&config, id).await,
        Commands::Watch { id } => watch_command(&config, id).await,
    }
}

/// Connect and resume the saved session
async fn connect(config: &Config) -> Result<RemoteClient> {
    let path = config.session_file();
    let Some(saved) = SavedSession::load(&path)? else {
        bail!("not signed in; run `collab login <email>` first");
    };

    let client = RemoteClient::connect(&saved.server_url).await?;
    if let Err(e) = client.resume(saved.token).await {
        debug!("Resume failed: {}", e);
        SavedSession::clear(&path)?;
        client.close();
        bail!("session expired; run `collab login <email>` again");
    }
    Ok(client)
}

fn format_time(millis: i64) -> String {
    chrono::Utc
        .timestamp_millis_opt(millis)
        .single()
        .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "-".to_string())
}

fn print_summary(summary: &DocumentSummary) {
    println!(
        "{}  {:<6}  {}  {}",
        summary.id,
        summary.role.as_str(),
        format_time(summary.updated_at),
        summary.title
    );
    println!("    {}", summary.preview);
}

async fn sign_in_command(config: &Config, credentials: Credentials, create: bool) -> Result<()> {
    let url = &config.client.server_url;
    let client = RemoteClient::connect(url).await?;
    client.mark_signed_out();
    let signed_in = if create {
        client.sign_up(credentials).await?
    } else {
        client.sign_in(credentials).await?
    };

    SavedSession::new(url, &signed_in).save(&config.session_file())?;
    info!("Saved session to {}", config.session_file().display());
    println!("Signed in as {}", signed_in.identity.email);
    client.close();
    Ok(())
}

async fn logout_command(config: &Config) -> Result<()> {
    let path = config.session_file();
    if let Ok(client) = connect(config).await {
        client.sign_out().await?;
        client.close();
    }
    SavedSession::clear(&path)?;
    println!("Signed out");
    Ok(())
}

async fn whoami_command(config: &Config) -> Result<()> {
    let client = connect(config).await?;
    let identity = client.current_user()?;
    println!("{} ({})", identity.email, identity.uid);
    client.close();
    Ok(())
}

async fn list_command(config: &Config) -> Result<()> {
    let client = connect(config).await?;
    let summaries = Dashboard::list(&client, &config.dashboard).await?;
    if summaries.is_empty() {
        println!("No documents yet. Create one with `collab new <title>`.");
    }
    for summary in &summaries {
        print_summary(summary);
    }
    client.close();
    Ok(())
}

async fn new_command(config: &Config, title: String) -> Result<()> {
    let client = connect(config).await?;
    let doc = client.create_document(&title).await?;
    println!("{}  {}", doc.id, doc.display_title());
    client.close();
    Ok(())
}

async fn show_command(config: &Config, id: DocumentId) -> Result<()> {
    let client = connect(config).await?;
    let Some(doc) = client.get_document(id).await? else {
        bail!("document {id} not found");
    };
    println!("# {}", doc.display_title());
    println!("updated {}", format_time(doc.updated_at));
    if !doc.collaborators.is_empty() {
        let people: Vec<String> = doc
            .collaborators
            .iter()
            .map(|(email, role)| format!("{email} ({role})"))
            .collect();
        println!("shared with {}", people.join(", "));
    }
    println!();
    println!("{}", doc.content);
    client.close();
    Ok(())
}

async fn edit_command(
    config: &Config,
    id: DocumentId,
    title: Option<String>,
    content: Option<String>,
    append: Option<String>,
) -> Result<()> {
    if title.is_none() && content.is_none() && append.is_none() {
        bail!("nothing to change; pass --title, --content or --append");
    }

    let client = connect(config).await?;
    let editor = EditorSession::open(Arc::new(client.clone()), id, &config.editor).await?;

    if let Some(title) = title {
        editor.edit_title(title)?;
    }
    if let Some(content) = content {
        editor.edit_content(content)?;
    }
    if let Some(line) = append {
        let mut text = editor.view().content;
        if !text.is_empty() && !text.ends_with('\n') {
            text.push('\n');
        }
        text.push_str(&line);
        editor.edit_content(text)?;
    }

    editor.flush().await;
    let status = editor.view().status;
    editor.close().await;
    client.close();

    if let SaveStatus::Error(message) = status {
        bail!(message);
    }
    println!("Saved");
    Ok(())
}

async fn share_command(config: &Config, id: DocumentId, email: String, role: Role) -> Result<()> {
    let client = connect(config).await?;
    let editor = EditorSession::open(Arc::new(client.clone()), id, &config.editor).await?;
    let message = editor.share(&email, role).await?;
    println!("{message}");
    editor.close().await;
    client.close();
    Ok(())
}

async fn revoke_command(config: &Config, id: DocumentId, email: String) -> Result<()> {
    let client = connect(config).await?;
    let editor = EditorSession::open(Arc::new(client.clone()), id, &config.editor).await?;
    let message = editor.revoke(&email).await?;
    println!("{message}");
    editor.close().await;
    client.close();
    Ok(())
}

async fn delete_command(config: &Config, id: DocumentId) -> Result<()> {
    let client = connect(config).await?;
    client.delete_document(id).await?;
    println!("Deleted {id}");
    client.close();
    Ok(())
}

async fn watch_command(config: &Config, id: Option<DocumentId>) -> Result<()> {
    let client = connect(config).await?;
    match id {
        Some(id) => watch_document(config, &client, id).await?,
        None => watch_listing(config, &client).await?,
    }
    client.close();
    Ok(())
}

async fn watch_document(config: &Config, client: &RemoteClient, id: DocumentId) -> Result<()> {
    let editor = EditorSession::open(Arc::new(client.clone()), id, &config.editor).await?;
    let mut updates = editor.subscribe();

    loop {
        let view = updates.borrow_and_update().clone();
        println!("--- {} ({})", view.display_title(), format_time(view.updated_at));
        println!("{}", view.content);

        match view.phase {
            DocumentPhase::Open => {}
            DocumentPhase::Deleted => {
                println!("Document was deleted");
                break;
            }
            DocumentPhase::AccessLost => {
                println!("Your access to this document was removed");
                break;
            }
        }

        tokio::select! {
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    editor.close().await;
    Ok(())
}

async fn watch_listing(config: &Config, client: &RemoteClient) -> Result<()> {
    let dashboard = Dashboard::open(Arc::new(client.clone()), &config.dashboard).await?;
    let mut updates = dashboard.subscribe();

    loop {
        let view = updates.borrow_and_update().clone();
        if !view.loading {
            println!("--- {} documents", view.recent().len());
            for summary in view.recent() {
                print_summary(&summary);
            }
        }

        tokio::select! {
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    Ok(())
}
