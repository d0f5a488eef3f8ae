//! crm-content - maintenance tool for routed content storage.
//!
//! Builds the content provider factory from a JSON configuration file and
//! exposes its operations on the command line: listing providers, storing
//! and fetching content, and running storage checks.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use crmcontent_common::{Principal, Reference, ResourceUri, TenantId};
use crmcontent_storage::{
    create_default_catalog, reader_stream, CancellationToken, ContentProviderFactory,
    StorageConfig,
};

#[derive(Parser)]
#[command(name = "crm-content")]
#[command(about = "Routed content storage maintenance")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Storage configuration file.
    #[arg(short, long, default_value = "storage.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List configured providers in routing order.
    Providers,

    /// Store a file through the router.
    Put {
        /// File to store.
        #[arg(short, long)]
        file: PathBuf,

        /// Content name (default: the file name).
        #[arg(short, long)]
        name: Option<String>,

        /// MIME type (default: guessed from the name).
        #[arg(short = 't', long)]
        content_type: Option<String>,

        /// Owning domain object, as kind@id.
        #[arg(short, long)]
        reference: Option<String>,

        /// Acting user.
        #[arg(short, long, default_value = "admin")]
        user: String,

        /// Tenant of the acting user.
        #[arg(long)]
        tenant: Option<i64>,
    },

    /// Write content to a file or stdout.
    Get {
        /// Resource URI.
        uri: String,

        /// Output file (default: stdout).
        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// Show metadata for a resource.
    Stat {
        /// Resource URI.
        uri: String,
    },

    /// Copy a resource within its provider.
    Cp {
        /// Source URI.
        from: String,

        /// Destination URI.
        to: String,
    },

    /// Delete a resource.
    Rm {
        /// Resource URI.
        uri: String,
    },

    /// Sum stored bytes across every provider.
    Check {
        /// Only count URIs containing this text.
        #[arg(short, long)]
        matching: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let factory = load_factory(&cli.config)?;

    match cli.command {
        Commands::Providers => cmd_providers(&factory),

        Commands::Put {
            file,
            name,
            content_type,
            reference,
            user,
            tenant,
        } => {
            cmd_put(
                &factory,
                &file,
                name,
                content_type,
                reference.as_deref(),
                user,
                tenant,
            )
            .await
        }

        Commands::Get { uri, out } => cmd_get(&factory, &uri, out.as_deref()).await,

        Commands::Stat { uri } => cmd_stat(&factory, &uri).await,

        Commands::Cp { from, to } => cmd_copy(&factory, &from, &to).await,

        Commands::Rm { uri } => cmd_remove(&factory, &uri).await,

        Commands::Check { matching } => cmd_check(&factory, matching.as_deref()).await,
    }
}

/// Build the factory from the configuration file.
fn load_factory(path: &Path) -> Result<ContentProviderFactory> {
    info!("Loading storage configuration from {}", path.display());
    let config = StorageConfig::load(path)
        .with_context(|| format!("Failed to read configuration {}", path.display()))?;

    let factory = ContentProviderFactory::new();
    factory
        .configure_from(&config, &create_default_catalog())
        .context("Invalid storage configuration")?;
    Ok(factory)
}

fn parse_uri(uri: &str) -> Result<ResourceUri> {
    ResourceUri::parse(uri).context("Invalid resource URI")
}

/// List providers.
fn cmd_providers(factory: &ContentProviderFactory) -> Result<()> {
    let providers = factory.providers()?;
    if providers.is_empty() {
        println!("No providers configured.");
        return Ok(());
    }
    for provider in providers {
        println!("  {:<20} {}://{}/", provider.name(), provider.scheme(), provider.name());
    }
    Ok(())
}

/// Store a file.
async fn cmd_put(
    factory: &ContentProviderFactory,
    file: &Path,
    name: Option<String>,
    content_type: Option<String>,
    reference: Option<&str>,
    user: String,
    tenant: Option<i64>,
) -> Result<()> {
    let name = match name {
        Some(name) => name,
        None => file
            .file_name()
            .and_then(|n| n.to_str())
            .map(String::from)
            .context("Cannot derive a content name from the file path; use --name")?,
    };
    let content_type = content_type.unwrap_or_else(|| {
        mime_guess::from_path(&name)
            .first_or_octet_stream()
            .essence_str()
            .to_string()
    });
    let reference = reference
        .map(Reference::parse)
        .transpose()
        .context("Invalid reference")?;
    let mut principal = Principal::new(user);
    if let Some(tenant) = tenant {
        principal = principal.with_tenant(TenantId(tenant));
    }

    let source = tokio::fs::File::open(file)
        .await
        .with_context(|| format!("Failed to open {}", file.display()))?;
    let length = source.metadata().await?.len();

    let provider = factory
        .provider_for_new_content(&name, length, reference.as_ref(), &principal)
        .context("No provider accepts this content")?;
    info!("Storing {} ({} bytes) in provider {}", name, length, provider.name());

    let metadata = provider
        .create(reader_stream(source), &content_type, &name, &principal)
        .await
        .context("Failed to store content")?;

    println!("{}", metadata.uri);
    Ok(())
}

/// Fetch content.
async fn cmd_get(factory: &ContentProviderFactory, uri: &str, out: Option<&Path>) -> Result<()> {
    let uri = parse_uri(uri)?;
    let provider = factory.provider_for_resource(&uri)?;

    let written = match out {
        Some(path) => {
            let mut file = tokio::fs::File::create(path)
                .await
                .with_context(|| format!("Failed to create {}", path.display()))?;
            let written = provider.read(&mut file, &uri).await?;
            file.sync_all().await?;
            written
        }
        None => {
            let mut stdout = tokio::io::stdout();
            let written = provider.read(&mut stdout, &uri).await?;
            stdout.flush().await?;
            written
        }
    };

    info!("Read {} bytes from {}", written, uri);
    Ok(())
}

/// Show metadata.
async fn cmd_stat(factory: &ContentProviderFactory, uri: &str) -> Result<()> {
    let uri = parse_uri(uri)?;
    let metadata = factory
        .provider_for_resource(&uri)?
        .metadata(&uri)
        .await
        .context("Failed to read metadata")?;

    println!("{}", serde_json::to_string_pretty(&metadata.to_map())?);
    Ok(())
}

/// Copy a resource.
async fn cmd_copy(factory: &ContentProviderFactory, from: &str, to: &str) -> Result<()> {
    let from = parse_uri(from)?;
    let to = parse_uri(to)?;
    let provider = factory.provider_for_resource(&from)?;

    if provider.copy(&from, &to).await? {
        println!("Copied {} to {}", from, to);
    } else {
        anyhow::bail!("Nothing copied: source missing or destination exists");
    }
    Ok(())
}

/// Delete a resource.
async fn cmd_remove(factory: &ContentProviderFactory, uri: &str) -> Result<()> {
    let uri = parse_uri(uri)?;
    let provider = factory.provider_for_resource(&uri)?;

    if provider.delete(&uri).await? {
        println!("Deleted {}", uri);
    } else {
        println!("Nothing to delete at {}", uri);
    }
    Ok(())
}

/// Run check across all providers.
async fn cmd_check(factory: &ContentProviderFactory, matching: Option<&str>) -> Result<()> {
    let cancel = CancellationToken::new();
    let ctrl_c = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        })
    };

    let mut objects = 0u64;
    let reports = factory
        .check_all(
            &mut |uri: &ResourceUri| {
                objects += 1;
                matching.map_or(true, |text| uri.as_str().contains(text))
            },
            &cancel,
        )
        .await;
    ctrl_c.abort();
    let reports = reports?;

    let mut total = 0u64;
    for report in &reports {
        println!("  {:<20} {:>14} bytes", report.provider, report.total);
        total += report.total;
    }
    println!("  {:<20} {:>14} bytes in {} objects", "total", total, objects);
    if cancel.is_cancelled() {
        println!("Check was interrupted; totals are partial.");
    }
    Ok(())
}
