use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use rollcall_core::{
    Identity, IdentityFields, IdentityPatch, RecognitionLogRecord, RecognitionReport,
};
use std::path::{Path, PathBuf};
use std::time::Duration;

mod output;

// `#[zbus::proxy]` generates `GalleryProxy` for the daemon's interface.
#[zbus::proxy(
    interface = "org.rollcall.Gallery1",
    default_service = "org.rollcall.Gallery1",
    default_path = "/org/rollcall/Gallery1"
)]
trait Gallery {
    async fn recognize(&self, image_path: &str) -> zbus::Result<String>;
    async fn enroll(&self, image_path: &str, fields_json: &str) -> zbus::Result<String>;
    async fn update_identity(&self, id: i64, patch_json: &str) -> zbus::Result<String>;
    async fn remove_identity(&self, id: i64) -> zbus::Result<bool>;
    async fn list_identities(&self) -> zbus::Result<String>;
    async fn recognition_logs(&self, limit: u32) -> zbus::Result<String>;
    async fn reload(&self) -> zbus::Result<u32>;
    async fn status(&self) -> zbus::Result<String>;
}

/// Face extraction can take a while on large photos with the CNN detector.
const METHOD_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Parser)]
#[command(name = "rollcall", about = "Rollcall face registry CLI")]
struct Cli {
    /// Talk to the daemon on the system bus instead of the session bus
    #[arg(long, global = true)]
    system: bool,

    /// Print raw JSON replies
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug, Default)]
struct PersonArgs {
    #[arg(long)]
    age: Option<u32>,
    #[arg(long)]
    gender: Option<String>,
    #[arg(long)]
    phone: Option<String>,
    #[arg(long)]
    email: Option<String>,
    #[arg(long)]
    address: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll a person from a photo containing exactly one face
    Enroll {
        /// Photo of the person
        image: PathBuf,
        /// Display name
        #[arg(short, long)]
        name: String,
        #[command(flatten)]
        person: PersonArgs,
    },
    /// Identify every face in a photo
    Recognize {
        image: PathBuf,
        /// Write a copy of the photo with face boxes drawn (green = known, red = unknown)
        #[arg(long, value_name = "OUT")]
        annotate: Option<PathBuf>,
    },
    /// List enrolled identities
    List,
    /// Update fields of an enrolled identity
    Update {
        /// Identity ID
        id: i64,
        #[arg(short, long)]
        name: Option<String>,
        #[command(flatten)]
        person: PersonArgs,
    },
    /// Remove an identity and its face embeddings
    Remove {
        /// Identity ID
        id: i64,
    },
    /// Show recent recognition attempts
    Logs {
        #[arg(short, long, default_value_t = 50)]
        limit: u32,
    },
    /// Reload the gallery from the database
    Reload,
    /// Show daemon status
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let proxy = connect(cli.system).await?;

    match cli.command {
        Commands::Enroll { image, name, person } => {
            let image = absolute(&image)?;
            let fields = IdentityFields {
                name,
                age: person.age,
                gender: person.gender,
                phone: person.phone,
                email: person.email,
                address: person.address,
            };
            let reply = proxy
                .enroll(&path_arg(&image)?, &serde_json::to_string(&fields)?)
                .await?;
            if cli.json {
                println!("{reply}");
            } else {
                let identity: Identity = serde_json::from_str(&reply)?;
                println!("Enrolled {} with id {}", identity.name, identity.id);
            }
        }
        Commands::Recognize { image, annotate } => {
            let image = absolute(&image)?;
            let reply = proxy.recognize(&path_arg(&image)?).await?;
            let report: RecognitionReport = serde_json::from_str(&reply)?;
            if cli.json {
                println!("{reply}");
            } else {
                for line in output::recognition_lines(&report) {
                    println!("{line}");
                }
            }
            if let Some(out) = annotate {
                rollcall_extract::annotate_file(&image, &out, &output::face_marks(&report))
                    .with_context(|| format!("writing annotated image {}", out.display()))?;
                if !cli.json {
                    println!("Annotated image written to {}", out.display());
                }
            }
        }
        Commands::List => {
            let reply = proxy.list_identities().await?;
            if cli.json {
                println!("{reply}");
            } else {
                let identities: Vec<Identity> = serde_json::from_str(&reply)?;
                for line in output::identity_lines(&identities) {
                    println!("{line}");
                }
            }
        }
        Commands::Update { id, name, person } => {
            let patch = IdentityPatch {
                name,
                age: person.age,
                gender: person.gender,
                phone: person.phone,
                email: person.email,
                address: person.address,
            };
            if patch.is_empty() {
                bail!(
                    "nothing to update: pass at least one of \
                     --name, --age, --gender, --phone, --email, --address"
                );
            }
            let reply = proxy
                .update_identity(id, &serde_json::to_string(&patch)?)
                .await?;
            if cli.json {
                println!("{reply}");
            } else {
                let identity: Identity = serde_json::from_str(&reply)?;
                println!("Updated {} (id {})", identity.name, identity.id);
            }
        }
        Commands::Remove { id } => {
            proxy.remove_identity(id).await?;
            println!("Removed identity {id}");
        }
        Commands::Logs { limit } => {
            let reply = proxy.recognition_logs(limit).await?;
            if cli.json {
                println!("{reply}");
            } else {
                let logs: Vec<RecognitionLogRecord> = serde_json::from_str(&reply)?;
                for line in output::log_lines(&logs) {
                    println!("{line}");
                }
            }
        }
        Commands::Reload => {
            let entries = proxy.reload().await?;
            println!("Gallery reloaded: {entries} face embedding(s)");
        }
        Commands::Status => {
            let reply = proxy.status().await?;
            let status: serde_json::Value = serde_json::from_str(&reply)?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
    }

    Ok(())
}

async fn connect(system: bool) -> Result<GalleryProxy<'static>> {
    let builder = if system {
        zbus::connection::Builder::system()?
    } else {
        zbus::connection::Builder::session()?
    };
    let conn = builder
        .method_timeout(METHOD_TIMEOUT)
        .build()
        .await
        .context("connecting to D-Bus")?;
    let proxy = GalleryProxy::new(&conn)
        .await
        .context("rollcalld is not reachable")?;
    Ok(proxy)
}

/// The daemon resolves paths from its own working directory, so send absolute ones.
fn absolute(image: &Path) -> Result<PathBuf> {
    std::fs::canonicalize(image).with_context(|| format!("image not found: {}", image.display()))
}

fn path_arg(path: &Path) -> Result<String> {
    match path.to_str() {
        Some(s) => Ok(s.to_string()),
        None => bail!("path is not valid UTF-8: {}", path.display()),
    }
}
