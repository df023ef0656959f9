use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};

#[zbus::proxy(
    interface = "io.tally.Attendance1",
    default_service = "io.tally.Attendance1",
    default_path = "/io/tally/Attendance1"
)]
trait Attendance {
    fn mark(&self, supervisor: &str, principal: &str, intent: &str) -> zbus::Result<String>;
    fn mark_contact(&self, supervisor: &str, contact: &str, intent: &str) -> zbus::Result<String>;
    fn mark_sample(&self, supervisor: &str, sample: &[u8], intent: &str) -> zbus::Result<String>;
    fn mark_period(&self, supervisor: &str, intent: &str) -> zbus::Result<String>;
    fn period_status(&self, supervisor: &str) -> zbus::Result<String>;
    fn ledger(&self, supervisor: &str, principal: &str) -> zbus::Result<String>;
    fn roster(&self, supervisor: &str) -> zbus::Result<String>;
    fn enroll_supervisor(&self, name: &str, contact: &str) -> zbus::Result<String>;
    fn enroll_subject(&self, supervisor: &str, name: &str, contact: &str, sample: &[u8]) -> zbus::Result<String>;
    fn add_reference(&self, supervisor: &str, principal: &str, sample: &[u8]) -> zbus::Result<u32>;
    fn remove_subject(&self, supervisor: &str, principal: &str) -> zbus::Result<bool>;
    fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "tally", about = "Tally attendance CLI")]
struct Cli {
    /// Supervisor id to act as
    #[arg(long = "as", global = true, env = "TALLY_SUPERVISOR")]
    supervisor: Option<String>,

    /// Talk to the daemon on the system bus instead of the session bus
    #[arg(long, global = true)]
    system: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Intent {
    Toggle,
    Start,
    End,
}

impl Intent {
    fn as_str(&self) -> &'static str {
        match self {
            Intent::Toggle => "toggle",
            Intent::Start => "start",
            Intent::End => "end",
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Open or close your period
    Period {
        #[arg(value_enum, default_value_t = Intent::Toggle)]
        intent: Intent,
    },
    /// Mark a subject by id, or by contact address with --contact
    Mark {
        principal: String,
        #[arg(value_enum, default_value_t = Intent::Toggle)]
        intent: Intent,
        /// Treat PRINCIPAL as the subject's contact address
        #[arg(long)]
        contact: bool,
    },
    /// Mark whoever the face image resolves to
    MarkFace {
        image: PathBuf,
        #[arg(value_enum, default_value_t = Intent::Toggle)]
        intent: Intent,
    },
    /// Show your period state
    Status,
    /// Show the attendance ledger of yourself or a subject
    Ledger {
        /// Subject id (defaults to yourself)
        principal: Option<String>,
    },
    /// List your subjects
    Roster,
    /// Register a new supervisor
    EnrollSupervisor {
        name: String,
        #[arg(short, long, default_value = "")]
        contact: String,
    },
    /// Register a subject from a face image
    Enroll {
        name: String,
        image: PathBuf,
        #[arg(short, long, default_value = "")]
        contact: String,
    },
    /// Add another reference image for a subject (e.g. with glasses)
    AddFace { principal: String, image: PathBuf },
    /// Remove a subject and their history
    Remove { principal: String },
    /// Show daemon status
    DaemonStatus,
}

fn read_image(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("reading {}", path.display()))
}

fn acting_as(supervisor: Option<&str>) -> Result<&str> {
    supervisor.context("no supervisor id; pass --as <ID> or set TALLY_SUPERVISOR")
}

fn print_json(text: &str) {
    match serde_json::from_str::<serde_json::Value>(text) {
        Ok(value) => println!("{}", serde_json::to_string_pretty(&value).unwrap_or_else(|_| text.to_string())),
        Err(_) => println!("{text}"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let conn = if cli.system {
        zbus::Connection::system().await
    } else {
        zbus::Connection::session().await
    }
    .context("connecting to D-Bus")?;
    tracing::debug!(system = cli.system, "connected to D-Bus");
    let proxy = AttendanceProxy::new(&conn).await?;

    let acting = cli.supervisor.as_deref();

    match &cli.command {
        Commands::Period { intent } => print_json(&proxy.mark_period(acting_as(acting)?, intent.as_str()).await?),
        Commands::Mark {
            principal,
            intent,
            contact: false,
        } => print_json(&proxy.mark(acting_as(acting)?, principal, intent.as_str()).await?),
        Commands::Mark {
            principal,
            intent,
            contact: true,
        } => print_json(&proxy.mark_contact(acting_as(acting)?, principal, intent.as_str()).await?),
        Commands::MarkFace { image, intent } => {
            let sample = read_image(image)?;
            print_json(&proxy.mark_sample(acting_as(acting)?, &sample, intent.as_str()).await?)
        }
        Commands::Status => print_json(&proxy.period_status(acting_as(acting)?).await?),
        Commands::Ledger { principal } => {
            let me = acting_as(acting)?;
            print_json(&proxy.ledger(me, principal.as_deref().unwrap_or(me)).await?)
        }
        Commands::Roster => print_json(&proxy.roster(acting_as(acting)?).await?),
        Commands::EnrollSupervisor { name, contact } => {
            print_json(&proxy.enroll_supervisor(name, contact).await?);
            eprintln!("export TALLY_SUPERVISOR=<id> to act as this supervisor");
        }
        Commands::Enroll { name, image, contact } => {
            let sample = read_image(image)?;
            print_json(&proxy.enroll_subject(acting_as(acting)?, name, contact, &sample).await?)
        }
        Commands::AddFace { principal, image } => {
            let sample = read_image(image)?;
            let count = proxy.add_reference(acting_as(acting)?, principal, &sample).await?;
            println!("{principal}: {count} reference(s)");
        }
        Commands::Remove { principal } => {
            proxy.remove_subject(acting_as(acting)?, principal).await?;
            println!("removed {principal}");
        }
        Commands::DaemonStatus => print_json(&proxy.status().await?),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mark_defaults_to_toggle() {
        let cli = Cli::try_parse_from(["tally", "--as", "sup", "mark", "bob"]).unwrap();
        assert_eq!(cli.supervisor.as_deref(), Some("sup"));
        match cli.command {
            Commands::Mark {
                principal,
                intent,
                contact,
            } => {
                assert_eq!(principal, "bob");
                assert_eq!(intent, Intent::Toggle);
                assert!(!contact);
            }
            _ => panic!("expected mark"),
        }
    }

    #[test]
    fn test_period_intent_parsed() {
        let cli = Cli::try_parse_from(["tally", "period", "end", "--system"]).unwrap();
        assert!(cli.system);
        assert!(matches!(cli.command, Commands::Period { intent: Intent::End }));
    }

    #[test]
    fn test_mark_by_contact() {
        let cli = Cli::try_parse_from(["tally", "mark", "--contact", "bob@example.com", "end"]).unwrap();
        match cli.command {
            Commands::Mark {
                principal,
                intent,
                contact,
            } => {
                assert_eq!(principal, "bob@example.com");
                assert_eq!(intent, Intent::End);
                assert!(contact);
            }
            _ => panic!("expected mark"),
        }
    }

    #[test]
    fn test_unknown_intent_rejected() {
        assert!(Cli::try_parse_from(["tally", "mark", "bob", "sideways"]).is_err());
    }
}
