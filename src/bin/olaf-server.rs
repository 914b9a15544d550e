// src/bin/olaf-server.rs
use clap::{Parser, Subcommand};
use std::env;
use tracing_subscriber::EnvFilter;
use yansi::Paint;

#[derive(Parser)]
#[command(name = "olaf-server", about = "OLAF neighbourhood home server", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a home server
    Start {
        /// Listen address (default: 0.0.0.0:9000)
        #[arg(long, default_value = "0.0.0.0:9000")]
        bind: String,

        /// Address peers and file URLs use to reach this server
        #[arg(long)]
        public_addr: Option<String>,

        /// Neighbourhood peers, host:port (comma-separated list accepted)
        #[arg(long)]
        peer: Option<String>,

        /// Directory backing file uploads (default: files)
        #[arg(long)]
        files_dir: Option<String>,
    },
}

fn banner() {
    let name = r#"
   ___  _        _    _____
  / _ \| |      / \  |  ___|
 | | | | |     / _ \ | |_
 | |_| | |___ / ___ \|  _|
  \___/|_____/_/   \_\_|
"#;
    println!("{}", Paint::cyan(name).bold());
    println!(
        "{} {}",
        Paint::green("OLAF Server").bold(),
        Paint::white("— neighbourhood home server").dimmed()
    );
    println!();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    banner();

    match cli.command {
        Commands::Start {
            bind,
            public_addr,
            peer,
            files_dir,
        } => {
            // Set env variables the rest of the server expects
            env::set_var("OLAF_BIND_ADDR", &bind);
            if let Some(addr) = public_addr {
                env::set_var("OLAF_PUBLIC_ADDR", addr);
            }
            if let Some(peers) = peer {
                println!("{} neighbourhood: {}", Paint::blue("[peers]"), peers);
                env::set_var("OLAF_PEERS", peers);
            } else {
                println!(
                    "{}",
                    Paint::yellow("[warn] no peers configured — server runs standalone")
                );
            }
            if let Some(dir) = files_dir {
                env::set_var("OLAF_FILES_DIR", dir);
            }

            println!("{} ws://{}/   files -> /api/upload", Paint::blue("[starting]").bold(), bind);
            olaf_chat::run_server().await?;
        }
    }
    Ok(())
}
