// src/bin/olaf-client.rs
// Interactive chat client. All protocol work happens in olaf_chat::client;
// this binary only parses line commands and prints events.

use std::path::PathBuf;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tracing_subscriber::EnvFilter;
use yansi::Paint;

use olaf_chat::client::{
    self, ClientConfig, Command, Event, ReceivedMessage, Scope,
};
use olaf_chat::crypto::Identity;

#[derive(Parser)]
#[command(name = "olaf-client", about = "OLAF neighbourhood chat client", version)]
struct Cli {
    /// Home server, host:port
    #[arg(long, default_value = "127.0.0.1:9000")]
    server: String,
}

fn print_help() {
    println!("  /list                  who is online");
    println!("  /msg <text>            public message to everyone");
    println!("  /tell <fp> <text>      private message to one fingerprint");
    println!("  /upload <path>         upload a file, prints its URL");
    println!("  /download <url> <path> fetch a file URL to a local path");
    println!("  /log                   show received messages");
    println!("  /quit                  leave");
}

fn print_message(msg: &ReceivedMessage) {
    let scope = match msg.scope {
        Scope::Public => Paint::green("public").to_string(),
        Scope::Private => Paint::magenta("private").to_string(),
    };
    println!(
        "{} [{}] {}: {}",
        Paint::white(msg.received_at.format("%H:%M:%S").to_string()).dimmed(),
        scope,
        Paint::cyan(short(&msg.sender)),
        msg.text
    );
}

// fingerprints are long; eight characters are plenty to tell users apart
fn short(fingerprint: &str) -> &str {
    &fingerprint[..fingerprint.len().min(8)]
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    println!("{}", Paint::green("OLAF Client").bold());
    println!("{} generating RSA identity...", Paint::blue("[keys]"));
    let identity = Identity::generate()?;
    println!(
        "{} fingerprint {}",
        Paint::blue("[keys]"),
        Paint::cyan(&identity.fingerprint)
    );

    let (cmd_tx, cmd_rx) = mpsc::channel::<Command>(16);
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<Event>();

    let config = ClientConfig {
        server_addr: cli.server.clone(),
    };
    let session = tokio::spawn(client::run_client(config, identity, cmd_rx, event_tx));

    // event printer
    let printer = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            match event {
                Event::Ready => {
                    println!("{} connected, directory received", Paint::green("[ok]"));
                    print_help();
                }
                Event::DirectoryUpdated(n) => {
                    println!("{} {} client(s) online", Paint::blue("[dir]"), n);
                }
                Event::Message(msg) => print_message(&msg),
                Event::Closed => {
                    println!("{}", Paint::yellow("[closed] session ended"));
                    break;
                }
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut parts = line.splitn(3, ' ');
        match parts.next().unwrap_or_default() {
            "/list" => {
                // snapshot may be one refresh behind; the push lands as [dir]
                let _ = cmd_tx.send(Command::RefreshDirectory).await;
                let (reply_tx, reply_rx) = oneshot::channel();
                if cmd_tx.send(Command::ListUsers(reply_tx)).await.is_err() {
                    break;
                }
                if let Ok(users) = reply_rx.await {
                    for user in users {
                        println!(
                            "  {} @ {}",
                            Paint::cyan(&user.fingerprint),
                            user.server
                        );
                    }
                }
            }
            "/msg" => {
                let text = line.strip_prefix("/msg").unwrap_or_default().trim();
                if text.is_empty() {
                    println!("usage: /msg <text>");
                    continue;
                }
                if cmd_tx.send(Command::SendPublic(text.into())).await.is_err() {
                    break;
                }
            }
            "/tell" => {
                let (fp, text) = match (parts.next(), parts.next()) {
                    (Some(fp), Some(text)) if !text.trim().is_empty() => (fp, text.trim()),
                    _ => {
                        println!("usage: /tell <fingerprint> <text>");
                        continue;
                    }
                };
                let command = Command::SendPrivate {
                    recipients: vec![fp.to_string()],
                    text: text.to_string(),
                };
                if cmd_tx.send(command).await.is_err() {
                    break;
                }
            }
            "/upload" => {
                let path = match parts.next() {
                    Some(p) => PathBuf::from(p),
                    None => {
                        println!("usage: /upload <path>");
                        continue;
                    }
                };
                match client::upload_file(&cli.server, &path).await {
                    Ok(url) => println!("{} {}", Paint::green("[uploaded]"), url),
                    Err(e) => println!("{} {}", Paint::red("[err]"), e),
                }
            }
            "/download" => {
                let (url, dest) = match (parts.next(), parts.next()) {
                    (Some(url), Some(dest)) => (url.to_string(), PathBuf::from(dest.trim())),
                    _ => {
                        println!("usage: /download <url> <path>");
                        continue;
                    }
                };
                match client::download_file(&url, &dest).await {
                    Ok(n) => println!("{} {} bytes -> {}", Paint::green("[saved]"), n, dest.display()),
                    Err(e) => println!("{} {}", Paint::red("[err]"), e),
                }
            }
            "/log" => {
                let (reply_tx, reply_rx) = oneshot::channel();
                if cmd_tx.send(Command::History(reply_tx)).await.is_err() {
                    break;
                }
                if let Ok(history) = reply_rx.await {
                    for msg in history {
                        print_message(&msg);
                    }
                }
            }
            "/quit" => {
                let _ = cmd_tx.send(Command::Quit).await;
                break;
            }
            _ => print_help(),
        }
    }

    let _ = session.await;
    printer.abort();
    Ok(())
}
