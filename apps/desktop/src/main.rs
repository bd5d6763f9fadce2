use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{bail, Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use clap::{Parser, Subcommand};
use client_core::{
    config::{self, DEFAULT_SETTINGS_FILE},
    transport::MemoryEnsemble,
    ClientEvent, ClientSettings, CreateOptions, TreeNode, ZkClient,
};
use serde::Serialize;
use shared::domain::{AclEntry, ConnectionState, CreateMode, StatField};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "zkview", about = "Browse and edit a ZooKeeper tree")]
struct Cli {
    /// Comma-separated host:port list; overrides the settings file.
    #[arg(long)]
    url: Option<String>,
    /// Re-arm watches after they fire.
    #[arg(long)]
    auto_refresh: bool,
    #[arg(long, default_value = DEFAULT_SETTINGS_FILE)]
    config: PathBuf,
    /// Run against an in-process sample tree instead of a server.
    #[arg(long)]
    offline: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Ls {
        #[arg(default_value = "/")]
        path: String,
    },
    Tree {
        path: Option<String>,
        #[arg(long, default_value_t = 3)]
        depth: usize,
    },
    Get {
        path: String,
        #[arg(long)]
        json: bool,
    },
    Set {
        path: String,
        data: String,
    },
    Create {
        path: String,
        #[arg(default_value = "")]
        data: String,
        #[arg(long)]
        ephemeral: bool,
        #[arg(long)]
        sequential: bool,
        /// scheme:id:perms, repeatable. Defaults to world:anyone:cdrwa.
        #[arg(long = "acl")]
        acl: Vec<String>,
    },
    Rm {
        path: String,
        /// Confirms removal of the node and everything below it.
        #[arg(long)]
        yes: bool,
    },
    Acl {
        path: String,
        /// Replaces the ACL with these scheme:id:perms entries.
        #[arg(long = "set")]
        set: Vec<String>,
    },
    Search {
        query: String,
        #[arg(long, default_value_t = 4)]
        depth: usize,
    },
    Watch {
        path: String,
        /// Stop after this many seconds instead of waiting for Ctrl-C.
        #[arg(long)]
        seconds: Option<u64>,
    },
    /// Saves the connection string and auto-refresh flag to the settings file.
    Remember,
}

#[derive(Serialize)]
struct NodeView<'a> {
    path: &'a str,
    encoding: &'static str,
    data: String,
    stat: Vec<StatField>,
    acl: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();

    let mut settings = config::load_settings(&cli.config);
    if let Some(url) = cli.url.clone() {
        settings.connect_string = url;
    }
    if cli.auto_refresh {
        settings.auto_refresh = true;
    }

    if let Command::Remember = cli.command {
        settings
            .remember(&cli.config)
            .with_context(|| format!("failed to save settings to {}", cli.config.display()))?;
        println!(
            "remembered url={} auto_refresh={} in {}",
            settings.connect_string,
            settings.auto_refresh,
            cli.config.display()
        );
        return Ok(());
    }

    let client = if cli.offline {
        let ensemble = sample_ensemble()?;
        ZkClient::with_connector(settings.clone(), Arc::new(ensemble))
    } else {
        ZkClient::new(settings.clone())
    };
    let handle = client
        .connect_default()
        .await
        .with_context(|| format!("failed to connect to {}", settings.connect_string))?;

    let outcome = run(&client, &settings, cli.command).await;
    client.close(handle).await.context("failed to close session")?;
    outcome
}

async fn run(client: &Arc<ZkClient>, settings: &ClientSettings, command: Command) -> Result<()> {
    match command {
        Command::Ls { path } => {
            for name in client.get_children(&path).await? {
                println!("{name}");
            }
        }
        Command::Tree { path, depth } => {
            let root = path.unwrap_or_else(|| settings.root.clone());
            let tree = client.load_tree(&root, depth).await?;
            print_tree(&tree, 0);
        }
        Command::Get { path, json } => {
            let (data, stat) = client.get_data(&path).await?;
            let acl = client.get_acl(&path).await?;
            let (encoding, rendered) = match String::from_utf8(data) {
                Ok(text) => ("utf8", text),
                Err(err) => ("base64", STANDARD.encode(err.into_bytes())),
            };
            if json {
                let view = NodeView {
                    path: &path,
                    encoding,
                    data: rendered,
                    stat: stat.describe(),
                    acl: acl.iter().map(ToString::to_string).collect(),
                };
                println!("{}", serde_json::to_string_pretty(&view)?);
            } else {
                println!("{rendered}");
                println!();
                for row in stat.describe() {
                    println!("{:<16}{:<28}{}", row.name, row.value, row.description);
                }
                println!();
                for entry in acl {
                    println!("acl {entry}");
                }
            }
        }
        Command::Set { path, data } => {
            let stat = client.set_data(&path, data.as_bytes()).await?;
            println!("set {path} version={}", stat.version);
        }
        Command::Create {
            path,
            data,
            ephemeral,
            sequential,
            acl,
        } => {
            let mode = match (ephemeral, sequential) {
                (false, false) => CreateMode::Persistent,
                (true, false) => CreateMode::Ephemeral,
                (false, true) => CreateMode::PersistentSequential,
                (true, true) => CreateMode::EphemeralSequential,
            };
            let acl = if acl.is_empty() {
                AclEntry::open_unsafe()
            } else {
                parse_acl(&acl)?
            };
            let created = client
                .create_with(&path, data.as_bytes(), CreateOptions { mode, acl })
                .await?;
            println!("created {created}");
        }
        Command::Rm { path, yes } => {
            if !yes {
                bail!("refusing to remove {path} and its children without --yes");
            }
            client.remove_recursive(&path).await?;
            println!("removed {path}");
        }
        Command::Acl { path, set } => {
            if !set.is_empty() {
                let acl = parse_acl(&set)?;
                client.set_acl(&path, &acl).await?;
            }
            for entry in client.get_acl(&path).await? {
                println!("{entry}");
            }
        }
        Command::Search { query, depth } => {
            client.load_tree(&settings.root, depth).await?;
            let result = client.search(&query).await;
            if result.matches.is_empty() {
                println!("no cached node matches '{query}'");
            }
            for path in result.matches {
                println!("{path}");
            }
        }
        Command::Watch { path, seconds } => watch(client, &path, seconds).await?,
        Command::Remember => {}
    }
    Ok(())
}

async fn watch(client: &Arc<ZkClient>, path: &str, seconds: Option<u64>) -> Result<()> {
    client.set_auto_refresh(true);
    let mut events = client.subscribe_events();
    if client.exists(path).await?.is_some() {
        client.get_children(path).await?;
    }
    println!("watching {path}; press Ctrl-C to stop");

    let deadline = async {
        match seconds {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    };
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => break,
            event = events.recv() => match event {
                Ok(ClientEvent::Log(entry)) => println!("{entry}"),
                Ok(ClientEvent::SessionStateChanged(state)) => {
                    println!("session {state}");
                    if state != ConnectionState::Connected {
                        break;
                    }
                }
                Ok(ClientEvent::Error(message)) => eprintln!("error: {message}"),
                Ok(ClientEvent::NodeChanged(_)) => {}
                Err(RecvError::Lagged(skipped)) => eprintln!("skipped {skipped} events"),
                Err(RecvError::Closed) => break,
            },
        }
    }
    Ok(())
}

fn parse_acl(entries: &[String]) -> Result<Vec<AclEntry>> {
    entries
        .iter()
        .map(|raw| {
            raw.parse::<AclEntry>()
                .with_context(|| format!("invalid ACL entry '{raw}'"))
        })
        .collect()
}

fn print_tree(node: &TreeNode, indent: usize) {
    let marker = if node.loaded { "" } else { " +" };
    println!("{:indent$}{}{marker}", "", node.name, indent = indent * 2);
    for child in &node.children {
        print_tree(child, indent + 1);
    }
}

fn sample_ensemble() -> Result<MemoryEnsemble> {
    let ensemble = MemoryEnsemble::new();
    for (path, data) in [
        ("/zookeeper/quota", ""),
        ("/app/config/db", "postgres://db.internal:5432/app"),
        ("/app/config/cache", "redis://cache.internal:6379"),
        ("/app/workers", ""),
        ("/locks", ""),
    ] {
        ensemble
            .seed(path, data.as_bytes())
            .with_context(|| format!("failed to seed {path}"))?;
    }
    Ok(ensemble)
}
