//! peerindex-ctl — command-line interface for the peerindex daemon.

use anyhow::{Context, Result};

mod cmd;

use cmd::{content, lookup};
use peerindex_ctl::client;

fn print_usage() {
    println!("Usage: peerindex-ctl [--server <host:port>] <command>");
    println!();
    println!("Commands:");
    println!("  register <peer> <name> <file>    Register content and upload its bytes");
    println!("  deregister <peer> <name>         Remove a registration");
    println!("  search <name>                    Find which peer has content");
    println!("  list <peer>                      List a peer's available content");
    println!("  download <name> <output-file>    Download content through the index");
    println!();
    println!("Options:");
    println!(
        "  --server <host:port>   Index control address (default: {})",
        client::DEFAULT_SERVER
    );
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();

    // Parse --server option
    let mut server = client::DEFAULT_SERVER.to_string();
    let mut remaining: Vec<&str> = Vec::new();
    let mut i = 0;
    while i < args.len() {
        if args[i] == "--server" {
            i += 1;
            server = args.get(i).context("--server requires a value")?.clone();
        } else {
            remaining.push(&args[i]);
        }
        i += 1;
    }

    if matches!(remaining.as_slice(), [] | ["help"] | ["--help"] | ["-h"]) {
        print_usage();
        return Ok(());
    }

    let server = client::resolve(&server).await?;

    match remaining.as_slice() {
        ["register", peer, name, file] => content::cmd_register(server, peer, name, file).await,
        ["deregister", peer, name]     => content::cmd_deregister(server, peer, name).await,
        ["download", name, output]     => content::cmd_download(server, name, output).await,
        ["search", name]               => lookup::cmd_search(server, name).await,
        ["list", peer]                 => lookup::cmd_list(server, peer).await,
        other => {
            eprintln!("Unknown command: {}", other.join(" "));
            eprintln!();
            print_usage();
            std::process::exit(1);
        }
    }
}
