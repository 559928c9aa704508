//! Read-only queries: search and list.

use std::net::SocketAddr;

use anyhow::{bail, Result};

use peerindex_core::{Reply, Request};
use peerindex_ctl::client;

pub async fn cmd_search(server: SocketAddr, name: &str) -> Result<()> {
    let req = Request::Search {
        name: name.to_string(),
    };
    match client::request(server, &req).await? {
        Reply::Found { name, addr, owner } => {
            println!("═══════════════════════════════════════");
            println!("  {}", name);
            println!("═══════════════════════════════════════");
            println!("  Owner   : {}", owner);
            println!("  Address : {}", addr);
        }
        Reply::Error { code, .. } if code == "NOT_FOUND" => {
            println!("No peer has {}.", name);
        }
        other => {
            client::ok(other.clone())?;
            bail!("unexpected reply {:?}", other);
        }
    }
    Ok(())
}

pub async fn cmd_list(server: SocketAddr, peer: &str) -> Result<()> {
    let req = Request::List {
        peer_id: peer.to_string(),
    };
    let names = match client::ok(client::request(server, &req).await?)? {
        Reply::Listing { names, .. } => names,
        other => bail!("unexpected reply {:?}", other),
    };

    if names.is_empty() {
        println!("{} has no available content.", peer);
        return Ok(());
    }

    println!("═══════════════════════════════════════");
    println!("  Content of {} ({})", peer, names.len());
    println!("═══════════════════════════════════════");
    for name in &names {
        println!("  ✓ {}", name);
    }
    Ok(())
}
