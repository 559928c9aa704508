//! Commands that move bytes: register, deregister, download.

use std::net::SocketAddr;

use anyhow::{bail, Context, Result};
use tokio::net::UdpSocket;

use peerindex_core::{Reply, Request};
use peerindex_ctl::client;

pub async fn cmd_register(server: SocketAddr, peer: &str, name: &str, path: &str) -> Result<()> {
    let mut file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("failed to open file: {}", path))?;
    let len = file
        .metadata()
        .await
        .with_context(|| format!("failed to stat file: {}", path))?
        .len();

    let bind = if server.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
    let socket = UdpSocket::bind(bind)
        .await
        .context("failed to bind client socket")?;

    let size = client::register(&socket, server, peer, name, &mut file, len).await?;

    println!("Registered:");
    println!("  Peer  : {}", peer);
    println!("  Name  : {}", name);
    println!("  Bytes : {}", size);
    Ok(())
}

pub async fn cmd_deregister(server: SocketAddr, peer: &str, name: &str) -> Result<()> {
    let req = Request::Deregister {
        peer_id: peer.to_string(),
        name: name.to_string(),
    };
    match client::ok(client::request(server, &req).await?)? {
        Reply::Removed { name } => println!("Deregistered {}.", name),
        other => bail!("unexpected reply {:?}", other),
    }
    Ok(())
}

pub async fn cmd_download(server: SocketAddr, name: &str, output: &str) -> Result<()> {
    let mut file = tokio::fs::File::create(output)
        .await
        .with_context(|| format!("failed to create file: {}", output))?;

    match client::fetch(server, name, &mut file).await {
        Ok((owner, size)) => {
            println!("Downloaded:");
            println!("  Name  : {}", name);
            println!("  Owner : {}", owner);
            println!("  Bytes : {}", size);
            println!("  Saved : {}", output);
            Ok(())
        }
        Err(e) => {
            drop(file);
            let _ = tokio::fs::remove_file(output).await;
            Err(e)
        }
    }
}
