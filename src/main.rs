use blockmesh::node::BlockStoreNode;
use std::path::PathBuf;

const DEFAULT_BLOCK_SIZE: u64 = 64 * 1024;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        eprintln!(
            "Usage: {} --port <port> [--host <addr>] [--store <bsid>=<path>]... [--peer <host:port>]...",
            args[0]
        );
        eprintln!("Example: {} --port 9000 --store 1=/var/blocks/a", args[0]);
        eprintln!(
            "Example: {} --port 9001 --store 2=/var/blocks/b --peer 127.0.0.1:9000",
            args[0]
        );
        std::process::exit(1);
    }

    let mut host = "127.0.0.1".to_string();
    let mut port: u16 = 0;
    let mut stores: Vec<(u64, PathBuf)> = Vec::new();
    let mut peers: Vec<(String, u16)> = Vec::new();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--host" => {
                host = args[i + 1].clone();
                i += 2;
            }
            "--port" => {
                port = args[i + 1].parse()?;
                i += 2;
            }
            "--store" => {
                let (bsid, path) = args[i + 1]
                    .split_once('=')
                    .ok_or_else(|| anyhow::anyhow!("--store expects <bsid>=<path>"))?;
                stores.push((bsid.parse()?, PathBuf::from(path)));
                i += 2;
            }
            "--peer" => {
                let (peer_host, peer_port) = args[i + 1]
                    .rsplit_once(':')
                    .ok_or_else(|| anyhow::anyhow!("--peer expects <host>:<port>"))?;
                peers.push((peer_host.to_string(), peer_port.parse()?));
                i += 2;
            }
            other => {
                anyhow::bail!("unknown argument {:?}", other);
            }
        }
    }

    let block_size = std::env::var("BLOCKMESH_BLOCK_SIZE")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or(DEFAULT_BLOCK_SIZE);
    let sync_writes = std::env::var("BLOCKMESH_SYNC_WRITES")
        .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
        .unwrap_or(false);
    let cache_blocks = std::env::var("BLOCKMESH_CACHE_BLOCKS")
        .ok()
        .and_then(|value| value.parse::<usize>().ok());

    let node = BlockStoreNode::create(&host, port).await?;
    tracing::info!("node listening on {}:{}", host, node.port());

    for (bsid, path) in stores {
        node.add_block_store(bsid, &path, block_size)?;
        tracing::info!(
            "serving block store {} from {} (block size {}, sync_writes {})",
            bsid,
            path.display(),
            block_size,
            sync_writes
        );
    }
    node.set_sync_writes(sync_writes);
    if let Some(blocks) = cache_blocks {
        node.set_cache_capacity(blocks);
    }
    node.start();

    if peers.is_empty() {
        tracing::info!("no initial peers; waiting for inbound connections");
    }
    for (peer_host, peer_port) in peers {
        if node.add_peer(&peer_host, peer_port).await {
            tracing::info!("joined mesh via {}:{}", peer_host, peer_port);
        } else {
            tracing::warn!("could not reach initial peer {}:{}", peer_host, peer_port);
        }
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    node.shutdown().await;
    Ok(())
}
