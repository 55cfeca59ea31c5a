/*
    In-process demo cluster: four replicas (f = 1) and one client exchanging
    datagrams over tokio channels. Each node is configured exactly as it
    would be from a TOML file, then the client runs a few key-value
    operations and prints the agreed results.

    RUST_LOG=debug shows the protocol traffic.
*/

use std::error::Error;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tracing::info;
use tracing_subscriber::EnvFilter;

use pbft_replica::common::crypto::Keypair;
use pbft_replica::config::{Config, NodeConfig, PrincipalEntry, ProtocolConfig};
use pbft_replica::consensus::types::Role;
use pbft_replica::consensus::{Client, KvService, Replica};
use pbft_replica::network::{ChannelTransport, Event, Node};

const REPLICAS: usize = 4;
const OPERATIONS: [&str; 4] = ["SET greeting hello", "GET greeting", "SET greeting bye", "GET greeting"];

fn entries(keys: &[Keypair], base_port: u16) -> Vec<PrincipalEntry> {
    keys.iter()
        .enumerate()
        .map(|(index, key)| {
            let addr = SocketAddr::from(([127, 0, 0, 1], base_port + index as u16));
            PrincipalEntry::new(index, &key.pubkey(), addr)
        })
        .collect()
}

fn config(role: Role, index: usize, key: &Keypair, replicas: &[PrincipalEntry], clients: &[PrincipalEntry]) -> Config {
    Config {
        protocol: ProtocolConfig::default(),
        node: NodeConfig {
            role,
            index: Some(index),
            private_key: hex::encode(key.seed()),
        },
        replicas: replicas.to_vec(),
        clients: clients.to_vec(),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let replica_keys: Vec<Keypair> = (0..REPLICAS).map(|_| Keypair::new_pair()).collect();
    let client_key = Keypair::new_pair();
    let replica_entries = entries(&replica_keys, 25600);
    let client_entries = entries(std::slice::from_ref(&client_key), 25700);

    let transport = ChannelTransport::new();
    let mut replica_nodes = Vec::new();
    for (index, key) in replica_keys.iter().enumerate() {
        let config = config(Role::Replica, index, key, &replica_entries, &client_entries);
        let peers = config.peers()?;
        let inbox = transport.register(peers.local().addr, 4096);
        replica_nodes.push(Node::new(
            Replica::new(peers, config.protocol.clone(), KvService::new()),
            transport.clone(),
            inbox,
        ));
    }

    let config = config(Role::Client, 0, &client_key, &replica_entries, &client_entries);
    let peers = config.peers()?;
    let inbox = transport.register(peers.local().addr, 1024);
    let (observer, mut reports) = mpsc::unbounded_channel();
    let client = Node::new(Client::new(peers, config.protocol.clone()), transport.clone(), inbox).with_observer(observer);
    let submit = client.sender();

    let mut shutdowns = Vec::new();
    let mut tasks = Vec::new();
    for node in replica_nodes {
        let (stop, shutdown) = oneshot::channel();
        shutdowns.push(stop);
        tasks.push(tokio::spawn(node.run(shutdown)));
    }
    let (stop_client, shutdown) = oneshot::channel();
    let client_task = tokio::spawn(client.run(shutdown));

    for operation in OPERATIONS {
        submit.send(Event::Submit(Bytes::from_static(operation.as_bytes()))).await?;
        let report = tokio::time::timeout(Duration::from_secs(10), reports.recv())
            .await?
            .ok_or("client stopped")?;
        for completion in report.completed {
            info!(
                operation,
                timestamp = completion.timestamp,
                result = %String::from_utf8_lossy(&completion.result),
                "completed"
            );
        }
    }

    let _ = stop_client.send(());
    client_task.await?;
    for stop in shutdowns {
        let _ = stop.send(());
    }
    for task in tasks {
        let replica = task.await?;
        info!(
            replica = replica.index(),
            view = replica.view,
            last_executed = replica.log.last_executed,
            "replica stopped"
        );
    }
    Ok(())
}
