//! Node handle running the DHT: receive loop, worker pool and maintenance tasks.

use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use flume::{Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError};
use tracing::{debug, info, trace};

use crate::cache::DurableCache;
use crate::common::{Id, Peer};
use crate::maintenance::Task;
use crate::rpc::{Config, Info, Rpc, RECV_BUFFER_SIZE};
use crate::signing::SignatureVerifier;
use crate::Error;

/// Datagrams waiting for a worker, per worker.
const QUEUE_SIZE_PER_WORKER: usize = 64;

#[derive(Debug)]
/// A running DHT node.
///
/// Every method is safe to call from any thread, concurrently with the
/// node's own threads. Dropping the node shuts it down.
pub struct Node {
    rpc: Arc<Rpc>,
    shutdown_sender: Mutex<Option<Sender<()>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Node {
    /// Returns a builder to edit settings before creating a Node.
    pub fn builder() -> NodeBuilder {
        NodeBuilder::default()
    }

    /// Create a new node with the given config, and start its threads.
    ///
    /// Does not join the network, see [Node::join].
    pub fn new(config: Config) -> Result<Self, Error> {
        let workers = config.workers.max(1);
        let rpc = Arc::new(Rpc::new(config)?);

        let (shutdown_sender, shutdown_receiver) = flume::bounded::<()>(0);
        let (datagram_sender, datagram_receiver) = flume::bounded(workers * QUEUE_SIZE_PER_WORKER);

        let mut handles = Vec::with_capacity(1 + workers + Task::ALL.len());

        handles.push(spawn("agora-recv", {
            let rpc = rpc.clone();
            let shutdown = shutdown_receiver.clone();
            move || receive_loop(&rpc, datagram_sender, shutdown)
        })?);

        for i in 0..workers {
            handles.push(spawn(&format!("agora-worker-{i}"), {
                let rpc = rpc.clone();
                let datagrams = datagram_receiver.clone();
                move || worker_loop(&rpc, datagrams)
            })?);
        }

        for task in Task::ALL {
            handles.push(spawn(&format!("agora-{}", task.name()), {
                let rpc = rpc.clone();
                let shutdown = shutdown_receiver.clone();
                move || maintenance_loop(&rpc, task, shutdown)
            })?);
        }

        info!(address = ?rpc.local_addr(), id = %rpc.id(), workers, "Agora DHT listening");

        Ok(Node {
            rpc,
            shutdown_sender: Mutex::new(Some(shutdown_sender)),
            handles: Mutex::new(handles),
        })
    }

    // === Getters ===

    /// Returns the node's Id
    pub fn id(&self) -> &Id {
        self.rpc.id()
    }

    /// Returns the address the node is listening to.
    pub fn local_addr(&self) -> SocketAddr {
        self.rpc.local_addr()
    }

    /// Returns the address other peers reach this node at.
    pub fn public_address(&self) -> SocketAddr {
        self.rpc.public_address()
    }

    /// Snapshot of this node's status and statistics.
    #[doc(alias = "get_status")]
    pub fn info(&self) -> Info {
        self.rpc.info()
    }

    /// The protocol engine shared by this node's threads.
    pub fn rpc(&self) -> &Rpc {
        &self.rpc
    }

    // === Public Methods ===

    /// Join the network through the configured bootstrap contacts.
    ///
    /// Returns the number of peers added to the routing table.
    pub fn join(&self) -> usize {
        self.rpc.join()
    }

    /// Store a record locally and replicate it to the peers closest to `key`.
    ///
    /// Returns `None` if the record was rejected, otherwise the number of peers
    /// that stored a replica, which may be `0`.
    pub fn put(&self, key: &str, value: &str) -> Option<usize> {
        if !self.rpc.put(key, value) {
            return None;
        }

        // A more recent value may already be held, replicate that one.
        let Some(held) = self.rpc.get_local(key) else {
            return Some(0);
        };

        let stored_at = self.rpc.send_put(key, &held);
        debug!(%key, stored_at, "Put");

        Some(stored_at)
    }

    /// Look `key` up locally, then on the network.
    pub fn get(&self, key: &str) -> Option<String> {
        self.rpc.get(key)
    }

    /// Delete `key` locally and ask the closest peers to delete it too.
    ///
    /// Returns `true` if a local copy was removed.
    pub fn remove(&self, key: &str) -> bool {
        let removed = self.rpc.remove(key);
        let notified = self.rpc.send_remove(key);
        debug!(%key, removed, notified, "Remove");

        removed
    }

    /// Store a record locally, listings included, and announce this node as its provider.
    pub fn map(&self, key: &str, value: &str) -> bool {
        self.rpc.map(key, value)
    }

    /// Up to `count` known peers closest to `target`, without network I/O.
    pub fn find_node(&self, target: &Id, count: usize) -> Vec<Peer> {
        self.rpc.find_node(target, count)
    }

    pub fn get_peers(&self) -> Vec<Peer> {
        self.rpc.get_peers()
    }

    pub fn get_data(&self) -> Vec<(String, String)> {
        self.rpc.get_data()
    }

    /// Stop every thread of this node and wait for them to finish.
    ///
    /// Calling it more than once is a no-op.
    pub fn shutdown(&self) {
        let sender = self
            .shutdown_sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if sender.is_none() {
            return;
        }

        drop(sender);

        if self.rpc.is_bootstrap_node() {
            self.rpc.persist_routing_table();
        }

        let handles: Vec<JoinHandle<()>> = self
            .handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();

        for handle in handles {
            let _ = handle.join();
        }

        info!(id = %self.rpc.id(), "Agora DHT was shutdown");
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn spawn<F>(name: &str, f: F) -> Result<JoinHandle<()>, Error>
where
    F: FnOnce() + Send + 'static,
{
    Ok(thread::Builder::new().name(name.to_string()).spawn(f)?)
}

fn receive_loop(rpc: &Rpc, datagrams: Sender<(Vec<u8>, SocketAddr)>, shutdown: Receiver<()>) {
    let mut buf = [0u8; RECV_BUFFER_SIZE];

    while let Err(TryRecvError::Empty) = shutdown.try_recv() {
        let Some((amt, from)) = rpc.socket().recv_from(&mut buf) else {
            continue;
        };

        match datagrams.try_send((buf[..amt].to_vec(), from)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                debug!(?from, "Workers are busy, dropping datagram");
            }
            Err(TrySendError::Disconnected(_)) => break,
        }
    }

    trace!("Receive loop stopped");
}

fn worker_loop(rpc: &Rpc, datagrams: Receiver<(Vec<u8>, SocketAddr)>) {
    // Ends once the receive loop drops its sender.
    for (bytes, from) in datagrams.iter() {
        rpc.handle_datagram(&bytes, from);
    }
}

fn maintenance_loop(rpc: &Rpc, task: Task, shutdown: Receiver<()>) {
    let interval = task.interval(rpc.config());

    loop {
        match shutdown.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => {
                task.run(rpc);
            }
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    trace!(task = task.name(), "Maintenance loop stopped");
}

#[derive(Debug, Default, Clone)]
/// Create a [Node] with custom settings.
pub struct NodeBuilder(Config);

impl NodeBuilder {
    /// Ip address to bind the UDP socket to.
    pub fn address(&mut self, address: IpAddr) -> &mut Self {
        self.0.address = address;
        self
    }

    /// Port to listen on, successive ports are tried if it is taken.
    pub fn port(&mut self, port: u16) -> &mut Self {
        self.0.port = port;
        self
    }

    /// The ip other peers see this node at.
    pub fn public_ip(&mut self, ip: IpAddr) -> &mut Self {
        self.0.public_ip = Some(ip);
        self
    }

    /// Replace the bootstrap contacts, as `host:port` strings.
    pub fn bootstrap<T: ToString>(&mut self, bootstrap: &[T]) -> &mut Self {
        self.0.bootstrap = bootstrap.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Run as a bootstrap node.
    pub fn bootstrap_mode(&mut self) -> &mut Self {
        self.0.bootstrap_mode = true;
        self
    }

    pub fn request_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.0.request_timeout = timeout;
        self
    }

    pub fn ping_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.0.ping_timeout = timeout;
        self
    }

    pub fn replication_factor(&mut self, replication_factor: usize) -> &mut Self {
        self.0.replication_factor = replication_factor;
        self
    }

    pub fn workers(&mut self, workers: usize) -> &mut Self {
        self.0.workers = workers;
        self
    }

    pub fn verifier(&mut self, verifier: Arc<dyn SignatureVerifier>) -> &mut Self {
        self.0.verifier = verifier;
        self
    }

    pub fn cache(&mut self, cache: Arc<dyn DurableCache>) -> &mut Self {
        self.0.cache = cache;
        self
    }

    /// Edit the full [Config].
    pub fn config(&mut self, f: impl FnOnce(&mut Config)) -> &mut Self {
        f(&mut self.0);
        self
    }

    /// Create a Node and start its threads.
    pub fn build(&self) -> Result<Node, Error> {
        Node::new(self.0.clone())
    }
}
