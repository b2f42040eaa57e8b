/// Connection hub
///
/// Tracks live chat connections per family. Register, unregister and
/// broadcast requests go through one control loop so a family's frames are
/// enqueued in the order they were broadcast. Each connection has a bounded
/// outbound channel; a full channel drops the connection instead of
/// blocking the broadcaster, and the client reconnects.
use super::{Frame, FrameKind, Presence};
use crate::account::User;
use crate::metrics;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval, Duration, Instant};
use tracing::{debug, info, warn};

/// Outbound frames buffered per connection
pub const OUTBOUND_CAPACITY: usize = 256;

/// How often the reaper scans for stale connections
pub const REAP_INTERVAL: Duration = Duration::from_secs(30);

/// Connections silent for longer than this are closed
pub const STALE_AFTER: Duration = Duration::from_secs(60);

const COMMAND_BUFFER: usize = 1024;

/// One live connection as seen by the hub
pub struct Client {
    pub conn_id: u64,
    pub user_id: u64,
    pub family_id: u64,
    pub user_name: String,
    outbound: Mutex<Option<mpsc::Sender<Arc<str>>>>,
    last_seen: Mutex<Instant>,
    cancel: watch::Sender<bool>,
}

/// Receiving ends handed to the connection's loops
pub struct ClientChannels {
    pub outbound: mpsc::Receiver<Arc<str>>,
    pub cancel: watch::Receiver<bool>,
}

#[derive(Debug, PartialEq, Eq)]
enum SendFailure {
    Full,
    Closed,
}

impl Client {
    fn new(conn_id: u64, user: &User) -> (Arc<Self>, ClientChannels) {
        let (tx, rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let (cancel, cancel_rx) = watch::channel(false);

        let client = Arc::new(Self {
            conn_id,
            user_id: user.id,
            family_id: user.family_id,
            user_name: user.name.clone(),
            outbound: Mutex::new(Some(tx)),
            last_seen: Mutex::new(Instant::now()),
            cancel,
        });
        let channels = ClientChannels {
            outbound: rx,
            cancel: cancel_rx,
        };
        (client, channels)
    }

    /// Record activity from the peer
    pub fn touch(&self) {
        *self.last_seen.lock() = Instant::now();
    }

    /// Time of the last frame read from the peer
    pub fn last_seen(&self) -> Instant {
        *self.last_seen.lock()
    }

    pub fn idle_for(&self) -> Duration {
        self.last_seen.lock().elapsed()
    }

    /// Queue a frame for this connection only
    pub fn send(&self, frame: Arc<str>) -> bool {
        self.try_send(frame).is_ok()
    }

    fn try_send(&self, frame: Arc<str>) -> Result<(), SendFailure> {
        let guard = self.outbound.lock();
        let Some(tx) = guard.as_ref() else {
            return Err(SendFailure::Closed);
        };
        tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendFailure::Full,
            mpsc::error::TrySendError::Closed(_) => SendFailure::Closed,
        })
    }

    /// Ask both connection loops to stop
    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Close the outbound channel and cancel the loops
    fn close(&self) {
        self.outbound.lock().take();
        self.cancel();
    }
}

enum Command {
    Register(Arc<Client>, oneshot::Sender<()>),
    Unregister(Arc<Client>, &'static str, oneshot::Sender<()>),
    Broadcast(u64, Arc<str>, oneshot::Sender<()>),
}

type Families = HashMap<u64, HashMap<u64, Arc<Client>>>;

struct Shared {
    families: RwLock<Families>,
    next_conn_id: AtomicU64,
}

/// Handle to the connection hub
#[derive(Clone)]
pub struct Hub {
    shared: Arc<Shared>,
    commands: mpsc::Sender<Command>,
    stop: Arc<watch::Sender<bool>>,
}

impl Hub {
    /// Start the control loop and the stale-connection reaper
    pub fn start() -> Self {
        let shared = Arc::new(Shared {
            families: RwLock::new(HashMap::new()),
            next_conn_id: AtomicU64::new(1),
        });
        let (commands, rx) = mpsc::channel(COMMAND_BUFFER);
        let (stop, stop_rx) = watch::channel(false);

        let hub = Self {
            shared: Arc::clone(&shared),
            commands,
            stop: Arc::new(stop),
        };

        tokio::spawn(control_loop(shared, rx, stop_rx.clone()));
        tokio::spawn(reaper(hub.clone(), stop_rx));

        info!("Chat hub started");
        hub
    }

    /// Stop the control loop and reaper, closing every connection
    pub fn stop(&self) {
        self.stop.send_replace(true);
    }

    /// Create the hub-side state for a new connection
    pub fn connect(&self, user: &User) -> (Arc<Client>, ClientChannels) {
        let conn_id = self.shared.next_conn_id.fetch_add(1, Ordering::Relaxed);
        Client::new(conn_id, user)
    }

    pub async fn register(&self, client: Arc<Client>) {
        self.call(|ack| Command::Register(client, ack)).await
    }

    pub async fn unregister(&self, client: Arc<Client>) {
        self.call(|ack| Command::Unregister(client, "closed", ack))
            .await
    }

    /// Enqueue a frame on every connection of the family. Returns once the
    /// frame has been offered to each of them.
    pub async fn broadcast(&self, family_id: u64, frame: &Frame) {
        match frame.encode() {
            Ok(text) => {
                self.call(|ack| Command::Broadcast(family_id, text, ack))
                    .await
            }
            Err(e) => warn!(family_id, error = %e, "Dropping broadcast"),
        }
    }

    async fn call(&self, command: impl FnOnce(oneshot::Sender<()>) -> Command) {
        let (ack, done) = oneshot::channel();
        if self.commands.send(command(ack)).await.is_err() {
            debug!("Chat hub stopped, ignoring command");
            return;
        }
        let _ = done.await;
    }

    /// Distinct users with at least one live connection
    pub fn online_users(&self, family_id: u64) -> HashSet<u64> {
        self.shared
            .families
            .read()
            .get(&family_id)
            .map(|clients| clients.values().map(|c| c.user_id).collect())
            .unwrap_or_default()
    }

    pub fn connection_count(&self, family_id: u64) -> usize {
        self.shared
            .families
            .read()
            .get(&family_id)
            .map(|clients| clients.len())
            .unwrap_or(0)
    }

    pub fn total_connections(&self) -> usize {
        self.shared.families.read().values().map(|c| c.len()).sum()
    }

    /// Close every connection idle for longer than `max_idle`
    pub async fn reap_stale(&self, max_idle: Duration) -> usize {
        let stale: Vec<Arc<Client>> = self
            .shared
            .families
            .read()
            .values()
            .flat_map(|clients| clients.values())
            .filter(|c| c.idle_for() > max_idle)
            .cloned()
            .collect();

        let count = stale.len();
        for client in stale {
            debug!(
                conn_id = client.conn_id,
                user_id = client.user_id,
                "Reaping stale connection"
            );
            client.cancel();
            self.call(|ack| Command::Unregister(client, "stale", ack))
                .await;
        }
        count
    }
}

async fn control_loop(
    shared: Arc<Shared>,
    mut rx: mpsc::Receiver<Command>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        let command = tokio::select! {
            biased;
            _ = stop.changed() => break,
            command = rx.recv() => match command {
                Some(command) => command,
                None => break,
            },
        };

        match command {
            Command::Register(client, ack) => {
                shared.register(client);
                let _ = ack.send(());
            }
            Command::Unregister(client, reason, ack) => {
                shared.unregister(&client, reason);
                let _ = ack.send(());
            }
            Command::Broadcast(family_id, text, ack) => {
                shared.broadcast(family_id, text);
                let _ = ack.send(());
            }
        }
    }

    let clients: Vec<Arc<Client>> = shared
        .families
        .write()
        .drain()
        .flat_map(|(_, clients)| clients.into_values())
        .collect();
    for client in &clients {
        client.close();
    }
    metrics::CHAT_CONNECTIONS_ACTIVE.set(0);
    info!(closed = clients.len(), "Chat hub stopped");
}

async fn reaper(hub: Hub, mut stop: watch::Receiver<bool>) {
    let mut ticker = interval(REAP_INTERVAL);
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;
            _ = stop.changed() => break,
            _ = ticker.tick() => {
                let reaped = hub.reap_stale(STALE_AFTER).await;
                if reaped > 0 {
                    info!(reaped, "Closed stale chat connections");
                }
            }
        }
    }
}

fn presence_frame(client: &Client, online: bool) -> Option<Arc<str>> {
    let presence = Presence {
        user_id: client.user_id,
        user_name: client.user_name.clone(),
        is_online: online,
    };
    let kind = if online {
        FrameKind::UserOnline(presence)
    } else {
        FrameKind::UserOffline(presence)
    };
    Frame::new(kind).encode().ok()
}

impl Shared {
    fn register(&self, client: Arc<Client>) {
        let family_id = client.family_id;
        let first_for_user = {
            let mut families = self.families.write();
            let clients = families.entry(family_id).or_default();
            let first = !clients.values().any(|c| c.user_id == client.user_id);
            clients.insert(client.conn_id, Arc::clone(&client));
            first
        };

        metrics::CHAT_CONNECTIONS_ACTIVE.inc();
        debug!(
            conn_id = client.conn_id,
            user_id = client.user_id,
            family_id,
            "Connection registered"
        );

        if first_for_user {
            if let Some(text) = presence_frame(&client, true) {
                self.broadcast(family_id, text);
            }
        }
    }

    fn unregister(&self, client: &Arc<Client>, reason: &'static str) {
        if let Some(offline) = self.remove(client, reason) {
            self.broadcast(client.family_id, offline);
        }
    }

    /// Remove and close a connection. Returns the offline frame when it was
    /// the user's last connection in the family.
    fn remove(&self, client: &Arc<Client>, reason: &'static str) -> Option<Arc<str>> {
        let (removed, last_for_user) = {
            let mut families = self.families.write();
            match families.get_mut(&client.family_id) {
                Some(clients) => {
                    let removed = clients.remove(&client.conn_id).is_some();
                    let last = !clients.values().any(|c| c.user_id == client.user_id);
                    if clients.is_empty() {
                        families.remove(&client.family_id);
                    }
                    (removed, last)
                }
                None => (false, false),
            }
        };

        client.close();
        if !removed {
            return None;
        }

        metrics::CHAT_CONNECTIONS_ACTIVE.dec();
        if reason != "closed" {
            metrics::record_connection_dropped(reason);
        }
        debug!(
            conn_id = client.conn_id,
            user_id = client.user_id,
            family_id = client.family_id,
            reason,
            "Connection removed"
        );

        if last_for_user {
            presence_frame(client, false)
        } else {
            None
        }
    }

    /// Offer a frame to every connection of a family. Connections that
    /// cannot take it are removed after the pass, which may in turn
    /// broadcast their owners going offline.
    fn broadcast(&self, family_id: u64, text: Arc<str>) {
        let mut pending = VecDeque::from([text]);

        while let Some(text) = pending.pop_front() {
            let clients: Vec<Arc<Client>> = match self.families.read().get(&family_id) {
                Some(clients) => clients.values().cloned().collect(),
                None => return,
            };

            let mut failed = Vec::new();
            for client in clients {
                if let Err(failure) = client.try_send(Arc::clone(&text)) {
                    failed.push((client, failure));
                }
            }

            for (client, failure) in failed {
                warn!(
                    conn_id = client.conn_id,
                    user_id = client.user_id,
                    family_id,
                    ?failure,
                    "Dropping connection that cannot keep up"
                );
                if let Some(offline) = self.remove(&client, "backpressure") {
                    pending.push_back(offline);
                }
            }
        }
    }
}
