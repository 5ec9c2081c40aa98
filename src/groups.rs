use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::events::GroupEvent;

/// A live connection's handle inside the registry: events pushed into `tx`
/// are drained by the connection's own writer task.
#[derive(Debug, Clone)]
pub struct Subscriber {
    id: Uuid,
    tx: UnboundedSender<GroupEvent>,
}

impl Subscriber {
    pub fn new(id: Uuid, tx: UnboundedSender<GroupEvent>) -> Self {
        Self { id, tx }
    }

    fn deliver(&self, event: GroupEvent) -> bool {
        self.tx.send(event).is_ok()
    }
}

/// Named broadcast targets with dynamic membership. Session handlers only
/// see this trait; whether fan-out stays in-process or crosses a shared
/// redis plane is picked at startup.
#[async_trait]
pub trait GroupRegistry: Send + Sync {
    async fn join(&self, group: &str, member: Subscriber);
    async fn leave(&self, group: &str, conn_id: Uuid);
    async fn broadcast(&self, group: &str, event: GroupEvent) -> anyhow::Result<()>;
}

#[derive(Clone)]
pub struct Groups(Arc<dyn GroupRegistry>);

impl Groups {
    pub fn local() -> Self {
        Self(Arc::new(LocalGroups::default()))
    }

    pub async fn redis(url: &str) -> anyhow::Result<Self> {
        Ok(Self(Arc::new(RedisGroups::connect(url).await?)))
    }

    pub async fn join(&self, group: &str, member: Subscriber) {
        self.0.join(group, member).await;
    }

    pub async fn leave(&self, group: &str, conn_id: Uuid) {
        self.0.leave(group, conn_id).await;
    }

    pub async fn broadcast(&self, group: &str, event: GroupEvent) -> anyhow::Result<()> {
        self.0.broadcast(group, event).await
    }
}

/// Single-process registry. All membership changes and fan-outs serialize
/// on one lock, which is what makes a broadcast atomic against concurrent
/// join/leave and keeps per-group delivery FIFO; senders are unbounded so
/// the lock is never held across an await.
#[derive(Clone, Default)]
pub struct LocalGroups {
    groups: Arc<Mutex<HashMap<String, Vec<Subscriber>>>>,
}

impl LocalGroups {
    fn insert(&self, group: &str, member: Subscriber) {
        let mut groups = self.groups.lock().unwrap();
        let members = groups.entry(group.to_owned()).or_default();
        members.retain(|m| m.id != member.id);
        members.push(member);
    }

    fn remove(&self, group: &str, conn_id: Uuid) {
        let mut groups = self.groups.lock().unwrap();
        if let Some(members) = groups.get_mut(group) {
            members.retain(|m| m.id != conn_id);
            if members.is_empty() {
                groups.remove(group);
            }
        }
    }

    fn fan_out(&self, group: &str, event: &GroupEvent) {
        let mut groups = self.groups.lock().unwrap();
        if let Some(members) = groups.get_mut(group) {
            // a member whose receiver is gone is mid-teardown; drop it here
            members.retain(|m| m.deliver(event.clone()));
            if members.is_empty() {
                groups.remove(group);
            }
        }
    }
}

#[async_trait]
impl GroupRegistry for LocalGroups {
    async fn join(&self, group: &str, member: Subscriber) {
        self.insert(group, member);
    }

    async fn leave(&self, group: &str, conn_id: Uuid) {
        self.remove(group, conn_id);
    }

    async fn broadcast(&self, group: &str, event: GroupEvent) -> anyhow::Result<()> {
        self.fan_out(group, &event);
        Ok(())
    }
}

const CHANNEL_PREFIX: &str = "groups:";

/// Multi-process registry: membership stays process-local, but every
/// broadcast is published to redis and a subscriber task relays whatever
/// arrives (including our own publishes) into the local membership map.
pub struct RedisGroups {
    local: LocalGroups,
    publisher: ConnectionManager,
}

impl RedisGroups {
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(url)?;
        let publisher = ConnectionManager::new(client.clone()).await?;
        let local = LocalGroups::default();
        tokio::spawn(subscriber_loop(client, local.clone()));
        Ok(Self { local, publisher })
    }
}

async fn subscriber_loop(client: redis::Client, local: LocalGroups) {
    loop {
        match client.get_async_pubsub().await {
            Ok(mut pubsub) => {
                if let Err(err) = pubsub.psubscribe(format!("{CHANNEL_PREFIX}*")).await {
                    warn!("redis psubscribe failed: {err}");
                } else {
                    info!("listening on redis fan-out channels");
                    let mut stream = pubsub.on_message();
                    while let Some(msg) = stream.next().await {
                        let channel = msg.get_channel_name().to_owned();
                        let Some(group) = channel.strip_prefix(CHANNEL_PREFIX) else {
                            continue;
                        };
                        let Ok(payload) = msg.get_payload::<String>() else {
                            continue;
                        };
                        match serde_json::from_str::<GroupEvent>(&payload) {
                            Ok(event) => local.fan_out(group, &event),
                            Err(err) => debug!("discarding malformed fan-out event: {err}"),
                        }
                    }
                    warn!("redis pub/sub stream ended");
                }
            }
            Err(err) => warn!("redis pub/sub connect failed: {err}"),
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}

#[async_trait]
impl GroupRegistry for RedisGroups {
    async fn join(&self, group: &str, member: Subscriber) {
        self.local.insert(group, member);
    }

    async fn leave(&self, group: &str, conn_id: Uuid) {
        self.local.remove(group, conn_id);
    }

    async fn broadcast(&self, group: &str, event: GroupEvent) -> anyhow::Result<()> {
        let payload = serde_json::to_string(&event)?;
        let channel = format!("{CHANNEL_PREFIX}{group}");
        let mut publisher = self.publisher.clone();
        let _: () = publisher.publish(channel, payload).await?;
        Ok(())
    }
}
