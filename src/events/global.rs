//! Daemon-global Event Bus: `/events` subscribers see a bounded replay of
//! recent history followed by a live feed, exactly as Docker's own event
//! stream behaves.

use std::collections::{HashMap, VecDeque};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

const RING_CAPACITY: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Container,
    Image,
    Network,
    Volume,
}

impl EventType {
    fn as_str(&self) -> &'static str {
        match self {
            EventType::Container => "container",
            EventType::Image => "image",
            EventType::Network => "network",
            EventType::Volume => "volume",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Actor {
    pub id: String,
    pub attributes: HashMap<String, String>,
}

/// A single lifecycle event, matching the record shape named in the data
/// model: time, type, action, actor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub time: i64,
    #[serde(rename = "Type")]
    pub event_type: EventType,
    pub action: String,
    pub actor: Actor,
}

impl Event {
    pub fn new(event_type: EventType, action: impl Into<String>, actor_id: impl Into<String>) -> Self {
        Self {
            time: now_unix(),
            event_type,
            action: action.into(),
            actor: Actor { id: actor_id.into(), attributes: HashMap::new() },
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.actor.attributes.insert(key.into(), value.into());
        self
    }
}

fn now_unix() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0)
}

/// Filter grammar mirroring Docker's `/events?filters=` query: each key
/// (type, event, container, image, network, volume, label) maps to a set
/// of acceptable values; a filter matches if every present key's set
/// contains (or is a prefix-match for labels) a corresponding attribute.
#[derive(Debug, Clone, Default)]
pub struct EventFilters {
    pub types: Vec<String>,
    pub events: Vec<String>,
    pub containers: Vec<String>,
    pub images: Vec<String>,
    pub networks: Vec<String>,
    pub volumes: Vec<String>,
    pub labels: Vec<String>,
}

impl EventFilters {
    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
            && self.events.is_empty()
            && self.containers.is_empty()
            && self.images.is_empty()
            && self.networks.is_empty()
            && self.volumes.is_empty()
            && self.labels.is_empty()
    }

    pub fn matches(&self, event: &Event) -> bool {
        if !self.types.is_empty() && !self.types.iter().any(|t| t == event.event_type.as_str()) {
            return false;
        }
        if !self.events.is_empty() && !self.events.iter().any(|a| a == &event.action) {
            return false;
        }
        let id_filter = match event.event_type {
            EventType::Container => &self.containers,
            EventType::Image => &self.images,
            EventType::Network => &self.networks,
            EventType::Volume => &self.volumes,
        };
        if !id_filter.is_empty() && !id_filter.iter().any(|id| id == &event.actor.id) {
            return false;
        }
        if !self.labels.is_empty() {
            let matches_label = self.labels.iter().any(|spec| match spec.split_once('=') {
                Some((k, v)) => event.actor.attributes.get(k).map(|av| av == v).unwrap_or(false),
                None => event.actor.attributes.contains_key(spec.as_str()),
            });
            if !matches_label {
                return false;
            }
        }
        true
    }
}

struct Ring {
    buf: VecDeque<Event>,
}

impl Ring {
    fn push(&mut self, event: Event) {
        if self.buf.len() == RING_CAPACITY {
            self.buf.pop_front();
        }
        self.buf.push_back(event);
    }

    fn replay(&self, since: Option<i64>, until: Option<i64>) -> Vec<Event> {
        self.buf
            .iter()
            .filter(|e| since.map(|s| e.time >= s).unwrap_or(true))
            .filter(|e| until.map(|u| e.time <= u).unwrap_or(true))
            .cloned()
            .collect()
    }
}

/// Bounded ring of the last N events plus a live broadcast feed.
/// `subscribe` replays matching history (if `since` was given) and then
/// yields live matches until `until` passes or the caller drops the stream.
pub struct EventBus {
    ring: RwLock<Ring>,
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _rx) = broadcast::channel(RING_CAPACITY);
        Self { ring: RwLock::new(Ring { buf: VecDeque::with_capacity(RING_CAPACITY) }), sender }
    }

    pub fn publish(&self, event: Event) {
        self.ring.write().push(event.clone());
        let _ = self.sender.send(event);
    }

    /// Replay-then-live stream filtered per `filters`. `since`/`until` are
    /// unix timestamps; omitting `since` skips replay entirely.
    pub fn subscribe(
        &self,
        since: Option<i64>,
        until: Option<i64>,
        filters: EventFilters,
    ) -> impl tokio_stream::Stream<Item = Event> + Send + 'static {
        let replay = if since.is_some() { self.ring.read().replay(since, until) } else { Vec::new() };
        let live = BroadcastStream::new(self.sender.subscribe()).filter_map(|r| r.ok());

        let replay_stream = tokio_stream::iter(replay);
        replay_stream.chain(live).filter(move |e: &Event| {
            if let Some(u) = until {
                if e.time > u {
                    return false;
                }
            }
            filters.is_empty() || filters.matches(e)
        })
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn replay_then_live_delivers_in_emission_order() {
        let bus = EventBus::new();
        bus.publish(Event::new(EventType::Container, "create", "abc"));

        let mut stream = Box::pin(bus.subscribe(Some(0), None, EventFilters::default()));
        bus.publish(Event::new(EventType::Container, "start", "abc"));

        let first = stream.next().await.unwrap();
        assert_eq!(first.action, "create");
        let second = stream.next().await.unwrap();
        assert_eq!(second.action, "start");
    }

    #[test]
    fn filters_match_type_and_actor_id() {
        let e = Event::new(EventType::Container, "die", "c1").with_attribute("image", "alpine");
        let mut f = EventFilters::default();
        f.types.push("container".into());
        f.containers.push("c1".into());
        assert!(f.matches(&e));

        let mut f2 = EventFilters::default();
        f2.containers.push("other".into());
        assert!(!f2.matches(&e));
    }

    #[test]
    fn label_filter_supports_key_value_and_bare_key() {
        let e = Event::new(EventType::Container, "create", "c1").with_attribute("role", "agent");
        let mut f = EventFilters::default();
        f.labels.push("role=agent".into());
        assert!(f.matches(&e));

        let mut f2 = EventFilters::default();
        f2.labels.push("missing".into());
        assert!(!f2.matches(&e));
    }

    #[test]
    fn ring_evicts_oldest_beyond_capacity() {
        let mut ring = Ring { buf: VecDeque::new() };
        for i in 0..(RING_CAPACITY + 10) {
            ring.push(Event::new(EventType::Container, "noop", i.to_string()));
        }
        assert_eq!(ring.buf.len(), RING_CAPACITY);
        assert_eq!(ring.buf.front().unwrap().actor.id, "10");
    }
}
