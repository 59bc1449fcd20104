//! Connection registry: user-id to live connection mapping plus the
//! per-connection bounded outbound queue.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tracing::{debug, warn};

use kindred_shared::protocol::ServerEvent;
use kindred_shared::types::UserId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId(u64);

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Result of enqueueing one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueue {
    /// Accepted (possibly after shedding an older typing event).
    Queued,
    /// The event itself was droppable and the queue is full of
    /// must-deliver events; it was shed.
    Shed,
    /// A must-deliver event did not fit: the connection is a slow consumer
    /// and has been closed.
    Overflow,
}

/// Bounded FIFO between the coordinator and one socket writer.
///
/// Overflow policy: oldest droppable (typing) events are evicted first; if
/// nothing can be evicted a droppable newcomer is shed, and a must-deliver
/// newcomer closes the queue.
#[derive(Debug)]
pub struct SendQueue {
    capacity: usize,
    inner: Mutex<QueueInner>,
    notify: Notify,
}

#[derive(Debug)]
struct QueueInner {
    buf: VecDeque<ServerEvent>,
    closed: bool,
}

impl SendQueue {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(QueueInner {
                buf: VecDeque::new(),
                closed: false,
            }),
            notify: Notify::new(),
        }
    }

    pub fn push(&self, event: ServerEvent) -> Enqueue {
        let result = {
            let mut inner = self.inner.lock().unwrap();
            if inner.closed {
                return Enqueue::Shed;
            }
            if inner.buf.len() < self.capacity {
                inner.buf.push_back(event);
                Enqueue::Queued
            } else if let Some(pos) = inner.buf.iter().position(|e| e.is_droppable()) {
                inner.buf.remove(pos);
                inner.buf.push_back(event);
                Enqueue::Queued
            } else if event.is_droppable() {
                Enqueue::Shed
            } else {
                inner.closed = true;
                Enqueue::Overflow
            }
        };
        self.notify.notify_one();
        result
    }

    /// Next event in enqueue order; `None` once the queue is closed and
    /// drained.
    pub async fn pop(&self) -> Option<ServerEvent> {
        loop {
            {
                let mut inner = self.inner.lock().unwrap();
                if let Some(event) = inner.buf.pop_front() {
                    return Some(event);
                }
                if inner.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    pub fn close(&self) {
        self.inner.lock().unwrap().closed = true;
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().unwrap().buf.len()
    }
}

struct Connection {
    user: Option<UserId>,
    queue: Arc<SendQueue>,
}

#[derive(Default)]
struct RegistryInner {
    conns: HashMap<ConnId, Connection>,
    /// Attach order per user; the most recently bound connection (the back)
    /// is primary for directed events.
    by_user: HashMap<UserId, Vec<ConnId>>,
}

pub struct ConnectionRegistry {
    queue_capacity: usize,
    next_id: AtomicU64,
    inner: Mutex<RegistryInner>,
}

impl ConnectionRegistry {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            queue_capacity,
            next_id: AtomicU64::new(1),
            inner: Mutex::new(RegistryInner::default()),
        }
    }

    pub fn attach(&self) -> (ConnId, Arc<SendQueue>) {
        let id = ConnId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let queue = Arc::new(SendQueue::new(self.queue_capacity));
        self.inner.lock().unwrap().conns.insert(
            id,
            Connection {
                user: None,
                queue: queue.clone(),
            },
        );
        debug!(conn = %id, "connection attached");
        (id, queue)
    }

    /// Associate an authenticated user with a connection. The newest bound
    /// connection becomes primary.
    pub fn bind(&self, conn: ConnId, user: UserId) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let RegistryInner { conns, by_user } = &mut *inner;
        let Some(entry) = conns.get_mut(&conn) else {
            return false;
        };
        if entry.user == Some(user) {
            return true;
        }
        let previous = entry.user.replace(user);
        if let Some(previous) = previous {
            if let Some(list) = by_user.get_mut(&previous) {
                list.retain(|c| *c != conn);
                if list.is_empty() {
                    by_user.remove(&previous);
                }
            }
        }
        by_user.entry(user).or_default().push(conn);
        true
    }

    /// Drop a connection. Returns the bound user and whether this was the
    /// user's last connection.
    pub fn detach(&self, conn: ConnId) -> Option<(UserId, bool)> {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner.conns.remove(&conn)?;
        entry.queue.close();
        let user = entry.user?;
        let remaining = match inner.by_user.get_mut(&user) {
            Some(list) => {
                list.retain(|c| *c != conn);
                let left = list.len();
                if left == 0 {
                    inner.by_user.remove(&user);
                }
                left
            }
            None => 0,
        };
        debug!(conn = %conn, user = %user, remaining, "connection detached");
        Some((user, remaining == 0))
    }

    pub fn user_of(&self, conn: ConnId) -> Option<UserId> {
        self.inner.lock().unwrap().conns.get(&conn)?.user
    }

    pub fn primary(&self, user: UserId) -> Option<ConnId> {
        self.inner
            .lock()
            .unwrap()
            .by_user
            .get(&user)?
            .last()
            .copied()
    }

    pub fn connections_of(&self, user: UserId) -> Vec<ConnId> {
        self.inner
            .lock()
            .unwrap()
            .by_user
            .get(&user)
            .cloned()
            .unwrap_or_default()
    }

    pub fn has_connections(&self, user: UserId) -> bool {
        self.inner.lock().unwrap().by_user.contains_key(&user)
    }

    /// Directed delivery: primary connection only.
    pub fn send(&self, user: UserId, event: ServerEvent) {
        if let Some(conn) = self.primary(user) {
            self.push_to(conn, event);
        }
    }

    /// Fan-out delivery: every connection of the user.
    pub fn broadcast(&self, user: UserId, event: ServerEvent) {
        for conn in self.connections_of(user) {
            self.push_to(conn, event.clone());
        }
    }

    /// Deliver to one specific connection; closes it on overflow.
    pub fn push_to(&self, conn: ConnId, event: ServerEvent) {
        let queue = {
            let inner = self.inner.lock().unwrap();
            match inner.conns.get(&conn) {
                Some(entry) => entry.queue.clone(),
                None => return,
            }
        };
        match queue.push(event) {
            Enqueue::Queued => {}
            Enqueue::Shed => debug!(conn = %conn, "typing event shed under backpressure"),
            Enqueue::Overflow => {
                warn!(conn = %conn, "send queue overflow, closing slow consumer");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kindred_shared::types::SessionId;

    fn typing() -> ServerEvent {
        ServerEvent::Typing {
            session_id: SessionId::new(),
            user_id: UserId::new(),
        }
    }

    fn ended() -> ServerEvent {
        ServerEvent::SessionEnded {
            session_id: SessionId::new(),
            by: UserId::new(),
        }
    }

    #[tokio::test]
    async fn fifo_order_preserved() {
        let queue = SendQueue::new(8);
        let e1 = ended();
        let e2 = ended();
        queue.push(e1.clone());
        queue.push(e2.clone());

        assert_eq!(queue.pop().await, Some(e1));
        assert_eq!(queue.pop().await, Some(e2));
    }

    #[tokio::test]
    async fn overflow_sheds_oldest_typing_first() {
        let queue = SendQueue::new(2);
        let t = typing();
        let m1 = ended();
        let m2 = ended();
        queue.push(t);
        queue.push(m1.clone());
        assert_eq!(queue.push(m2.clone()), Enqueue::Queued);

        // The typing event was evicted; both must-deliver events survive.
        assert_eq!(queue.pop().await, Some(m1));
        assert_eq!(queue.pop().await, Some(m2));
    }

    #[tokio::test]
    async fn overflow_with_messages_closes_queue() {
        let queue = SendQueue::new(2);
        queue.push(ended());
        queue.push(ended());

        assert_eq!(queue.push(typing()), Enqueue::Shed);
        assert!(!queue.is_closed());

        assert_eq!(queue.push(ended()), Enqueue::Overflow);
        assert!(queue.is_closed());

        // Already queued events still drain, then the close is observed.
        assert!(queue.pop().await.is_some());
        assert!(queue.pop().await.is_some());
        assert_eq!(queue.pop().await, None);
    }

    #[tokio::test]
    async fn closed_queue_drops_new_events() {
        let queue = SendQueue::new(2);
        queue.close();
        assert_eq!(queue.push(ended()), Enqueue::Shed);
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn newest_bound_connection_is_primary() {
        let registry = ConnectionRegistry::new(8);
        let user = UserId::new();
        let (c1, _q1) = registry.attach();
        let (c2, _q2) = registry.attach();
        registry.bind(c1, user);
        registry.bind(c2, user);

        assert_eq!(registry.primary(user), Some(c2));
        assert_eq!(registry.connections_of(user), vec![c1, c2]);

        let (_, last) = registry.detach(c2).unwrap();
        assert!(!last);
        assert_eq!(registry.primary(user), Some(c1));

        let (_, last) = registry.detach(c1).unwrap();
        assert!(last);
        assert!(!registry.has_connections(user));
    }

    #[tokio::test]
    async fn send_goes_to_primary_broadcast_to_all() {
        let registry = ConnectionRegistry::new(8);
        let user = UserId::new();
        let (c1, q1) = registry.attach();
        let (c2, q2) = registry.attach();
        registry.bind(c1, user);
        registry.bind(c2, user);

        registry.send(user, ended());
        assert_eq!(q1.len(), 0);
        assert_eq!(q2.len(), 1);

        registry.broadcast(user, ended());
        assert_eq!(q1.len(), 1);
        assert_eq!(q2.len(), 2);
    }
}
