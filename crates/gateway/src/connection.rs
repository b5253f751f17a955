//! One exchange connection per credential set, shared by every client
//! session bound to that set.
//!
//! A connection owns up to two upstream sockets: a public one for market
//! data and a private one for account streams. Interest is counted per key
//! per session; the upstream subscription set is always the union of what
//! attached sessions ask for.

use crate::config::GatewaySettings;
use crate::error::GatewayError;
use crate::session::{ClientSink, SessionId};
use crate::upstream::{dial, Upstream, UpstreamReader, UpstreamSender};
use axum::extract::ws::Utf8Bytes;
use exgate_core::*;
use futures_util::StreamExt;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, RwLock};
use tokio::time::{interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Interest tracking
// ---------------------------------------------------------------------------

/// Reference-counted key interest: which sessions want which keys.
#[derive(Debug, Default)]
pub struct Interests {
    keys: BTreeMap<SubscriptionKey, HashSet<SessionId>>,
}

impl Interests {
    /// Record interest. True if the key was not active before.
    pub fn add(&mut self, key: SubscriptionKey, session: SessionId) -> bool {
        let holders = self.keys.entry(key).or_default();
        let was_empty = holders.is_empty();
        holders.insert(session);
        was_empty
    }

    /// Drop interest. True if the key is no longer wanted by anyone.
    pub fn remove(&mut self, key: &SubscriptionKey, session: SessionId) -> bool {
        let Some(holders) = self.keys.get_mut(key) else {
            return false;
        };
        if !holders.remove(&session) {
            return false;
        }
        if holders.is_empty() {
            self.keys.remove(key);
            true
        } else {
            false
        }
    }

    /// Drop every interest held by `session`, returning keys that went inactive.
    pub fn release(&mut self, session: SessionId) -> Vec<SubscriptionKey> {
        let mut released = Vec::new();
        self.keys.retain(|key, holders| {
            if holders.remove(&session) && holders.is_empty() {
                released.push(key.clone());
                false
            } else {
                true
            }
        });
        released
    }

    pub fn contains(&self, key: &SubscriptionKey) -> bool {
        self.keys.contains_key(key)
    }

    pub fn keys(&self) -> Vec<SubscriptionKey> {
        self.keys.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Slots
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Public,
    Private,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Side::Public => "public",
            Side::Private => "private",
        })
    }
}

/// Observable state of one upstream slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Idle,
    Connecting,
    Authenticating,
    Active,
    Closed,
}

#[derive(Debug)]
enum Slot {
    Idle,
    Connecting { generation: u64 },
    Authenticating(Upstream),
    Active(Upstream),
}

impl Slot {
    fn upstream(&self) -> Option<&Upstream> {
        match self {
            Slot::Authenticating(up) | Slot::Active(up) => Some(up),
            _ => None,
        }
    }

    fn into_upstream(self) -> Option<Upstream> {
        match self {
            Slot::Authenticating(up) | Slot::Active(up) => Some(up),
            _ => None,
        }
    }

    fn is_generation(&self, generation: u64) -> bool {
        match self {
            Slot::Connecting { generation: g } => *g == generation,
            Slot::Authenticating(up) | Slot::Active(up) => up.generation == generation,
            Slot::Idle => false,
        }
    }

    fn state(&self) -> SlotState {
        match self {
            Slot::Idle => SlotState::Idle,
            Slot::Connecting { .. } => SlotState::Connecting,
            Slot::Authenticating(_) => SlotState::Authenticating,
            Slot::Active(_) => SlotState::Active,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Open,
    Closed,
}

#[derive(Debug, Clone)]
enum Request {
    Auth,
    Subscribe(SubscriptionKey),
    Unsubscribe(SubscriptionKey),
    Ping,
}

#[derive(Debug)]
struct Pending {
    side: Side,
    request: Request,
    sent: Instant,
}

#[derive(Debug)]
enum Change {
    Added(SubscriptionKey),
    Removed(SubscriptionKey),
}

/// What to do once the connection lock is released.
enum Plan {
    Nothing,
    Send(UpstreamSender, Vec<String>),
    Dial(u64),
    Redial {
        old: Option<Upstream>,
        generation: u64,
        streams: Vec<String>,
    },
    Retire(Upstream),
}

struct ConnectionInner {
    lifecycle: Lifecycle,
    clients: HashMap<SessionId, ClientSink>,
    public_keys: Interests,
    private_keys: Interests,
    public: Slot,
    private: Slot,
    next_id: u64,
    generation: u64,
    pending: HashMap<u64, Pending>,
    /// Active keys the exchange refused to subscribe.
    rejected: HashSet<SubscriptionKey>,
}

impl ConnectionInner {
    fn slot(&self, side: Side) -> &Slot {
        match side {
            Side::Public => &self.public,
            Side::Private => &self.private,
        }
    }

    fn replace_slot(&mut self, side: Side, slot: Slot) -> Slot {
        match side {
            Side::Public => std::mem::replace(&mut self.public, slot),
            Side::Private => std::mem::replace(&mut self.private, slot),
        }
    }

    fn interests(&self, side: Side) -> &Interests {
        match side {
            Side::Public => &self.public_keys,
            Side::Private => &self.private_keys,
        }
    }

    fn interests_mut(&mut self, side: Side) -> &mut Interests {
        match side {
            Side::Public => &mut self.public_keys,
            Side::Private => &mut self.private_keys,
        }
    }

    fn next_generation(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }

    fn track(&mut self, side: Side, request: Request) -> u64 {
        self.next_id += 1;
        let id = self.next_id;
        self.pending.insert(
            id,
            Pending {
                side,
                request,
                sent: Instant::now(),
            },
        );
        id
    }

    /// Forget requests on `side` the exchange never answered: anything older
    /// than `max_age`, and any earlier ping, which the next one supersedes.
    fn prune_pending(&mut self, side: Side, max_age: Duration) {
        self.pending.retain(|_, p| {
            p.side != side || (p.sent.elapsed() < max_age && !matches!(p.request, Request::Ping))
        });
    }

    /// True when an already-active key has no working upstream subscription,
    /// so a repeated subscribe should try again.
    fn needs_retry(&mut self, side: Side, key: &SubscriptionKey) -> bool {
        let rejected = self.rejected.remove(key);
        rejected || matches!(self.slot(side), Slot::Idle)
    }
}

fn side_of(key: &SubscriptionKey) -> Side {
    if key.is_private() {
        Side::Private
    } else {
        Side::Public
    }
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

/// Upstream sockets and subscription state for one credential set.
pub struct ExchangeConnection {
    credentials: CredentialSet,
    adapter: Arc<dyn ProtocolAdapter>,
    settings: GatewaySettings,
    http: reqwest::Client,
    done: watch::Sender<bool>,
    inner: RwLock<ConnectionInner>,
}

impl ExchangeConnection {
    pub fn new(
        credentials: CredentialSet,
        adapter: Arc<dyn ProtocolAdapter>,
        settings: GatewaySettings,
        http: reqwest::Client,
    ) -> Self {
        let (done, _) = watch::channel(false);
        Self {
            credentials,
            adapter,
            settings,
            http,
            done,
            inner: RwLock::new(ConnectionInner {
                lifecycle: Lifecycle::Open,
                clients: HashMap::new(),
                public_keys: Interests::default(),
                private_keys: Interests::default(),
                public: Slot::Idle,
                private: Slot::Idle,
                next_id: 0,
                generation: 0,
                pending: HashMap::new(),
                rejected: HashSet::new(),
            }),
        }
    }

    pub fn credential_id(&self) -> &str {
        &self.credentials.id
    }

    pub fn platform(&self) -> Platform {
        self.credentials.platform
    }

    pub fn adapter(&self) -> &dyn ProtocolAdapter {
        self.adapter.as_ref()
    }

    /// Fires once when the connection closes.
    pub fn done_signal(&self) -> watch::Receiver<bool> {
        self.done.subscribe()
    }

    pub async fn is_closed(&self) -> bool {
        self.inner.read().await.lifecycle == Lifecycle::Closed
    }

    pub async fn client_count(&self) -> usize {
        self.inner.read().await.clients.len()
    }

    /// Active keys on one side, in canonical string form.
    pub async fn active_keys(&self, side: Side) -> Vec<String> {
        let inner = self.inner.read().await;
        inner
            .interests(side)
            .keys()
            .iter()
            .map(|k| k.to_string())
            .collect()
    }

    pub async fn slot_state(&self, side: Side) -> SlotState {
        let inner = self.inner.read().await;
        if inner.lifecycle == Lifecycle::Closed {
            return SlotState::Closed;
        }
        inner.slot(side).state()
    }

    /// Attach a client. False if the connection already closed.
    pub async fn attach(&self, sink: ClientSink) -> bool {
        let mut inner = self.inner.write().await;
        if inner.lifecycle == Lifecycle::Closed {
            return false;
        }
        inner.clients.insert(sink.id(), sink);
        true
    }

    /// Detach a client and release its interests. Returns true when this
    /// was the last client and the connection is now closed.
    pub async fn detach(self: &Arc<Self>, session: SessionId) -> bool {
        let (public, private, closing) = {
            let mut inner = self.inner.write().await;
            if inner.lifecycle == Lifecycle::Closed || inner.clients.remove(&session).is_none() {
                return false;
            }
            let public = inner.public_keys.release(session);
            let private = inner.private_keys.release(session);
            let closing = inner
                .clients
                .is_empty()
                .then(|| self.close_locked(&mut inner));
            (public, private, closing)
        };

        if let Some(upstreams) = closing {
            for up in upstreams {
                self.retire(up).await;
            }
            info!(
                credential = %self.credentials.id,
                platform = %self.credentials.platform,
                "Exchange connection closed, no clients left"
            );
            return true;
        }

        self.apply_removals(Side::Public, public).await;
        self.apply_removals(Side::Private, private).await;
        false
    }

    /// Close both sockets and fire the done signal. Idempotent.
    pub async fn close(&self) {
        let upstreams = {
            let mut inner = self.inner.write().await;
            if inner.lifecycle == Lifecycle::Closed {
                return;
            }
            inner.clients.clear();
            self.close_locked(&mut inner)
        };
        for up in upstreams {
            self.retire(up).await;
        }
        info!(credential = %self.credentials.id, "Exchange connection closed");
    }

    /// The Open -> Closed transition. Must run under the connection lock.
    fn close_locked(&self, inner: &mut ConnectionInner) -> Vec<Upstream> {
        inner.lifecycle = Lifecycle::Closed;
        self.done.send_replace(true);
        inner.pending.clear();
        let public = inner.replace_slot(Side::Public, Slot::Idle);
        let private = inner.replace_slot(Side::Private, Slot::Idle);
        public
            .into_upstream()
            .into_iter()
            .chain(private.into_upstream())
            .collect()
    }

    /// Close an upstream and release its stream token, if any.
    async fn retire(&self, up: Upstream) {
        up.close();
        if let Some(token) = &up.token {
            if let Err(e) = self
                .adapter
                .close_private_stream(&self.http, &self.credentials, token)
                .await
            {
                warn!(credential = %self.credentials.id, error = %e, "Failed to release stream token");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Subscription changes
    // -----------------------------------------------------------------------

    /// Register `session`'s interest in `key`, opening or extending the upstream
    /// subscription if nobody held it yet.
    pub async fn subscribe(
        self: &Arc<Self>,
        session: SessionId,
        key: SubscriptionKey,
    ) -> Result<(), GatewayError> {
        let side = side_of(&key);
        let plan = {
            let mut inner = self.inner.write().await;
            if inner.lifecycle == Lifecycle::Closed {
                return Err(GatewayError::NotConnected);
            }
            if inner.interests_mut(side).add(key.clone(), session) {
                debug!(credential = %self.credentials.id, key = %key, "Key activated");
            } else if inner.needs_retry(side, &key) {
                debug!(credential = %self.credentials.id, key = %key, "Retrying key with no upstream");
            } else {
                return Ok(());
            }
            self.plan_change(&mut inner, side, Change::Added(key))?
        };
        self.run_plan(side, plan).await;
        Ok(())
    }

    /// Drop `session`'s interest in `key`. The upstream unsubscribe only
    /// happens once no attached session wants the key.
    pub async fn unsubscribe(
        self: &Arc<Self>,
        session: SessionId,
        key: &SubscriptionKey,
    ) -> Result<(), GatewayError> {
        let side = side_of(key);
        let plan = {
            let mut inner = self.inner.write().await;
            if inner.lifecycle == Lifecycle::Closed {
                return Err(GatewayError::NotConnected);
            }
            if !inner.interests_mut(side).remove(key, session) {
                return Ok(());
            }
            debug!(credential = %self.credentials.id, key = %key, "Key deactivated");
            self.plan_change(&mut inner, side, Change::Removed(key.clone()))?
        };
        self.run_plan(side, plan).await;
        Ok(())
    }

    async fn apply_removals(self: &Arc<Self>, side: Side, mut keys: Vec<SubscriptionKey>) {
        if keys.is_empty() {
            return;
        }
        let stateless = self.adapter.style() == ProtocolStyle::StatelessReconnect;
        let plans = {
            let mut inner = self.inner.write().await;
            if inner.lifecycle == Lifecycle::Closed {
                return;
            }
            if stateless {
                // One redial covers every released key.
                match keys.pop() {
                    Some(key) => vec![self.plan_change(&mut inner, side, Change::Removed(key))],
                    None => Vec::new(),
                }
            } else {
                keys.into_iter()
                    .map(|key| self.plan_change(&mut inner, side, Change::Removed(key)))
                    .collect()
            }
        };
        for plan in plans {
            match plan {
                Ok(plan) => self.run_plan(side, plan).await,
                Err(e) => warn!(credential = %self.credentials.id, error = %e, "Failed to release key"),
            }
        }
    }

    /// Decide the wire effect of one interest change. Runs under the lock.
    fn plan_change(
        &self,
        inner: &mut ConnectionInner,
        side: Side,
        change: Change,
    ) -> Result<Plan, GatewayError> {
        if let Change::Removed(key) = &change {
            inner.rejected.remove(key);
        }
        let plan = match (self.adapter.style(), side) {
            (ProtocolStyle::StatelessReconnect, Side::Public) => self.plan_resync(inner)?,
            (ProtocolStyle::StatelessReconnect, Side::Private) => match change {
                Change::Added(_) => match inner.private {
                    Slot::Idle => {
                        let generation = inner.next_generation();
                        inner.private = Slot::Connecting { generation };
                        Plan::Dial(generation)
                    }
                    _ => Plan::Nothing,
                },
                Change::Removed(_) if inner.private_keys.is_empty() => {
                    match inner.replace_slot(Side::Private, Slot::Idle).into_upstream() {
                        Some(up) => Plan::Retire(up),
                        None => Plan::Nothing,
                    }
                }
                Change::Removed(_) => Plan::Nothing,
            },
            (ProtocolStyle::PersistentRpc, _) => match change {
                Change::Added(key) => match inner.slot(side) {
                    Slot::Active(up) => {
                        let sender = up.sender();
                        let text = self.rpc_frame(inner, side, &key, true)?;
                        Plan::Send(sender, vec![text])
                    }
                    Slot::Idle => {
                        let generation = inner.next_generation();
                        inner.replace_slot(side, Slot::Connecting { generation });
                        Plan::Dial(generation)
                    }
                    // Picked up by the flush after the dial or auth completes.
                    Slot::Connecting { .. } | Slot::Authenticating(_) => Plan::Nothing,
                },
                Change::Removed(key) => match inner.slot(side) {
                    Slot::Active(up) => {
                        let sender = up.sender();
                        let text = self.rpc_frame(inner, side, &key, false)?;
                        Plan::Send(sender, vec![text])
                    }
                    _ => Plan::Nothing,
                },
            },
        };
        Ok(plan)
    }

    /// Stateless public socket: the stream set lives in the URL, so any
    /// change means closing the old socket and dialing the new set.
    fn plan_resync(&self, inner: &mut ConnectionInner) -> Result<Plan, GatewayError> {
        let mut streams = Vec::new();
        for key in inner.public_keys.keys() {
            if let WireRequest::Stream(name) = self.adapter.build_subscribe(&key, 0)? {
                streams.push(name);
            }
        }
        let generation = inner.next_generation();
        let next = if streams.is_empty() {
            Slot::Idle
        } else {
            Slot::Connecting { generation }
        };
        let old = inner.replace_slot(Side::Public, next).into_upstream();
        Ok(Plan::Redial {
            old,
            generation,
            streams,
        })
    }

    fn rpc_frame(
        &self,
        inner: &mut ConnectionInner,
        side: Side,
        key: &SubscriptionKey,
        subscribe: bool,
    ) -> Result<String, GatewayError> {
        let request = if subscribe {
            Request::Subscribe(key.clone())
        } else {
            Request::Unsubscribe(key.clone())
        };
        let id = inner.track(side, request);
        let wire = if subscribe {
            self.adapter.build_subscribe(key, id)?
        } else {
            self.adapter.build_unsubscribe(key, id)?
        };
        match wire {
            WireRequest::Rpc { text, .. } => Ok(text),
            WireRequest::Stream(name) => Ok(name),
            WireRequest::None => Err(GatewayError::InvalidRequest(format!(
                "{} has no wire form",
                key
            ))),
        }
    }

    /// Carry out a plan outside the lock. Upstream failures are surfaced to
    /// every attached client.
    async fn run_plan(self: &Arc<Self>, side: Side, plan: Plan) {
        if let Err(e) = self.execute(side, plan).await {
            warn!(
                credential = %self.credentials.id,
                side = %side,
                error = %e,
                "Upstream change failed"
            );
            self.fan_out(&NormalizedMessage::error(
                Some(self.credentials.platform),
                format!("{} stream: {}", side, e),
            ))
            .await;
        }
    }

    async fn execute(self: &Arc<Self>, side: Side, plan: Plan) -> Result<(), GatewayError> {
        match plan {
            Plan::Nothing => Ok(()),
            Plan::Send(sender, frames) => {
                for text in frames {
                    sender.send_text(text);
                }
                Ok(())
            }
            Plan::Retire(up) => {
                self.retire(up).await;
                Ok(())
            }
            Plan::Redial {
                old,
                generation,
                streams,
            } => {
                if let Some(up) = old {
                    self.retire(up).await;
                }
                if streams.is_empty() {
                    debug!(credential = %self.credentials.id, "No public streams left");
                    return Ok(());
                }
                let url = self.adapter.public_url(&self.credentials.endpoints, &streams);
                self.dial_and_install(side, generation, url, None).await
            }
            Plan::Dial(generation) => {
                let token = if side == Side::Private {
                    match self
                        .adapter
                        .open_private_stream(&self.http, &self.credentials)
                        .await
                    {
                        Ok(token) => token,
                        Err(e) => {
                            self.abandon(side, generation).await;
                            return Err(e.into());
                        }
                    }
                } else {
                    None
                };
                let url = match side {
                    Side::Public => self.adapter.public_url(&self.credentials.endpoints, &[]),
                    Side::Private => self
                        .adapter
                        .private_url(&self.credentials.endpoints, token.as_deref()),
                };
                self.dial_and_install(side, generation, url, token).await
            }
        }
    }

    async fn dial_and_install(
        self: &Arc<Self>,
        side: Side,
        generation: u64,
        url: String,
        token: Option<String>,
    ) -> Result<(), GatewayError> {
        match dial(&url, self.settings.dial_timeout(), generation).await {
            Ok((mut up, reader)) => {
                up.token = token;
                self.install(side, up, reader).await;
                Ok(())
            }
            Err(e) => {
                self.abandon(side, generation).await;
                if let Some(token) = token {
                    if let Err(e) = self
                        .adapter
                        .close_private_stream(&self.http, &self.credentials, &token)
                        .await
                    {
                        warn!(credential = %self.credentials.id, error = %e, "Failed to release stream token");
                    }
                }
                Err(e)
            }
        }
    }

    /// A dial failed: return the slot to Idle unless a newer dial took over.
    async fn abandon(&self, side: Side, generation: u64) {
        let mut inner = self.inner.write().await;
        if matches!(inner.slot(side), Slot::Connecting { generation: g } if *g == generation) {
            inner.replace_slot(side, Slot::Idle);
        }
    }

    /// Put a freshly dialed socket into its slot, flush what it needs, and
    /// start its tasks. A socket from a superseded dial is closed instead.
    async fn install(self: &Arc<Self>, side: Side, up: Upstream, reader: UpstreamReader) {
        let generation = up.generation;
        let sender = up.sender();
        let stop = up.stop_signal();
        let token = up.token.clone();

        let frames = {
            let mut inner = self.inner.write().await;
            let current = matches!(inner.slot(side), Slot::Connecting { generation: g } if *g == generation);
            if inner.lifecycle == Lifecycle::Closed || !current {
                drop(inner);
                debug!(credential = %self.credentials.id, generation, "Discarding stale upstream");
                self.retire(up).await;
                return;
            }

            match (self.adapter.style(), side) {
                (ProtocolStyle::PersistentRpc, Side::Private) => {
                    let id = inner.track(side, Request::Auth);
                    match self.adapter.build_auth(&self.credentials, id) {
                        Some(auth) => {
                            inner.replace_slot(side, Slot::Authenticating(up));
                            vec![auth]
                        }
                        None => {
                            inner.pending.remove(&id);
                            inner.replace_slot(side, Slot::Active(up));
                            self.flush_locked(&mut inner, side)
                        }
                    }
                }
                (ProtocolStyle::PersistentRpc, Side::Public) => {
                    inner.replace_slot(side, Slot::Active(up));
                    self.flush_locked(&mut inner, side)
                }
                (ProtocolStyle::StatelessReconnect, _) => {
                    inner.replace_slot(side, Slot::Active(up));
                    Vec::new()
                }
            }
        };

        for text in frames {
            sender.send_text(text);
        }
        info!(
            credential = %self.credentials.id,
            platform = %self.credentials.platform,
            side = %side,
            generation,
            "Upstream installed"
        );

        self.spawn_reader(side, generation, reader, stop.clone());
        if let Some(period) = self.adapter.keepalive_interval() {
            self.spawn_keepalive(side, generation, period, stop.clone());
        }
        if let Some(token) = token {
            self.spawn_rearm(side, generation, token, stop);
        }
    }

    /// Subscribe frames for every active key on `side`. Runs under the lock.
    fn flush_locked(&self, inner: &mut ConnectionInner, side: Side) -> Vec<String> {
        inner.rejected.retain(|key| side_of(key) != side);
        let mut frames = Vec::new();
        for key in inner.interests(side).keys() {
            match self.rpc_frame(inner, side, &key, true) {
                Ok(text) => frames.push(text),
                Err(e) => warn!(key = %key, error = %e, "Cannot build subscribe"),
            }
        }
        frames
    }

    // -----------------------------------------------------------------------
    // Inbound
    // -----------------------------------------------------------------------

    fn spawn_reader(
        self: &Arc<Self>,
        side: Side,
        generation: u64,
        mut reader: UpstreamReader,
        mut stop: watch::Receiver<bool>,
    ) {
        let conn = Arc::clone(self);
        let mut done = self.done.subscribe();
        tokio::spawn(async move {
            if *stop.borrow_and_update() || *done.borrow_and_update() {
                return;
            }
            let lost = loop {
                tokio::select! {
                    _ = stop.changed() => break None,
                    _ = done.changed() => break None,
                    frame = reader.next() => match frame {
                        Some(Ok(Message::Text(text))) => conn.handle_frame(side, Frame::Text(&text)).await,
                        Some(Ok(Message::Binary(bytes))) => conn.handle_frame(side, Frame::Binary(&bytes)).await,
                        Some(Ok(Message::Close(frame))) => {
                            break Some(match frame {
                                Some(f) => format!("closed by exchange: {} {}", u16::from(f.code), f.reason),
                                None => "closed by exchange".to_string(),
                            });
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => break Some(e.to_string()),
                        None => break Some("stream ended".to_string()),
                    },
                }
            };
            if let Some(reason) = lost {
                conn.on_upstream_lost(side, generation, reason).await;
            }
        });
    }

    async fn handle_frame(self: &Arc<Self>, side: Side, frame: Frame<'_>) {
        for item in self.adapter.parse_inbound(frame) {
            match item {
                Inbound::Message(msg) => self.fan_out(&msg).await,
                Inbound::Response { id, error } => self.on_response(side, id, error).await,
            }
        }
    }

    async fn on_response(self: &Arc<Self>, side: Side, id: u64, error: Option<String>) {
        let pending = {
            let mut inner = self.inner.write().await;
            let pending = inner.pending.remove(&id);
            // A refused key stays wanted; remember it so a repeat subscribe resends.
            if let Some(Pending {
                request: Request::Subscribe(key),
                ..
            }) = &pending
            {
                if error.is_some() && inner.interests(side).contains(key) {
                    inner.rejected.insert(key.clone());
                }
            }
            pending
        };
        let platform = Some(self.credentials.platform);
        match (pending.map(|p| p.request), error) {
            (Some(Request::Auth), None) => self.on_authenticated().await,
            (Some(Request::Auth), Some(err)) => self.on_auth_failed(err).await,
            (Some(Request::Subscribe(key)), Some(err)) => {
                warn!(credential = %self.credentials.id, key = %key, error = %err, "Subscribe rejected");
                self.fan_out(
                    &NormalizedMessage::error(platform, format!("subscribe {} failed: {}", key, err))
                        .with_symbol(key.symbol.clone()),
                )
                .await;
            }
            (Some(Request::Unsubscribe(key)), Some(err)) => {
                debug!(key = %key, error = %err, "Unsubscribe rejected");
            }
            (Some(Request::Ping), Some(err)) => {
                warn!(credential = %self.credentials.id, side = %side, error = %err, "Keepalive rejected");
            }
            (None, Some(err)) => {
                self.fan_out(&NormalizedMessage::error(platform, err)).await;
            }
            (_, None) => debug!(id, side = %side, "Request acknowledged"),
        }
    }

    async fn on_authenticated(&self) {
        let flush = {
            let mut inner = self.inner.write().await;
            match inner.replace_slot(Side::Private, Slot::Idle) {
                Slot::Authenticating(up) => {
                    let sender = up.sender();
                    inner.replace_slot(Side::Private, Slot::Active(up));
                    Some((sender, self.flush_locked(&mut inner, Side::Private)))
                }
                other => {
                    inner.replace_slot(Side::Private, other);
                    None
                }
            }
        };
        if let Some((sender, frames)) = flush {
            info!(
                credential = %self.credentials.id,
                keys = frames.len(),
                "Private stream authenticated"
            );
            for text in frames {
                sender.send_text(text);
            }
        }
    }

    async fn on_auth_failed(&self, err: String) {
        let failed = {
            let mut inner = self.inner.write().await;
            match inner.replace_slot(Side::Private, Slot::Idle) {
                Slot::Authenticating(up) => Some(up),
                other => {
                    inner.replace_slot(Side::Private, other);
                    None
                }
            }
        };
        if let Some(up) = failed {
            warn!(credential = %self.credentials.id, error = %err, "Private stream authentication failed");
            self.retire(up).await;
            self.fan_out(&NormalizedMessage::error(
                Some(self.credentials.platform),
                format!("authentication failed: {}", err),
            ))
            .await;
        }
    }

    /// Send a message to every attached client.
    pub async fn fan_out(&self, msg: &NormalizedMessage) {
        let sinks: Vec<ClientSink> = {
            let inner = self.inner.read().await;
            inner.clients.values().cloned().collect()
        };
        if sinks.is_empty() {
            return;
        }
        let text: Utf8Bytes = msg.to_json().into();
        for sink in sinks {
            if !sink.send_text(text.clone()) {
                debug!(session = %sink.id(), "Client channel closed during fan-out");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Failure and background tasks
    // -----------------------------------------------------------------------

    async fn on_upstream_lost(self: &Arc<Self>, side: Side, generation: u64, reason: String) {
        let lost = {
            let mut inner = self.inner.write().await;
            if inner.lifecycle == Lifecycle::Closed || !inner.slot(side).is_generation(generation) {
                None
            } else {
                inner.pending.retain(|_, p| p.side != side);
                inner.replace_slot(side, Slot::Idle).into_upstream()
            }
        };
        let Some(up) = lost else {
            return;
        };
        warn!(
            credential = %self.credentials.id,
            side = %side,
            reason = %reason,
            "Upstream connection lost"
        );
        self.retire(up).await;
        self.fan_out(&NormalizedMessage::error(
            Some(self.credentials.platform),
            format!("{} stream disconnected: {}", side, reason),
        ))
        .await;
        self.reconnect(side).await;
    }

    /// Bounded reconnect with exponential backoff, replaying the active keys.
    async fn reconnect(self: &Arc<Self>, side: Side) {
        let attempts = self.settings.reconnect_attempts;
        let mut done = self.done.subscribe();
        for attempt in 1..=attempts {
            tokio::select! {
                _ = tokio::time::sleep(self.settings.reconnect_delay(attempt)) => {}
                _ = done.changed() => return,
            }

            let plan = {
                let mut inner = self.inner.write().await;
                if inner.lifecycle == Lifecycle::Closed
                    || inner.interests(side).is_empty()
                    || !matches!(inner.slot(side), Slot::Idle)
                {
                    return;
                }
                match (self.adapter.style(), side) {
                    (ProtocolStyle::StatelessReconnect, Side::Public) => self.plan_resync(&mut inner),
                    _ => {
                        let generation = inner.next_generation();
                        inner.replace_slot(side, Slot::Connecting { generation });
                        Ok(Plan::Dial(generation))
                    }
                }
            };

            let result = match plan {
                Ok(plan) => self.execute(side, plan).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => {
                    info!(credential = %self.credentials.id, side = %side, attempt, "Upstream reconnected");
                    return;
                }
                Err(e) => warn!(
                    credential = %self.credentials.id,
                    side = %side,
                    attempt,
                    error = %e,
                    "Reconnect attempt failed"
                ),
            }
        }
        if attempts > 0 {
            self.fan_out(&NormalizedMessage::error(
                Some(self.credentials.platform),
                format!("{} stream unavailable after {} attempts", side, attempts),
            ))
            .await;
        }
    }

    fn spawn_keepalive(
        self: &Arc<Self>,
        side: Side,
        generation: u64,
        period: Duration,
        mut stop: watch::Receiver<bool>,
    ) {
        let conn = Arc::clone(self);
        let mut done = self.done.subscribe();
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = stop.changed() => break,
                    _ = done.changed() => break,
                    _ = ticker.tick() => {
                        if !conn.send_ping(side, generation).await {
                            break;
                        }
                    }
                }
            }
        });
    }

    async fn send_ping(&self, side: Side, generation: u64) -> bool {
        let ping = {
            let mut inner = self.inner.write().await;
            let Some(sender) = inner
                .slot(side)
                .upstream()
                .filter(|up| up.generation == generation)
                .map(Upstream::sender)
            else {
                return false;
            };
            inner.prune_pending(side, self.settings.pong_wait());
            let id = inner.track(side, Request::Ping);
            match self.adapter.build_ping(id) {
                Some(text) => (sender, text),
                None => {
                    inner.pending.remove(&id);
                    return false;
                }
            }
        };
        let (sender, text) = ping;
        sender.send_text(text)
    }

    /// Renew an out-of-band stream token until the socket closes. A failed
    /// renewal drops the socket so the reconnect path opens a fresh token.
    fn spawn_rearm(
        self: &Arc<Self>,
        side: Side,
        generation: u64,
        token: String,
        mut stop: watch::Receiver<bool>,
    ) {
        let conn = Arc::clone(self);
        let mut done = self.done.subscribe();
        let period = self.settings.listen_key_renew();
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = stop.changed() => break,
                    _ = done.changed() => break,
                    _ = ticker.tick() => {
                        match conn.adapter.renew_private_stream(&conn.http, &conn.credentials, &token).await {
                            Ok(()) => debug!(credential = %conn.credentials.id, "Stream token renewed"),
                            Err(e) => {
                                warn!(credential = %conn.credentials.id, error = %e, "Stream token renewal failed");
                                let reason = format!("stream token renewal failed: {}", e);
                                conn.on_upstream_lost(side, generation, reason).await;
                                break;
                            }
                        }
                    }
                }
            }
        });
    }
}
