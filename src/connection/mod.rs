//! Connection lifecycle: token registry, per-user-connection state
//! machine, CQI scheduling, and flood protection for inbound connection
//! requests.
//!
//! Modelled on the teacher's `PeerSession` state machine in `peer.rs`: a
//! small `State` enum with a `Disconnected` default, a `Status` holding
//! session bookkeeping, and explicit transitions driven by the owning
//! manager rather than by the connection itself.

mod flood;
mod token;

pub use flood::FloodGuard;
pub use token::{ExpectedConnection, TokenRegistry};

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::time::{Duration, Instant};

use crate::conf::ConnectionConf;
use crate::events::{ConnectionEvent, ConnectionEventBus, ConnectionEventReceiver};
use crate::{error::Error, DownloadType, HintedUser, Token};

/// At any given time a connection to a user is in one of these states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    /// No TCP connection exists yet; we are waiting for either side to
    /// connect (an expected-connection entry is outstanding).
    Disconnected,
    /// The TCP connection is being established.
    Connecting,
    /// The ADC/NMDC handshake (`MyNick`/`INF` exchange, supports/key
    /// negotiation) is in progress.
    Handshaking,
    /// Handshake complete; normal file-list/file-transfer messages may be
    /// exchanged.
    Connected,
    /// A transfer is actively in progress on this connection.
    Transferring,
}

impl Default for State {
    fn default() -> Self {
        State::Disconnected
    }
}

/// Per-connection session state, owned by the `ConnectionManager`.
#[derive(Clone, Debug)]
pub struct UserConnection {
    pub token: Token,
    pub user: Option<HintedUser>,
    pub state: State,
    pub download_type: DownloadType,
    /// True once this connection has proven itself capable of opening
    /// additional parallel connections to the same user (MCN).
    pub supports_mcn: bool,
    pub secure: bool,
}

impl UserConnection {
    pub fn new(token: Token) -> Self {
        Self {
            token,
            user: None,
            state: State::default(),
            download_type: DownloadType::Any,
            supports_mcn: false,
            secure: false,
        }
    }

    pub fn transition(&mut self, next: State) -> Result<(), Error> {
        let valid = matches!(
            (self.state, next),
            (State::Disconnected, State::Connecting)
                | (State::Connecting, State::Handshaking)
                | (State::Handshaking, State::Connected)
                | (State::Connected, State::Transferring)
                | (State::Transferring, State::Connected)
                | (_, State::Disconnected)
        );
        if !valid {
            return Err(Error::ProtocolViolation(crate::error::ProtocolError::Malformed(format!(
                "invalid transition {:?} -> {:?}",
                self.state, next
            ))));
        }
        self.state = next;
        Ok(())
    }
}

/// What role a [`ConnectionQueueItem`] wants to serve (spec.md §3.2).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnType {
    Download,
    Upload,
    Pm,
}

/// A CQI's place in its own small state machine: queued, attempting, or
/// carrying live traffic (spec.md §4.5).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CqiState {
    Waiting,
    Connecting,
    Active,
}

/// A connection queue item (CQI): a request to connect to a user that has
/// not yet resulted in a live [`UserConnection`] (spec.md §3.2, §3.4).
/// One CQI represents the *intent* to have a connection of a given kind
/// to a given user; the live `UserConnection` is tracked separately and
/// associated with the CQI via `token` once the handshake completes.
#[derive(Clone, Debug)]
pub struct ConnectionQueueItem {
    pub token: Token,
    pub user: HintedUser,
    pub conn_type: ConnType,
    pub state: CqiState,
    pub download_type: DownloadType,
    /// `>0`: soft-failure count, backed off `60s * errors` before retry.
    /// `-1`: a hard error occurred; never retried until the user
    /// reconnects and a fresh CQI is queued.
    pub errors: i32,
    pub last_attempt: Instant,
    /// Last time bytes flowed on the associated UserConnection; drives
    /// the 50s no-progress timeout while `state == Active`.
    pub last_progress: Instant,
    pub max_remote_conns: u8,
    pub hub_url: String,
    pub running: bool,
    pub mcn: bool,
}

impl ConnectionQueueItem {
    fn new(token: Token, user: HintedUser, conn_type: ConnType, download_type: DownloadType, hub_url: String, now: Instant) -> Self {
        Self {
            token,
            user,
            conn_type,
            state: CqiState::Waiting,
            download_type,
            errors: 0,
            last_attempt: now,
            last_progress: now,
            max_remote_conns: 0,
            hub_url,
            running: false,
            mcn: false,
        }
    }

    /// Soft-error backoff per spec.md §4.5: `60s * max(1, errors)` since
    /// the last attempt. A hard error (`errors == -1`) is never due.
    fn is_due(&self, now: Instant) -> bool {
        if self.errors < 0 {
            return false;
        }
        if self.errors == 0 {
            return true;
        }
        let backoff = Duration::from_secs(60) * self.errors.max(1) as u32;
        now.duration_since(self.last_attempt) >= backoff
    }
}

/// No progress on an ACTIVE CQI for this long triggers a timeout back to
/// WAITING (spec.md §4.5, §5 "CQI connect attempt timeout: 50s").
pub const CQI_PROGRESS_TIMEOUT: Duration = Duration::from_secs(50);

/// Aggregates the pieces needed to take a connection from "we'd like to
/// reach this user" through to a live, handshaked [`UserConnection`]:
/// the CQI table, the expected-connection token table, flood protection,
/// and the set of connections currently live. Owned by
/// [`crate::context::AppContext`].
pub struct ConnectionManager {
    conf: ConnectionConf,
    expected: TokenRegistry,
    flood: FloodGuard,
    live: HashMap<Token, UserConnection>,
    cqis: HashMap<Token, ConnectionQueueItem>,
    /// IPs that have proven MCN support, exempted from the normal flood
    /// severe threshold in favor of `flood_mcn_limit` (spec.md §4.5).
    mcn_peers: HashSet<IpAddr>,
    events: ConnectionEventBus,
    next_token_id: u64,
}

impl ConnectionManager {
    pub fn new(conf: ConnectionConf) -> Self {
        let flood = FloodGuard::new(conf.flood_minor_threshold, conf.flood_severe_threshold, conf.flood_mcn_limit, conf.flood_period);
        Self {
            conf,
            expected: TokenRegistry::new(),
            flood,
            live: HashMap::new(),
            cqis: HashMap::new(),
            mcn_peers: HashSet::new(),
            events: ConnectionEventBus::new(),
            next_token_id: 0,
        }
    }

    pub fn subscribe(&mut self) -> ConnectionEventReceiver {
        self.events.subscribe()
    }

    fn mint_token(&mut self) -> Token {
        self.next_token_id += 1;
        format!("cqi{:x}", self.next_token_id)
    }

    /// Queues the intent to connect to `user` (spec.md §3.4 invariant 5:
    /// at most one `download`-type CQI per user unless MCN mode is
    /// active for them). Returns `None` if a CQI of this `conn_type`
    /// already exists for the user and `download_type` isn't one of the
    /// MCN-expansion types.
    pub fn queue_cqi(&mut self, user: HintedUser, conn_type: ConnType, download_type: DownloadType, hub_url: impl Into<String>, now: Instant) -> Option<Token> {
        if conn_type == ConnType::Download && matches!(download_type, DownloadType::Any) {
            let already = self.cqis.values().any(|c| c.conn_type == ConnType::Download && c.user.user.cid == user.user.cid);
            if already {
                return None;
            }
        }
        let token = self.mint_token();
        self.cqis.insert(token.clone(), ConnectionQueueItem::new(token.clone(), user, conn_type, download_type, hub_url.into(), now));
        Some(token)
    }

    pub fn cqi(&self, token: &str) -> Option<&ConnectionQueueItem> {
        self.cqis.get(token)
    }

    /// The once-a-second CQI attempt scheduler (spec.md §5 "CQI attempt
    /// scheduling"): picks up to `per_tick_limit` WAITING CQIs whose
    /// backoff has elapsed, transitions them to CONNECTING, and
    /// registers an expected-connection entry for each so an inbound
    /// handshake can be matched back to it. Returns the tokens the
    /// caller should now actually dial via the hub client.
    pub fn due_attempts(&mut self, now: Instant, per_tick_limit: usize) -> Vec<(Token, HintedUser, String)> {
        let mut due: Vec<Token> = self
            .cqis
            .values()
            .filter(|c| c.state == CqiState::Waiting && c.is_due(now))
            .map(|c| c.token.clone())
            .collect();
        due.sort();
        due.truncate(per_tick_limit);

        let mut dialed = Vec::new();
        for token in due {
            let cqi = match self.cqis.get_mut(&token) {
                Some(c) => c,
                None => continue,
            };
            cqi.state = CqiState::Connecting;
            cqi.last_attempt = now;
            let _ = self.expected.register(token.clone(), cqi.user.clone(), cqi.download_type, now);
            dialed.push((token, cqi.user.clone(), cqi.hub_url.clone()));
        }
        dialed
    }

    /// Records a soft or hard failure on `token`'s CQI (spec.md §4.5
    /// "Failure policy per CQI"). Soft failures increment `errors` and
    /// return to WAITING to be retried after backoff; hard failures set
    /// `errors = -1`, parked until the user reconnects.
    pub fn fail_cqi(&mut self, token: &str, hard: bool) {
        if let Some(cqi) = self.cqis.get_mut(token) {
            cqi.errors = if hard { -1 } else { cqi.errors.max(0) + 1 };
            cqi.state = CqiState::Waiting;
            cqi.running = false;
        }
        self.expected.take(token);
    }

    /// Marks `token`'s CQI ACTIVE once its handshake has completed and
    /// the matching `UserConnection` exists (spec.md §4.5 "Association":
    /// `WAITING → ACTIVE`).
    pub fn activate_cqi(&mut self, token: &str, now: Instant) {
        if let Some(cqi) = self.cqis.get_mut(token) {
            cqi.state = CqiState::Active;
            cqi.running = true;
            cqi.errors = 0;
            cqi.last_progress = now;
        }
    }

    /// Call whenever bytes flow on a CQI's connection, resetting its
    /// no-progress timeout.
    pub fn note_cqi_progress(&mut self, token: &str, now: Instant) {
        if let Some(cqi) = self.cqis.get_mut(token) {
            cqi.last_progress = now;
        }
    }

    pub fn remove_cqi(&mut self, token: &str) -> Option<ConnectionQueueItem> {
        self.cqis.remove(token)
    }

    /// Times out ACTIVE CQIs that haven't made progress for
    /// [`CQI_PROGRESS_TIMEOUT`], returning them to WAITING with
    /// `errors++` (spec.md §4.5). Returns the affected tokens so the
    /// caller can also tear down the stalled `UserConnection`.
    pub fn sweep_cqi_timeouts(&mut self, now: Instant) -> Vec<Token> {
        let mut timed_out = Vec::new();
        for cqi in self.cqis.values_mut() {
            if cqi.state == CqiState::Active && now.duration_since(cqi.last_progress) > CQI_PROGRESS_TIMEOUT {
                cqi.state = CqiState::Waiting;
                cqi.running = false;
                cqi.errors = cqi.errors.max(0) + 1;
                timed_out.push(cqi.token.clone());
            }
        }
        timed_out
    }

    /// MCN expansion (spec.md §4.5): once `base_token`'s CQI is ACTIVE
    /// and the peer has advertised multi-connection support with
    /// `remote_co` max connections, queue additional `McnNormal` CQIs
    /// for the same user up to `min(remote_co, local_slots_per_user)`
    /// (a coexisting `Small` CQI, if any, isn't counted against this).
    /// Returns the newly queued tokens.
    pub fn expand_mcn(&mut self, base_token: &str, remote_co: u8, local_slots_per_user: u8, now: Instant) -> Vec<Token> {
        let (user, hub_url) = match self.cqis.get(base_token) {
            Some(c) if c.state == CqiState::Active && c.conn_type == ConnType::Download => (c.user.clone(), c.hub_url.clone()),
            _ => return Vec::new(),
        };

        let target_total = remote_co.min(local_slots_per_user) as usize;
        let existing_mcn = self
            .cqis
            .values()
            .filter(|c| c.conn_type == ConnType::Download && c.user.user.cid == user.user.cid && matches!(c.download_type, DownloadType::McnNormal))
            .count();

        let mut new_tokens = Vec::new();
        for _ in existing_mcn..target_total.saturating_sub(1) {
            let token = self.mint_token();
            let mut cqi = ConnectionQueueItem::new(token.clone(), user.clone(), ConnType::Download, DownloadType::McnNormal, hub_url.clone(), now);
            cqi.mcn = true;
            self.cqis.insert(token.clone(), cqi);
            new_tokens.push(token);
        }

        if !new_tokens.is_empty() {
            if let Some(base) = self.cqis.get_mut(base_token) {
                base.mcn = true;
                base.max_remote_conns = remote_co;
            }
        }
        new_tokens
    }

    /// Remembers `addr` as belonging to a peer known to support MCN, so
    /// subsequent flood checks judge it against the raised MCN limit
    /// (spec.md §4.5).
    pub fn note_mcn_peer(&mut self, addr: IpAddr) {
        self.mcn_peers.insert(addr);
    }

    /// Registers an outgoing connection request, to be matched up with
    /// the TCP connection it eventually produces.
    pub fn expect(&mut self, token: Token, user: HintedUser, download_type: DownloadType, now: Instant) -> Result<(), Error> {
        self.expected.register(token, user, download_type, now)
    }

    /// Accepts or rejects an inbound connection attempt from `addr`,
    /// applying IP-based flood protection first (spec.md §4.5: a
    /// flooding connection hasn't completed a handshake and carries no
    /// CID yet, so the gate must key on the transport address).
    pub fn accept(&mut self, addr: IpAddr, now: Instant) -> bool {
        let is_mcn_peer = self.mcn_peers.contains(&addr);
        let allowed = self.flood.allow(addr, is_mcn_peer, now);
        if !allowed {
            self.events.emit(ConnectionEvent::ConnectionFlooded {
                user: HintedUser {
                    user: crate::User {
                        cid: crate::Cid([0; 24]),
                        nick: String::new(),
                    },
                    hub_url: String::new(),
                },
            });
        }
        allowed
    }

    /// Completes the handshake for a token produced by either an
    /// expected outgoing request or an accepted inbound one, creating
    /// the live [`UserConnection`] and, if the token belongs to a CQI,
    /// transitioning it to ACTIVE.
    pub fn establish(&mut self, token: Token, user: Option<HintedUser>, now: Instant) -> &mut UserConnection {
        let user_for_event = user.clone();
        let mut conn = UserConnection::new(token.clone());
        conn.user = user;
        self.live.insert(token.clone(), conn);
        self.activate_cqi(&token, now);
        if let Some(user) = user_for_event {
            log::info!("connection {} established with {}", token, user.user.nick);
            self.events.emit(ConnectionEvent::UserConnected { token: token.clone(), user });
        }
        self.live.get_mut(&token).expect("just inserted")
    }

    pub fn get_mut(&mut self, token: &str) -> Option<&mut UserConnection> {
        self.live.get_mut(token)
    }

    pub fn get(&self, token: &str) -> Option<&UserConnection> {
        self.live.get(token)
    }

    pub fn disconnect(&mut self, token: &str) {
        if self.live.remove(token).is_some() {
            log::debug!("connection {} disconnected", token);
            self.events.emit(ConnectionEvent::UserDisconnected { token: token.to_owned() });
        }
        self.remove_cqi(token);
    }

    pub fn running_connections_for(&self, cid: crate::Cid) -> usize {
        self.live.values().filter(|c| c.user.as_ref().map_or(false, |u| u.user.cid == cid)).count()
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn cqi_count(&self) -> usize {
        self.cqis.len()
    }

    /// Periodic housekeeping: drops stale expected-connection tokens and
    /// sweeps the flood guard's buckets (spec.md §5, once-a-minute tick).
    /// CQI no-progress timeouts are checked every second instead via
    /// [`ConnectionManager::sweep_cqi_timeouts`], matching the 50 s
    /// timeout's own granularity.
    pub fn sweep(&mut self, now: Instant) -> Vec<Token> {
        self.flood.sweep(now);
        self.expected.expire(self.conf.expected_connection_ttl, now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_valid_transitions() {
        let mut uc = UserConnection::new("t1".to_owned());
        assert!(uc.transition(State::Connecting).is_ok());
        assert!(uc.transition(State::Handshaking).is_ok());
        assert!(uc.transition(State::Connected).is_ok());
        assert!(uc.transition(State::Transferring).is_ok());
        assert!(uc.transition(State::Disconnected).is_ok());
    }

    #[test]
    fn test_invalid_transition_rejected() {
        let mut uc = UserConnection::new("t1".to_owned());
        assert!(uc.transition(State::Transferring).is_err());
    }

    fn user() -> HintedUser {
        HintedUser {
            user: crate::User {
                cid: crate::Cid([9; 24]),
                nick: "hank".to_owned(),
            },
            hub_url: "adc://hub".to_owned(),
        }
    }

    #[test]
    fn test_establish_emits_connected_event() {
        let mut cm = ConnectionManager::new(ConnectionConf::new());
        let mut rx = cm.subscribe();
        cm.establish("tok1".to_owned(), Some(user()), Instant::now());
        assert!(cm.get("tok1").is_some());
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn test_sweep_expires_stale_expected_connections() {
        let mut conf = ConnectionConf::new();
        conf.expected_connection_ttl = Duration::from_secs(5);
        let mut cm = ConnectionManager::new(conf);
        let start = Instant::now();
        cm.expect("tok1".to_owned(), user(), DownloadType::Any, start).unwrap();
        let expired = cm.sweep(start + Duration::from_secs(10));
        assert_eq!(expired, vec!["tok1".to_owned()]);
    }

    #[test]
    fn test_queue_cqi_rejects_second_download_cqi_for_same_user() {
        let mut cm = ConnectionManager::new(ConnectionConf::new());
        let now = Instant::now();
        let first = cm.queue_cqi(user(), ConnType::Download, DownloadType::Any, "adc://hub", now);
        assert!(first.is_some());
        let second = cm.queue_cqi(user(), ConnType::Download, DownloadType::Any, "adc://hub", now);
        assert!(second.is_none());
    }

    #[test]
    fn test_due_attempts_transitions_waiting_to_connecting() {
        let mut cm = ConnectionManager::new(ConnectionConf::new());
        let now = Instant::now();
        let token = cm.queue_cqi(user(), ConnType::Download, DownloadType::Any, "adc://hub", now).unwrap();
        let dialed = cm.due_attempts(now, 10);
        assert_eq!(dialed.len(), 1);
        assert_eq!(cm.cqi(&token).unwrap().state, CqiState::Connecting);
    }

    #[test]
    fn test_soft_failure_backs_off_before_retry() {
        let mut cm = ConnectionManager::new(ConnectionConf::new());
        let now = Instant::now();
        let token = cm.queue_cqi(user(), ConnType::Download, DownloadType::Any, "adc://hub", now).unwrap();
        cm.due_attempts(now, 10);
        cm.fail_cqi(&token, false);
        assert_eq!(cm.cqi(&token).unwrap().errors, 1);

        // immediately retrying is not yet due (60s backoff).
        let dialed = cm.due_attempts(now + Duration::from_secs(1), 10);
        assert!(dialed.is_empty());

        let dialed = cm.due_attempts(now + Duration::from_secs(61), 10);
        assert_eq!(dialed.len(), 1);
    }

    #[test]
    fn test_hard_failure_never_retried() {
        let mut cm = ConnectionManager::new(ConnectionConf::new());
        let now = Instant::now();
        let token = cm.queue_cqi(user(), ConnType::Download, DownloadType::Any, "adc://hub", now).unwrap();
        cm.due_attempts(now, 10);
        cm.fail_cqi(&token, true);
        assert_eq!(cm.cqi(&token).unwrap().errors, -1);

        let dialed = cm.due_attempts(now + Duration::from_secs(10_000), 10);
        assert!(dialed.is_empty());
    }

    #[test]
    fn test_establish_activates_matching_cqi() {
        let mut cm = ConnectionManager::new(ConnectionConf::new());
        let now = Instant::now();
        let token = cm.queue_cqi(user(), ConnType::Download, DownloadType::Any, "adc://hub", now).unwrap();
        cm.due_attempts(now, 10);
        cm.establish(token.clone(), Some(user()), now);
        assert_eq!(cm.cqi(&token).unwrap().state, CqiState::Active);
    }

    #[test]
    fn test_sweep_times_out_stalled_active_cqi() {
        let mut cm = ConnectionManager::new(ConnectionConf::new());
        let now = Instant::now();
        let token = cm.queue_cqi(user(), ConnType::Download, DownloadType::Any, "adc://hub", now).unwrap();
        cm.due_attempts(now, 10);
        cm.activate_cqi(&token, now);

        let later = now + Duration::from_secs(51);
        let timed_out = cm.sweep_cqi_timeouts(later);
        assert_eq!(timed_out, vec![token.clone()]);
        assert_eq!(cm.cqi(&token).unwrap().state, CqiState::Waiting);
        assert_eq!(cm.cqi(&token).unwrap().errors, 1);
    }

    #[test]
    fn test_expand_mcn_creates_cqis_up_to_min_of_remote_and_local() {
        let mut cm = ConnectionManager::new(ConnectionConf::new());
        let now = Instant::now();
        let base = cm.queue_cqi(user(), ConnType::Download, DownloadType::Any, "adc://hub", now).unwrap();
        cm.due_attempts(now, 10);
        cm.activate_cqi(&base, now);

        // remote advertises CO=3, we allow 3 slots per user: base + 2 more.
        let new_tokens = cm.expand_mcn(&base, 3, 3, now);
        assert_eq!(new_tokens.len(), 2);
        assert_eq!(cm.cqi_count(), 3);
        for t in &new_tokens {
            assert_eq!(cm.cqi(t).unwrap().download_type, DownloadType::McnNormal);
        }
    }

    #[test]
    fn test_flood_rejection_keyed_by_ip_not_cid() {
        let mut conf = ConnectionConf::new();
        conf.flood_minor_threshold = 1;
        conf.flood_severe_threshold = 1;
        let mut cm = ConnectionManager::new(conf);
        let now = Instant::now();
        let addr: IpAddr = "203.0.113.5".parse().unwrap();
        assert!(cm.accept(addr, now));
        assert!(!cm.accept(addr, now));
    }

    #[test]
    fn test_mcn_peer_exempt_from_severe_flood_threshold() {
        let mut conf = ConnectionConf::new();
        conf.flood_minor_threshold = 1;
        conf.flood_severe_threshold = 1;
        conf.flood_mcn_limit = 5;
        let mut cm = ConnectionManager::new(conf);
        let now = Instant::now();
        let addr: IpAddr = "203.0.113.6".parse().unwrap();
        cm.note_mcn_peer(addr);
        assert!(cm.accept(addr, now));
        assert!(cm.accept(addr, now));
    }
}
