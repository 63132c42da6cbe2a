//! Node assembly.
//!
//! The node owns every subsystem, passing each the capability handles it
//! needs at construction, and tears them down in reverse order on `stop`.
//! Wire I/O is abstracted behind [`PeerTransport`]; datagrams come in
//! through [`Node::process_datagram`] and all sends go out through the
//! transport, so two nodes can be wired back-to-back in tests.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use lattice_consensus::{
    ActiveElections, AnnounceAction, ElectionStatus, OnlineReps, QuorumSettings, RepCrawler,
    Vote, VoteCode, VoteProcessor,
};
use lattice_crypto::{generate_keypair, sign_message};
use lattice_ledger::{Block, Ledger, ProcessResult, Store};
use lattice_messages::{
    ConfirmAck, ConfirmReq, Keepalive, Message, MusigStage0Req, MusigStage0Res, MusigStage1Req,
    MusigStage1Res, NodeIdHandshake, Publish, PublishVoteStaple, KEEPALIVE_SLOTS, VERSION_USING,
};
use lattice_network::{PeerDirectory, SynCookies};
use lattice_stapling::{
    RepTarget, RepXorSolver, RequesterAction, StapleCallback, VoteStapleRequester, VoteStapler,
};
use lattice_types::{Account, Amount, BlockHash, KeyPair, PublicKey, Timestamp};
use lattice_utils::StatsCounter;
use tracing::{debug, info, trace, warn};

use crate::block_arrival::{BlockArrival, StapleInfo};
use crate::block_processor::{BlockProcessor, BlockProcessorHandle};
use crate::config::NodeConfig;
use crate::gap_cache::GapCache;
use crate::Alarm;

/// Join the solver's recruiting candidates with the peer endpoints known to
/// host each representative, preserving the canonical weight order.
pub fn requester_targets(
    candidates: &[(Account, Amount)],
    peers: &PeerDirectory,
) -> Vec<RepTarget> {
    candidates
        .iter()
        .map(|(account, weight)| RepTarget {
            account: *account,
            weight: *weight,
            endpoints: peers.endpoints_for_rep(account),
        })
        .collect()
}

/// Outbound datagram sink. Implementations route an encoded message to a
/// peer endpoint (UDP in production, an in-process queue in tests).
pub trait PeerTransport: Send + Sync {
    fn send(&self, endpoint: SocketAddr, message: Message);
}

/// A representative hosted by this node for voting purposes.
struct VotingRep {
    keypair: KeyPair,
    sequence: AtomicU64,
}

/// Fires confirmed-election side effects: cement the winner by force,
/// release staple state, and mark the arrival confirmed.
struct ConfirmHandler {
    block_processor: Arc<BlockProcessorHandle>,
    stapler: Arc<Mutex<VoteStapler>>,
    block_arrival: Arc<Mutex<BlockArrival>>,
    stats: Arc<StatsCounter>,
}

impl ConfirmHandler {
    fn handle(&self, status: &ElectionStatus) {
        let winner = &status.winner;
        self.block_arrival.lock().unwrap().set_confirmed(&winner.hash);
        self.stapler.lock().unwrap().remove_root(&winner.root());
        self.block_processor.force(winner.clone());
        self.stats.increment("election.confirmed");
        info!(winner = %winner.hash, tally = %status.tally, stapled = status.stapled,
              "block confirmed");
    }
}

struct AnnounceLoop {
    stop: Arc<(Mutex<bool>, Condvar)>,
    thread: Option<thread::JoinHandle<()>>,
}

impl AnnounceLoop {
    fn new(interval: Duration, tick: impl Fn() + Send + 'static) -> Self {
        let stop = Arc::new((Mutex::new(false), Condvar::new()));
        let stop_clone = stop.clone();
        let thread = thread::Builder::new()
            .name("announce loop".into())
            .spawn(move || {
                let (lock, condition) = &*stop_clone;
                let mut stopped = lock.lock().unwrap();
                while !*stopped {
                    let (guard, _) = condition.wait_timeout(stopped, interval).unwrap();
                    stopped = guard;
                    if *stopped {
                        break;
                    }
                    drop(stopped);
                    tick();
                    stopped = lock.lock().unwrap();
                }
            })
            .expect("spawning the announce loop thread");
        Self {
            stop,
            thread: Some(thread),
        }
    }

    fn stop(&mut self) {
        let (lock, condition) = &*self.stop;
        *lock.lock().unwrap() = true;
        condition.notify_all();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// A running consensus node.
pub struct Node {
    pub config: NodeConfig,
    pub ledger: Arc<Ledger>,
    pub peers: Arc<Mutex<PeerDirectory>>,
    pub syn_cookies: Arc<Mutex<SynCookies>>,
    pub online_reps: Arc<Mutex<OnlineReps>>,
    pub active: Arc<Mutex<ActiveElections>>,
    pub rep_crawler: Arc<Mutex<RepCrawler>>,
    pub gap_cache: Arc<Mutex<GapCache>>,
    pub block_arrival: Arc<Mutex<BlockArrival>>,
    pub vote_stapler: Arc<Mutex<VoteStapler>>,
    pub staple_requester: Arc<Mutex<VoteStapleRequester>>,
    pub xor_solver: Arc<Mutex<RepXorSolver>>,
    pub stats: Arc<StatsCounter>,
    pub transport: Arc<dyn PeerTransport>,
    /// Predecessors the gap cache decided are worth bootstrapping. The
    /// bootstrap client itself lives outside this workspace.
    pub bootstrap_requests: Arc<Mutex<Vec<BlockHash>>>,

    node_id: KeyPair,
    endpoint: SocketAddr,
    voting_reps: Mutex<Vec<VotingRep>>,
    confirm_handler: Arc<ConfirmHandler>,

    block_processor: Mutex<BlockProcessor>,
    block_handle: Arc<BlockProcessorHandle>,
    vote_processor: Mutex<VoteProcessor>,
    announce: Mutex<AnnounceLoop>,
    alarm: Alarm,
}

impl Node {
    pub fn new(
        config: NodeConfig,
        store: Arc<dyn Store>,
        transport: Arc<dyn PeerTransport>,
    ) -> Arc<Self> {
        let endpoint: SocketAddr = format!("[::1]:{}", config.port()).parse().unwrap();
        let stats = Arc::new(StatsCounter::new());
        let ledger = Arc::new(Ledger::new(store, config.work_threshold));
        let node_id = generate_keypair();

        let quorum = QuorumSettings {
            online_weight_minimum: Amount::new(config.online_weight_minimum),
            quorum_percent: config.online_weight_quorum as u128,
        };
        let peers = Arc::new(Mutex::new(PeerDirectory::new(endpoint)));
        let syn_cookies = Arc::new(Mutex::new(SynCookies::new()));
        let online_reps = Arc::new(Mutex::new(OnlineReps::new(Amount::new(
            config.online_weight_minimum,
        ))));
        let active = Arc::new(Mutex::new(ActiveElections::new(quorum)));
        let rep_crawler = Arc::new(Mutex::new(RepCrawler::new()));
        let gap_cache = Arc::new(Mutex::new(GapCache::new(
            config.bootstrap_fraction_numerator as u128,
        )));
        let block_arrival = Arc::new(Mutex::new(BlockArrival::new()));
        let vote_stapler = Arc::new(Mutex::new(VoteStapler::new()));
        let staple_requester = Arc::new(Mutex::new(VoteStapleRequester::new(
            node_id.public,
            config.online_weight_quorum as u128,
        )));
        let xor_solver = Arc::new(Mutex::new(RepXorSolver::new(60)));
        let bootstrap_requests = Arc::new(Mutex::new(Vec::new()));

        // Block processor: admissions feed election starts for live blocks.
        let observer_arrival = block_arrival.clone();
        let observer_active = active.clone();
        let observer_stats = stats.clone();
        let block_processor = BlockProcessor::new(
            ledger.clone(),
            active.clone(),
            gap_cache.clone(),
            Box::new(move |block, result| {
                match result {
                    ProcessResult::Progress => {
                        observer_stats.increment("block.progress");
                        // Live blocks go up for election until confirmed.
                        let recent =
                            observer_arrival.lock().unwrap().rebroadcast_info(&block.hash);
                        if recent.recent && !recent.confirmed {
                            observer_active.lock().unwrap().start(block.clone(), None);
                        }
                    }
                    ProcessResult::Fork => observer_stats.increment("block.fork"),
                    ProcessResult::GapPrevious | ProcessResult::GapSource => {
                        observer_stats.increment("block.gap")
                    }
                    ProcessResult::Old => observer_stats.increment("block.old"),
                    _ => {}
                }
            }),
        );
        let block_handle = block_processor.handle().clone();

        let confirm_handler = Arc::new(ConfirmHandler {
            block_processor: block_handle.clone(),
            stapler: vote_stapler.clone(),
            block_arrival: block_arrival.clone(),
            stats: stats.clone(),
        });

        // Vote processor: observer feeds the gap cache, the rep crawler,
        // and the stats table; the sink fires confirmation side effects.
        let vote_stats = stats.clone();
        let vote_gap = gap_cache.clone();
        let vote_ledger = ledger.clone();
        let vote_online = online_reps.clone();
        let vote_crawler = rep_crawler.clone();
        let vote_peers = peers.clone();
        let vote_bootstrap = bootstrap_requests.clone();
        let sink_handler = confirm_handler.clone();
        let vote_processor = VoteProcessor::new(
            active.clone(),
            online_reps.clone(),
            ledger.clone(),
            Box::new(move |vote, endpoint, code| {
                match code {
                    VoteCode::Vote => vote_stats.increment("vote.valid"),
                    VoteCode::Replay => vote_stats.increment("vote.replay"),
                    VoteCode::Invalid => {
                        vote_stats.increment("vote.invalid");
                        return;
                    }
                }
                // A vote may answer an outstanding rep-crawl probe.
                {
                    let crawler = vote_crawler.lock().unwrap();
                    if vote.hashes.iter().any(|hash| crawler.exists(hash)) {
                        let weight = vote_ledger.weight(&vote.account);
                        vote_peers.lock().unwrap().rep_response(
                            endpoint,
                            vote.account,
                            weight,
                            Timestamp::now(),
                        );
                    }
                }
                // Votes also score gapped blocks toward a bootstrap.
                let online_stake = vote_online.lock().unwrap().online_stake();
                let triggered =
                    vote_gap
                        .lock()
                        .unwrap()
                        .vote(vote, &vote_ledger, online_stake);
                for previous in triggered {
                    vote_stats.increment("bootstrap.triggered");
                    debug!(missing = %previous, "bootstrap requested for missing predecessor");
                    vote_bootstrap.lock().unwrap().push(previous);
                }
            }),
            Box::new(move |status| sink_handler.handle(&status)),
        );

        // Announce loop: one round per interval.
        let tick_active = active.clone();
        let tick_ledger = ledger.clone();
        let tick_online = online_reps.clone();
        let tick_peers = peers.clone();
        let tick_transport = transport.clone();
        let tick_handler = confirm_handler.clone();
        let announce = AnnounceLoop::new(
            Duration::from_millis(config.network.announce_interval_ms()),
            move || {
                let online_stake = tick_online.lock().unwrap().online_stake();
                let round = tick_active
                    .lock()
                    .unwrap()
                    .announce_round(&tick_ledger, online_stake);
                for status in &round.confirmed {
                    tick_handler.handle(status);
                }
                let peers = tick_peers.lock().unwrap();
                for action in round.actions {
                    match action {
                        AnnounceAction::Rebroadcast(block) => {
                            for endpoint in peers.list_fanout() {
                                tick_transport.send(
                                    endpoint,
                                    Message::Publish(Publish {
                                        block: block.clone(),
                                    }),
                                );
                            }
                        }
                        AnnounceAction::ConfirmReq { block, pair } => {
                            let mut targets: Vec<SocketAddr> = peers
                                .representatives(16)
                                .into_iter()
                                .map(|info| info.endpoint)
                                .collect();
                            targets.extend(peers.list_fanout());
                            targets.sort();
                            targets.dedup();
                            for endpoint in targets {
                                tick_transport.send(
                                    endpoint,
                                    Message::ConfirmReq(ConfirmReq::Block(block.clone())),
                                );
                                if let Some((ours, theirs)) = &pair {
                                    for candidate in [ours, theirs] {
                                        if candidate.hash != block.hash {
                                            tick_transport.send(
                                                endpoint,
                                                Message::ConfirmReq(ConfirmReq::Block(
                                                    candidate.clone(),
                                                )),
                                            );
                                        }
                                    }
                                }
                            }
                        }
                    }
                }
            },
        );

        Arc::new(Self {
            config,
            ledger,
            peers,
            syn_cookies,
            online_reps,
            active,
            rep_crawler,
            gap_cache,
            block_arrival,
            vote_stapler,
            staple_requester,
            xor_solver,
            stats,
            transport,
            bootstrap_requests,
            node_id,
            endpoint,
            voting_reps: Mutex::new(Vec::new()),
            confirm_handler,
            block_processor: Mutex::new(block_processor),
            block_handle,
            vote_processor: Mutex::new(vote_processor),
            announce: Mutex::new(announce),
            alarm: Alarm::new(),
        })
    }

    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    pub fn node_account(&self) -> Account {
        Account::from(self.node_id.public)
    }

    pub fn block_handle(&self) -> &Arc<BlockProcessorHandle> {
        &self.block_handle
    }

    /// Host a representative: it votes on confirm_req and serves staple
    /// sessions. The same key drives both.
    pub fn add_voting_rep(&self, keypair: KeyPair) {
        let account = Account::from(keypair.public);
        self.vote_stapler
            .lock()
            .unwrap()
            .add_representative(account, lattice_types::PrivateKey(keypair.private.0));
        self.voting_reps.lock().unwrap().push(VotingRep {
            keypair,
            sequence: AtomicU64::new(0),
        });
    }

    /// Begin the periodic maintenance schedule.
    pub fn start(self: &Arc<Self>) {
        for peer in &self.config.preconfigured_peers {
            if let Ok(endpoint) = peer.parse() {
                self.send_keepalive(endpoint);
            }
        }
        self.schedule_maintenance();
        info!(endpoint = %self.endpoint, "node started");
    }

    fn maintenance_interval(&self) -> Duration {
        if self.config.network.is_test() {
            Duration::from_millis(250)
        } else {
            Duration::from_secs(5)
        }
    }

    fn schedule_maintenance(self: &Arc<Self>) {
        let node = Arc::downgrade(self);
        self.alarm.add(self.maintenance_interval(), move || {
            let Some(node) = node.upgrade() else {
                return;
            };
            node.run_maintenance();
            node.schedule_maintenance();
        });
    }

    fn run_maintenance(self: &Arc<Self>) {
        let now = Timestamp::now();
        self.online_reps
            .lock()
            .unwrap()
            .recalculate_stake(&self.ledger, now);
        self.xor_solver
            .lock()
            .unwrap()
            .calculate_top_reps(&self.ledger, now);
        self.syn_cookies.lock().unwrap().purge(now);
        self.gap_cache.lock().unwrap().purge_old(now);
        self.vote_stapler.lock().unwrap().purge(now);

        let staple_actions = self.staple_requester.lock().unwrap().check_timeouts(now);
        self.perform_requester_actions(staple_actions);

        let purged = self.peers.lock().unwrap().purge(now);
        for info in purged {
            trace!(endpoint = %info.endpoint, "peer expired");
        }
        self.ongoing_keepalive(now);
        self.ongoing_rep_crawl(now);
    }

    fn ongoing_keepalive(&self, _now: Timestamp) {
        let targets = self.peers.lock().unwrap().random_set(KEEPALIVE_SLOTS);
        for endpoint in targets {
            self.send_keepalive(endpoint);
        }
    }

    fn ongoing_rep_crawl(&self, now: Timestamp) {
        // Probe with the latest confirmed block so any honest peer can vote.
        let probe = self
            .active
            .lock()
            .unwrap()
            .confirmed_history()
            .back()
            .map(|status| status.winner.clone());
        let Some(block) = probe else {
            return;
        };
        self.rep_crawler.lock().unwrap().add(block.hash);
        let targets = self.peers.lock().unwrap().rep_crawl_targets(now);
        for endpoint in targets {
            self.transport.send(
                endpoint,
                Message::ConfirmReq(ConfirmReq::Block(block.clone())),
            );
        }
    }

    fn send_keepalive(&self, endpoint: SocketAddr) {
        let mut slots: [Option<SocketAddr>; KEEPALIVE_SLOTS] = Default::default();
        self.peers.lock().unwrap().random_fill(&mut slots);
        self.transport
            .send(endpoint, Message::Keepalive(Keepalive { peers: slots }));
    }

    /// Submit a locally originated (or freshly received live) block.
    pub fn process_active(&self, block: Block) {
        let now = Timestamp::now();
        self.block_arrival
            .lock()
            .unwrap()
            .add(block.hash, None, false, Amount::ZERO, now);
        self.block_handle.add(block.clone(), now);
        let fanout = self.peers.lock().unwrap().list_fanout();
        for endpoint in fanout {
            self.transport.send(
                endpoint,
                Message::Publish(Publish {
                    block: block.clone(),
                }),
            );
        }
    }

    /// Decode and dispatch one raw datagram, counting protocol-level drops.
    pub fn process_datagram(&self, data: &[u8], from: SocketAddr) {
        match lattice_messages::decode(data, self.config.network) {
            Ok(message) => self.process_message(message, from),
            Err(error) => {
                use lattice_messages::WireError;
                let stat = match error {
                    WireError::BadMagic => "message.bad_magic",
                    WireError::Truncated | WireError::Malformed(_) => "message.truncated",
                    WireError::UnknownType(_) => "message.unknown_type",
                    WireError::VersionTooOld(_) => "message.old_version",
                };
                self.stats.increment(stat);
            }
        }
    }

    /// Dispatch one decoded message.
    pub fn process_message(&self, message: Message, from: SocketAddr) {
        let now = Timestamp::now();
        // Any traffic refreshes the peer; unknown endpoints trigger the
        // SYN-cookie handshake.
        let start_handshake = self
            .peers
            .lock()
            .unwrap()
            .contacted(from, VERSION_USING, now);
        if start_handshake {
            let cookie = self.syn_cookies.lock().unwrap().assign(from, now);
            if let Some(cookie) = cookie {
                self.transport.send(
                    from,
                    Message::NodeIdHandshake(NodeIdHandshake {
                        query: Some(cookie),
                        response: None,
                    }),
                );
            }
        }

        match message {
            Message::Keepalive(keepalive) => self.handle_keepalive(keepalive, now),
            Message::Publish(publish) => self.handle_publish(publish.block, now),
            Message::ConfirmReq(request) => self.handle_confirm_req(request, from, now),
            Message::ConfirmAck(ack) => self.handle_confirm_ack(ack, from),
            Message::NodeIdHandshake(handshake) => self.handle_handshake(handshake, from, now),
            Message::MusigStage0Req(request) => self.handle_stage0_req(request, from, now),
            Message::MusigStage0Res(response) => {
                let actions = self.staple_requester.lock().unwrap().stage0_response(
                    response.request_id,
                    response.responder,
                    response.r_commitment,
                    &response.signature,
                );
                self.perform_requester_actions(actions);
            }
            Message::MusigStage1Req(request) => self.handle_stage1_req(request, from),
            Message::MusigStage1Res(response) => {
                let actions = self
                    .staple_requester
                    .lock()
                    .unwrap()
                    .stage1_response(response.request_id, response.s_partial);
                self.perform_requester_actions(actions);
            }
            Message::PublishVoteStaple(staple) => self.handle_vote_staple(staple, now),
        }
    }

    fn handle_keepalive(&self, keepalive: Keepalive, now: Timestamp) {
        let reachable: Vec<SocketAddr> = {
            let mut peers = self.peers.lock().unwrap();
            keepalive
                .peers
                .into_iter()
                .flatten()
                .filter(|endpoint| peers.reachout(*endpoint, now))
                .collect()
        };
        for endpoint in reachable {
            self.send_keepalive(endpoint);
        }
    }

    fn handle_publish(&self, block: Block, now: Timestamp) {
        let already_seen = self
            .block_arrival
            .lock()
            .unwrap()
            .add(block.hash, None, false, Amount::ZERO, now);
        if !already_seen {
            self.block_handle.add(block, now);
        }
    }

    fn handle_confirm_req(&self, request: ConfirmReq, from: SocketAddr, now: Timestamp) {
        let hash_to_vote = match request {
            ConfirmReq::Block(block) => {
                let root = block.root();
                match self.ledger.store().block_by_root(&root) {
                    // Vote for whatever occupies the root in *our* ledger,
                    // but still take the offered block in so a fork election
                    // starts on our side too.
                    Some(existing) => {
                        if existing.hash != block.hash {
                            self.handle_publish(block, now);
                        }
                        Some(existing.hash)
                    }
                    None => {
                        let hash = block.hash;
                        self.handle_publish(block, now);
                        Some(hash)
                    }
                }
            }
            ConfirmReq::RootHashPair { root, head: _ } => self
                .ledger
                .store()
                .block_by_root(&root)
                .map(|block| block.hash),
        };
        let Some(hash) = hash_to_vote else {
            return;
        };
        if !self.config.enable_voting {
            return;
        }
        for vote in self.generate_votes(vec![hash]) {
            // Our own elections tally this vote too.
            self.vote_processor
                .lock()
                .unwrap()
                .vote(vote.clone(), self.endpoint);
            self.transport
                .send(from, Message::ConfirmAck(ConfirmAck { vote }));
        }
    }

    fn generate_votes(&self, hashes: Vec<BlockHash>) -> Vec<Vote> {
        let reps = self.voting_reps.lock().unwrap();
        reps.iter()
            .map(|rep| {
                let sequence = rep.sequence.fetch_add(1, Ordering::SeqCst) + 1;
                Vote::new(
                    Account::from(rep.keypair.public),
                    sequence,
                    hashes.clone(),
                    &rep.keypair.private,
                )
            })
            .collect()
    }

    fn handle_confirm_ack(&self, ack: ConfirmAck, from: SocketAddr) {
        self.vote_processor.lock().unwrap().vote(ack.vote, from);
    }

    fn handle_handshake(&self, handshake: NodeIdHandshake, from: SocketAddr, now: Timestamp) {
        if let Some((account, signature)) = handshake.response {
            let valid = self
                .syn_cookies
                .lock()
                .unwrap()
                .validate(from, &account, &signature);
            if valid {
                self.peers
                    .lock()
                    .unwrap()
                    .insert(from, VERSION_USING, Some(account), now);
                debug!(endpoint = %from, id = %account, "peer authenticated");
            }
        }
        if let Some(cookie) = handshake.query {
            let signature = sign_message(&cookie, &self.node_id.private);
            self.transport.send(
                from,
                Message::NodeIdHandshake(NodeIdHandshake {
                    query: None,
                    response: Some((self.node_account(), signature)),
                }),
            );
        }
    }

    fn handle_stage0_req(&self, request: MusigStage0Req, from: SocketAddr, now: Timestamp) {
        let opposing = self.peer_node_id(&from);
        let representative = request.representative;
        let result = self.vote_stapler.lock().unwrap().stage0(
            opposing,
            request.request_id,
            representative,
            request.block,
            now,
        );
        match result {
            Ok(commitment) => {
                let mut message = Vec::with_capacity(64);
                message.extend_from_slice(&request.request_id);
                message.extend_from_slice(&commitment);
                let signature = self
                    .vote_stapler
                    .lock()
                    .unwrap()
                    .sign_as(&representative, &message);
                let Some(signature) = signature else {
                    return;
                };
                self.transport.send(
                    from,
                    Message::MusigStage0Res(MusigStage0Res {
                        request_id: request.request_id,
                        r_commitment: commitment,
                        responder: PublicKey::from(representative),
                        signature,
                    }),
                );
            }
            Err(error) => trace!(%error, "stage0 request refused"),
        }
    }

    fn handle_stage1_req(&self, request: MusigStage1Req, from: SocketAddr) {
        let opposing = self.peer_node_id(&from);
        let result = self.vote_stapler.lock().unwrap().stage1(
            opposing,
            request.request_id,
            request.r_total,
            request.agg_pubkey,
            request.l_base,
        );
        match result {
            Ok(s_partial) => {
                self.transport.send(
                    from,
                    Message::MusigStage1Res(MusigStage1Res {
                        request_id: request.request_id,
                        s_partial,
                    }),
                );
            }
            Err(error) => trace!(%error, "stage1 request refused"),
        }
    }

    fn handle_vote_staple(&self, staple: PublishVoteStaple, now: Timestamp) {
        let validation = {
            let mut solver = self.xor_solver.lock().unwrap();
            solver.calculate_top_reps(&self.ledger, now);
            solver.validate_staple(&staple.block.hash, &staple.reps_xor, &staple.signature)
        };
        let (stake, _max_position) = match validation {
            Ok(result) => result,
            Err(error) => {
                self.stats.increment("staple.invalid");
                debug!(%error, block = %staple.block.hash, "vote staple rejected");
                return;
            }
        };
        self.stats.increment("staple.validated");

        let online_stake = self.online_reps.lock().unwrap().online_stake();
        let quorum = online_stake.percent(self.config.online_weight_quorum as u128);
        let meets_quorum = stake >= quorum;

        self.block_arrival.lock().unwrap().add(
            staple.block.hash,
            Some(StapleInfo {
                reps_xor: staple.reps_xor,
                signature: staple.signature,
            }),
            meets_quorum,
            stake,
            now,
        );
        self.block_handle.add(staple.block.clone(), now);

        if meets_quorum {
            let root = staple.block.root();
            let confirmed = self.active.lock().unwrap().confirm_stapled(
                &root,
                staple.block.hash,
                stake,
                &self.ledger,
            );
            match confirmed {
                Some(status) => self.confirm_handler.handle(&status),
                // No election yet: the staple alone carries quorum, so the
                // block cements as soon as it is admitted.
                None => self.block_handle.force(staple.block.clone()),
            }
        }
    }

    fn peer_node_id(&self, endpoint: &SocketAddr) -> PublicKey {
        self.peers
            .lock()
            .unwrap()
            .node_id(endpoint)
            .map(PublicKey::from)
            .unwrap_or(PublicKey::ZERO)
    }

    /// Ask the network to staple `block`. The callback fires exactly once
    /// with the outcome.
    pub fn request_staple(&self, block: Block, callback: StapleCallback) {
        let now = Timestamp::now();
        let targets = {
            let mut solver = self.xor_solver.lock().unwrap();
            solver.calculate_top_reps(&self.ledger, now);
            let peers = self.peers.lock().unwrap();
            requester_targets(solver.generation_candidates(), &peers)
        };
        let online_stake = self.online_reps.lock().unwrap().online_stake();
        let actions = self.staple_requester.lock().unwrap().request_staple(
            block,
            targets,
            online_stake,
            callback,
            now,
        );
        self.perform_requester_actions(actions);
    }

    fn perform_requester_actions(&self, actions: Vec<RequesterAction>) {
        for action in actions {
            match action {
                RequesterAction::Stage0Request {
                    endpoint,
                    request_id,
                    block,
                    representative,
                } => {
                    self.transport.send(
                        endpoint,
                        Message::MusigStage0Req(MusigStage0Req {
                            request_id,
                            block,
                            representative,
                        }),
                    );
                }
                RequesterAction::Stage1Request {
                    endpoint,
                    request_id,
                    r_total,
                    agg_pubkey,
                    l_base,
                } => {
                    self.transport.send(
                        endpoint,
                        Message::MusigStage1Req(MusigStage1Req {
                            request_id,
                            r_total,
                            agg_pubkey,
                            l_base,
                        }),
                    );
                }
                RequesterAction::BroadcastStaple {
                    block,
                    reps_xor,
                    signature,
                } => {
                    self.stats.increment("staple.assembled");
                    let staple = PublishVoteStaple {
                        block,
                        reps_xor,
                        signature,
                    };
                    // Apply locally first, then flood.
                    self.handle_vote_staple(staple.clone(), Timestamp::now());
                    let fanout = self.peers.lock().unwrap().list_fanout();
                    for endpoint in fanout {
                        self.transport
                            .send(endpoint, Message::PublishVoteStaple(staple.clone()));
                    }
                }
                RequesterAction::BroadcastIndividual { block } => {
                    self.stats.increment("staple.fallback");
                    warn!(block = %block.hash, "staple failed; broadcasting individual votes");
                    let votes = if self.config.enable_voting {
                        self.generate_votes(vec![block.hash])
                    } else {
                        Vec::new()
                    };
                    for vote in &votes {
                        self.vote_processor
                            .lock()
                            .unwrap()
                            .vote(vote.clone(), self.endpoint);
                    }
                    let fanout = self.peers.lock().unwrap().list_fanout();
                    for endpoint in fanout {
                        self.transport.send(
                            endpoint,
                            Message::Publish(Publish {
                                block: block.clone(),
                            }),
                        );
                        for vote in &votes {
                            self.transport.send(
                                endpoint,
                                Message::ConfirmAck(ConfirmAck { vote: vote.clone() }),
                            );
                        }
                    }
                }
            }
        }
    }

    /// Wait until the vote and block queues are drained. Test determinism.
    pub fn flush(&self) {
        self.vote_processor.lock().unwrap().flush();
        self.block_handle.flush();
    }

    /// Stop every worker, in reverse construction order.
    pub fn stop(&self) {
        self.announce.lock().unwrap().stop();
        self.vote_processor.lock().unwrap().stop();
        self.block_processor.lock().unwrap().stop();
        info!(endpoint = %self.endpoint, "node stopped");
    }
}
