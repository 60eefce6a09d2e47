/*
    Copyright © 2023, The BitDust Developers
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The group-member thread: joins message groups, keeps their broker cooperation sets alive,
//! consumes queue messages in strict order and publishes messages at most once.
//!
//! A group is named by its [`GroupKeyId`] and protected by a shared
//! [`GroupKey`](crate::types::symkey::GroupKey). The thread owns every joined group's
//! [`GroupMember`] state and drives them serially: broker discovery through the [`Dht`],
//! `queue-connect` negotiation through the [p2p thread](crate::p2p), and queue traffic on the
//! `"group"` channel. Subsystems and library users talk to it through a cloneable
//! [`GroupHandle`].
//!
//! Ordering and retry rules live in [`member`]; the wire JSON shapes in [`messages`]. This
//! module is only the driver.

pub mod messages;

pub(crate) mod member;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt::{self, Display, Formatter};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Instant, SystemTime};

use borsh::{BorshDeserialize, BorshSerialize};

use crate::config::GroupConfiguration;
use crate::dht::{BrokerEntry, Dht};
use crate::events::{
    Event, GroupBrokersUpdatedEvent, GroupConnectingEvent, GroupDisconnectedEvent,
    GroupSynchronizedEvent, MessageInEvent, MessagePushedEvent, PushMessageFailedEvent,
};
use crate::group::member::{ChunkVerdict, GroupMember, MemberState};
use crate::group::messages::{AcceptedReply, BrokerReply, GroupKeyInfo, QueueConnectParams, QueueMessage};
use crate::identity_cache::IdentityCache;
use crate::messages::{
    AckInfo, ArchiveReadRequest, Command, ConsumeRequest, FailInfo, ProduceRequest,
    QueueDisconnectRequest, QueueMessagesChunk, SignedPacket,
};
use crate::networking::{Network, PacketRecvError, PacketStub, CHANNEL_GROUP};
use crate::p2p::P2pHandle;
use crate::pluggables::{paths, KVGet, KVStore};
use crate::seeker::{ConnectOutcome, LookupFn};
use crate::types::basic::{BrokerPos, Channel, SequenceId, ServiceName};
use crate::types::idurl::IdUrl;
use crate::types::symkey::GroupKey;

/// The service a broker candidate must host to join a cooperation set.
pub const SERVICE_MESSAGE_BROKER: &str = "service_message_broker";

/// How many mismatch/identity re-detection rounds one connect attempt tolerates before the
/// member falls back to disconnected.
const CONNECT_ROUNDS: u32 = 3;

/// Names a group: the key alias plus the IDURL of the group's creator.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GroupKeyId {
    pub alias: String,
    pub creator: IdUrl,
}

impl GroupKeyId {
    pub fn new(alias: &str, creator: IdUrl) -> GroupKeyId {
        GroupKeyId {
            alias: alias.to_string(),
            creator,
        }
    }
}

impl Display for GroupKeyId {
    /// `<alias>$<creator>` in global form, e.g. `family$alice@idhost.org`.
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}${}", self.alias, self.creator.to_global_form())
    }
}

/// Names one queue: a group served by one specific active broker. Every `Consume`, `Produce`
/// and `QueueMessages` carries it, and a chunk whose queue id matches no joined member is
/// foreign and refused.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct QueueId(String);

impl QueueId {
    /// `<alias>&<creator>&<broker>`, all in global form.
    pub fn new(group: &GroupKeyId, broker: &IdUrl) -> QueueId {
        QueueId(format!(
            "{}&{}&{}",
            group.alias,
            group.creator.to_global_form(),
            broker.to_global_form()
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for QueueId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

enum GroupCommand {
    Join { group: GroupKeyId, key: GroupKey },
    Leave { group: GroupKeyId },
    Push { group: GroupKeyId, payload: Vec<u8> },
    Reconnect { group: GroupKeyId },
    ReplaceActiveBroker { group: GroupKeyId },
}

/// Client of the group thread. Cloneable; commands are fire-and-forget, outcomes surface as
/// events.
#[derive(Clone)]
pub struct GroupHandle {
    commands: Sender<GroupCommand>,
}

impl GroupHandle {
    /// Joins `group` and starts consuming its queue. Idempotent for an already joined group.
    pub fn join(&self, group: &GroupKeyId, key: GroupKey) {
        let _ = self.commands.send(GroupCommand::Join {
            group: group.clone(),
            key,
        });
    }

    /// Unsubscribes from the queue and drops the member state. The last consumed sequence id
    /// stays persisted for a later re-join.
    pub fn leave(&self, group: &GroupKeyId) {
        let _ = self.commands.send(GroupCommand::Leave {
            group: group.clone(),
        });
    }

    /// Queues one message for publication into the group. Delivery is at-most-once; the
    /// outcome surfaces as a `MessagePushed` or `PushMessageFailed` event.
    pub fn push_message(&self, group: &GroupKeyId, payload: &[u8]) {
        let _ = self.commands.send(GroupCommand::Push {
            group: group.clone(),
            payload: payload.to_vec(),
        });
    }

    /// Drops the group's connection and runs broker detection again.
    pub fn reconnect(&self, group: &GroupKeyId) {
        let _ = self.commands.send(GroupCommand::Reconnect {
            group: group.clone(),
        });
    }

    /// Declares the active broker dead and rotates to a replacement.
    pub fn replace_active_broker(&self, group: &GroupKeyId) {
        let _ = self.commands.send(GroupCommand::ReplaceActiveBroker {
            group: group.clone(),
        });
    }
}

/// Spawns the group thread. `broker_lookup` yields random broker candidates for hiring; one
/// call is one lookup iteration.
pub(crate) fn start_group<N: Network + 'static, D: Dht, K: KVStore>(
    stub: PacketStub<N>,
    dht: D,
    kv: K,
    p2p: P2pHandle,
    cache: IdentityCache,
    broker_lookup: Arc<dyn Fn() -> Vec<IdUrl> + Send + Sync>,
    config: GroupConfiguration,
    event_publisher: Option<Sender<Event>>,
    shutdown_signal: Receiver<()>,
) -> (JoinHandle<()>, GroupHandle) {
    let (commands, command_receiver) = mpsc::channel();
    let thread = thread::spawn(move || {
        let mut service = GroupService {
            stub,
            dht,
            kv,
            p2p,
            cache,
            broker_lookup,
            config,
            members: HashMap::new(),
            pending_pushes: HashMap::new(),
            event_publisher,
        };
        loop {
            match shutdown_signal.try_recv() {
                Ok(()) => {
                    service.disconnect_all();
                    return;
                }
                Err(TryRecvError::Empty) => (),
                Err(TryRecvError::Disconnected) => {
                    panic!("Group thread disconnected from main thread")
                }
            }

            match command_receiver.recv_timeout(service.config.tick_interval) {
                Ok(command) => {
                    service.handle_command(command);
                    while let Ok(command) = command_receiver.try_recv() {
                        service.handle_command(command);
                    }
                }
                Err(RecvTimeoutError::Timeout) => (),
                Err(RecvTimeoutError::Disconnected) => {
                    panic!("Group thread disconnected from main thread")
                }
            }

            while let Some((origin, packet)) = service.stub.try_recv() {
                service.handle_inbound(origin, packet);
            }

            service.connect_pending();
            service.drive_pushes();
        }
    });
    (thread, GroupHandle { commands })
}

struct GroupService<N: Network, D: Dht, K: KVStore> {
    stub: PacketStub<N>,
    dht: D,
    kv: K,
    p2p: P2pHandle,
    cache: IdentityCache,
    broker_lookup: Arc<dyn Fn() -> Vec<IdUrl> + Send + Sync>,
    config: GroupConfiguration,
    members: HashMap<GroupKeyId, GroupMember>,
    /// Produce packet id → (group, slot counter), for ack correlation.
    pending_pushes: HashMap<String, (GroupKeyId, u64)>,
    event_publisher: Option<Sender<Event>>,
}

impl<N: Network, D: Dht, K: KVStore> GroupService<N, D, K> {
    fn handle_command(&mut self, command: GroupCommand) {
        match command {
            GroupCommand::Join { group, key } => {
                if self.members.contains_key(&group) {
                    log::debug!("already a member of group {}", group);
                    return;
                }
                let last = load_sequence(&self.kv, &group);
                self.members
                    .insert(group.clone(), GroupMember::new(group, key, last));
            }
            GroupCommand::Leave { group } => {
                let Some(mut member) = self.members.remove(&group) else {
                    return;
                };
                self.unsubscribe(&mut member);
                member.close();
                self.publish(Event::GroupDisconnected(GroupDisconnectedEvent {
                    timestamp: SystemTime::now(),
                    group,
                }));
            }
            GroupCommand::Push { group, payload } => {
                let Some(member) = self.members.get_mut(&group) else {
                    log::warn!("push into group {} we are not a member of", group);
                    return;
                };
                member.enqueue_message(&payload);
            }
            GroupCommand::Reconnect { group } => {
                if let Some(member) = self.members.get_mut(&group) {
                    member.reset_connection();
                }
            }
            GroupCommand::ReplaceActiveBroker { group } => {
                self.rotate_active_broker(&group);
            }
        }
    }

    /// Declares the group's active broker dead and schedules a reconnect that excludes it.
    fn rotate_active_broker(&mut self, group: &GroupKeyId) {
        let Some(mut member) = self.members.remove(group) else {
            return;
        };
        if let Some(dead) = member.mark_dead_broker() {
            log::info!("group {}: active broker {} declared dead", group, dead);
            self.dht.clear_brokers_cache(&group.creator);
            if self.stub.me() == &group.creator {
                let _ = self.dht.erase_broker(&group.creator, BrokerPos::ACTIVE);
            }
        }
        member.reset_connection();
        self.members.insert(group.clone(), member);
    }

    fn disconnect_all(&mut self) {
        let groups: Vec<GroupKeyId> = self.members.keys().cloned().collect();
        for group in groups {
            if let Some(mut member) = self.members.remove(&group) {
                self.unsubscribe(&mut member);
            }
        }
    }

    fn unsubscribe(&mut self, member: &mut GroupMember) {
        if let (Some(queue_id), Some(broker)) =
            (member.queue_id(), member.active_broker().cloned())
        {
            self.stub.send_command(
                &broker,
                Channel::new(CHANNEL_GROUP),
                format!("{}:disconnect:{}", queue_id, rand::random::<u32>()),
                Command::QueueDisconnect(QueueDisconnectRequest {
                    queue_id: queue_id.to_string(),
                }),
            );
        }
        store_sequence(&mut self.kv, &member.group, member.last_sequence_id);
    }

    // Broker detection and queue-connect negotiation.

    fn connect_pending(&mut self) {
        let pending: Vec<GroupKeyId> = self
            .members
            .iter()
            .filter(|(_, member)| {
                matches!(
                    member.state,
                    MemberState::AtStartup | MemberState::Disconnected
                )
            })
            .map(|(group, _)| group.clone())
            .collect();
        for group in pending {
            self.connect_member(&group);
        }
    }

    fn connect_member(&mut self, group: &GroupKeyId) {
        let Some(mut member) = self.members.remove(group) else {
            return;
        };
        self.publish(Event::GroupConnecting(GroupConnectingEvent {
            timestamp: SystemTime::now(),
            group: group.clone(),
        }));

        member.state = MemberState::DhtRead;
        let positions: Vec<BrokerPos> = (0..self.config.brokers_required)
            .map(BrokerPos::new)
            .collect();
        let mut known: BTreeMap<u8, IdUrl> = self
            .dht
            .read_brokers(&group.creator, &positions, true)
            .unwrap_or_else(|err| {
                log::warn!("group {}: broker record read failed: {}", group, err);
                Vec::new()
            })
            .into_iter()
            .map(|entry| (entry.position.int(), entry.idurl))
            .collect();
        member.state = MemberState::Brokers;

        let mut exclude: HashSet<IdUrl> = member.dead_brokers.iter().cloned().collect();
        let service = ServiceName::new(SERVICE_MESSAGE_BROKER);

        for round in 0..CONNECT_ROUNDS {
            let target = known
                .get(&BrokerPos::ACTIVE.int())
                .filter(|broker| !exclude.contains(*broker))
                .cloned();
            let hiring = target.is_none();
            let params = self.connect_params(&member, &known, hiring.then_some(0));
            let outcome = match &target {
                Some(broker) => self.p2p.connect_known_node(broker, &service, &params, 2),
                None => self.p2p.connect_random_node(
                    self.hire_lookup(),
                    &service,
                    &params,
                    self.config.broker_lookup_attempts,
                    exclude.clone(),
                ),
            };
            match outcome {
                ConnectOutcome::NodeConnected { idurl, response } => {
                    self.adopt_cooperation(&mut member, &idurl, &response);
                    self.members.insert(group.clone(), member);
                    self.after_connect(group);
                    return;
                }
                ConnectOutcome::Mismatch { idurl, mismatch } => {
                    // The broker's counter-proposal replaces our view; re-detect from it.
                    log::info!(
                        "group {}: broker {} proposed a different cooperation set",
                        group,
                        idurl
                    );
                    if let Some(proposed) = mismatch.proposed_brokers() {
                        known = proposed.clone();
                    }
                }
                ConnectOutcome::RequestFailed { idurl, reason } => {
                    if self.absorb_pushed_identity(&idurl, &reason) {
                        // Fresher identity cached; the same round is worth re-issuing.
                        continue;
                    }
                    log::warn!(
                        "group {}: queue-connect to {} failed in round {}: {}",
                        group,
                        idurl,
                        round,
                        reason
                    );
                    exclude.insert(idurl);
                }
                ConnectOutcome::HandshakeFailed { idurl, error } => {
                    log::warn!("group {}: handshake with {} failed: {}", group, idurl, error);
                    exclude.insert(idurl);
                }
                ConnectOutcome::LookupFailed => {
                    log::warn!("group {}: no broker candidate found", group);
                    break;
                }
            }
        }

        member.reset_connection();
        self.members.insert(group.clone(), member);
        self.publish(Event::GroupDisconnected(GroupDisconnectedEvent {
            timestamp: SystemTime::now(),
            group: group.clone(),
        }));
    }

    fn connect_params(
        &self,
        member: &GroupMember,
        known: &BTreeMap<u8, IdUrl>,
        position: Option<u8>,
    ) -> String {
        let params = QueueConnectParams {
            action: QueueConnectParams::ACTION.to_string(),
            group_key_info: GroupKeyInfo {
                key_id: member.group.to_string(),
                fingerprint: member.key.fingerprint(),
            },
            archive_folder_path: format!("archive/{}", member.group),
            last_sequence_id: member.last_sequence_id,
            known_brokers: known.clone(),
            position,
        };
        serde_json::to_string(&params).expect("serializing connect params in memory cannot fail")
    }

    /// Candidate source for hiring: the configured preferred brokers first, then the pluggable
    /// random lookup.
    fn hire_lookup(&self) -> LookupFn {
        let preferred = self.config.preferred_brokers.clone();
        let source = self.broker_lookup.clone();
        let mut first = true;
        Box::new(move || {
            if first && !preferred.is_empty() {
                first = false;
                return preferred.clone();
            }
            source()
        })
    }

    /// A `RequestFailed` whose reason embeds `identity:<base64>` is a broker pushing a fresher
    /// identity document. Cache it and report true so the caller retries.
    fn absorb_pushed_identity(&mut self, idurl: &IdUrl, reason: &str) -> bool {
        let Some(at) = reason.find("identity:") else {
            return false;
        };
        let Some(BrokerReply::Identity(doc)) = BrokerReply::parse(&reason[at..]) else {
            return false;
        };
        match self.cache.update(idurl, doc) {
            Ok(accepted) => accepted,
            Err(err) => {
                log::warn!("broker {} pushed an invalid identity: {}", idurl, err);
                false
            }
        }
    }

    fn adopt_cooperation(&mut self, member: &mut GroupMember, broker: &IdUrl, response: &str) {
        let accepted: AcceptedReply = match BrokerReply::parse_accepted(response) {
            Some(BrokerReply::Accepted(reply)) => reply,
            _ => {
                log::debug!("broker {} accepted without a cooperation set", broker);
                AcceptedReply::default()
            }
        };
        let mut brokers: BTreeMap<BrokerPos, IdUrl> = accepted
            .cooperated_brokers
            .into_iter()
            .map(|(position, idurl)| (BrokerPos::new(position), idurl))
            .collect();
        brokers
            .entry(BrokerPos::ACTIVE)
            .or_insert_with(|| broker.clone());
        member.on_brokers_connected(brokers);
    }

    /// Post-connect work for a freshly connected member: republish the record if we created
    /// the group, fan the new set out to co-creator members, and subscribe to the queue.
    fn after_connect(&mut self, group: &GroupKeyId) {
        let brokers: Vec<BrokerEntry> = match self.members.get(group) {
            Some(member) => member
                .connected_brokers
                .iter()
                .map(|(position, idurl)| BrokerEntry {
                    position: *position,
                    idurl: idurl.clone(),
                })
                .collect(),
            None => return,
        };

        if self.stub.me() == &group.creator {
            for entry in &brokers {
                if let Err(err) =
                    self.dht
                        .write_broker(&group.creator, entry, self.config.broker_record_ttl)
                {
                    log::warn!(
                        "group {}: publishing broker {} at {} failed: {}",
                        group,
                        entry.idurl,
                        entry.position,
                        err
                    );
                }
            }
        }

        // Members of other groups under the same creator share the cooperation set; a member
        // holding a stale one reconnects against the new record.
        let new_set: BTreeMap<BrokerPos, IdUrl> = brokers
            .iter()
            .map(|entry| (entry.position, entry.idurl.clone()))
            .collect();
        for (other, member) in self.members.iter_mut() {
            if other == group || other.creator != group.creator {
                continue;
            }
            if matches!(member.state, MemberState::Queue | MemberState::InSync)
                && member.connected_brokers != new_set
            {
                log::info!("group {}: cooperation set changed, reconnecting", other);
                member.reset_connection();
            }
        }
        self.publish(Event::GroupBrokersUpdated(GroupBrokersUpdatedEvent {
            timestamp: SystemTime::now(),
            customer: group.creator.clone(),
            brokers,
        }));

        if !self.subscribe(group) {
            self.rotate_active_broker(group);
        }
    }

    /// Sends `Consume` to the active broker and waits for its ack. True on success.
    fn subscribe(&mut self, group: &GroupKeyId) -> bool {
        let Some(member) = self.members.get(group) else {
            return false;
        };
        let (Some(queue_id), Some(broker)) =
            (member.queue_id(), member.active_broker().cloned())
        else {
            return false;
        };
        let last = member.last_sequence_id;
        let packet_id = format!("{}:consume:{}", queue_id, rand::random::<u32>());
        let consumer_id = self.stub.me().to_global_form();
        self.stub.send_command(
            &broker,
            Channel::new(CHANNEL_GROUP),
            packet_id.clone(),
            Command::Consume(ConsumeRequest {
                queue_id: queue_id.to_string(),
                consumer_id,
                last_sequence_id: last,
            }),
        );

        let deadline = Instant::now() + self.config.broker_connect_timeout;
        let received = self.stub.recv_matching(deadline, |_, packet| {
            packet.packet_id == packet_id
                && matches!(packet.command, Command::Ack(_) | Command::Fail(_))
        });
        match received {
            Ok((_, packet)) => match packet.command {
                Command::Ack(_) => {
                    if let Some(member) = self.members.get_mut(group) {
                        member.state = MemberState::InSync;
                    }
                    self.publish(Event::GroupSynchronized(GroupSynchronizedEvent {
                        timestamp: SystemTime::now(),
                        group: group.clone(),
                        last_sequence_id: last,
                    }));
                    true
                }
                Command::Fail(info) => {
                    log::warn!("group {}: consume refused by {}: {}", group, broker, info.reason);
                    false
                }
                _ => false,
            },
            Err(PacketRecvError::Timeout) | Err(PacketRecvError::Disconnected) => {
                log::warn!("group {}: consume ack from {} timed out", group, broker);
                false
            }
        }
    }

    // Inbound queue traffic.

    fn handle_inbound(&mut self, origin: IdUrl, packet: SignedPacket) {
        match packet.command.clone() {
            Command::QueueMessages(chunk) => self.handle_chunk(origin, packet, chunk),
            Command::Ack(_) => {
                let Some((group, counter)) = self.pending_pushes.remove(&packet.packet_id) else {
                    log::debug!("uncorrelated ack {} on the group channel", packet.packet_id);
                    return;
                };
                let Some(member) = self.members.get_mut(&group) else {
                    return;
                };
                if member.note_ack(counter) {
                    self.publish(Event::MessagePushed(MessagePushedEvent {
                        timestamp: SystemTime::now(),
                        group,
                        counter,
                    }));
                }
            }
            Command::Fail(info) => {
                if let Some((group, counter)) = self.pending_pushes.remove(&packet.packet_id) {
                    // The slot stays queued; the retry timer governs the re-send.
                    log::warn!(
                        "group {}: produce of slot {} refused by {}: {}",
                        group,
                        counter,
                        origin,
                        info.reason
                    );
                }
            }
            other => {
                log::debug!(
                    "dropping unexpected {} from {} on the group channel",
                    packet.command_name(),
                    origin
                );
                drop(other);
            }
        }
    }

    fn handle_chunk(&mut self, origin: IdUrl, packet: SignedPacket, chunk: QueueMessagesChunk) {
        let group = self.members.iter().find_map(|(group, member)| {
            member
                .queue_id()
                .filter(|queue_id| queue_id.as_str() == chunk.queue_id)
                .map(|_| group.clone())
        });
        let Some(group) = group else {
            log::warn!("chunk for foreign queue {} from {}", chunk.queue_id, origin);
            self.stub.send_command(
                &origin,
                packet.channel,
                packet.packet_id,
                Command::Fail(FailInfo {
                    reason: format!("unknown queue {}", chunk.queue_id),
                }),
            );
            return;
        };
        let Some(messages) = QueueMessage::decode_list(&chunk.messages_json) else {
            log::warn!("malformed chunk on queue {} from {}", chunk.queue_id, origin);
            self.stub.send_command(
                &origin,
                packet.channel,
                packet.packet_id,
                Command::Fail(FailInfo {
                    reason: "malformed message list".to_string(),
                }),
            );
            return;
        };
        self.stub.send_command(
            &origin,
            packet.channel,
            packet.packet_id,
            Command::Ack(AckInfo {
                payload: Vec::new(),
            }),
        );

        let mut member = self
            .members
            .remove(&group)
            .expect("member existed in the lookup above");
        let (deliveries, verdict) = member.absorb_chunk(
            messages,
            chunk.latest_sequence_id,
            self.config.max_buffered_messages,
        );
        for delivery in deliveries {
            self.publish(Event::MessageIn(MessageInEvent {
                timestamp: SystemTime::now(),
                group: group.clone(),
                sequence_id: delivery.sequence_id,
                producer_id: delivery.producer_id,
                payload: delivery.payload,
            }));
        }
        store_sequence(&mut self.kv, &group, member.last_sequence_id);

        match verdict {
            ChunkVerdict::InSync => (),
            ChunkVerdict::Ahead { from, to } => {
                if let (Some(queue_id), Some(broker)) =
                    (member.queue_id(), member.active_broker().cloned())
                {
                    log::info!("group {}: reading archive range {}..={}", group, from, to);
                    self.stub.send_command(
                        &broker,
                        Channel::new(CHANNEL_GROUP),
                        format!("{}:archive:{}-{}", queue_id, from, to),
                        Command::ArchiveRead(ArchiveReadRequest {
                            queue_id: queue_id.to_string(),
                            from,
                            to,
                        }),
                    );
                }
            }
            ChunkVerdict::Fatal(reason) => {
                log::error!("group {}: {}", group, reason);
                if let Some(dead) = member.mark_dead_broker() {
                    self.dht.clear_brokers_cache(&group.creator);
                    log::info!("group {}: abandoning broker {}", group, dead);
                }
                member.reset_connection();
                self.publish(Event::GroupDisconnected(GroupDisconnectedEvent {
                    timestamp: SystemTime::now(),
                    group: group.clone(),
                }));
            }
        }
        self.members.insert(group, member);
    }

    // Publish side.

    fn drive_pushes(&mut self) {
        let now = Instant::now();
        let connected: Vec<GroupKeyId> = self
            .members
            .iter()
            .filter(|(_, member)| member.state == MemberState::InSync)
            .map(|(group, _)| group.clone())
            .collect();
        for group in connected {
            let Some(member) = self.members.get(&group) else {
                continue;
            };
            let failed: Vec<(u64, u32)> = member
                .outgoing
                .values()
                .filter(|slot| slot.attempts > self.config.critical_push_message_fails)
                .map(|slot| (slot.counter, slot.attempts))
                .collect();
            if !failed.is_empty() {
                for (counter, attempts) in failed {
                    self.publish(Event::PushMessageFailed(PushMessageFailedEvent {
                        timestamp: SystemTime::now(),
                        group: group.clone(),
                        counter,
                        attempts,
                    }));
                }
                self.rotate_active_broker(&group);
                continue;
            }
            self.send_ready_slots(&group, now);
        }
    }

    fn send_ready_slots(&mut self, group: &GroupKeyId, now: Instant) {
        let Some(mut member) = self.members.remove(group) else {
            return;
        };
        let (Some(queue_id), Some(broker)) =
            (member.queue_id(), member.active_broker().cloned())
        else {
            self.members.insert(group.clone(), member);
            return;
        };
        let ready = member.slots_ready(now, self.config.message_ack_timeout);
        if ready
            .iter()
            .any(|counter| member.outgoing[counter].require_handshake)
        {
            // Re-sends after a broker rotation refresh the connection first.
            if let Err(err) = self.p2p.ping(&broker, false) {
                log::warn!("group {}: ping of broker {} failed: {}", group, broker, err);
                self.members.insert(group.clone(), member);
                return;
            }
            for slot in member.outgoing.values_mut() {
                slot.require_handshake = false;
            }
        }
        let known_brokers: Vec<BrokerEntry> = member
            .connected_brokers
            .iter()
            .map(|(position, idurl)| BrokerEntry {
                position: *position,
                idurl: idurl.clone(),
            })
            .collect();
        let producer_id = self.stub.me().to_global_form();
        for counter in ready {
            let payload = member.outgoing[&counter].payload.clone();
            let packet_id = format!("{}:produce:{}", queue_id, counter);
            self.stub.send_command(
                &broker,
                Channel::new(CHANNEL_GROUP),
                packet_id.clone(),
                Command::Produce(ProduceRequest {
                    queue_id: queue_id.to_string(),
                    producer_id: producer_id.clone(),
                    payload,
                    known_brokers: known_brokers.clone(),
                }),
            );
            member.note_sent(counter, now);
            self.pending_pushes.insert(packet_id, (group.clone(), counter));
        }
        self.members.insert(group.clone(), member);
    }

    fn publish(&self, event: Event) {
        Event::publish(&self.event_publisher, event);
    }
}

fn sequence_key(group: &GroupKeyId) -> Vec<u8> {
    paths::combine(&paths::GROUP_LAST_SEQUENCE_ID, group.to_string().as_bytes())
}

fn load_sequence(kv: &impl KVGet, group: &GroupKeyId) -> SequenceId {
    kv.get(&sequence_key(group))
        .and_then(|bytes| SequenceId::try_from_slice(&bytes).ok())
        .unwrap_or_default()
}

/// Persists the last consumed sequence id, monotonically: a smaller value never overwrites a
/// larger one.
fn store_sequence<K: KVStore>(kv: &mut K, group: &GroupKeyId, sequence_id: SequenceId) {
    if sequence_id < load_sequence(kv, group) {
        return;
    }
    let bytes = sequence_id
        .try_to_vec()
        .expect("serializing a sequence id in memory cannot fail");
    kv.set(&sequence_key(group), &bytes);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    #[derive(Clone)]
    struct MemoryKV(Arc<Mutex<HashMap<Vec<u8>, Vec<u8>>>>);

    impl KVGet for MemoryKV {
        fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
            self.0.lock().unwrap().get(key).cloned()
        }
    }

    impl KVStore for MemoryKV {
        fn set(&mut self, key: &[u8], value: &[u8]) {
            self.0.lock().unwrap().insert(key.to_vec(), value.to_vec());
        }
        fn delete(&mut self, key: &[u8]) {
            self.0.lock().unwrap().remove(key);
        }
    }

    fn group() -> GroupKeyId {
        GroupKeyId::new("family", IdUrl::new("http://idhost.org/alice.xml"))
    }

    #[test]
    fn group_key_id_display() {
        assert_eq!(group().to_string(), "family$alice@idhost.org");
    }

    #[test]
    fn queue_id_names_group_and_broker() {
        let queue_id = QueueId::new(&group(), &IdUrl::new("http://idhost.org/b0.xml"));
        assert_eq!(queue_id.as_str(), "family&alice@idhost.org&b0@idhost.org");
    }

    #[test]
    fn sequence_persistence_is_monotonic() {
        let mut kv = MemoryKV(Arc::new(Mutex::new(HashMap::new())));
        let group = group();
        assert_eq!(load_sequence(&kv, &group), SequenceId::new(0));

        store_sequence(&mut kv, &group, SequenceId::new(7));
        assert_eq!(load_sequence(&kv, &group), SequenceId::new(7));

        store_sequence(&mut kv, &group, SequenceId::new(3));
        assert_eq!(load_sequence(&kv, &group), SequenceId::new(7));

        store_sequence(&mut kv, &group, SequenceId::new(12));
        assert_eq!(load_sequence(&kv, &group), SequenceId::new(12));
    }
}
