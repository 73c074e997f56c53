use std::collections::HashMap;
use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use tokio::sync::{mpsc, oneshot, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tracing::{debug, warn};
use ulid::Ulid;

use crate::limits::MAX_CONTENTION_SET;
use crate::model::*;

use super::{EngineError, WalCommand};

pub type SharedSchedule = Arc<RwLock<Schedule>>;

/// Where a booking lives. Bookings are owned by their slot; this is the lookup path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BookingRef {
    pub campaign_id: Ulid,
    pub slot_id: Ulid,
    pub user_id: Ulid,
}

/// Which schedules a transaction write-locks.
#[derive(Debug, Clone)]
pub enum LockScope {
    /// The campaign plus every campaign sharing one of its rooms or facilitators.
    Contention(Ulid),
    /// Exactly these campaigns. Empty for catalog-only changes.
    Exact(Vec<Ulid>),
}

/// Catalog, schedules and indexes. All mutation goes through [`Transaction`].
pub struct Store {
    rooms: DashMap<Ulid, Room>,
    campaigns: DashMap<Ulid, Campaign>,
    facilitators: DashMap<Ulid, Facilitator>,
    users: DashMap<Ulid, User>,
    schedules: DashMap<Ulid, SharedSchedule>,
    /// room → campaigns using it
    room_campaigns: DashMap<Ulid, Vec<Ulid>>,
    /// campaign → facilitators running it
    campaign_facilitators: DashMap<Ulid, Vec<Ulid>>,
    bookings: DashMap<Ulid, BookingRef>,
    user_bookings: DashMap<Ulid, Vec<Ulid>>,
    /// Ids created by commits still in flight, keyed by entity kind.
    claimed_ids: DashSet<(&'static str, Ulid)>,
    /// Commits hold it shared; compaction holds it exclusively.
    commit_gate: RwLock<()>,
    wal_tx: mpsc::Sender<WalCommand>,
}

impl Store {
    pub(super) fn new(wal_tx: mpsc::Sender<WalCommand>) -> Self {
        Self {
            rooms: DashMap::new(),
            campaigns: DashMap::new(),
            facilitators: DashMap::new(),
            users: DashMap::new(),
            schedules: DashMap::new(),
            room_campaigns: DashMap::new(),
            campaign_facilitators: DashMap::new(),
            bookings: DashMap::new(),
            user_bookings: DashMap::new(),
            claimed_ids: DashSet::new(),
            commit_gate: RwLock::new(()),
            wal_tx,
        }
    }

    /// Rebuild state from replayed WAL batches.
    ///
    /// Runs before the store is shared, so schedules are assembled as plain
    /// values, updated in place and only wrapped in locks at the end.
    pub(super) fn restore(batches: &[Vec<Event>], wal_tx: mpsc::Sender<WalCommand>) -> Self {
        let store = Self::new(wal_tx);
        let mut schedules: HashMap<Ulid, Schedule> = HashMap::new();

        for batch in batches {
            for event in batch.iter().filter(|e| e.schedule_id().is_none()) {
                if let Event::CampaignCreated { campaign } = event {
                    schedules
                        .entry(campaign.id)
                        .or_insert_with(|| Schedule::new(campaign.id));
                }
                store.apply_catalog(event);
            }
            let result = apply_schedule_events(batch, &mut schedules, |cid| {
                store.campaigns.get(cid).map(|c| c.max_players)
            });
            match result {
                Ok(_) => {
                    for event in batch {
                        store.index_event(event);
                    }
                }
                Err(reason) => warn!(%reason, "replay: skipping inconsistent WAL batch"),
            }
        }

        for (id, schedule) in schedules {
            store.schedules.insert(id, Arc::new(RwLock::new(schedule)));
        }
        store
    }

    // ── Catalog reads ────────────────────────────────────────

    pub fn campaign(&self, id: &Ulid) -> Option<Campaign> {
        self.campaigns.get(id).map(|c| c.value().clone())
    }

    pub fn campaign_ids(&self) -> Vec<Ulid> {
        let mut ids: Vec<Ulid> = self.campaigns.iter().map(|e| *e.key()).collect();
        ids.sort();
        ids
    }

    pub fn campaign_count(&self) -> usize {
        self.campaigns.len()
    }

    pub fn room(&self, id: &Ulid) -> Option<Room> {
        self.rooms.get(id).map(|r| r.value().clone())
    }

    /// All rooms, ordered by id.
    pub fn rooms(&self) -> Vec<Room> {
        let mut rooms: Vec<Room> = self.rooms.iter().map(|e| e.value().clone()).collect();
        rooms.sort_by_key(|r| r.id);
        rooms
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn facilitator(&self, id: &Ulid) -> Option<Facilitator> {
        self.facilitators.get(id).map(|f| f.value().clone())
    }

    pub fn facilitator_count(&self) -> usize {
        self.facilitators.len()
    }

    pub fn user(&self, id: &Ulid) -> Option<User> {
        self.users.get(id).map(|u| u.value().clone())
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    pub fn campaigns_in_room(&self, room_id: &Ulid) -> Vec<Ulid> {
        self.room_campaigns
            .get(room_id)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }

    pub fn facilitators_of(&self, campaign_id: &Ulid) -> Vec<Ulid> {
        self.campaign_facilitators
            .get(campaign_id)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }

    pub fn booking_ref(&self, booking_id: &Ulid) -> Option<BookingRef> {
        self.bookings.get(booking_id).map(|e| *e.value())
    }

    pub fn bookings_of_user(&self, user_id: &Ulid) -> Vec<Ulid> {
        self.user_bookings
            .get(user_id)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }

    pub fn schedule_handle(&self, campaign_id: &Ulid) -> Option<SharedSchedule> {
        self.schedules.get(campaign_id).map(|e| e.value().clone())
    }

    fn exists(&self, entity: &str, id: &Ulid) -> bool {
        match entity {
            "room" => self.rooms.contains_key(id),
            "campaign" => self.campaigns.contains_key(id),
            "facilitator" => self.facilitators.contains_key(id),
            "user" => self.users.contains_key(id),
            "booking" => self.bookings.contains_key(id),
            _ => false,
        }
    }

    /// Sorted, deduplicated ids of every schedule a booking on `campaign_id`
    /// must see: itself, campaigns sharing a room, campaigns sharing a facilitator.
    pub fn contention_set(&self, campaign_id: &Ulid) -> Result<Vec<Ulid>, EngineError> {
        let room_ids = self
            .campaigns
            .get(campaign_id)
            .map(|c| c.room_ids.clone())
            .ok_or_else(|| EngineError::not_found("campaign", *campaign_id))?;

        let mut ids = vec![*campaign_id];
        for room_id in &room_ids {
            ids.extend(self.campaigns_in_room(room_id));
        }
        for facilitator_id in self.facilitators_of(campaign_id) {
            if let Some(f) = self.facilitators.get(&facilitator_id) {
                ids.extend(f.campaign_ids.iter().copied());
            }
        }
        ids.sort();
        ids.dedup();
        if ids.len() > MAX_CONTENTION_SET {
            return Err(EngineError::LimitExceeded("too many contending campaigns"));
        }
        Ok(ids)
    }

    // ── Locking ──────────────────────────────────────────────

    /// Acquire write locks for `scope` in ULID order.
    ///
    /// A contention scope is recomputed once the locks are held; if a catalog
    /// change moved it in between, the locks are released and acquisition is
    /// retried up to `max_retries` times.
    pub async fn begin(
        self: &Arc<Self>,
        scope: LockScope,
        max_retries: u32,
    ) -> Result<Transaction, EngineError> {
        match scope {
            LockScope::Exact(mut ids) => {
                ids.sort();
                ids.dedup();
                let guards = self.lock_write(&ids).await?;
                Ok(Transaction::new(Arc::clone(self), guards))
            }
            LockScope::Contention(campaign_id) => {
                for attempt in 0..=max_retries {
                    let ids = self.contention_set(&campaign_id)?;
                    let guards = self.lock_write(&ids).await?;
                    if self.contention_set(&campaign_id)? == ids {
                        return Ok(Transaction::new(Arc::clone(self), guards));
                    }
                    drop(guards);
                    metrics::counter!(crate::observability::TXN_RETRIES_TOTAL).increment(1);
                    debug!(%campaign_id, attempt, "contention set moved while locking, retrying");
                }
                Err(EngineError::StateConflict(format!(
                    "contention set of campaign {campaign_id} kept changing"
                )))
            }
        }
    }

    /// Read locks over the contention set of `campaign_id`, for speculative checks.
    pub async fn snapshot(self: &Arc<Self>, campaign_id: &Ulid) -> Result<Snapshot, EngineError> {
        let ids = self.contention_set(campaign_id)?;
        let mut guards = Vec::with_capacity(ids.len());
        for id in ids {
            let handle = self
                .schedule_handle(&id)
                .ok_or_else(|| EngineError::not_found("campaign", id))?;
            guards.push((id, handle.read_owned().await));
        }
        Ok(Snapshot {
            store: Arc::clone(self),
            guards,
        })
    }

    async fn lock_write(
        &self,
        sorted_ids: &[Ulid],
    ) -> Result<Vec<(Ulid, OwnedRwLockWriteGuard<Schedule>)>, EngineError> {
        let mut guards = Vec::with_capacity(sorted_ids.len());
        for id in sorted_ids {
            let handle = self
                .schedule_handle(id)
                .ok_or_else(|| EngineError::not_found("campaign", *id))?;
            guards.push((*id, handle.write_owned().await));
        }
        Ok(guards)
    }

    // ── Event application ────────────────────────────────────

    /// Apply a catalog event. Slot and booking events are no-ops here.
    fn apply_catalog(&self, event: &Event) {
        match event {
            Event::RoomCreated {
                id,
                name,
                room_type,
                capacity,
            } => {
                self.rooms.insert(
                    *id,
                    Room {
                        id: *id,
                        name: name.clone(),
                        room_type: *room_type,
                        capacity: *capacity,
                    },
                );
            }
            Event::CampaignCreated { campaign } => {
                for room_id in &campaign.room_ids {
                    self.room_campaigns.entry(*room_id).or_default().push(campaign.id);
                }
                self.campaigns.insert(campaign.id, campaign.clone());
            }
            Event::CampaignRoomAssigned {
                campaign_id,
                room_id,
            } => {
                if let Some(mut c) = self.campaigns.get_mut(campaign_id)
                    && !c.room_ids.contains(room_id)
                {
                    c.room_ids.push(*room_id);
                    drop(c);
                    self.room_campaigns.entry(*room_id).or_default().push(*campaign_id);
                }
            }
            Event::CampaignDeactivated { id } => {
                if let Some(mut c) = self.campaigns.get_mut(id) {
                    c.is_active = false;
                }
            }
            Event::FacilitatorCreated { id, name } => {
                self.facilitators.insert(
                    *id,
                    Facilitator {
                        id: *id,
                        name: name.clone(),
                        campaign_ids: Vec::new(),
                    },
                );
            }
            Event::FacilitatorAssigned {
                facilitator_id,
                campaign_id,
            } => {
                if let Some(mut f) = self.facilitators.get_mut(facilitator_id)
                    && !f.campaign_ids.contains(campaign_id)
                {
                    f.campaign_ids.push(*campaign_id);
                    drop(f);
                    self.campaign_facilitators
                        .entry(*campaign_id)
                        .or_default()
                        .push(*facilitator_id);
                }
            }
            Event::UserRegistered { id, name } => {
                self.users.insert(
                    *id,
                    User {
                        id: *id,
                        name: name.clone(),
                    },
                );
            }
            Event::SlotOpened { .. }
            | Event::BookingConfirmed { .. }
            | Event::BookingCancelled { .. } => {}
        }
    }

    fn index_event(&self, event: &Event) {
        match event {
            Event::BookingConfirmed {
                id,
                campaign_id,
                slot_id,
                user_id,
                ..
            } => {
                self.bookings.insert(
                    *id,
                    BookingRef {
                        campaign_id: *campaign_id,
                        slot_id: *slot_id,
                        user_id: *user_id,
                    },
                );
                self.user_bookings.entry(*user_id).or_default().push(*id);
            }
            Event::BookingCancelled { id, .. } => {
                if let Some((_, r)) = self.bookings.remove(id)
                    && let Some(mut ids) = self.user_bookings.get_mut(&r.user_id)
                {
                    ids.retain(|b| b != id);
                }
            }
            _ => {}
        }
    }

    // ── WAL ──────────────────────────────────────────────────

    async fn wal_append(&self, batch: Vec<Event>) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append { batch, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// Rewrite the WAL as the minimal batches recreating current state.
    ///
    /// Holds read locks on every schedule and the commit gate exclusively, so
    /// no commit can land between the snapshot and the file swap.
    pub(super) async fn compact(&self) -> Result<(), EngineError> {
        let mut ids: Vec<Ulid> = self.schedules.iter().map(|e| *e.key()).collect();
        ids.sort();
        let mut guards = Vec::with_capacity(ids.len());
        for id in &ids {
            if let Some(handle) = self.schedule_handle(id) {
                guards.push(handle.read_owned().await);
            }
        }
        let _gate = self.commit_gate.write().await;

        let mut batches: Vec<Vec<Event>> = Vec::new();
        let mut catalog: Vec<Event> = Vec::new();

        catalog.extend(self.rooms().into_iter().map(|r| Event::RoomCreated {
            id: r.id,
            name: r.name,
            room_type: r.room_type,
            capacity: r.capacity,
        }));

        let mut campaigns: Vec<Campaign> =
            self.campaigns.iter().map(|e| e.value().clone()).collect();
        campaigns.sort_by_key(|c| c.id);
        catalog.extend(campaigns.into_iter().map(|campaign| Event::CampaignCreated { campaign }));

        let mut facilitators: Vec<Facilitator> =
            self.facilitators.iter().map(|e| e.value().clone()).collect();
        facilitators.sort_by_key(|f| f.id);
        for f in facilitators {
            catalog.push(Event::FacilitatorCreated {
                id: f.id,
                name: f.name,
            });
            catalog.extend(f.campaign_ids.into_iter().map(|campaign_id| {
                Event::FacilitatorAssigned {
                    facilitator_id: f.id,
                    campaign_id,
                }
            }));
        }

        let mut users: Vec<User> = self.users.iter().map(|e| e.value().clone()).collect();
        users.sort_by_key(|u| u.id);
        catalog.extend(users.into_iter().map(|u| Event::UserRegistered {
            id: u.id,
            name: u.name,
        }));
        batches.push(catalog);

        for guard in &guards {
            for slot in &guard.slots {
                let mut batch = vec![Event::SlotOpened {
                    id: slot.id,
                    campaign_id: slot.campaign_id,
                    start: slot.start,
                }];
                batch.extend(slot.bookings.iter().map(|b| Event::BookingConfirmed {
                    id: b.id,
                    campaign_id: slot.campaign_id,
                    slot_id: slot.id,
                    user_id: b.user_id,
                    players_count: b.players_count,
                    created_at: b.created_at,
                }));
                batches.push(batch);
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact {
                batches,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub(super) async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

/// Schedules addressable by campaign id: the owned map used during replay or
/// the write guards of a transaction.
trait ScheduleSet {
    fn schedule_mut(&mut self, campaign_id: &Ulid) -> Option<&mut Schedule>;
}

impl ScheduleSet for HashMap<Ulid, Schedule> {
    fn schedule_mut(&mut self, campaign_id: &Ulid) -> Option<&mut Schedule> {
        self.get_mut(campaign_id)
    }
}

impl ScheduleSet for Vec<(Ulid, OwnedRwLockWriteGuard<Schedule>)> {
    fn schedule_mut(&mut self, campaign_id: &Ulid) -> Option<&mut Schedule> {
        let i = find_guard(self.as_slice(), campaign_id)?;
        Some(&mut *self[i].1)
    }
}

/// How to take back one applied schedule event.
enum Undo {
    SlotOpened { campaign_id: Ulid, slot_id: Ulid },
    BookingAdded { campaign_id: Ulid, slot_id: Ulid, booking_id: Ulid },
    /// The slot as it was before a cancellation, which may have pruned it.
    SlotBefore { campaign_id: Ulid, slot: Slot },
}

/// Apply the slot and booking events of `events` in place, checking slot
/// uniqueness, seat count and booking existence along the way.
///
/// Either every event applies and the undo log is returned, or nothing does.
fn apply_schedule_events<S: ScheduleSet>(
    events: &[Event],
    schedules: &mut S,
    max_players: impl Fn(&Ulid) -> Option<u32>,
) -> Result<Vec<Undo>, String> {
    let mut undo = Vec::new();
    for event in events {
        if let Err(reason) = apply_schedule_event(event, schedules, &max_players, &mut undo) {
            undo_schedule_events(schedules, undo);
            return Err(reason);
        }
    }
    Ok(undo)
}

fn apply_schedule_event<S: ScheduleSet>(
    event: &Event,
    schedules: &mut S,
    max_players: &impl Fn(&Ulid) -> Option<u32>,
    undo: &mut Vec<Undo>,
) -> Result<(), String> {
    let Some(campaign_id) = event.schedule_id() else {
        return Ok(());
    };
    let schedule = schedules
        .schedule_mut(&campaign_id)
        .ok_or_else(|| format!("schedule of campaign {campaign_id} is not locked"))?;
    match event {
        Event::SlotOpened { id, start, .. } => {
            if !schedule.insert_slot(Slot::new(*id, campaign_id, *start)) {
                return Err(format!("a slot already starts at {}", format_timestamp(*start)));
            }
            undo.push(Undo::SlotOpened {
                campaign_id,
                slot_id: *id,
            });
        }
        Event::BookingConfirmed {
            id,
            slot_id,
            user_id,
            players_count,
            created_at,
            ..
        } => {
            let max = max_players(&campaign_id)
                .ok_or_else(|| format!("campaign {campaign_id} vanished"))?;
            let slot = schedule
                .slot_mut(slot_id)
                .ok_or_else(|| format!("slot {slot_id} does not exist"))?;
            if slot.booking_of(user_id).is_some() {
                return Err(format!("user {user_id} already holds a booking in slot {slot_id}"));
            }
            if i64::from(*players_count) > slot.available_seats(max) {
                return Err(format!(
                    "slot {slot_id} has {} seats left, {players_count} requested",
                    slot.available_seats(max).max(0)
                ));
            }
            slot.bookings.push(Booking {
                id: *id,
                user_id: *user_id,
                slot_id: *slot_id,
                players_count: *players_count,
                created_at: *created_at,
            });
            undo.push(Undo::BookingAdded {
                campaign_id,
                slot_id: *slot_id,
                booking_id: *id,
            });
        }
        Event::BookingCancelled { id, .. } => {
            let before = schedule
                .find_booking(id)
                .map(|(slot, _)| slot.clone())
                .ok_or_else(|| format!("booking {id} does not exist"))?;
            schedule.remove_booking(id);
            undo.push(Undo::SlotBefore {
                campaign_id,
                slot: before,
            });
        }
        _ => {}
    }
    Ok(())
}

fn undo_schedule_events<S: ScheduleSet>(schedules: &mut S, undo: Vec<Undo>) {
    for step in undo.into_iter().rev() {
        match step {
            Undo::SlotOpened {
                campaign_id,
                slot_id,
            } => {
                if let Some(schedule) = schedules.schedule_mut(&campaign_id) {
                    schedule.remove_slot(&slot_id);
                }
            }
            Undo::BookingAdded {
                campaign_id,
                slot_id,
                booking_id,
            } => {
                if let Some(slot) = schedules
                    .schedule_mut(&campaign_id)
                    .and_then(|s| s.slot_mut(&slot_id))
                {
                    slot.bookings.retain(|b| b.id != booking_id);
                }
            }
            Undo::SlotBefore { campaign_id, slot } => {
                if let Some(schedule) = schedules.schedule_mut(&campaign_id) {
                    schedule.restore_slot(slot);
                }
            }
        }
    }
}

/// Entity ids an in-flight commit creates.
///
/// Claimed before the existence check and released only once the commit has
/// applied (or failed), so two commits never both create the same id.
struct IdClaims {
    store: Arc<Store>,
    keys: Vec<(&'static str, Ulid)>,
}

impl IdClaims {
    fn acquire(store: &Arc<Store>, events: &[Event]) -> Result<Self, EngineError> {
        let mut claims = Self {
            store: Arc::clone(store),
            keys: Vec::new(),
        };
        for key in events.iter().filter_map(created_id) {
            if !store.claimed_ids.insert(key) {
                return Err(EngineError::AlreadyExists(key.1));
            }
            claims.keys.push(key);
            if store.exists(key.0, &key.1) {
                return Err(EngineError::AlreadyExists(key.1));
            }
        }
        Ok(claims)
    }
}

impl Drop for IdClaims {
    fn drop(&mut self) {
        for key in &self.keys {
            self.store.claimed_ids.remove(key);
        }
    }
}

fn created_id(event: &Event) -> Option<(&'static str, Ulid)> {
    match event {
        Event::RoomCreated { id, .. } => Some(("room", *id)),
        Event::CampaignCreated { campaign } => Some(("campaign", campaign.id)),
        Event::FacilitatorCreated { id, .. } => Some(("facilitator", *id)),
        Event::UserRegistered { id, .. } => Some(("user", *id)),
        Event::BookingConfirmed { id, .. } => Some(("booking", *id)),
        _ => None,
    }
}

// ── Views ────────────────────────────────────────────────────

/// Read access to the catalog plus the schedules a handle has locked.
///
/// Implemented by [`Transaction`] (write locks) and [`Snapshot`] (read locks);
/// the conflict detector and the availability generator run over either.
pub trait ScheduleView {
    fn store(&self) -> &Store;

    /// `None` when the schedule is not covered by this view's locks.
    fn schedule(&self, campaign_id: &Ulid) -> Option<&Schedule>;

    fn campaign(&self, id: &Ulid) -> Option<Campaign> {
        self.store().campaign(id)
    }

    fn room(&self, id: &Ulid) -> Option<Room> {
        self.store().room(id)
    }

    fn campaigns_in_room(&self, room_id: &Ulid) -> Vec<Ulid> {
        self.store().campaigns_in_room(room_id)
    }

    fn facilitators_of(&self, campaign_id: &Ulid) -> Vec<Ulid> {
        self.store().facilitators_of(campaign_id)
    }

    fn slot_at(&self, campaign_id: &Ulid, start: Ms) -> Option<&Slot> {
        self.schedule(campaign_id)?.slot_at(start)
    }

    /// Active campaigns the facilitator runs that use at least one online room.
    fn online_campaigns_for_facilitator(&self, facilitator_id: &Ulid) -> Vec<Campaign> {
        let Some(f) = self.store().facilitator(facilitator_id) else {
            return Vec::new();
        };
        f.campaign_ids
            .iter()
            .filter_map(|id| self.campaign(id))
            .filter(|c| c.is_active)
            .filter(|c| {
                c.room_ids
                    .iter()
                    .any(|r| self.room(r).is_some_and(|r| r.room_type == RoomType::Online))
            })
            .collect()
    }

    /// Occupied sessions of active campaigns in `room_id` overlapping `window`,
    /// ignoring campaign `exclude`.
    fn booked_intervals_for_room(
        &self,
        room_id: &Ulid,
        window: &Span,
        exclude: &Ulid,
    ) -> Result<Vec<Span>, EngineError> {
        let mut spans = Vec::new();
        for campaign_id in self.campaigns_in_room(room_id) {
            if campaign_id == *exclude {
                continue;
            }
            let Some(other) = self.campaign(&campaign_id) else {
                continue;
            };
            let Some(duration) = other.duration_ms().filter(|_| other.is_active) else {
                continue;
            };
            let schedule = self.schedule(&campaign_id).ok_or_else(|| {
                EngineError::StateConflict(format!("schedule of campaign {campaign_id} is not locked"))
            })?;
            spans.extend(schedule.occupied_overlapping(window, duration));
        }
        spans.sort_by_key(|s| s.start);
        Ok(spans)
    }
}

fn find_guard<G>(guards: &[(Ulid, G)], id: &Ulid) -> Option<usize> {
    guards.binary_search_by_key(id, |(gid, _)| *gid).ok()
}

/// Read-locked view for speculative checks.
pub struct Snapshot {
    store: Arc<Store>,
    guards: Vec<(Ulid, OwnedRwLockReadGuard<Schedule>)>,
}

impl ScheduleView for Snapshot {
    fn store(&self) -> &Store {
        &self.store
    }

    fn schedule(&self, campaign_id: &Ulid) -> Option<&Schedule> {
        find_guard(&self.guards, campaign_id).map(|i| &*self.guards[i].1)
    }
}

/// Write-locked unit of work.
///
/// Events are staged, then validated and made durable by [`Transaction::commit`].
/// Dropping an uncommitted transaction discards staged events and releases the locks.
pub struct Transaction {
    store: Arc<Store>,
    guards: Vec<(Ulid, OwnedRwLockWriteGuard<Schedule>)>,
    staged: Vec<Event>,
    finished: bool,
}

impl Transaction {
    fn new(store: Arc<Store>, guards: Vec<(Ulid, OwnedRwLockWriteGuard<Schedule>)>) -> Self {
        Self {
            store,
            guards,
            staged: Vec::new(),
            finished: false,
        }
    }

    pub fn locked_campaigns(&self) -> Vec<Ulid> {
        self.guards.iter().map(|(id, _)| *id).collect()
    }

    pub fn staged(&self) -> &[Event] {
        &self.staged
    }

    pub fn stage(&mut self, event: Event) {
        self.staged.push(event);
    }

    /// Stage a new slot and return its id.
    pub fn add_slot(&mut self, campaign_id: Ulid, start: Ms) -> Ulid {
        let id = Ulid::new();
        self.stage(Event::SlotOpened {
            id,
            campaign_id,
            start,
        });
        id
    }

    pub fn add_booking(&mut self, campaign_id: Ulid, slot_id: Ulid, booking: &Booking) {
        self.stage(Event::BookingConfirmed {
            id: booking.id,
            campaign_id,
            slot_id,
            user_id: booking.user_id,
            players_count: booking.players_count,
            created_at: booking.created_at,
        });
    }

    pub fn delete_booking(&mut self, booking_id: Ulid, campaign_id: Ulid, slot_id: Ulid) {
        self.stage(Event::BookingCancelled {
            id: booking_id,
            campaign_id,
            slot_id,
        });
    }

    /// Validate staged events against the locked state and apply them, then
    /// append them to the WAL as one entry. A failed append undoes the apply.
    ///
    /// Runs on its own task: once started, a caller dropping the returned
    /// future cannot interrupt it between the WAL write and the in-memory apply.
    pub async fn commit(self) -> Result<(), EngineError> {
        tokio::spawn(self.commit_locked())
            .await
            .map_err(|e| EngineError::WalError(format!("commit task failed: {e}")))?
    }

    async fn commit_locked(mut self) -> Result<(), EngineError> {
        let events = std::mem::take(&mut self.staged);
        if events.is_empty() {
            self.finished = true;
            return Ok(());
        }

        let store = Arc::clone(&self.store);
        let _claims = IdClaims::acquire(&store, &events)?;
        let undo = apply_schedule_events(&events, &mut self.guards, |cid| {
            store.campaigns.get(cid).map(|c| c.max_players)
        })
        .map_err(EngineError::StateConflict)?;

        let _gate = store.commit_gate.read().await;
        if let Err(e) = store.wal_append(events.clone()).await {
            undo_schedule_events(&mut self.guards, undo);
            return Err(e);
        }

        for event in &events {
            if let Event::CampaignCreated { campaign } = event {
                store
                    .schedules
                    .entry(campaign.id)
                    .or_insert_with(|| Arc::new(RwLock::new(Schedule::new(campaign.id))));
            }
            store.apply_catalog(event);
            store.index_event(event);
        }
        self.finished = true;
        debug!(events = events.len(), "transaction committed");
        Ok(())
    }
}

impl ScheduleView for Transaction {
    fn store(&self) -> &Store {
        &self.store
    }

    fn schedule(&self, campaign_id: &Ulid) -> Option<&Schedule> {
        find_guard(&self.guards, campaign_id).map(|i| &*self.guards[i].1)
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.finished {
            debug!(
                staged = self.staged.len(),
                locked = self.guards.len(),
                "transaction rolled back"
            );
        }
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("locked", &self.locked_campaigns())
            .field("staged", &self.staged)
            .finish()
    }
}
