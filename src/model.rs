use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, SecondsFormat, Timelike, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::limits::*;

/// Unix milliseconds, always UTC. The only instant type inside the engine.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;
pub const HOUR_MS: Ms = 3_600_000;
pub const DAY_MS: Ms = 86_400_000;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }
}

/// Rejected entity construction or malformed wire value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct InvalidEntity(pub String);

impl InvalidEntity {
    fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

// ── Rooms ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RoomType {
    /// A real table: one game at a time.
    Physical,
    /// Capacity is governed by how many facilitators are free.
    Online,
}

impl RoomType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoomType::Physical => "physical",
            RoomType::Online => "online",
        }
    }
}

impl fmt::Display for RoomType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RoomType {
    type Err = InvalidEntity;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "physical" | "offline" => Ok(RoomType::Physical),
            "online" | "virtual" => Ok(RoomType::Online),
            other => Err(InvalidEntity(format!("unsupported room type: {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
    pub id: Ulid,
    pub name: String,
    pub room_type: RoomType,
    /// Seats at the table. Always `Some` for physical rooms, `None` for online ones.
    pub capacity: Option<u32>,
}

impl Room {
    pub fn new(
        id: Ulid,
        name: String,
        room_type: RoomType,
        capacity: Option<u32>,
    ) -> Result<Self, InvalidEntity> {
        if name.trim().is_empty() {
            return Err(InvalidEntity::new("room name must not be empty"));
        }
        match (room_type, capacity) {
            (RoomType::Physical, Some(c)) if c > 0 => {}
            (RoomType::Physical, _) => {
                return Err(InvalidEntity::new("physical room requires a positive capacity"));
            }
            (RoomType::Online, None) => {}
            (RoomType::Online, Some(_)) => {
                return Err(InvalidEntity::new("online room must not declare a capacity"));
            }
        }
        Ok(Self { id, name, room_type, capacity })
    }
}

// ── Campaigns ────────────────────────────────────────────────────

/// Input for [`Campaign::new`].
#[derive(Debug, Clone, PartialEq)]
pub struct CampaignSpec {
    pub id: Ulid,
    pub title: String,
    pub description: Option<String>,
    pub price_cents: u32,
    pub level: u8,
    pub max_players: u32,
    pub duration_hours: Option<f64>,
    pub working_hours_start: NaiveTime,
    pub working_hours_end: NaiveTime,
    pub room_ids: Vec<Ulid>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Campaign {
    pub id: Ulid,
    pub title: String,
    pub description: Option<String>,
    pub price_cents: u32,
    pub level: u8,
    pub max_players: u32,
    /// `None` means the campaign cannot be scheduled.
    pub duration_hours: Option<f64>,
    pub working_hours_start: NaiveTime,
    pub working_hours_end: NaiveTime,
    /// Ordered set: insertion order kept, no duplicates.
    pub room_ids: Vec<Ulid>,
    pub is_active: bool,
}

impl Campaign {
    pub fn new(spec: CampaignSpec) -> Result<Self, InvalidEntity> {
        if spec.title.trim().is_empty() {
            return Err(InvalidEntity::new("campaign title must not be empty"));
        }
        if !(MIN_CAMPAIGN_LEVEL..=MAX_CAMPAIGN_LEVEL).contains(&spec.level) {
            return Err(InvalidEntity(format!(
                "level {} outside [{MIN_CAMPAIGN_LEVEL}, {MAX_CAMPAIGN_LEVEL}]",
                spec.level
            )));
        }
        if !(MIN_CAMPAIGN_PLAYERS..=MAX_CAMPAIGN_PLAYERS).contains(&spec.max_players) {
            return Err(InvalidEntity(format!(
                "max_players {} outside [{MIN_CAMPAIGN_PLAYERS}, {MAX_CAMPAIGN_PLAYERS}]",
                spec.max_players
            )));
        }
        if let Some(h) = spec.duration_hours
            && !(h.is_finite() && h > 0.0 && h <= MAX_SESSION_HOURS)
        {
            return Err(InvalidEntity(format!("duration_hours {h} must be in (0, {MAX_SESSION_HOURS}]")));
        }
        if spec.working_hours_start >= spec.working_hours_end {
            return Err(InvalidEntity::new("working_hours_start must be before working_hours_end"));
        }

        let mut seen = HashSet::new();
        let mut room_ids = spec.room_ids;
        room_ids.retain(|id| seen.insert(*id));

        Ok(Self {
            id: spec.id,
            title: spec.title,
            description: spec.description,
            price_cents: spec.price_cents,
            level: spec.level,
            max_players: spec.max_players,
            duration_hours: spec.duration_hours,
            working_hours_start: spec.working_hours_start,
            working_hours_end: spec.working_hours_end,
            room_ids,
            is_active: true,
        })
    }

    pub fn duration_ms(&self) -> Option<Ms> {
        self.duration_hours
            .map(|h| (h * HOUR_MS as f64).round() as Ms)
    }

    /// `working_hours_end - duration`, if non-negative.
    pub fn max_start_time(&self) -> Option<NaiveTime> {
        let latest = time_of_day_ms(self.working_hours_end) - self.duration_ms()?;
        if latest < 0 {
            return None;
        }
        NaiveTime::from_num_seconds_from_midnight_opt(
            (latest / 1000) as u32,
            ((latest % 1000) * 1_000_000) as u32,
        )
    }

    /// Inclusive `(earliest, latest)` start offsets within a UTC day.
    /// `None` when unschedulable or the session does not fit the window.
    pub fn start_window(&self) -> Option<(Ms, Ms)> {
        let earliest = time_of_day_ms(self.working_hours_start);
        let latest = time_of_day_ms(self.working_hours_end) - self.duration_ms()?;
        (latest >= earliest).then_some((earliest, latest))
    }

    pub fn accepts_start(&self, start: Ms) -> bool {
        self.start_window()
            .is_some_and(|(earliest, latest)| (earliest..=latest).contains(&ms_of_day(start)))
    }

    pub fn session_span(&self, start: Ms) -> Option<Span> {
        self.duration_ms().map(|d| Span::new(start, start + d))
    }

    pub fn is_schedulable(&self) -> bool {
        self.duration_hours.is_some()
    }
}

// ── Slots & bookings ─────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub user_id: Ulid,
    pub slot_id: Ulid,
    pub players_count: u32,
    pub created_at: Ms,
}

/// A materialized session of a campaign. Occupancy is always derived from `bookings`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub id: Ulid,
    pub campaign_id: Ulid,
    pub start: Ms,
    pub bookings: Vec<Booking>,
}

impl Slot {
    pub fn new(id: Ulid, campaign_id: Ulid, start: Ms) -> Self {
        Self {
            id,
            campaign_id,
            start,
            bookings: Vec::new(),
        }
    }

    pub fn current_players(&self) -> u32 {
        self.bookings.iter().map(|b| b.players_count).sum()
    }

    pub fn available_seats(&self, max_players: u32) -> i64 {
        i64::from(max_players) - i64::from(self.current_players())
    }

    pub fn is_full(&self, max_players: u32) -> bool {
        self.available_seats(max_players) <= 0
    }

    pub fn is_in_past(&self, now: Ms) -> bool {
        self.start < now
    }

    /// Empty slots never block a room or a facilitator.
    pub fn is_occupied(&self) -> bool {
        !self.bookings.is_empty()
    }

    pub fn booking_of(&self, user_id: &Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.user_id == *user_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Facilitator {
    pub id: Ulid,
    pub name: String,
    pub campaign_ids: Vec<Ulid>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: Ulid,
    pub name: String,
}

/// All slots of one campaign, sorted by `start`. Unit of locking.
#[derive(Debug, Clone)]
pub struct Schedule {
    pub campaign_id: Ulid,
    pub slots: Vec<Slot>,
}

impl Schedule {
    pub fn new(campaign_id: Ulid) -> Self {
        Self {
            campaign_id,
            slots: Vec::new(),
        }
    }

    pub fn slot_at(&self, start: Ms) -> Option<&Slot> {
        self.slots
            .binary_search_by_key(&start, |s| s.start)
            .ok()
            .map(|pos| &self.slots[pos])
    }

    pub fn slot(&self, id: &Ulid) -> Option<&Slot> {
        self.slots.iter().find(|s| s.id == *id)
    }

    /// Insert keeping sort order. Returns false if a slot already starts at `slot.start`.
    pub fn insert_slot(&mut self, slot: Slot) -> bool {
        match self.slots.binary_search_by_key(&slot.start, |s| s.start) {
            Ok(_) => false,
            Err(pos) => {
                self.slots.insert(pos, slot);
                true
            }
        }
    }

    pub fn slot_mut(&mut self, id: &Ulid) -> Option<&mut Slot> {
        self.slots.iter_mut().find(|s| s.id == *id)
    }

    pub fn remove_slot(&mut self, id: &Ulid) -> Option<Slot> {
        let pos = self.slots.iter().position(|s| s.id == *id)?;
        Some(self.slots.remove(pos))
    }

    /// Put back an earlier copy of a slot, replacing the current one if present.
    pub fn restore_slot(&mut self, slot: Slot) {
        match self.slot_mut(&slot.id) {
            Some(current) => *current = slot,
            None => {
                self.insert_slot(slot);
            }
        }
    }

    pub fn find_booking(&self, booking_id: &Ulid) -> Option<(&Slot, &Booking)> {
        self.slots.iter().find_map(|slot| {
            slot.bookings
                .iter()
                .find(|b| b.id == *booking_id)
                .map(|b| (slot, b))
        })
    }

    /// Remove a booking; a slot left without bookings is pruned.
    pub fn remove_booking(&mut self, booking_id: &Ulid) -> Option<Booking> {
        let slot_pos = self
            .slots
            .iter()
            .position(|s| s.bookings.iter().any(|b| b.id == *booking_id))?;
        let slot = &mut self.slots[slot_pos];
        let pos = slot.bookings.iter().position(|b| b.id == *booking_id)?;
        let booking = slot.bookings.remove(pos);
        if slot.bookings.is_empty() {
            self.slots.remove(slot_pos);
        }
        Some(booking)
    }

    /// Spans of occupied slots (each `duration` long) overlapping `query`.
    pub fn occupied_overlapping(&self, query: &Span, duration: Ms) -> impl Iterator<Item = Span> + '_ {
        // Slots at index >= right_bound start at or after query.end and cannot overlap.
        let right_bound = self.slots.partition_point(|s| s.start < query.end);
        let query_start = query.start;
        self.slots[..right_bound]
            .iter()
            .filter(|s| s.is_occupied())
            .map(move |s| Span::new(s.start, s.start + duration))
            .filter(move |span| span.end > query_start)
    }
}

/// WAL record. A committed transaction is written as one `Vec<Event>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    RoomCreated {
        id: Ulid,
        name: String,
        room_type: RoomType,
        capacity: Option<u32>,
    },
    CampaignCreated {
        campaign: Campaign,
    },
    CampaignRoomAssigned {
        campaign_id: Ulid,
        room_id: Ulid,
    },
    CampaignDeactivated {
        id: Ulid,
    },
    FacilitatorCreated {
        id: Ulid,
        name: String,
    },
    FacilitatorAssigned {
        facilitator_id: Ulid,
        campaign_id: Ulid,
    },
    UserRegistered {
        id: Ulid,
        name: String,
    },
    SlotOpened {
        id: Ulid,
        campaign_id: Ulid,
        start: Ms,
    },
    BookingConfirmed {
        id: Ulid,
        campaign_id: Ulid,
        slot_id: Ulid,
        user_id: Ulid,
        players_count: u32,
        created_at: Ms,
    },
    BookingCancelled {
        id: Ulid,
        campaign_id: Ulid,
        slot_id: Ulid,
    },
}

impl Event {
    /// Campaign whose schedule the event mutates, for slot and booking events.
    pub fn schedule_id(&self) -> Option<Ulid> {
        match self {
            Event::SlotOpened { campaign_id, .. }
            | Event::BookingConfirmed { campaign_id, .. }
            | Event::BookingCancelled { campaign_id, .. } => Some(*campaign_id),
            _ => None,
        }
    }
}

// ── Query result types ───────────────────────────────────────────

/// A provisional start time produced by the availability generator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeCandidate {
    pub start: Ms,
    pub end: Ms,
    pub current_players: u32,
    pub available_seats: u32,
    pub available: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingInfo {
    pub id: Ulid,
    pub user_id: Ulid,
    pub campaign_id: Ulid,
    pub campaign_title: String,
    pub slot_id: Ulid,
    pub start: Ms,
    pub end: Ms,
    pub players_count: u32,
    pub created_at: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotInfo {
    pub id: Ulid,
    pub campaign_id: Ulid,
    pub start: Ms,
    pub end: Ms,
    pub current_players: u32,
    pub available_seats: u32,
    pub booking_count: usize,
}

// ── Time helpers ─────────────────────────────────────────────────

pub fn time_of_day_ms(t: NaiveTime) -> Ms {
    Ms::from(t.num_seconds_from_midnight()) * 1000 + Ms::from(t.nanosecond() / 1_000_000)
}

/// Offset of an instant from UTC midnight.
pub fn ms_of_day(instant: Ms) -> Ms {
    instant.rem_euclid(DAY_MS)
}

pub fn day_start(date: NaiveDate) -> Ms {
    date.and_time(NaiveTime::MIN).and_utc().timestamp_millis()
}

/// ISO-8601 instant. A timestamp without an explicit zone is UTC, never local time.
pub fn parse_timestamp(s: &str) -> Result<Ms, InvalidEntity> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc).timestamp_millis());
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Ok(naive.and_utc().timestamp_millis());
        }
    }
    Err(InvalidEntity(format!("bad timestamp: {s}")))
}

pub fn format_timestamp(ms: Ms) -> String {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Secs, true))
        .unwrap_or_else(|| ms.to_string())
}

pub fn parse_date(s: &str) -> Result<NaiveDate, InvalidEntity> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
        .map_err(|e| InvalidEntity(format!("bad date {s}: {e}")))
}

pub fn parse_time_of_day(s: &str) -> Result<NaiveTime, InvalidEntity> {
    let s = s.trim();
    NaiveTime::parse_from_str(s, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M"))
        .map_err(|e| InvalidEntity(format!("bad time of day {s}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hm(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn spec(duration_hours: Option<f64>) -> CampaignSpec {
        CampaignSpec {
            id: Ulid::new(),
            title: "Curse of Strahd".into(),
            description: None,
            price_cents: 1500,
            level: 3,
            max_players: 5,
            duration_hours,
            working_hours_start: hm(10, 0),
            working_hours_end: hm(22, 0),
            room_ids: vec![],
        }
    }

    fn booking(slot_id: Ulid, players_count: u32) -> Booking {
        Booking {
            id: Ulid::new(),
            user_id: Ulid::new(),
            slot_id,
            players_count,
            created_at: 0,
        }
    }

    #[test]
    fn span_basics() {
        let s = Span::new(100, 200);
        assert_eq!(s.duration_ms(), 100);
        assert!(s.contains_instant(100));
        assert!(s.contains_instant(199));
        assert!(!s.contains_instant(200)); // half-open
    }

    #[test]
    fn span_overlap() {
        let a = Span::new(100, 200);
        let b = Span::new(150, 250);
        let c = Span::new(200, 300);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c)); // adjacent, not overlapping
    }

    #[test]
    fn physical_room_requires_capacity() {
        let id = Ulid::new();
        assert!(Room::new(id, "Table 1".into(), RoomType::Physical, Some(6)).is_ok());
        assert!(Room::new(id, "Table 1".into(), RoomType::Physical, None).is_err());
        assert!(Room::new(id, "Table 1".into(), RoomType::Physical, Some(0)).is_err());
    }

    #[test]
    fn online_room_rejects_capacity() {
        let id = Ulid::new();
        assert!(Room::new(id, "Discord".into(), RoomType::Online, None).is_ok());
        assert!(Room::new(id, "Discord".into(), RoomType::Online, Some(4)).is_err());
    }

    #[test]
    fn room_type_parsing() {
        assert_eq!("Physical".parse::<RoomType>().unwrap(), RoomType::Physical);
        assert_eq!(" online ".parse::<RoomType>().unwrap(), RoomType::Online);
        assert!("hybrid".parse::<RoomType>().is_err());
    }

    #[test]
    fn campaign_validation() {
        assert!(Campaign::new(spec(Some(4.0))).is_ok());

        let mut s = spec(Some(4.0));
        s.level = 21;
        assert!(Campaign::new(s).is_err());

        let mut s = spec(Some(4.0));
        s.max_players = 9;
        assert!(Campaign::new(s).is_err());

        let mut s = spec(Some(4.0));
        s.working_hours_end = s.working_hours_start;
        assert!(Campaign::new(s).is_err());

        assert!(Campaign::new(spec(Some(0.0))).is_err());
        assert!(Campaign::new(spec(Some(f64::NAN))).is_err());
    }

    #[test]
    fn campaign_room_ids_deduplicated_in_order() {
        let (a, b) = (Ulid::new(), Ulid::new());
        let mut s = spec(Some(2.0));
        s.room_ids = vec![b, a, b];
        let c = Campaign::new(s).unwrap();
        assert_eq!(c.room_ids, vec![b, a]);
        assert!(c.is_active);
    }

    #[test]
    fn max_start_time_and_window() {
        let c = Campaign::new(spec(Some(4.0))).unwrap();
        assert_eq!(c.max_start_time(), Some(hm(18, 0)));
        assert_eq!(c.start_window(), Some((10 * HOUR_MS, 18 * HOUR_MS)));

        let c = Campaign::new(spec(Some(1.5))).unwrap();
        assert_eq!(c.max_start_time(), Some(hm(20, 30)));

        let unschedulable = Campaign::new(spec(None)).unwrap();
        assert_eq!(unschedulable.max_start_time(), None);
        assert_eq!(unschedulable.start_window(), None);
        assert!(!unschedulable.is_schedulable());
    }

    #[test]
    fn session_longer_than_window_has_no_start() {
        let mut s = spec(Some(13.0));
        s.working_hours_end = hm(22, 0);
        let c = Campaign::new(s).unwrap();
        assert_eq!(c.start_window(), None);
        assert!(!c.accepts_start(10 * HOUR_MS));
    }

    #[test]
    fn accepts_start_bounds_inclusive() {
        let c = Campaign::new(spec(Some(4.0))).unwrap();
        let day = day_start(NaiveDate::from_ymd_opt(2030, 1, 1).unwrap());
        assert!(c.accepts_start(day + 10 * HOUR_MS));
        assert!(c.accepts_start(day + 18 * HOUR_MS));
        assert!(!c.accepts_start(day + 18 * HOUR_MS + MINUTE_MS));
        assert!(!c.accepts_start(day + 9 * HOUR_MS + 59 * MINUTE_MS));
    }

    #[test]
    fn slot_derived_values() {
        let mut slot = Slot::new(Ulid::new(), Ulid::new(), 1000);
        assert!(!slot.is_occupied());
        assert_eq!(slot.available_seats(5), 5);

        slot.bookings.push(booking(slot.id, 2));
        slot.bookings.push(booking(slot.id, 3));
        assert_eq!(slot.current_players(), 5);
        assert_eq!(slot.available_seats(5), 0);
        assert!(slot.is_full(5));
        assert!(!slot.is_full(6));
        assert!(slot.is_in_past(1001));
        assert!(!slot.is_in_past(1000));
    }

    #[test]
    fn schedule_keeps_slots_sorted_and_unique() {
        let cid = Ulid::new();
        let mut sched = Schedule::new(cid);
        assert!(sched.insert_slot(Slot::new(Ulid::new(), cid, 300)));
        assert!(sched.insert_slot(Slot::new(Ulid::new(), cid, 100)));
        assert!(sched.insert_slot(Slot::new(Ulid::new(), cid, 200)));
        assert!(!sched.insert_slot(Slot::new(Ulid::new(), cid, 200)));

        let starts: Vec<Ms> = sched.slots.iter().map(|s| s.start).collect();
        assert_eq!(starts, vec![100, 200, 300]);
        assert!(sched.slot_at(200).is_some());
        assert!(sched.slot_at(250).is_none());
    }

    #[test]
    fn removing_last_booking_prunes_slot() {
        let cid = Ulid::new();
        let mut sched = Schedule::new(cid);
        let slot = Slot::new(Ulid::new(), cid, 100);
        let slot_id = slot.id;
        sched.insert_slot(slot);
        let a = booking(slot_id, 1);
        let b = booking(slot_id, 2);
        let (a_id, b_id) = (a.id, b.id);
        sched.slot_mut(&slot_id).unwrap().bookings.extend([a, b]);

        assert_eq!(sched.remove_booking(&a_id).map(|b| b.id), Some(a_id));
        assert!(sched.slot_at(100).is_some());
        assert_eq!(sched.remove_booking(&b_id).map(|b| b.id), Some(b_id));
        assert!(sched.slots.is_empty());
        assert!(sched.remove_booking(&b_id).is_none());
    }

    #[test]
    fn restore_slot_replaces_or_reinserts() {
        let cid = Ulid::new();
        let mut sched = Schedule::new(cid);
        let slot = Slot::new(Ulid::new(), cid, 100);
        let slot_id = slot.id;
        sched.insert_slot(slot);
        let a = booking(slot_id, 2);
        let a_id = a.id;
        sched.slot_mut(&slot_id).unwrap().bookings.push(a);
        let before = sched.slot(&slot_id).unwrap().clone();

        sched.remove_booking(&a_id);
        assert!(sched.slots.is_empty());
        sched.restore_slot(before.clone());
        assert_eq!(sched.slot_at(100), Some(&before));

        sched.slot_mut(&slot_id).unwrap().bookings.clear();
        sched.restore_slot(before.clone());
        assert_eq!(sched.slots, vec![before]);

        assert!(sched.remove_slot(&slot_id).is_some());
        assert!(sched.remove_slot(&slot_id).is_none());
    }

    #[test]
    fn occupied_overlapping_ignores_empty_and_adjacent() {
        let cid = Ulid::new();
        let mut sched = Schedule::new(cid);
        for start in [0, 400, 800] {
            let slot = Slot::new(Ulid::new(), cid, start);
            let sid = slot.id;
            sched.insert_slot(slot);
            if start != 400 {
                sched.slot_mut(&sid).unwrap().bookings.push(booking(sid, 1));
            }
        }
        // [0,200) ends exactly at query.start; [400,600) is empty; [800,1000) overlaps.
        let hits: Vec<Span> = sched.occupied_overlapping(&Span::new(200, 900), 200).collect();
        assert_eq!(hits, vec![Span::new(800, 1000)]);
    }

    #[test]
    fn timestamp_without_zone_is_utc() {
        let with_zone = parse_timestamp("2030-05-01T18:00:00Z").unwrap();
        let naive = parse_timestamp("2030-05-01T18:00:00").unwrap();
        let offset = parse_timestamp("2030-05-01T20:00:00+02:00").unwrap();
        assert_eq!(with_zone, naive);
        assert_eq!(with_zone, offset);
        assert_eq!(format_timestamp(with_zone), "2030-05-01T18:00:00Z");
        assert!(parse_timestamp("yesterday").is_err());
    }

    #[test]
    fn date_and_time_of_day_parsing() {
        let d = parse_date("2030-05-01").unwrap();
        assert_eq!(day_start(d), parse_timestamp("2030-05-01T00:00:00Z").unwrap());
        assert_eq!(parse_time_of_day("18:30").unwrap(), hm(18, 30));
        assert_eq!(time_of_day_ms(hm(18, 30)), 18 * HOUR_MS + 30 * MINUTE_MS);
        assert!(parse_date("01/05/2030").is_err());
    }

    #[test]
    fn event_serialization_roundtrip() {
        let campaign = Campaign::new(spec(Some(3.5))).unwrap();
        let event = Event::CampaignCreated { campaign };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
